//! JSON-RPC 2.0 envelope types and the explicit method registry.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard JSON-RPC 2.0 error codes.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Name of the built-in method listing every registered method.
pub const LIST_METHODS: &str = "rpc_methods";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(details: impl std::fmt::Display) -> Self {
        Self::new(codes::PARSE_ERROR, format!("Parse error: {details}"))
    }

    pub fn invalid_request(details: impl std::fmt::Display) -> Self {
        Self::new(codes::INVALID_REQUEST, format!("Invalid request: {details}"))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(details: impl std::fmt::Display) -> Self {
        Self::new(codes::INVALID_PARAMS, format!("Invalid params: {details}"))
    }

    pub fn internal(details: impl std::fmt::Display) -> Self {
        Self::new(codes::INTERNAL_ERROR, format!("Internal error: {details}"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Absent for notifications. An explicit `null` still gets a response,
    /// see `MethodRegistry::dispatch`.
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type Handler = Box<dyn Fn(Value) -> BoxFuture<Result<Value, RpcError>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("method name {0:?} is not namespace_method")]
    InvalidName(String),
    #[error("method {0} already registered")]
    Duplicate(String),
    #[error("method {0} is reserved")]
    Reserved(String),
}

/// Explicit `namespace_method -> handler` table. Nothing is reachable over
/// RPC unless it was registered here.
#[derive(Default)]
pub struct MethodRegistry {
    methods: BTreeMap<String, Handler>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: &str, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        if !is_valid_name(name) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        if name == LIST_METHODS {
            return Err(RegistryError::Reserved(name.to_string()));
        }
        if self.methods.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.methods.insert(
            name.to_string(),
            Box::new(move |params: Value| -> BoxFuture<Result<Value, RpcError>> { Box::pin(handler(params)) }),
        );
        Ok(())
    }

    /// Registered names in sorted order, plus the built-in listing.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.push(LIST_METHODS.to_string());
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        name == LIST_METHODS || self.methods.contains_key(name)
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        if method == LIST_METHODS {
            return Ok(serde_json::json!({ "methods": self.names() }));
        }
        match self.methods.get(method) {
            Some(handler) => handler(params).await,
            None => Err(RpcError::method_not_found(method)),
        }
    }

    /// Handle one decoded request value. `None` for notifications.
    pub async fn dispatch(&self, request: Value) -> Option<JsonRpcResponse> {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        // serde folds `"id": null` into None; only a missing member is a notification
        let notification = request.as_object().is_some_and(|o| !o.contains_key("id"));
        let req: JsonRpcRequest = match serde_json::from_value(request) {
            Ok(r) => r,
            Err(e) => return Some(JsonRpcResponse::failure(id, RpcError::invalid_request(e))),
        };
        if req.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::failure(
                id,
                RpcError::invalid_request("jsonrpc must be \"2.0\""),
            ));
        }

        let outcome = self.call(&req.method, req.params.unwrap_or(Value::Null)).await;
        if let Err(e) = &outcome {
            tracing::debug!(method = %req.method, code = e.code, "api: call failed");
        }
        if notification {
            return None;
        }
        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::failure(id, error),
        })
    }
}

fn is_valid_name(name: &str) -> bool {
    match name.split_once('_') {
        Some((ns, method)) => {
            !ns.is_empty()
                && !method.is_empty()
                && ns.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                && method.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// Reject anything but absent or empty params.
pub fn expect_no_params(params: &Value) -> Result<(), RpcError> {
    let empty = match params {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    };
    if empty {
        Ok(())
    } else {
        Err(RpcError::invalid_params("method takes no parameters"))
    }
}
