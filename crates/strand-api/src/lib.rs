//! Strand API -- local node JSON-RPC over HTTP or a Unix socket.
//!
//! Single endpoint: `POST /` with a JSON-RPC 2.0 body (or batch). Optional
//! bearer token auth. Node data is reached only through methods registered
//! on a `MethodRegistry`.

pub mod rpc;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};

pub use rpc::{
    codes, expect_no_params, BoxFuture, JsonRpcRequest, JsonRpcResponse, MethodRegistry, RegistryError, RpcError,
};

/// Returns the node's static description.
pub type NodeInfoFn = Box<dyn Fn() -> Value + Send + Sync>;

/// Returns the connected peer list.
pub type PeerListFn = Box<dyn Fn() -> BoxFuture<Value> + Send + Sync>;

/// Returns the connected peer count.
pub type PeerCountFn = Box<dyn Fn() -> BoxFuture<usize> + Send + Sync>;

/// Reports whether the node is running.
pub type RunningFn = Box<dyn Fn() -> bool + Send + Sync>;

/// Time since the node started; `None` once it has stopped.
pub type UptimeFn = Box<dyn Fn() -> Option<Duration> + Send + Sync>;

/// Read-only views of a running node, supplied by the node binary.
pub struct NodeViews {
    pub node_info: NodeInfoFn,
    pub peer_list: PeerListFn,
    pub peer_count: PeerCountFn,
    pub is_running: RunningFn,
    pub uptime: UptimeFn,
}

/// Register `strand_nodeInfo`, `strand_peers` and `strand_status`.
pub fn register_node_methods(registry: &mut MethodRegistry, views: NodeViews) -> Result<(), RegistryError> {
    let views = Arc::new(views);

    let v = views.clone();
    registry.register("strand_nodeInfo", move |params| {
        let v = v.clone();
        async move {
            expect_no_params(&params)?;
            Ok((v.node_info)())
        }
    })?;

    let v = views.clone();
    registry.register("strand_peers", move |params| {
        let v = v.clone();
        async move {
            expect_no_params(&params)?;
            Ok((v.peer_list)().await)
        }
    })?;

    let v = views;
    registry.register("strand_status", move |params| {
        let v = v.clone();
        async move {
            expect_no_params(&params)?;
            let peers = (v.peer_count)().await;
            Ok(json!({
                "running": (v.is_running)(),
                "uptime_secs": (v.uptime)().map(|d| d.as_secs()),
                "peers": peers,
            }))
        }
    })?;

    Ok(())
}

/// Shared state for the RPC handler.
pub struct AppState {
    pub registry: MethodRegistry,
    /// `None` disables auth.
    pub bearer_token: Option<String>,
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new().route("/", post(handle_rpc)).with_state(state)
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, &'static str)> {
    let Some(token) = &state.bearer_token else {
        return Ok(());
    };
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = format!("Bearer {token}");
    if auth != expected {
        return Err((StatusCode::UNAUTHORIZED, "invalid bearer token"));
    }
    Ok(())
}

async fn handle_rpc(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let request: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return Json(JsonRpcResponse::failure(Value::Null, RpcError::parse_error(e))).into_response(),
    };

    match request {
        Value::Array(batch) if batch.is_empty() => Json(JsonRpcResponse::failure(
            Value::Null,
            RpcError::invalid_request("empty batch"),
        ))
        .into_response(),
        Value::Array(batch) => {
            let mut responses = Vec::with_capacity(batch.len());
            for item in batch {
                if let Some(resp) = state.registry.dispatch(item).await {
                    responses.push(resp);
                }
            }
            if responses.is_empty() {
                StatusCode::NO_CONTENT.into_response()
            } else {
                Json(responses).into_response()
            }
        }
        single => match state.registry.dispatch(single).await {
            Some(resp) => Json(resp).into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        },
    }
}

// ============================================================================
// Serving
// ============================================================================

/// Serve `router` on a TCP listener until `shutdown` resolves.
pub async fn serve_http<S>(listener: tokio::net::TcpListener, router: Router, shutdown: S) -> std::io::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await
}

/// Serve `router` on a Unix socket until `shutdown` resolves.
pub async fn serve_unix<S>(listener: tokio::net::UnixListener, router: Router, shutdown: S)
where
    S: Future<Output = ()> + Send + 'static,
{
    use hyper_util::rt::TokioIo;
    use tower::Service;

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let router = router.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = hyper::service::service_fn(move |req| {
                                let mut router = router.clone();
                                async move { router.call(req).await }
                            });
                            if let Err(e) = hyper_util::server::conn::auto::Builder::new(
                                hyper_util::rt::TokioExecutor::new(),
                            )
                            .serve_connection(io, service)
                            .await
                            {
                                tracing::error!("api: connection error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("api: accept error: {e}");
                    }
                }
            }
            _ = &mut shutdown => break,
        }
    }
    tracing::debug!("api: unix listener stopped");
}
