//! Ed25519 node key -- generation, loading, signing.

use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use std::path::Path;

use crate::CryptoError;

/// A node's long-term Ed25519 keypair. The public half is the node id.
pub struct NodeKey {
    keypair: Ed25519KeyPair,
    pkcs8_doc: Vec<u8>,
}

impl NodeKey {
    /// Generate a new random keypair.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|e| CryptoError::IdentityError(e.to_string()))?;
        Self::from_pkcs8_bytes(pkcs8.as_ref().to_vec())
    }

    /// Load keypair from PKCS#8 DER file.
    pub fn from_file(path: &Path) -> Result<Self, CryptoError> {
        let pkcs8_bytes = std::fs::read(path)?;
        Self::from_pkcs8_bytes(pkcs8_bytes)
    }

    /// Load or create keypair at path.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            let key = Self::generate()?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &key.pkcs8_doc)?;
            Ok(key)
        }
    }

    pub fn from_pkcs8_bytes(pkcs8_bytes: Vec<u8>) -> Result<Self, CryptoError> {
        let keypair = Ed25519KeyPair::from_pkcs8(&pkcs8_bytes)
            .map_err(|e| CryptoError::IdentityError(e.to_string()))?;
        Ok(Self {
            keypair,
            pkcs8_doc: pkcs8_bytes,
        })
    }

    /// Raw 32-byte public key.
    pub fn public_key(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.keypair.public_key().as_ref());
        out
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.public_key().as_ref())
    }

    /// Sign data.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.keypair.sign(data).as_ref().to_vec()
    }

    /// PKCS#8 DER bytes.
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8_doc
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKey")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}
