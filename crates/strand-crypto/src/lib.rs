//! Strand Crypto -- Ed25519 node keys, handshake challenges, signature checks.

use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{UnparsedPublicKey, ED25519};
use sha2::{Digest, Sha256};

pub mod identity;

pub use identity::NodeKey;

/// Handshake nonce length in bytes.
pub const NONCE_LEN: usize = 32;

/// Domain separator mixed into every handshake signature.
const HANDSHAKE_DOMAIN: &[u8] = b"strand-handshake-v1";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("identity error: {0}")]
    IdentityError(String),
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("random source failure")]
    Rng,
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Fresh random challenge for one handshake.
pub fn random_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let rng = SystemRandom::new();
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut nonce).map_err(|_| CryptoError::Rng)?;
    Ok(nonce)
}

/// Digest a node signs to answer a peer's challenge.
///
/// Binds the challenge to both public keys so a signature cannot be replayed
/// towards a different verifier.
pub fn handshake_transcript(nonce: &[u8], signer: &[u8], verifier: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(HANDSHAKE_DOMAIN);
    hasher.update(nonce);
    hasher.update(signer);
    hasher.update(verifier);
    hasher.finalize().into()
}

/// Verify an Ed25519 signature against a raw public key.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(message, signature)
        .map_err(|_| CryptoError::InvalidSignature)
}
