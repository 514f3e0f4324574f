//! Cryptographic channel for tunnel conversations
//!
//! This module provides:
//! - P-256 ECDH key agreement, one negotiation per conversation
//! - JSON public-key announcements (JWK-style coordinates)
//! - AES-256-GCM sealing of packet text with a fresh random IV per message
//! - HKDF-SHA256 expansion of the agreed secret into the message key

mod channel;
mod keys;

pub use channel::{negotiate, Sealed, Secret, SEALED_MARKER};
pub use keys::{KeyPair, PublicKeyAnnouncement};

use thiserror::Error;

/// Length of the AES-GCM key in bytes
pub const KEY_LEN: usize = 32;

/// Length of the random IV in bytes
pub const IV_LEN: usize = 12;

/// Length of the authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed")]
    KeyGeneration,

    #[error("Key agreement failed")]
    Agreement,

    #[error("Invalid public key material: {0}")]
    InvalidPublicKey(String),

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed")]
    Decryption,

    #[error("Malformed sealed message")]
    MalformedSealed,
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}
