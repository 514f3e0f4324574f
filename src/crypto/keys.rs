//! Key management for conversation negotiation

use super::CryptoError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::agreement::{EphemeralPrivateKey, ECDH_P256};
use ring::rand::SystemRandom;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of one P-256 coordinate in bytes
const COORD_LEN: usize = 32;

/// Length of an uncompressed SEC1 point (0x04 || x || y)
const POINT_LEN: usize = 1 + 2 * COORD_LEN;

/// P-256 key pair used for exactly one agreement.
///
/// The private half is ephemeral and consumed by [`super::negotiate`]; a
/// fresh pair is generated for every key announcement, so re-keying a
/// conversation never reuses key material.
pub struct KeyPair {
    pub(crate) private: EphemeralPrivateKey,
    public_point: [u8; POINT_LEN],
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let private = EphemeralPrivateKey::generate(&ECDH_P256, &rng)
            .map_err(|_| CryptoError::KeyGeneration)?;
        let public = private
            .compute_public_key()
            .map_err(|_| CryptoError::KeyGeneration)?;
        let public_point: [u8; POINT_LEN] = public
            .as_ref()
            .try_into()
            .map_err(|_| CryptoError::KeyGeneration)?;

        Ok(Self {
            private,
            public_point,
        })
    }

    /// The JSON announcement for our public half
    pub fn announcement(&self) -> PublicKeyAnnouncement {
        PublicKeyAnnouncement::from_point(&self.public_point)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({}...)", &self.announcement().x[..8])
    }
}

/// Public-key material as it travels in `key` packets: a JSON object with
/// base64url-encoded affine coordinates, matching the JWK shape peer
/// endpoints export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyAnnouncement {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

impl PublicKeyAnnouncement {
    fn from_point(point: &[u8; POINT_LEN]) -> Self {
        Self {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x: URL_SAFE_NO_PAD.encode(&point[1..1 + COORD_LEN]),
            y: URL_SAFE_NO_PAD.encode(&point[1 + COORD_LEN..]),
        }
    }

    /// Parse an announcement out of the raw JSON a `key` packet carries.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, CryptoError> {
        let parsed: Self = serde_json::from_value(value.clone())
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        if parsed.kty != "EC" || parsed.crv != "P-256" {
            return Err(CryptoError::InvalidPublicKey(format!(
                "unsupported key type {}/{}",
                parsed.kty, parsed.crv
            )));
        }
        Ok(parsed)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kty": self.kty,
            "crv": self.crv,
            "x": self.x,
            "y": self.y,
        })
    }

    /// Rebuild the uncompressed SEC1 point for the agreement API.
    pub(crate) fn to_point(&self) -> Result<[u8; POINT_LEN], CryptoError> {
        let x = URL_SAFE_NO_PAD
            .decode(&self.x)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        let y = URL_SAFE_NO_PAD
            .decode(&self.y)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        if x.len() != COORD_LEN || y.len() != COORD_LEN {
            return Err(CryptoError::InvalidPublicKey(
                "coordinate length mismatch".to_string(),
            ));
        }
        let mut point = [0u8; POINT_LEN];
        point[0] = 0x04;
        point[1..1 + COORD_LEN].copy_from_slice(&x);
        point[1 + COORD_LEN..].copy_from_slice(&y);
        Ok(point)
    }
}
