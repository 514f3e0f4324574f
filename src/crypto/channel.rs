//! Authenticated encryption of packet text
//!
//! One [`Secret`] exists per conversation. Sealing produces the outer
//! message body directly: the marker `s`, then the armored IV and armored
//! ciphertext-with-tag joined by the field delimiter. Key announcements stay
//! plaintext and use the codec's `k` tag instead.

use super::keys::{KeyPair, PublicKeyAnnouncement};
use super::{random_bytes, CryptoError, IV_LEN, KEY_LEN};
use crate::packet::armor;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::agreement::{agree_ephemeral, UnparsedPublicKey, ECDH_P256};
use ring::hkdf::{Salt, HKDF_SHA256};

/// Marker prefixing every encrypted message body
pub const SEALED_MARKER: char = 's';

/// HKDF info label binding derived keys to this protocol
const KEY_INFO: &[u8] = b"courier_tunnel conversation key";

/// Symmetric key for one conversation. Held in memory only; replaced
/// wholesale when the peer re-keys.
pub struct Secret {
    key: LessSafeKey,
}

/// Derive the conversation secret from our ephemeral pair and the peer's
/// announced public key. Consumes the pair: one agreement per key pair.
pub fn negotiate(local: KeyPair, remote: &PublicKeyAnnouncement) -> Result<Secret, CryptoError> {
    let peer_point = remote.to_point()?;
    let peer = UnparsedPublicKey::new(&ECDH_P256, peer_point);

    let key_bytes = agree_ephemeral(local.private, &peer, |shared| expand_key(shared))
        .map_err(|_| CryptoError::Agreement)??;

    Secret::from_key_bytes(&key_bytes)
}

/// HKDF-SHA256 expansion of the raw agreement output into the AES-GCM key.
fn expand_key(shared: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    struct OkmLen(usize);
    impl ring::hkdf::KeyType for OkmLen {
        fn len(&self) -> usize {
            self.0
        }
    }

    let mut key = [0u8; KEY_LEN];
    let prk = Salt::new(HKDF_SHA256, &[0u8; 32]).extract(shared);
    prk.expand(&[KEY_INFO], OkmLen(KEY_LEN))
        .and_then(|okm| okm.fill(&mut key))
        .map_err(|_| CryptoError::KeyGeneration)?;
    Ok(key)
}

impl Secret {
    fn from_key_bytes(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| CryptoError::KeyGeneration)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
        })
    }

    /// Encrypt a packet's text, drawing a fresh random IV.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        random_bytes(&mut iv);

        let mut buffer = plaintext.to_vec();
        let nonce = Nonce::assume_unique_for_key(iv);
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| CryptoError::Encryption)?;

        Ok(Sealed {
            iv: armor::encode(&iv),
            ciphertext: armor::encode(&buffer),
        })
    }

    /// Decrypt and authenticate a sealed message. Any failure is a hard
    /// per-message failure; the caller drops the message.
    pub fn open(&self, sealed: &Sealed) -> Result<Vec<u8>, CryptoError> {
        let iv_bytes = armor::decode(&sealed.iv).map_err(|_| CryptoError::MalformedSealed)?;
        let iv: [u8; IV_LEN] = iv_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::MalformedSealed)?;
        let mut buffer =
            armor::decode(&sealed.ciphertext).map_err(|_| CryptoError::MalformedSealed)?;

        let nonce = Nonce::assume_unique_for_key(iv);
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| CryptoError::Decryption)?;
        Ok(plaintext.to_vec())
    }
}

/// An encrypted message body: armored IV and armored ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub iv: String,
    pub ciphertext: String,
}

impl Sealed {
    /// Render the outer message body sent over the chat transport.
    pub fn encode(&self) -> String {
        format!("{}{}~{}", SEALED_MARKER, self.iv, self.ciphertext)
    }

    /// Parse an outer message body carrying the sealed marker.
    pub fn decode(text: &str) -> Result<Self, CryptoError> {
        let rest = text
            .strip_prefix(SEALED_MARKER)
            .ok_or(CryptoError::MalformedSealed)?;
        let (iv, ciphertext) = rest.split_once('~').ok_or(CryptoError::MalformedSealed)?;
        if iv.is_empty() || ciphertext.is_empty() {
            return Err(CryptoError::MalformedSealed);
        }
        Ok(Self {
            iv: iv.to_string(),
            ciphertext: ciphertext.to_string(),
        })
    }
}
