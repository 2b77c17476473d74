//! Wire representations produced by the cipher.

use serde::{Deserialize, Serialize};

/// Size of the random IV (`XChaCha20` extended nonce).
pub const IV_SIZE: usize = 24;

/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;

/// One encrypted message body.
///
/// Immutable once produced. The IV is fresh for every encryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Generation of the conversation key that sealed this envelope. Bound
    /// into the associated data, so it cannot be altered in transit.
    pub generation: u64,
    /// Random 24-byte IV
    #[serde(with = "serde_bytes")]
    pub iv: [u8; IV_SIZE],
    /// Ciphertext including the 16-byte tag
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedEnvelope {
    /// Plaintext length (ciphertext length minus authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(TAG_SIZE)
    }
}

/// A conversation key encrypted under a peer's public identity key.
///
/// Transient: exists only between the exchange protocol and the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// RSA-OAEP ciphertext, as long as the recipient's modulus
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    /// Generation the wrapped key corresponds to
    pub generation: u64,
}
