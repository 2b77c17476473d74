//! Key material types.

use std::fmt;

use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Size of a conversation key in bytes (256 bits).
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Per-conversation secret used for message bodies.
///
/// Zeroized on drop. `Debug` never prints the bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

impl SymmetricKey {
    /// Fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Key from raw bytes. Anything but exactly 32 bytes is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; SYMMETRIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::KeyUnwrapFailure {
                reason: format!(
                    "expected {SYMMETRIC_KEY_SIZE}-byte key, got {} bytes",
                    bytes.len()
                ),
            })?;
        Ok(Self { bytes })
    }

    /// Raw key bytes. Never log or persist these.
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.bytes
    }

    /// Deterministic tie-break between two keys minted for the same
    /// generation. Both peers evaluate it identically, so they converge on
    /// the same winner.
    pub fn outranks(&self, other: &Self) -> bool {
        self.bytes > other.bytes
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

/// Exportable public identity key (`SubjectPublicKeyInfo` DER).
///
/// Parsing is deferred to the cipher so that malformed keys surface as
/// `InvalidPublicKey` at the point of use.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKeyBytes(#[serde(with = "serde_bytes")] Vec<u8>);

impl PublicKeyBytes {
    /// Wrap DER bytes received from the transport.
    pub fn from_der(der: Vec<u8>) -> Self {
        Self(der)
    }

    /// DER encoding.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyBytes({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        let a = SymmetricKey::generate();
        let b = SymmetricKey::generate();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        assert!(SymmetricKey::from_bytes(&[0u8; 31]).is_err());
        assert!(SymmetricKey::from_bytes(&[0u8; 33]).is_err());
        assert!(SymmetricKey::from_bytes(&[7u8; 32]).is_ok());
    }

    #[test]
    fn debug_is_redacted() {
        let key = SymmetricKey::from_bytes(&[0xAB; 32]).unwrap();
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("171"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn outranks_is_antisymmetric() {
        let low = SymmetricKey::from_bytes(&[1u8; 32]).unwrap();
        let high = SymmetricKey::from_bytes(&[2u8; 32]).unwrap();
        assert!(high.outranks(&low));
        assert!(!low.outranks(&high));
        assert!(!low.outranks(&low.clone()));
    }
}
