//! Errors raised by the cryptographic primitives.
//!
//! Variants never carry key material. Primitive failures are reported once
//! and never retried: retrying a failed decryption with the same key cannot
//! succeed and would only hand an attacker an oracle.

use thiserror::Error;

/// Errors from identity and cipher operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The randomness source or key generation algorithm failed.
    #[error("key generation failed: {reason}")]
    KeyGenerationFailure {
        /// Underlying failure
        reason: String,
    },

    /// Peer public key could not be parsed or is too weak.
    #[error("invalid public key: {reason}")]
    InvalidPublicKey {
        /// Why the key was rejected
        reason: String,
    },

    /// Asymmetric encryption of a symmetric key failed.
    #[error("key wrap failed: {reason}")]
    KeyWrapFailure {
        /// Underlying failure
        reason: String,
    },

    /// A wrapped key could not be unwrapped with our identity.
    #[error("key unwrap failed: {reason}")]
    KeyUnwrapFailure {
        /// Underlying failure
        reason: String,
    },

    /// Symmetric encryption failed. Fatal, never retried.
    #[error("encryption failed: {reason}")]
    EncryptionFailure {
        /// Underlying failure
        reason: String,
    },

    /// Authentication mismatch on a present key (tampering or key mismatch).
    #[error("decryption failed: {reason}")]
    DecryptionFailure {
        /// Underlying failure
        reason: String,
    },

    /// Signing with the identity key failed.
    #[error("signing failed: {reason}")]
    SigningFailure {
        /// Underlying failure
        reason: String,
    },

    /// Signature did not verify under the given public key.
    #[error("invalid signature")]
    InvalidSignature,
}
