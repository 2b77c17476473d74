//! Veilchat Cryptographic Primitives
//!
//! Building blocks for the Veilchat end-to-end encryption core: the local
//! identity key pair and the stateless cipher operations built on it.
//!
//! # Key Hierarchy
//!
//! Every account owns one long-lived RSA identity. Each conversation has a
//! 32-byte symmetric key that is generated by one side, wrapped under the
//! other side's public identity key, and published. Message bodies are sealed
//! with the conversation key.
//!
//! ```text
//! Identity key pair (RSA, 4096-bit default)
//!        │  wrap / unwrap (RSA-OAEP, SHA-256, generation-bound label)
//!        ▼
//! Conversation key (32 bytes, one per peer per generation)
//!        │  seal / open (XChaCha20-Poly1305, random 24-byte IV)
//!        ▼
//! Encrypted envelope
//! ```
//!
//! # Security
//!
//! Private material:
//! - The identity private key never leaves [`IdentityKeyStore`]
//! - Conversation keys are zeroized on drop and redacted in `Debug`
//!
//! Authenticity:
//! - AEAD tag failure is reported as `DecryptionFailure`, never retried
//! - The key generation is bound into the associated data and the OAEP label

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod cipher;
mod envelope;
mod error;
mod identity;
mod keys;

pub use cipher::{
    decrypt, encrypt, encrypt_with_iv, parse_public_key, unwrap_key, verify_signature, wrap_key,
};
pub use envelope::{EncryptedEnvelope, IV_SIZE, TAG_SIZE, WrappedKey};
pub use error::CryptoError;
pub use identity::{DEFAULT_MODULUS_BITS, IdentityKeyStore, MIN_MODULUS_BITS};
pub use keys::{PublicKeyBytes, SYMMETRIC_KEY_SIZE, SymmetricKey};
