//! Local identity key pair.
//!
//! The private half never leaves this module: callers get the public key,
//! a signing operation, and an unwrap operation for short payloads. There is
//! no accessor, `Clone` or serialization for the private key.

use std::fmt;

use rand::rngs::OsRng;
use rsa::{
    Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey, pkcs8::EncodePublicKey,
    traits::PublicKeyParts,
};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::{error::CryptoError, keys::PublicKeyBytes};

/// Modulus size used by [`IdentityKeyStore::generate`].
pub const DEFAULT_MODULUS_BITS: usize = 4096;

/// Smallest modulus accepted for our own or a peer's identity.
pub const MIN_MODULUS_BITS: usize = 2048;

/// Owner of the account's long-lived RSA key pair.
pub struct IdentityKeyStore {
    private: RsaPrivateKey,
    public: PublicKeyBytes,
    modulus_bytes: usize,
}

impl IdentityKeyStore {
    /// Generate a [`DEFAULT_MODULUS_BITS`] key pair from the OS CSPRNG.
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with_bits(DEFAULT_MODULUS_BITS)
    }

    /// Generate a key pair with an explicit modulus size.
    ///
    /// # Errors
    ///
    /// - `KeyGenerationFailure` if `bits` is below [`MIN_MODULUS_BITS`] or the
    ///   prime search fails
    pub fn generate_with_bits(bits: usize) -> Result<Self, CryptoError> {
        if bits < MIN_MODULUS_BITS {
            return Err(CryptoError::KeyGenerationFailure {
                reason: format!("modulus of {bits} bits is below the {MIN_MODULUS_BITS}-bit floor"),
            });
        }

        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGenerationFailure { reason: e.to_string() })?;

        let public = RsaPublicKey::from(&private);
        let der = public
            .to_public_key_der()
            .map_err(|e| CryptoError::KeyGenerationFailure { reason: e.to_string() })?;

        Ok(Self {
            modulus_bytes: public.size(),
            public: PublicKeyBytes::from_der(der.as_bytes().to_vec()),
            private,
        })
    }

    /// Exportable public key.
    pub fn public_key(&self) -> &PublicKeyBytes {
        &self.public
    }

    /// Modulus size in bytes; every wrap addressed to us has this length.
    pub fn modulus_bytes(&self) -> usize {
        self.modulus_bytes
    }

    /// Private-key decryption of a short payload (OAEP, SHA-256, with the
    /// OAEP `label` the sender used).
    ///
    /// Only used to unwrap conversation keys, never message bodies.
    pub fn unwrap(&self, ciphertext: &[u8], label: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if ciphertext.len() != self.modulus_bytes {
            return Err(CryptoError::KeyUnwrapFailure {
                reason: format!(
                    "ciphertext is {} bytes, modulus is {}",
                    ciphertext.len(),
                    self.modulus_bytes
                ),
            });
        }

        self.private
            .decrypt(Oaep::new_with_label::<Sha256, _>(label), ciphertext)
            .map(Zeroizing::new)
            .map_err(|e| CryptoError::KeyUnwrapFailure { reason: e.to_string() })
    }

    /// RSASSA-PKCS1-v1_5 signature over SHA-256 of `message`.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = Sha256::digest(message);
        self.private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| CryptoError::SigningFailure { reason: e.to_string() })
    }
}

impl fmt::Debug for IdentityKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyStore")
            .field("public", &self.public)
            .field("modulus_bits", &(self.modulus_bytes * 8))
            .finish_non_exhaustive()
    }
}
