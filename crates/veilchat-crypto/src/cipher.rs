//! Stateless cipher operations.
//!
//! Free functions with no shared state; safe to call from any number of
//! threads. Conversation keys are wrapped with RSA-OAEP (SHA-256) and message
//! bodies are sealed with `XChaCha20-Poly1305`.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};
use rsa::{Oaep, Pkcs1v15Sign, RsaPublicKey, pkcs8::DecodePublicKey, traits::PublicKeyParts};
use sha2::{Digest, Sha256};

use crate::{
    envelope::{EncryptedEnvelope, IV_SIZE, TAG_SIZE, WrappedKey},
    error::CryptoError,
    identity::{IdentityKeyStore, MIN_MODULUS_BITS},
    keys::{PublicKeyBytes, SymmetricKey},
};

/// Domain separation prefix for envelope associated data.
const ENVELOPE_AAD_PREFIX: &[u8] = b"veilchat envelope v1";

/// OAEP label prefix; the generation is appended so a wrap cannot be
/// replayed under a different generation.
const WRAP_LABEL_PREFIX: &str = "veilchat wrap v1";

/// OAEP label binding a wrap to its generation.
pub fn wrap_label(generation: u64) -> String {
    format!("{WRAP_LABEL_PREFIX}/{generation}")
}

/// Parse and validate a peer's public identity key.
///
/// # Errors
///
/// - `InvalidPublicKey` if the bytes are not an RSA `SubjectPublicKeyInfo`
///   or the modulus is below [`MIN_MODULUS_BITS`]
pub fn parse_public_key(public_key: &PublicKeyBytes) -> Result<RsaPublicKey, CryptoError> {
    let key = RsaPublicKey::from_public_key_der(public_key.as_bytes())
        .map_err(|e| CryptoError::InvalidPublicKey { reason: e.to_string() })?;

    let bits = key.size() * 8;
    if bits < MIN_MODULUS_BITS {
        return Err(CryptoError::InvalidPublicKey {
            reason: format!("{bits}-bit modulus is below the {MIN_MODULUS_BITS}-bit floor"),
        });
    }

    Ok(key)
}

/// Encrypt a conversation key under the peer's public identity key.
pub fn wrap_key(
    peer_public_key: &PublicKeyBytes,
    key: &SymmetricKey,
    generation: u64,
) -> Result<WrappedKey, CryptoError> {
    let public = parse_public_key(peer_public_key)?;
    let padding = Oaep::new_with_label::<Sha256, _>(wrap_label(generation));

    let ciphertext = public
        .encrypt(&mut OsRng, padding, key.as_bytes())
        .map_err(|e| CryptoError::KeyWrapFailure { reason: e.to_string() })?;

    Ok(WrappedKey { ciphertext, generation })
}

/// Recover a conversation key addressed to our identity.
///
/// Any failure, including a payload that is not exactly a key, is a
/// `KeyUnwrapFailure`.
pub fn unwrap_key(
    identity: &IdentityKeyStore,
    wrapped: &WrappedKey,
) -> Result<SymmetricKey, CryptoError> {
    let secret = identity.unwrap(&wrapped.ciphertext, &wrap_label(wrapped.generation))?;
    SymmetricKey::from_bytes(&secret)
}

/// Seal `plaintext` under `key` with a fresh random IV.
pub fn encrypt(
    key: &SymmetricKey,
    generation: u64,
    plaintext: &[u8],
) -> Result<EncryptedEnvelope, CryptoError> {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    encrypt_with_iv(key, generation, plaintext, iv)
}

/// Seal `plaintext` with a caller-provided IV.
///
/// Deterministic; exists for tests and fuzzing. Production code goes through
/// [`encrypt`], which never reuses an IV.
pub fn encrypt_with_iv(
    key: &SymmetricKey,
    generation: u64,
    plaintext: &[u8],
    iv: [u8; IV_SIZE],
) -> Result<EncryptedEnvelope, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let aad = associated_data(generation);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&iv), Payload { msg: plaintext, aad: &aad })
        .map_err(|_| CryptoError::EncryptionFailure {
            reason: "XChaCha20-Poly1305 rejected the input".to_string(),
        })?;

    Ok(EncryptedEnvelope { generation, iv, ciphertext })
}

/// Open an envelope.
///
/// # Errors
///
/// - `DecryptionFailure` if the ciphertext is truncated or authentication
///   fails (tampering, wrong key, or altered generation)
pub fn decrypt(key: &SymmetricKey, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, CryptoError> {
    if envelope.ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::DecryptionFailure {
            reason: format!("ciphertext shorter than the {TAG_SIZE}-byte tag"),
        });
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let aad = associated_data(envelope.generation);

    cipher
        .decrypt(
            XNonce::from_slice(&envelope.iv),
            Payload { msg: envelope.ciphertext.as_slice(), aad: &aad },
        )
        .map_err(|_| CryptoError::DecryptionFailure { reason: "authentication failed".to_string() })
}

/// Verify an [`IdentityKeyStore::sign`] signature.
pub fn verify_signature(
    public_key: &PublicKeyBytes,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let public = parse_public_key(public_key)?;
    let digest = Sha256::digest(message);

    public
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

fn associated_data(generation: u64) -> [u8; ENVELOPE_AAD_PREFIX.len() + 8] {
    let mut aad = [0u8; ENVELOPE_AAD_PREFIX.len() + 8];
    aad[..ENVELOPE_AAD_PREFIX.len()].copy_from_slice(ENVELOPE_AAD_PREFIX);
    aad[ENVELOPE_AAD_PREFIX.len()..].copy_from_slice(&generation.to_be_bytes());
    aad
}
