//! Fuzz target for message envelope encryption
//!
//! # Strategy
//!
//! - Arbitrary keys, IVs, generations and plaintexts
//! - Single-bit flips anywhere in the ciphertext
//! - Altered generation, truncated ciphertext, wrong key
//!
//! # Invariants
//!
//! - Encrypt/decrypt roundtrip succeeds
//! - Ciphertext is exactly plaintext + tag
//! - Every tampering is rejected with DecryptionFailure, never a panic and
//!   never a wrong plaintext

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use veilchat_crypto::{
    decrypt, encrypt_with_iv, CryptoError, SymmetricKey, IV_SIZE, TAG_SIZE,
};

#[derive(Debug, Clone, Arbitrary)]
struct EnvelopeScenario {
    key: [u8; 32],
    iv: [u8; IV_SIZE],
    generation: u64,
    plaintext: Vec<u8>,
    tamper: Tamper,
}

#[derive(Debug, Clone, Arbitrary)]
enum Tamper {
    None,
    FlipBit { index: u16, bit: u8 },
    Generation { delta: u64 },
    Truncate { keep: u16 },
    WrongKey { key: [u8; 32] },
}

fuzz_target!(|scenario: EnvelopeScenario| {
    let key = SymmetricKey::from_bytes(&scenario.key).expect("32 bytes");

    let mut envelope = match encrypt_with_iv(&key, scenario.generation, &scenario.plaintext, scenario.iv) {
        Ok(envelope) => envelope,
        Err(_) => return,
    };

    // INVARIANT 1: Ciphertext carries exactly one tag
    assert_eq!(envelope.ciphertext.len(), scenario.plaintext.len() + TAG_SIZE);

    // INVARIANT 2: Roundtrip
    let opened = decrypt(&key, &envelope).expect("roundtrip must succeed");
    assert_eq!(opened, scenario.plaintext);

    let decrypt_key = match scenario.tamper {
        Tamper::None => return,
        Tamper::FlipBit { index, bit } => {
            let index = usize::from(index) % envelope.ciphertext.len();
            envelope.ciphertext[index] ^= 1 << (bit % 8);
            key
        },
        Tamper::Generation { delta } => {
            if delta == 0 {
                return;
            }
            envelope.generation = envelope.generation.wrapping_add(delta);
            key
        },
        Tamper::Truncate { keep } => {
            let keep = usize::from(keep) % envelope.ciphertext.len();
            envelope.ciphertext.truncate(keep);
            key
        },
        Tamper::WrongKey { key: other } => {
            if other == scenario.key {
                return;
            }
            SymmetricKey::from_bytes(&other).expect("32 bytes")
        },
    };

    // INVARIANT 3: Tampering is always detected
    assert!(matches!(
        decrypt(&decrypt_key, &envelope),
        Err(CryptoError::DecryptionFailure { .. })
    ));
});
