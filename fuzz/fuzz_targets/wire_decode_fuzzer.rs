//! Fuzz target for the CBOR wire codec
//!
//! # Strategy
//!
//! - Completely arbitrary bytes fed to every decoder
//! - Whatever decodes is re-encoded and decoded again
//!
//! # Invariants
//!
//! - NEVER panic on malformed CBOR
//! - Decoded envelopes always have a tag-sized ciphertext
//! - Decode(encode(decoded)) == decoded

#![no_main]

use libfuzzer_sys::fuzz_target;
use veilchat_core::{wire, ConversationMessage};
use veilchat_crypto::TAG_SIZE;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = wire::decode_envelope(data) {
        assert!(envelope.ciphertext.len() >= TAG_SIZE);
        let again = wire::decode_envelope(&wire::encode(&envelope).expect("encode")).expect("decode");
        assert_eq!(again, envelope);
    }

    if let Ok(wrapped) = wire::decode_wrapped_key(data) {
        assert!(!wrapped.ciphertext.is_empty());
    }

    if let Ok(event) = wire::decode_event(data) {
        let again = wire::decode_event(&wire::encode(&event).expect("encode")).expect("decode");
        assert_eq!(again, event);
    }

    if let Ok(message) = wire::decode_message(data) {
        if let ConversationMessage::Message { envelope, .. } = &message {
            assert!(envelope.ciphertext.len() >= TAG_SIZE);
        }
        let again = wire::decode_message(&wire::encode(&message).expect("encode")).expect("decode");
        assert_eq!(again, message);
    }
});
