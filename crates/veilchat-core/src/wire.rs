//! CBOR wire codec.
//!
//! Everything that crosses the transport (envelopes, wrapped keys, events,
//! conversation messages) is CBOR. Byte fields are encoded as CBOR byte
//! strings rather than integer arrays.

use serde::{Serialize, de::DeserializeOwned};
use veilchat_crypto::{EncryptedEnvelope, TAG_SIZE, WrappedKey};

use crate::{
    error::WireError,
    event::{ConversationMessage, KeyEvent},
};

/// Encode any wire value.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decode any wire value without semantic validation.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    ciborium::de::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

/// Decode an envelope.
///
/// # Errors
///
/// - `Decode` if the bytes are not an envelope (including an IV that is
///   not exactly 24 bytes)
/// - `Malformed` if the ciphertext cannot even hold the tag
pub fn decode_envelope(bytes: &[u8]) -> Result<EncryptedEnvelope, WireError> {
    let envelope: EncryptedEnvelope = decode(bytes)?;
    validate_envelope(&envelope)?;
    Ok(envelope)
}

/// Decode a wrapped key.
pub fn decode_wrapped_key(bytes: &[u8]) -> Result<WrappedKey, WireError> {
    let wrapped: WrappedKey = decode(bytes)?;
    if wrapped.ciphertext.is_empty() {
        return Err(WireError::Malformed {
            field: "wrapped.ciphertext",
            reason: "empty".to_string(),
        });
    }
    Ok(wrapped)
}

/// Decode a push event.
pub fn decode_event(bytes: &[u8]) -> Result<KeyEvent, WireError> {
    decode(bytes)
}

/// Decode a conversation message, validating any envelope it carries.
pub fn decode_message(bytes: &[u8]) -> Result<ConversationMessage, WireError> {
    let message: ConversationMessage = decode(bytes)?;
    if let ConversationMessage::Message { envelope, .. } = &message {
        validate_envelope(envelope)?;
    }
    Ok(message)
}

fn validate_envelope(envelope: &EncryptedEnvelope) -> Result<(), WireError> {
    if envelope.ciphertext.len() < TAG_SIZE {
        return Err(WireError::Malformed {
            field: "envelope.ciphertext",
            reason: format!(
                "{} bytes, shorter than the {TAG_SIZE}-byte tag",
                envelope.ciphertext.len()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use veilchat_crypto::{PublicKeyBytes, SymmetricKey, encrypt_with_iv};

    use super::*;
    use crate::peer::PeerId;

    fn envelope() -> EncryptedEnvelope {
        let key = SymmetricKey::from_bytes(&[7; 32]).unwrap();
        encrypt_with_iv(&key, 3, b"hello", [1; 24]).unwrap()
    }

    #[test]
    fn envelope_survives_encoding() {
        let original = envelope();
        let decoded = decode_envelope(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn byte_fields_are_byte_strings() {
        let bytes = encode(&envelope()).unwrap();
        // 5-byte plaintext + 16-byte tag as one byte string, not 21 integers.
        assert!(bytes.len() < 24 + 21 + 32);
    }

    #[test]
    fn truncated_ciphertext_is_malformed() {
        let mut envelope = envelope();
        envelope.ciphertext.truncate(TAG_SIZE - 1);

        let result = decode_envelope(&encode(&envelope).unwrap());
        assert!(matches!(result, Err(WireError::Malformed { field: "envelope.ciphertext", .. })));
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(decode_envelope(&[0xff, 0x00, 0x13]), Err(WireError::Decode(_))));
        assert!(matches!(decode_event(&[]), Err(WireError::Decode(_))));
    }

    #[test]
    fn message_kind_tag_is_snake_case() {
        #[derive(serde::Deserialize)]
        struct Tagged {
            kind: String,
        }

        let message = ConversationMessage::Announce {
            author: PeerId::new("b"),
            public_key: PublicKeyBytes::from_der(vec![1, 2, 3]),
            generation: 1,
        };
        let tagged: Tagged = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(tagged.kind, "announce");
        assert_eq!(decode_message(&encode(&message).unwrap()).unwrap(), message);
    }

    #[test]
    fn events_survive_encoding() {
        let events = [
            KeyEvent::announce(PeerId::new("b"), PublicKeyBytes::from_der(vec![4; 10]), 1),
            KeyEvent::rotate(PeerId::new("b"), WrappedKey { ciphertext: vec![5; 256], generation: 2 }),
            KeyEvent::revoke(PeerId::new("b"), 3),
        ];

        for event in events {
            assert_eq!(decode_event(&encode(&event).unwrap()).unwrap(), event);
        }
    }
}
