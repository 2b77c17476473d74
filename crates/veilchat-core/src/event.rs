//! Inbound events and conversation messages.

use serde::{Deserialize, Serialize};
use veilchat_crypto::{EncryptedEnvelope, PublicKeyBytes, WrappedKey};

use crate::peer::PeerId;

/// A key-lifecycle push event for one peer.
///
/// Ordered per peer by the transport, but unordered relative to
/// request/response completions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    /// Peer the event concerns
    pub peer: PeerId,
    /// Generation carried by the event
    pub generation: u64,
    /// What happened
    pub kind: KeyEventKind,
}

/// Payload of a [`KeyEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum KeyEventKind {
    /// Peer published (or republished) its public identity key.
    ///
    /// Unsigned. The key is only as trustworthy as the channel that
    /// delivered it.
    Announce(PublicKeyBytes),
    /// Peer wrapped a new conversation key for us.
    Rotate(WrappedKey),
    /// Conversation closed or peer removed.
    Revoke,
}

impl KeyEvent {
    /// Announce event.
    pub fn announce(peer: PeerId, public_key: PublicKeyBytes, generation: u64) -> Self {
        Self { peer, generation, kind: KeyEventKind::Announce(public_key) }
    }

    /// Rotate event; the generation is the wrap's.
    pub fn rotate(peer: PeerId, wrapped: WrappedKey) -> Self {
        Self { peer, generation: wrapped.generation, kind: KeyEventKind::Rotate(wrapped) }
    }

    /// Revoke event.
    pub fn revoke(peer: PeerId, generation: u64) -> Self {
        Self { peer, generation, kind: KeyEventKind::Revoke }
    }

    /// Kind name, for logs.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            KeyEventKind::Announce(_) => "announce",
            KeyEventKind::Rotate(_) => "rotate",
            KeyEventKind::Revoke => "revoke",
        }
    }
}

/// Everything that can arrive in a conversation, discriminated by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationMessage {
    /// Encrypted chat message.
    Message {
        /// Message identifier
        id: String,
        /// Sender
        author: PeerId,
        /// Encrypted body
        envelope: EncryptedEnvelope,
    },
    /// Conversation key wrapped for the recipient.
    Key {
        /// Sender
        author: PeerId,
        /// Wrapped key
        wrapped: WrappedKey,
    },
    /// Sender's public identity key.
    Announce {
        /// Sender
        author: PeerId,
        /// Announced key
        public_key: PublicKeyBytes,
        /// Announcement counter
        generation: u64,
    },
}

impl ConversationMessage {
    /// Sender of the message.
    pub fn author(&self) -> &PeerId {
        match self {
            Self::Message { author, .. } | Self::Key { author, .. } | Self::Announce { author, .. } => {
                author
            },
        }
    }

    /// The key event a non-chat message amounts to.
    pub fn into_key_event(self) -> Option<KeyEvent> {
        match self {
            Self::Message { .. } => None,
            Self::Key { author, wrapped } => Some(KeyEvent::rotate(author, wrapped)),
            Self::Announce { author, public_key, generation } => {
                Some(KeyEvent::announce(author, public_key, generation))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_event_takes_wrap_generation() {
        let wrapped = WrappedKey { ciphertext: vec![1, 2, 3], generation: 7 };
        let event = KeyEvent::rotate(PeerId::new("b"), wrapped);

        assert_eq!(event.generation, 7);
        assert_eq!(event.kind_name(), "rotate");
    }

    #[test]
    fn chat_message_is_not_a_key_event() {
        let message = ConversationMessage::Message {
            id: "m1".to_string(),
            author: PeerId::new("b"),
            envelope: EncryptedEnvelope { generation: 1, iv: [0; 24], ciphertext: vec![0; 16] },
        };

        assert_eq!(message.author(), &PeerId::new("b"));
        assert!(message.into_key_event().is_none());
    }

    #[test]
    fn announce_message_becomes_announce_event() {
        let public_key = PublicKeyBytes::from_der(vec![9; 4]);
        let message = ConversationMessage::Announce {
            author: PeerId::new("b"),
            public_key: public_key.clone(),
            generation: 3,
        };

        assert_eq!(
            message.into_key_event(),
            Some(KeyEvent::announce(PeerId::new("b"), public_key, 3))
        );
    }
}
