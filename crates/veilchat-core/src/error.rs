//! Error types for the key exchange core.
//!
//! Two layers: transport errors raised by the collaborator that moves bytes,
//! and exchange errors surfaced to the rest of the client. Stale or invalid
//! key-state transitions are not errors at all; they are reported through
//! [`ApplyOutcome`](crate::ApplyOutcome) and otherwise swallowed.

use thiserror::Error;
use veilchat_crypto::CryptoError;

use crate::{keyring::KeyState, peer::PeerId};

/// Errors raised by a [`KeyTransport`](crate::KeyTransport) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer has no public identity key on record.
    #[error("public key for {peer} is unavailable")]
    PeerKeyUnavailable {
        /// Peer whose key was requested
        peer: PeerId,
    },

    /// The transport could not complete the call.
    #[error("transport unavailable: {reason}")]
    Unavailable {
        /// Underlying failure
        reason: String,
    },
}

/// Errors surfaced by [`Session`](crate::Session) and the exchange protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// No usable key yet. Expected while an exchange is in progress; retry
    /// after the next key event rather than reporting it to a user.
    #[error("key for {peer} is not ready")]
    KeyNotReady {
        /// Peer without a usable key
        peer: PeerId,
    },

    /// The envelope's generation is older than every key still retained.
    #[error("key generation {generation} for {peer} is no longer retained")]
    GenerationExpired {
        /// Peer the envelope came from
        peer: PeerId,
        /// Generation carried by the envelope
        generation: u64,
    },

    /// Authentication mismatch on a present key. Never retried.
    #[error("message from {peer} failed to decrypt")]
    DecryptionFailure {
        /// Peer the envelope came from
        peer: PeerId,
    },

    /// Rotation requires the peer to be `Ready`.
    #[error("cannot rotate key for {peer} in state {state:?}")]
    RotationNotAllowed {
        /// Peer whose key rotation was requested
        peer: PeerId,
        /// Current state, `None` if no conversation exists
        state: Option<KeyState>,
    },

    /// A received wrapped key could not be unwrapped; key state unchanged.
    #[error("key exchange with {peer} failed: {reason}")]
    KeyExchangeFailure {
        /// Peer whose key was rejected
        peer: PeerId,
        /// Why the exchange failed
        reason: String,
    },

    /// Propagated unchanged from the transport.
    #[error("public key for {peer} is unavailable")]
    PeerKeyUnavailable {
        /// Peer whose key was requested
        peer: PeerId,
    },

    /// Cryptographic primitive failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Transport failure other than a missing peer key.
    #[error("transport error: {0}")]
    Transport(TransportError),
}

impl ExchangeError {
    /// Returns true if waiting for a future key event (or retrying the
    /// transport call) may succeed.
    ///
    /// Cryptographic failures are never transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::KeyNotReady { .. } | Self::Transport(TransportError::Unavailable { .. })
        )
    }
}

impl From<TransportError> for ExchangeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::PeerKeyUnavailable { peer } => Self::PeerKeyUnavailable { peer },
            other @ TransportError::Unavailable { .. } => Self::Transport(other),
        }
    }
}

/// Errors from the CBOR wire codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Bytes are not a valid encoding of the expected type.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Decoded value violates a size invariant.
    #[error("malformed {field}: {reason}")]
    Malformed {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}
