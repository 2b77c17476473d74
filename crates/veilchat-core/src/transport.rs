//! Transport abstraction.
//!
//! The core never performs I/O itself. Request/response calls go through a
//! [`KeyTransport`] implementation; push events arrive as a
//! `futures::Stream` of [`KeyEvent`](crate::KeyEvent) handed to the
//! [`EventReconciler`](crate::EventReconciler).
//!
//! Implementations own retries, timeouts and channel authentication.

use async_trait::async_trait;
use veilchat_crypto::{PublicKeyBytes, WrappedKey};

use crate::{error::TransportError, peer::PeerId};

/// Request/response half of the transport collaborator.
#[async_trait]
pub trait KeyTransport: Send + Sync {
    /// Fetch a peer's public identity key.
    ///
    /// # Errors
    ///
    /// - `PeerKeyUnavailable` if the peer has no key on record
    async fn fetch_public_key(&self, peer: &PeerId) -> Result<PublicKeyBytes, TransportError>;

    /// Fetch the newest conversation key the peer wrapped for us, if any.
    async fn fetch_wrapped_key(&self, peer: &PeerId) -> Result<Option<WrappedKey>, TransportError>;

    /// Publish a conversation key wrapped for `peer`.
    ///
    /// Fire-and-forget from the core's point of view: an `Ok` means the
    /// transport accepted it, not that the peer processed it.
    async fn publish_wrapped_key(
        &self,
        peer: &PeerId,
        wrapped: WrappedKey,
    ) -> Result<(), TransportError>;
}
