//! Key exchange protocol.
//!
//! Drives the handshake and rotations against the transport. This is the
//! only component that suspends: it awaits the transport when fetching a
//! peer's public key and when publishing a wrap. Everything it learns is
//! committed through [`KeyRing`] transitions; results of calls that were
//! in flight while the conversation was closed or reopened are dropped by
//! the ticket check in [`KeyRing::apply_for`].

use std::sync::Arc;

use veilchat_crypto::{
    IdentityKeyStore, PublicKeyBytes, SymmetricKey, WrappedKey, unwrap_key, wrap_key,
};

use crate::{
    config::ActivationPolicy,
    error::ExchangeError,
    keyring::{ApplyOutcome, KeyRing, KeyState, Ticket, Transition},
    peer::PeerId,
    transport::KeyTransport,
};

/// Handshake and rotation driver for one local identity.
pub struct KeyExchangeProtocol<T> {
    identity: Arc<IdentityKeyStore>,
    keyring: Arc<KeyRing>,
    transport: Arc<T>,
    activation: ActivationPolicy,
}

impl<T: KeyTransport> KeyExchangeProtocol<T> {
    /// Create a protocol driver.
    pub fn new(
        identity: Arc<IdentityKeyStore>,
        keyring: Arc<KeyRing>,
        transport: Arc<T>,
        activation: ActivationPolicy,
    ) -> Self {
        Self { identity, keyring, transport, activation }
    }

    /// Activation policy for conversations this side initiates.
    pub fn activation(&self) -> ActivationPolicy {
        self.activation
    }

    /// Start a conversation with `peer`.
    ///
    /// Opens the entry, fetches the peer's public key, wraps a fresh key at
    /// the next generation and publishes it. Under
    /// [`ActivationPolicy::Immediate`] the key is committed at once (`Ready`);
    /// under [`ActivationPolicy::AwaitAcknowledgement`] it is offered
    /// (`AwaitingPeerKey`) until the peer answers.
    ///
    /// Idempotent: if the entry already holds key material, or another
    /// handshake is in flight, nothing is sent and the current state is
    /// returned. Returns `None` if the conversation was closed while the
    /// handshake awaited the transport.
    ///
    /// # Errors
    ///
    /// - `PeerKeyUnavailable` if the transport has no key for the peer
    /// - `Crypto(InvalidPublicKey)` if the fetched key is unusable
    /// - `Transport` if publishing fails
    ///
    /// On error the entry stays `Pending` and the call may be retried.
    pub async fn create_conversation(
        &self,
        peer: &PeerId,
    ) -> Result<Option<KeyState>, ExchangeError> {
        let snapshot = self.keyring.open(peer);

        let Some(ticket) = self.keyring.claim_handshake(peer) else {
            tracing::debug!("Conversation with {peer} already past handshake ({:?})", snapshot.state);
            return Ok(self.keyring.status(peer));
        };

        match self.handshake(&ticket, snapshot.generation + 1).await {
            Ok(state) => Ok(state),
            Err(e) => {
                tracing::warn!("Handshake with {peer} failed: {e}");
                self.keyring.release_handshake(&ticket);
                Err(e)
            },
        }
    }

    async fn handshake(
        &self,
        ticket: &Ticket,
        generation: u64,
    ) -> Result<Option<KeyState>, ExchangeError> {
        let peer = ticket.peer();
        let public_key = self.peer_public_key(ticket).await?;

        // A wrap published for a dead incarnation would reach the peer and
        // diverge from whatever the reopened conversation agrees on.
        if !self.keyring.is_live(ticket) {
            tracing::debug!("Conversation with {peer} closed during handshake, not publishing");
            return Ok(self.keyring.status(peer));
        }

        let key = SymmetricKey::generate();
        let wrapped = wrap_key(&public_key, &key, generation)?;
        self.transport.publish_wrapped_key(peer, wrapped).await?;

        let transition = match self.activation {
            ActivationPolicy::Immediate => Transition::KeyWrapped { key, generation },
            ActivationPolicy::AwaitAcknowledgement => Transition::KeyOffered { key, generation },
        };

        match self.keyring.apply_for(ticket, transition) {
            ApplyOutcome::Applied => {
                tracing::info!("Sent conversation key to {peer} at generation {generation}");
            },
            outcome => {
                // Closed meanwhile, or the peer's key arrived first.
                tracing::debug!("Own handshake key for {peer} not committed ({outcome:?})");
                self.keyring.release_handshake(ticket);
            },
        }

        Ok(self.keyring.status(peer))
    }

    /// Accept a conversation key the peer wrapped for us.
    ///
    /// Only applies to an existing conversation: a wrap for an unknown or
    /// closed peer is `Ignored`. A wrap older than the active key is dropped
    /// without being unwrapped.
    ///
    /// # Errors
    ///
    /// - `KeyExchangeFailure` if the wrap cannot be unwrapped; key state is
    ///   left untouched
    pub fn receive_wrapped_key(
        &self,
        peer: &PeerId,
        wrapped: &WrappedKey,
    ) -> Result<ApplyOutcome, ExchangeError> {
        accept_wrapped_key(&self.identity, &self.keyring, peer, wrapped)
    }

    /// Rotate the conversation key with `peer`.
    ///
    /// The new key sits pending (`Rotating`) while the wrap is published;
    /// the previous key keeps encrypting until the rotation is confirmed and
    /// stays available for decryption afterwards. Returns the new
    /// generation.
    ///
    /// # Errors
    ///
    /// - `RotationNotAllowed` unless the entry is `Ready`, or if a
    ///   concurrent key change overtook this rotation
    /// - `Transport` if publishing fails; the rotation is aborted and the
    ///   entry returns to `Ready` on the previous key
    pub async fn rotate(&self, peer: &PeerId) -> Result<u64, ExchangeError> {
        let snapshot = match self.keyring.snapshot(peer) {
            Some(snapshot) if snapshot.state == KeyState::Ready => snapshot,
            other => {
                return Err(ExchangeError::RotationNotAllowed {
                    peer: peer.clone(),
                    state: other.map(|snapshot| snapshot.state),
                });
            },
        };

        let ticket = snapshot.ticket();
        let public_key = self.peer_public_key(&ticket).await?;

        let generation = snapshot.generation + 1;
        let key = SymmetricKey::generate();
        let wrapped = wrap_key(&public_key, &key, generation)?;

        if self.keyring.apply_for(&ticket, Transition::KeyRotated { key, generation })
            != ApplyOutcome::Applied
        {
            return Err(ExchangeError::RotationNotAllowed {
                peer: peer.clone(),
                state: self.keyring.status(peer),
            });
        }

        if let Err(e) = self.transport.publish_wrapped_key(peer, wrapped).await {
            tracing::warn!("Publishing rotation {generation} for {peer} failed: {e}");
            self.keyring.apply_for(&ticket, Transition::RotationAborted { generation });
            return Err(e.into());
        }

        self.keyring.apply_for(&ticket, Transition::RotationConfirmed { generation });
        tracing::info!("Rotated conversation key with {peer} to generation {generation}");
        Ok(generation)
    }

    /// Read the peer's current wrap over the request/response path and apply
    /// it through the same generation check as push events.
    ///
    /// Only touches an existing conversation; returns `Ignored` if there is
    /// none, it was closed during the fetch, or the peer has no wrap for us.
    pub async fn sync_from_transport(&self, peer: &PeerId) -> Result<ApplyOutcome, ExchangeError> {
        let Some(snapshot) = self.keyring.snapshot(peer) else {
            return Ok(ApplyOutcome::Ignored);
        };
        let ticket = snapshot.ticket();

        let Some(wrapped) = self.transport.fetch_wrapped_key(peer).await? else {
            return Ok(ApplyOutcome::Ignored);
        };

        if self.keyring.is_stale(peer, wrapped.generation) {
            return Ok(ApplyOutcome::Stale);
        }

        let key = unwrap_for(&self.identity, peer, &wrapped)?;
        Ok(self
            .keyring
            .apply_for(&ticket, Transition::KeyWrapped { key, generation: wrapped.generation }))
    }

    async fn peer_public_key(&self, ticket: &Ticket) -> Result<PublicKeyBytes, ExchangeError> {
        let peer = ticket.peer();
        if let Some(public_key) = self.keyring.public_key(peer) {
            return Ok(public_key);
        }

        let public_key = self.transport.fetch_public_key(peer).await?;
        self.keyring.remember_public_key(ticket, public_key.clone());
        Ok(public_key)
    }
}

/// Unwrap a peer's wrap and commit it to an existing entry.
pub(crate) fn accept_wrapped_key(
    identity: &IdentityKeyStore,
    keyring: &KeyRing,
    peer: &PeerId,
    wrapped: &WrappedKey,
) -> Result<ApplyOutcome, ExchangeError> {
    match keyring.status(peer) {
        None => {
            tracing::debug!("Ignoring wrap {} from {peer}: no conversation", wrapped.generation);
            return Ok(ApplyOutcome::Ignored);
        },
        Some(state) if state.is_terminal() => return Ok(ApplyOutcome::Ignored),
        Some(_) => {},
    }
    if keyring.is_stale(peer, wrapped.generation) {
        tracing::debug!("Skipping stale wrap {} from {peer}", wrapped.generation);
        return Ok(ApplyOutcome::Stale);
    }

    let key = unwrap_for(identity, peer, wrapped)?;
    Ok(keyring.apply(peer, Transition::KeyWrapped { key, generation: wrapped.generation }))
}

fn unwrap_for(
    identity: &IdentityKeyStore,
    peer: &PeerId,
    wrapped: &WrappedKey,
) -> Result<SymmetricKey, ExchangeError> {
    unwrap_key(identity, wrapped).map_err(|e| ExchangeError::KeyExchangeFailure {
        peer: peer.clone(),
        reason: e.to_string(),
    })
}
