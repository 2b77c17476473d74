//! Session facade.
//!
//! The surface the rest of the client talks to: encryption keyed by peer,
//! key readiness per peer, and intake for everything the transport delivers.
//! Owns one [`KeyRing`] and wires the [`KeyExchangeProtocol`] and
//! [`EventReconciler`] to it.

use std::sync::Arc;

use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use veilchat_crypto::{
    EncryptedEnvelope, IdentityKeyStore, PublicKeyBytes, WrappedKey, decrypt, encrypt,
};

use crate::{
    config::SessionConfig,
    error::ExchangeError,
    event::{ConversationMessage, KeyEvent},
    exchange::KeyExchangeProtocol,
    keyring::{ApplyOutcome, KeyRing, KeyState, KeyStatusChange},
    peer::PeerId,
    reconciler::{EventReconciler, ReconcileStats},
    transport::KeyTransport,
};

/// Result of [`Session::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A chat message, decrypted.
    Plaintext {
        /// Message identifier
        id: String,
        /// Sender
        author: PeerId,
        /// Decrypted body
        body: Vec<u8>,
    },
    /// A key message, applied to the key ring.
    Key(ApplyOutcome),
}

/// End-to-end encryption session for one local identity.
pub struct Session<T> {
    identity: Arc<IdentityKeyStore>,
    keyring: Arc<KeyRing>,
    exchange: KeyExchangeProtocol<T>,
    reconciler: EventReconciler,
    config: SessionConfig,
}

impl<T: KeyTransport> Session<T> {
    /// Create a session with an empty key ring.
    pub fn new(identity: Arc<IdentityKeyStore>, transport: Arc<T>, config: SessionConfig) -> Self {
        let keyring = Arc::new(KeyRing::new(config.retained_generations));
        let exchange = KeyExchangeProtocol::new(
            identity.clone(),
            keyring.clone(),
            transport,
            config.activation,
        );
        let reconciler = EventReconciler::new(identity.clone(), keyring.clone());

        Self { identity, keyring, exchange, reconciler, config }
    }

    /// Our public identity key, for publishing to the directory.
    pub fn public_key(&self) -> &PublicKeyBytes {
        self.identity.public_key()
    }

    /// Configuration the session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Underlying key ring.
    pub fn keyring(&self) -> &Arc<KeyRing> {
        &self.keyring
    }

    /// Start (or resume) the conversation with `peer`.
    ///
    /// See [`KeyExchangeProtocol::create_conversation`].
    pub async fn ensure_conversation(
        &self,
        peer: &PeerId,
    ) -> Result<Option<KeyState>, ExchangeError> {
        self.exchange.create_conversation(peer).await
    }

    /// Encrypt `plaintext` under the active key for `peer`.
    ///
    /// # Errors
    ///
    /// - `KeyNotReady` unless the peer is `Ready` or `Rotating`
    pub fn encrypt_for(
        &self,
        peer: &PeerId,
        plaintext: &[u8],
    ) -> Result<EncryptedEnvelope, ExchangeError> {
        let active = self.keyring.symmetric_key_for(peer)?;
        Ok(encrypt(&active.key, active.generation, plaintext)?)
    }

    /// Decrypt an envelope from `peer` with the key of the envelope's
    /// generation.
    ///
    /// # Errors
    ///
    /// - `KeyNotReady` if no key for that generation has arrived (retry after
    ///   the next key event)
    /// - `GenerationExpired` if the generation is older than every retained
    ///   key
    /// - `DecryptionFailure` if the key is present but authentication fails
    pub fn decrypt_from(
        &self,
        peer: &PeerId,
        envelope: &EncryptedEnvelope,
    ) -> Result<Vec<u8>, ExchangeError> {
        let keys = self.keyring.keys_for_generation(peer, envelope.generation)?;

        // Both sides may have minted a key for this generation.
        keys.iter().find_map(|key| decrypt(key, envelope).ok()).ok_or_else(|| {
            tracing::warn!(
                "Envelope from {peer} at generation {} rejected by {} candidate key(s)",
                envelope.generation,
                keys.len()
            );
            ExchangeError::DecryptionFailure { peer: peer.clone() }
        })
    }

    /// Accept a conversation key `peer` wrapped for us.
    ///
    /// See [`KeyExchangeProtocol::receive_wrapped_key`].
    pub fn receive_wrapped_key(
        &self,
        peer: &PeerId,
        wrapped: &WrappedKey,
    ) -> Result<ApplyOutcome, ExchangeError> {
        self.exchange.receive_wrapped_key(peer, wrapped)
    }

    /// Rotate the conversation key with `peer`. Returns the new generation.
    pub async fn rotate(&self, peer: &PeerId) -> Result<u64, ExchangeError> {
        self.exchange.rotate(peer).await
    }

    /// Key state for `peer`, `None` if there is no conversation.
    pub fn status(&self, peer: &PeerId) -> Option<KeyState> {
        self.keyring.status(peer)
    }

    /// Close the conversation with `peer`. Effective immediately, even while
    /// a handshake or rotation is awaiting the transport.
    pub fn close(&self, peer: &PeerId) -> bool {
        self.keyring.close(peer)
    }

    /// Handle a message delivered in a conversation.
    pub fn receive(&self, message: ConversationMessage) -> Result<Inbound, ExchangeError> {
        match message {
            ConversationMessage::Message { id, author, envelope } => {
                let body = self.decrypt_from(&author, &envelope)?;
                Ok(Inbound::Plaintext { id, author, body })
            },
            other => match other.into_key_event() {
                Some(event) => self.handle_event(event).map(Inbound::Key),
                None => Ok(Inbound::Key(ApplyOutcome::Ignored)),
            },
        }
    }

    /// Apply one push event.
    pub fn handle_event(&self, event: KeyEvent) -> Result<ApplyOutcome, ExchangeError> {
        self.reconciler.handle(event)
    }

    /// Drain a push event stream into the key ring.
    pub async fn run_events<S>(&self, events: S) -> ReconcileStats
    where
        S: Stream<Item = KeyEvent> + Unpin,
    {
        self.reconciler.run(events).await
    }

    /// Pull the peer's current wrap over the request/response path.
    pub async fn sync(&self, peer: &PeerId) -> Result<ApplyOutcome, ExchangeError> {
        self.exchange.sync_from_transport(peer).await
    }

    /// Wait until `peer` has a usable key and return its generation.
    ///
    /// # Errors
    ///
    /// - `KeyNotReady` if there is no conversation, or it is closed or
    ///   revoked while waiting
    pub async fn wait_until_ready(&self, peer: &PeerId) -> Result<u64, ExchangeError> {
        // Subscribe before checking so a change between the two is not lost.
        let mut changes = self.keyring.subscribe();

        loop {
            match self.keyring.snapshot(peer) {
                Some(snapshot) if snapshot.state.has_usable_key() => {
                    return Ok(snapshot.generation);
                },
                Some(snapshot) if !snapshot.state.is_terminal() => {},
                _ => return Err(ExchangeError::KeyNotReady { peer: peer.clone() }),
            }

            match changes.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {},
                Err(RecvError::Closed) => {
                    return Err(ExchangeError::KeyNotReady { peer: peer.clone() });
                },
            }
        }
    }

    /// Subscribe to key status changes for all peers.
    pub fn subscribe(&self) -> broadcast::Receiver<KeyStatusChange> {
        self.keyring.subscribe()
    }
}
