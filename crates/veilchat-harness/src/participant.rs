//! A simulated client: one session wired to the hub.

use std::sync::{Arc, Mutex, MutexGuard};

use veilchat_core::{
    ConversationMessage, ExchangeError, Inbound, KeyEvent, PeerId, ReconcileStats, Session,
    SessionConfig,
};
use veilchat_crypto::IdentityKeyStore;

use crate::{
    feed::EventFeed,
    hub::{MemoryHub, MemoryTransport},
};

/// A registered peer with its session and push feed.
pub struct Participant {
    id: PeerId,
    session: Session<MemoryTransport>,
    feed: Mutex<Option<EventFeed>>,
}

impl Participant {
    /// Register `id` with the hub and build its session.
    pub fn join(
        hub: &Arc<MemoryHub>,
        id: impl Into<PeerId>,
        identity: Arc<IdentityKeyStore>,
        config: SessionConfig,
    ) -> Self {
        let id = id.into();
        let (transport, feed) = hub.register(id.clone(), identity.public_key().clone());
        let session = Session::new(identity, Arc::new(transport), config);

        Self { id, session, feed: Mutex::new(Some(feed)) }
    }

    /// Peer id.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// The participant's session.
    pub fn session(&self) -> &Session<MemoryTransport> {
        &self.session
    }

    /// Apply every push event delivered so far.
    pub fn pump(&self) -> ReconcileStats {
        let events = self.drain();
        let mut stats = ReconcileStats::default();

        for event in events {
            let outcome = self.session.handle_event(event);
            if let Err(e) = &outcome {
                tracing::warn!("{} dropped an event: {e}", self.id);
            }
            stats.record(&outcome);
        }

        stats
    }

    /// Take delivered events without applying them.
    pub fn drain(&self) -> Vec<KeyEvent> {
        let mut feed = self.feed();
        feed.as_mut().map(EventFeed::drain).unwrap_or_default()
    }

    /// Take the feed out, e.g. to drive it as a stream. Later pumps see
    /// nothing.
    pub fn take_feed(&self) -> Option<EventFeed> {
        self.feed().take()
    }

    #[allow(clippy::expect_used)]
    fn feed(&self) -> MutexGuard<'_, Option<EventFeed>> {
        self.feed.lock().expect("feed mutex poisoned")
    }

    /// Encrypt `text` for `to` as a conversation message.
    pub fn compose(
        &self,
        to: &PeerId,
        id: &str,
        text: &str,
    ) -> Result<ConversationMessage, ExchangeError> {
        let envelope = self.session.encrypt_for(to, text.as_bytes())?;
        Ok(ConversationMessage::Message { id: id.to_string(), author: self.id.clone(), envelope })
    }

    /// Decrypt an inbound conversation message to text.
    pub fn read(&self, message: ConversationMessage) -> Result<String, ExchangeError> {
        match self.session.receive(message)? {
            Inbound::Plaintext { body, .. } => Ok(String::from_utf8_lossy(&body).into_owned()),
            Inbound::Key(outcome) => Ok(format!("<key message: {outcome:?}>")),
        }
    }
}
