//! In-memory stand-in for the server.
//!
//! The hub keeps a directory of public identity keys, the newest wrap each
//! peer published for each other peer, and one push channel per registered
//! peer. Push events travel CBOR-encoded, exactly as they would on a wire.
//!
//! The first wrap a peer publishes for another is preceded by an announce of
//! the publisher's public key, which is what opens the conversation on the
//! receiving side.
//!
//! Fault injection:
//! - [`MemoryHub::pause_fetches`] holds request/response completions in
//!   flight (the response is captured when the request is made), so push
//!   events can overtake them
//! - [`MemoryHub::fail_publishes`] makes one peer's publishes fail

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use veilchat_core::{KeyEvent, KeyTransport, PeerId, TransportError, wire};
use veilchat_crypto::{PublicKeyBytes, WrappedKey};

use crate::feed::EventFeed;

#[derive(Default)]
struct HubState {
    directory: HashMap<PeerId, PublicKeyBytes>,
    wraps: HashMap<(PeerId, PeerId), WrappedKey>,
    introduced: HashSet<(PeerId, PeerId)>,
    inboxes: HashMap<PeerId, mpsc::UnboundedSender<Vec<u8>>>,
    failing: HashSet<PeerId>,
    publishes: usize,
}

/// Shared in-memory directory and push fabric.
pub struct MemoryHub {
    state: Mutex<HubState>,
    fetch_gate: watch::Sender<bool>,
}

impl MemoryHub {
    /// Create an empty hub with fetches flowing.
    pub fn new() -> Arc<Self> {
        let (fetch_gate, _) = watch::channel(true);
        Arc::new(Self { state: Mutex::new(HubState::default()), fetch_gate })
    }

    /// Register a peer: publish its public key and open its push channel.
    ///
    /// Registering the same peer again replaces its key and channel.
    pub fn register(
        self: &Arc<Self>,
        peer: PeerId,
        public_key: PublicKeyBytes,
    ) -> (MemoryTransport, EventFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state();
            state.directory.insert(peer.clone(), public_key);
            state.inboxes.insert(peer.clone(), tx);
        }

        tracing::debug!("Registered {peer} with the hub");
        (MemoryTransport { hub: Arc::clone(self), local: peer }, EventFeed::new(rx))
    }

    /// Drop `peer`'s push channel; its feed stream ends once drained.
    pub fn disconnect(&self, peer: &PeerId) {
        self.state().inboxes.remove(peer);
    }

    /// Push `peer`'s public key to every other registered peer.
    pub fn announce(&self, peer: &PeerId, generation: u64) {
        let state = self.state();
        let Some(public_key) = state.directory.get(peer).cloned() else {
            return;
        };

        for recipient in state.inboxes.keys().filter(|recipient| *recipient != peer) {
            let event = KeyEvent::announce(peer.clone(), public_key.clone(), generation);
            Self::push(&state, recipient, &event);
        }
    }

    /// `from` closes its conversation with `to`; `to` receives a revoke.
    pub fn close_conversation(&self, from: &PeerId, to: &PeerId) {
        let mut state = self.state();
        let pair = (from.clone(), to.clone());
        state.introduced.remove(&pair);
        let generation = state.wraps.remove(&pair).map_or(0, |wrapped| wrapped.generation);

        Self::push(&state, to, &KeyEvent::revoke(from.clone(), generation));
    }

    /// Deliver an arbitrary event to `to`.
    pub fn inject(&self, to: &PeerId, event: &KeyEvent) {
        let state = self.state();
        Self::push(&state, to, event);
    }

    /// Deliver raw bytes to `to`, bypassing the encoder.
    pub fn inject_raw(&self, to: &PeerId, bytes: Vec<u8>) {
        let state = self.state();
        if let Some(inbox) = state.inboxes.get(to) {
            let _ = inbox.send(bytes);
        }
    }

    /// Newest wrap `from` published for `to`.
    pub fn latest_wrap(&self, from: &PeerId, to: &PeerId) -> Option<WrappedKey> {
        let state = self.state();
        state.wraps.get(&(from.clone(), to.clone())).cloned()
    }

    /// Number of successful publishes so far.
    pub fn publishes(&self) -> usize {
        self.state().publishes
    }

    /// Hold fetch responses until [`MemoryHub::resume_fetches`].
    pub fn pause_fetches(&self) {
        self.fetch_gate.send_replace(false);
    }

    /// Release held fetch responses.
    pub fn resume_fetches(&self) {
        self.fetch_gate.send_replace(true);
    }

    /// Make publishes by `peer` fail (or succeed again).
    pub fn fail_publishes(&self, peer: &PeerId, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing.insert(peer.clone());
        } else {
            state.failing.remove(peer);
        }
    }

    #[allow(clippy::expect_used)]
    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().expect("hub mutex poisoned")
    }

    async fn wait_for_gate(&self) -> Result<(), TransportError> {
        let mut gate = self.fetch_gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::Unavailable { reason: "hub shut down".to_string() })
    }

    fn push(state: &HubState, to: &PeerId, event: &KeyEvent) {
        let Some(inbox) = state.inboxes.get(to) else {
            tracing::debug!("No inbox for {to}, dropping {} event", event.kind_name());
            return;
        };

        match wire::encode(event) {
            Ok(bytes) => {
                // A dropped feed just means nobody listens any more.
                let _ = inbox.send(bytes);
            },
            Err(e) => tracing::warn!("Failed to encode event for {to}: {e}"),
        }
    }
}

/// One peer's view of the hub.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    local: PeerId,
}

impl MemoryTransport {
    /// Peer this transport acts for.
    pub fn local(&self) -> &PeerId {
        &self.local
    }
}

#[async_trait]
impl KeyTransport for MemoryTransport {
    async fn fetch_public_key(&self, peer: &PeerId) -> Result<PublicKeyBytes, TransportError> {
        let response = {
            let state = self.hub.state();
            state.directory.get(peer).cloned()
        };

        self.hub.wait_for_gate().await?;
        response.ok_or_else(|| TransportError::PeerKeyUnavailable { peer: peer.clone() })
    }

    async fn fetch_wrapped_key(&self, peer: &PeerId) -> Result<Option<WrappedKey>, TransportError> {
        let response = {
            let state = self.hub.state();
            state.wraps.get(&(peer.clone(), self.local.clone())).cloned()
        };

        self.hub.wait_for_gate().await?;
        Ok(response)
    }

    async fn publish_wrapped_key(
        &self,
        peer: &PeerId,
        wrapped: WrappedKey,
    ) -> Result<(), TransportError> {
        let mut state = self.hub.state();

        if state.failing.contains(&self.local) {
            return Err(TransportError::Unavailable {
                reason: format!("publish from {} rejected", self.local),
            });
        }

        let pair = (self.local.clone(), peer.clone());
        if !state.introduced.contains(&pair) {
            if let Some(public_key) = state.directory.get(&self.local).cloned() {
                let event = KeyEvent::announce(self.local.clone(), public_key, 0);
                MemoryHub::push(&state, peer, &event);
            }
            state.introduced.insert(pair.clone());
        }

        let event = KeyEvent::rotate(self.local.clone(), wrapped.clone());
        state.wraps.insert(pair, wrapped);
        state.publishes += 1;
        MemoryHub::push(&state, peer, &event);
        Ok(())
    }
}
