//! Push event reconciliation.
//!
//! Push events and request/response completions race each other. The
//! reconciler does not try to order them: it translates each event into a
//! [`KeyRing`] transition and lets the generation check decide. Whichever
//! of {fetch result, event} carries the higher generation wins; the other
//! is dropped as stale.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use veilchat_crypto::IdentityKeyStore;

use crate::{
    error::ExchangeError,
    event::{KeyEvent, KeyEventKind},
    exchange::accept_wrapped_key,
    keyring::{ApplyOutcome, KeyRing, Transition},
};

/// Counters describing what a reconciliation run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Events that changed key state
    pub applied: usize,
    /// Events dropped as stale
    pub stale: usize,
    /// Events ignored in the current state
    pub ignored: usize,
    /// Events rejected as malformed or undecryptable
    pub rejected: usize,
}

impl ReconcileStats {
    /// Count one outcome.
    pub fn record(&mut self, outcome: &Result<ApplyOutcome, ExchangeError>) {
        match outcome {
            Ok(ApplyOutcome::Applied) => self.applied += 1,
            Ok(ApplyOutcome::Stale) => self.stale += 1,
            Ok(ApplyOutcome::Ignored) => self.ignored += 1,
            Err(_) => self.rejected += 1,
        }
    }

    /// Total events seen.
    pub fn total(&self) -> usize {
        self.applied + self.stale + self.ignored + self.rejected
    }
}

/// Translates push events into key ring transitions.
///
/// Holds no key state of its own.
pub struct EventReconciler {
    identity: Arc<IdentityKeyStore>,
    keyring: Arc<KeyRing>,
}

impl EventReconciler {
    /// Create a reconciler for the given identity and key ring.
    pub fn new(identity: Arc<IdentityKeyStore>, keyring: Arc<KeyRing>) -> Self {
        Self { identity, keyring }
    }

    /// Apply one event.
    ///
    /// # Errors
    ///
    /// - `KeyExchangeFailure` if a rotate event's wrap cannot be unwrapped,
    ///   or its generation disagrees with the event's; key state is unchanged
    pub fn handle(&self, event: KeyEvent) -> Result<ApplyOutcome, ExchangeError> {
        let KeyEvent { peer, generation, kind } = event;

        match kind {
            KeyEventKind::Announce(public_key) => {
                Ok(self.keyring.apply(&peer, Transition::KeyAnnounced { public_key, generation }))
            },
            KeyEventKind::Rotate(wrapped) => {
                if wrapped.generation != generation {
                    return Err(ExchangeError::KeyExchangeFailure {
                        peer,
                        reason: format!(
                            "event generation {generation} does not match wrap generation {}",
                            wrapped.generation
                        ),
                    });
                }
                accept_wrapped_key(&self.identity, &self.keyring, &peer, &wrapped)
            },
            KeyEventKind::Revoke => {
                let outcome = self.keyring.apply(&peer, Transition::Revoked);
                if outcome == ApplyOutcome::Applied {
                    tracing::info!("Conversation with {peer} revoked");
                }
                Ok(outcome)
            },
        }
    }

    /// Drain `events`, applying each in arrival order.
    ///
    /// Rejected events are logged and dropped: the source cannot retract
    /// them, and one bad event must not stall the stream.
    pub async fn run<S>(&self, mut events: S) -> ReconcileStats
    where
        S: Stream<Item = KeyEvent> + Unpin,
    {
        let mut stats = ReconcileStats::default();

        while let Some(event) = events.next().await {
            let peer = event.peer.clone();
            let kind = event.kind_name();
            let outcome = self.handle(event);

            if let Err(e) = &outcome {
                tracing::warn!("Dropping {kind} event from {peer}: {e}");
            }
            stats.record(&outcome);
        }

        tracing::debug!("Event stream ended: {stats:?}");
        stats
    }
}
