//! Veilchat Core
//!
//! Key lifecycle, key exchange and event reconciliation for the Veilchat
//! end-to-end encryption core.
//!
//! # Architecture
//!
//! Key state reaches a client over two channels that are ordered
//! independently: request/response reads (fetching a peer's key) and push
//! events (announce, rotate, revoke). Either may complete first. All of it
//! funnels into one authoritative [`KeyRing`], whose transition API enforces
//! generation monotonicity, so the outcome does not depend on arrival order.
//!
//! ```text
//!  Session ─ ensure_conversation / rotate ─▶ KeyExchangeProtocol ─▶ KeyTransport
//!     │                                            │
//!     │ receive / handle_event                     │ apply_for(ticket, ..)
//!     ▼                                            ▼
//!  EventReconciler ────────── apply(peer, ..) ──▶ KeyRing ──▶ KeyStatusChange
//!                                                    │
//!  encrypt_for / decrypt_from ◀── key lookups ───────┘
//! ```
//!
//! # Components
//!
//! - [`KeyRing`]: Per-peer key state machine and storage
//! - [`KeyExchangeProtocol`]: Conversation handshake and rotation
//! - [`EventReconciler`]: Push events to key ring transitions
//! - [`Session`]: Facade for the rest of the client
//! - [`KeyTransport`]: What the core needs from the transport
//! - [`wire`]: CBOR codec for everything that crosses the transport

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod config;
mod error;
mod event;
mod exchange;
mod keyring;
mod peer;
mod reconciler;
mod session;
mod transport;
pub mod wire;

pub use config::{ActivationPolicy, DEFAULT_RETAINED_GENERATIONS, SessionConfig};
pub use error::{ExchangeError, TransportError, WireError};
pub use event::{ConversationMessage, KeyEvent, KeyEventKind};
pub use exchange::KeyExchangeProtocol;
pub use keyring::{
    ActiveKey, ApplyOutcome, EntrySnapshot, KeyRing, KeyState, KeyStatusChange, Ticket,
    Transition,
};
pub use peer::PeerId;
pub use reconciler::{EventReconciler, ReconcileStats};
pub use session::{Inbound, Session};
pub use transport::KeyTransport;
