//! Simulation harness for Veilchat key exchange testing.
//!
//! An in-memory [`MemoryHub`] stands in for the server: it holds the public
//! key directory and the newest wraps, and delivers push events over
//! per-peer channels. Each [`Participant`] is a full
//! [`Session`](veilchat_core::Session) talking to the hub through a
//! [`MemoryTransport`].
//!
//! Push events are delivered only when a participant pumps its feed, so a
//! test controls exactly how request/response completions and push events
//! interleave.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
mod feed;
mod hub;
mod participant;

pub use feed::EventFeed;
pub use hub::{MemoryHub, MemoryTransport};
pub use participant::Participant;
