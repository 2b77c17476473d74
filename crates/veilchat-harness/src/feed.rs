//! Push event channel for one registered peer.

use std::task::Poll;

use futures::{Stream, stream};
use tokio::sync::mpsc;
use veilchat_core::{KeyEvent, wire};

/// Receiving end of a peer's push channel.
///
/// Bytes that fail to decode are logged and skipped, like a client would
/// skip a garbled notification.
pub struct EventFeed {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl EventFeed {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Next event already delivered, without waiting.
    pub fn try_next(&mut self) -> Option<KeyEvent> {
        while let Ok(bytes) = self.rx.try_recv() {
            if let Some(event) = decode(&bytes) {
                return Some(event);
            }
        }
        None
    }

    /// Everything delivered so far.
    pub fn drain(&mut self) -> Vec<KeyEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    /// Turn the feed into a stream that ends when the hub drops the sender.
    pub fn into_stream(mut self) -> impl Stream<Item = KeyEvent> + Unpin {
        stream::poll_fn(move |cx| {
            loop {
                match self.rx.poll_recv(cx) {
                    Poll::Ready(Some(bytes)) => {
                        if let Some(event) = decode(&bytes) {
                            return Poll::Ready(Some(event));
                        }
                    },
                    Poll::Ready(None) => return Poll::Ready(None),
                    Poll::Pending => return Poll::Pending,
                }
            }
        })
    }
}

fn decode(bytes: &[u8]) -> Option<KeyEvent> {
    match wire::decode_event(bytes) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!("Skipping undecodable push event: {e}");
            None
        },
    }
}
