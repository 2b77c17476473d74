//! Session configuration.

use serde::{Deserialize, Serialize};
use veilchat_crypto::{CryptoError, DEFAULT_MODULUS_BITS, IdentityKeyStore};

/// Default number of previous key generations kept for late messages.
pub const DEFAULT_RETAINED_GENERATIONS: usize = 4;

/// When a conversation key the initiator wrapped becomes usable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPolicy {
    /// Usable as soon as the wrap is published.
    #[default]
    Immediate,
    /// Held in `AwaitingPeerKey` until the peer announces itself or sends
    /// its own key.
    AwaitAcknowledgement,
}

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Key activation policy for conversations we initiate
    pub activation: ActivationPolicy,
    /// RSA modulus size for a freshly generated identity
    pub identity_bits: usize,
    /// Previous key generations retained per peer
    pub retained_generations: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            activation: ActivationPolicy::default(),
            identity_bits: DEFAULT_MODULUS_BITS,
            retained_generations: DEFAULT_RETAINED_GENERATIONS,
        }
    }
}

impl SessionConfig {
    /// Generate an identity of the configured size.
    ///
    /// Slow for 4096-bit keys; call from a blocking context.
    pub fn generate_identity(&self) -> Result<IdentityKeyStore, CryptoError> {
        IdentityKeyStore::generate_with_bits(self.identity_bits)
    }
}
