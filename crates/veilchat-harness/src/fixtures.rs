//! Shared test identities.
//!
//! RSA key generation dominates test time, so a small pool of minimum-size
//! identities is generated once per test binary and handed out by index.

use std::sync::{Arc, LazyLock};

use veilchat_crypto::{IdentityKeyStore, MIN_MODULUS_BITS};

/// Number of pooled identities.
pub const POOL_SIZE: usize = 3;

#[allow(clippy::expect_used)]
static POOL: LazyLock<Vec<Arc<IdentityKeyStore>>> = LazyLock::new(|| {
    (0..POOL_SIZE)
        .map(|_| {
            Arc::new(
                IdentityKeyStore::generate_with_bits(MIN_MODULUS_BITS)
                    .expect("identity generation"),
            )
        })
        .collect()
});

/// Pooled identity `index % POOL_SIZE`.
pub fn identity(index: usize) -> Arc<IdentityKeyStore> {
    Arc::clone(&POOL[index % POOL_SIZE])
}
