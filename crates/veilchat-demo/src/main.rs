//! Veilchat demo binary.
//!
//! Runs two sessions against an in-memory hub: handshake, a few messages
//! over the CBOR wire format, key rotations, and finally a revoke.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 4096-bit identities, immediate activation
//! veilchat-demo
//!
//! # Faster keys, acknowledgement policy, more traffic
//! veilchat-demo --bits 2048 --policy await-acknowledgement --messages 5 --rotations 3
//! ```

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use veilchat_core::{ActivationPolicy, SessionConfig, wire};
use veilchat_harness::{MemoryHub, Participant};

/// Key activation policy
#[derive(ValueEnum, Clone, Copy, Debug)]
enum Policy {
    /// Usable as soon as the initiator publishes
    Immediate,
    /// Usable once the peer acknowledges
    AwaitAcknowledgement,
}

impl From<Policy> for ActivationPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Immediate => Self::Immediate,
            Policy::AwaitAcknowledgement => Self::AwaitAcknowledgement,
        }
    }
}

/// Veilchat two-party walkthrough
#[derive(Parser, Debug)]
#[command(name = "veilchat-demo")]
#[command(about = "Veilchat end-to-end key exchange walkthrough")]
#[command(version)]
struct Args {
    /// RSA identity size in bits
    #[arg(long, default_value = "4096")]
    bits: usize,

    /// Key activation policy
    #[arg(long, value_enum, default_value = "immediate")]
    policy: Policy,

    /// Messages sent in each direction per key generation
    #[arg(long, default_value = "2")]
    messages: usize,

    /// Number of key rotations
    #[arg(long, default_value = "1")]
    rotations: usize,

    /// Previous key generations kept for late messages
    #[arg(long, default_value = "4")]
    retained_generations: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = SessionConfig {
        activation: args.policy.into(),
        identity_bits: args.bits,
        retained_generations: args.retained_generations,
    };

    tracing::info!("Generating two {}-bit identities", config.identity_bits);
    let (alice_identity, bob_identity) = {
        let alice = tokio::task::spawn_blocking({
            let config = config.clone();
            move || config.generate_identity()
        });
        let bob = tokio::task::spawn_blocking({
            let config = config.clone();
            move || config.generate_identity()
        });
        (Arc::new(alice.await??), Arc::new(bob.await??))
    };

    let hub = MemoryHub::new();
    let alice = Participant::join(&hub, "alice", alice_identity, config.clone());
    let bob = Participant::join(&hub, "bob", bob_identity, config);

    let state = alice.session().ensure_conversation(bob.id()).await?;
    tracing::info!("alice -> bob handshake sent, alice is {state:?}");

    bob.pump();
    if matches!(args.policy, Policy::AwaitAcknowledgement) {
        // Bob acknowledges by announcing himself.
        hub.announce(bob.id(), 1);
        alice.pump();
    }
    let generation = alice.session().wait_until_ready(bob.id()).await?;
    tracing::info!("Conversation ready at generation {generation}");

    converse(&alice, &bob, args.messages, generation)?;

    for _ in 0..args.rotations {
        let generation = alice.session().rotate(bob.id()).await?;
        let stats = bob.pump();
        tracing::info!("alice rotated to generation {generation}, bob applied {}", stats.applied);
        converse(&alice, &bob, args.messages, generation)?;
    }

    hub.close_conversation(alice.id(), bob.id());
    bob.pump();
    tracing::info!("alice closed the conversation, bob is {:?}", bob.session().status(alice.id()));

    match bob.session().encrypt_for(alice.id(), b"anyone there?") {
        Ok(_) => tracing::warn!("bob could still encrypt after revocation"),
        Err(e) => tracing::info!("bob can no longer encrypt: {e}"),
    }

    Ok(())
}

fn converse(
    alice: &Participant,
    bob: &Participant,
    messages: usize,
    generation: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    for n in 0..messages {
        for (from, to) in [(alice, bob), (bob, alice)] {
            let id = format!("{}-{generation}-{n}", from.id());
            let text = format!("message {n} from {} at generation {generation}", from.id());

            let bytes = wire::encode(&from.compose(to.id(), &id, &text)?)?;
            let received = to.read(wire::decode_message(&bytes)?)?;
            tracing::info!("{} read {id} ({} bytes on the wire): {received}", to.id(), bytes.len());
        }
    }
    Ok(())
}
