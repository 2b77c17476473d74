//! Fuzz target for key ring state transitions
//!
//! # Strategy
//!
//! - A handful of peers sharing one key ring
//! - Arbitrary interleavings of open, close, handshake claims and every
//!   transition, including results carrying tickets from closed incarnations
//!
//! # Invariants
//!
//! - Generation never decreases within one incarnation
//! - Revoked is terminal until the entry is closed
//! - A symmetric key is handed out only in Ready or Rotating
//! - The handed-out key generation matches the entry generation
//! - Stale tickets never create or modify an entry
//! - Only an announce brings an absent peer into the ring
//! - Retired generations stay within the retention bound

#![no_main]

use std::collections::HashMap;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use veilchat_core::{KeyRing, KeyState, PeerId, Ticket, Transition};
use veilchat_crypto::{PublicKeyBytes, SymmetricKey};

const PEERS: [&str; 3] = ["alice", "bob", "carol"];

#[derive(Debug, Clone, Arbitrary)]
enum Step {
    Transition,
    UseTicket { ticket: u8 },
}

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Open,
    Close,
    Claim,
    Announce { generation: u8 },
    Offer { key: [u8; 32], generation: u8 },
    Wrap { key: [u8; 32], generation: u8 },
    Rotate { key: [u8; 32], generation: u8 },
    Confirm { generation: u8 },
    Abort { generation: u8 },
    Revoke,
}

#[derive(Debug, Clone, Arbitrary)]
struct Action {
    peer: u8,
    op: Op,
    step: Step,
}

#[derive(Debug, Clone, Arbitrary)]
struct KeyRingScenario {
    retained: u8,
    actions: Vec<Action>,
}

fn transition(op: &Op) -> Option<Transition> {
    let key = |bytes: &[u8; 32]| SymmetricKey::from_bytes(bytes).expect("32 bytes");

    Some(match op {
        Op::Open | Op::Close | Op::Claim => return None,
        Op::Announce { generation } => Transition::KeyAnnounced {
            public_key: PublicKeyBytes::from_der(vec![*generation; 4]),
            generation: u64::from(*generation),
        },
        Op::Offer { key: bytes, generation } => {
            Transition::KeyOffered { key: key(bytes), generation: u64::from(*generation) }
        },
        Op::Wrap { key: bytes, generation } => {
            Transition::KeyWrapped { key: key(bytes), generation: u64::from(*generation) }
        },
        Op::Rotate { key: bytes, generation } => {
            Transition::KeyRotated { key: key(bytes), generation: u64::from(*generation) }
        },
        Op::Confirm { generation } => {
            Transition::RotationConfirmed { generation: u64::from(*generation) }
        },
        Op::Abort { generation } => {
            Transition::RotationAborted { generation: u64::from(*generation) }
        },
        Op::Revoke => Transition::Revoked,
    })
}

fuzz_target!(|scenario: KeyRingScenario| {
    if scenario.actions.len() > 256 {
        return;
    }

    let retained = usize::from(scenario.retained % 6);
    let keyring = KeyRing::new(retained);
    let mut tickets: Vec<Ticket> = Vec::new();
    // (incarnation, generation, revoked) per peer
    let mut last: HashMap<PeerId, (u64, u64, bool)> = HashMap::new();

    for action in &scenario.actions {
        let peer = PeerId::new(PEERS[usize::from(action.peer) % PEERS.len()]);
        match (&action.op, &action.step) {
            (Op::Open, _) => tickets.push(keyring.open(&peer).ticket()),
            (Op::Close, _) => {
                keyring.close(&peer);
            },
            (Op::Claim, _) => {
                if let Some(ticket) = keyring.claim_handshake(&peer) {
                    tickets.push(ticket);
                }
            },
            (op, Step::Transition) => {
                let absent = keyring.status(&peer).is_none();
                if let Some(transition) = transition(op) {
                    let announce = matches!(transition, Transition::KeyAnnounced { .. });
                    keyring.apply(&peer, transition);

                    // INVARIANT: Only an announce creates an entry
                    if absent && !announce {
                        assert_eq!(keyring.status(&peer), None);
                    }
                }
            },
            (op, Step::UseTicket { ticket }) => {
                let Some(ticket) = tickets.get(usize::from(*ticket) % tickets.len().max(1)) else {
                    continue;
                };
                let target = ticket.peer().clone();
                let target_before = keyring.snapshot(&target);
                let live = target_before.as_ref().is_some_and(|s| s.ticket() == *ticket);

                if let Some(transition) = transition(op) {
                    keyring.apply_for(ticket, transition);
                }

                // INVARIANT: Stale tickets never create or modify an entry
                if !live {
                    assert_eq!(keyring.snapshot(&target), target_before);
                }
            },
        }

        let after = keyring.snapshot(&peer);
        let Some(snapshot) = after else {
            last.remove(&peer);
            assert!(keyring.symmetric_key_for(&peer).is_err());
            continue;
        };

        if let Some(&(incarnation, generation, revoked)) = last.get(&peer) {
            if incarnation == snapshot.incarnation {
                // INVARIANT: Monotonic generation within one incarnation
                assert!(snapshot.generation >= generation);

                // INVARIANT: Revoked is terminal
                if revoked {
                    assert_eq!(snapshot.state, KeyState::Revoked);
                }
            }
        }

        // INVARIANT: Keys only in usable states, at the entry generation
        if let Ok(active) = keyring.symmetric_key_for(&peer) {
            assert!(snapshot.state.has_usable_key());
            assert_eq!(active.generation, snapshot.generation);
        }

        // INVARIANT: Retention bound
        assert!(snapshot.retired_generations.len() <= retained);

        last.insert(
            peer,
            (snapshot.incarnation, snapshot.generation, snapshot.state == KeyState::Revoked),
        );
    }
});
