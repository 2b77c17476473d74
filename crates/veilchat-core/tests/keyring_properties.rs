//! Property-based tests for the KeyRing state machine.
//!
//! Transitions are generated without any regard for validity, mimicking
//! push events and fetch completions arriving in arbitrary order.

use proptest::prelude::*;
use veilchat_core::{ApplyOutcome, ExchangeError, KeyRing, KeyState, PeerId, Transition};
use veilchat_crypto::{PublicKeyBytes, SymmetricKey};

fn key_strategy() -> impl Strategy<Value = SymmetricKey> {
    any::<[u8; 32]>().prop_map(|bytes| SymmetricKey::from_bytes(&bytes).expect("32 bytes"))
}

fn transition_strategy() -> impl Strategy<Value = Transition> {
    let generation = 0u64..8;
    prop_oneof![
        1 => (any::<u8>(), generation.clone()).prop_map(|(byte, generation)| {
            Transition::KeyAnnounced { public_key: PublicKeyBytes::from_der(vec![byte; 4]), generation }
        }),
        1 => (key_strategy(), generation.clone())
            .prop_map(|(key, generation)| Transition::KeyOffered { key, generation }),
        4 => (key_strategy(), generation.clone())
            .prop_map(|(key, generation)| Transition::KeyWrapped { key, generation }),
        2 => (key_strategy(), generation.clone())
            .prop_map(|(key, generation)| Transition::KeyRotated { key, generation }),
        2 => generation.clone().prop_map(|generation| Transition::RotationConfirmed { generation }),
        1 => generation.prop_map(|generation| Transition::RotationAborted { generation }),
        1 => Just(Transition::Revoked),
    ]
}

fn peer() -> PeerId {
    PeerId::new("B")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: generation never decreases, whatever arrives
    #[test]
    fn prop_generation_is_monotonic(
        transitions in prop::collection::vec(transition_strategy(), 1..40)
    ) {
        let ring = KeyRing::new(4);
        ring.open(&peer());
        let mut last = 0;

        for transition in transitions {
            ring.apply(&peer(), transition);
            let generation = ring.snapshot(&peer()).map_or(last, |snapshot| snapshot.generation);
            prop_assert!(generation >= last, "generation went from {} to {}", last, generation);
            last = generation;
        }
    }

    /// Property: once revoked, nothing brings an entry back
    #[test]
    fn prop_revocation_is_terminal(
        before in prop::collection::vec(transition_strategy(), 0..10),
        after in prop::collection::vec(transition_strategy(), 1..20)
    ) {
        let ring = KeyRing::new(4);
        ring.open(&peer());
        for transition in before {
            ring.apply(&peer(), transition);
        }
        ring.apply(&peer(), Transition::Revoked);
        prop_assert_eq!(ring.status(&peer()), Some(KeyState::Revoked));

        for transition in after {
            prop_assert_eq!(ring.apply(&peer(), transition), ApplyOutcome::Ignored);
            prop_assert_eq!(ring.status(&peer()), Some(KeyState::Revoked));
            let not_ready = matches!(
                ring.symmetric_key_for(&peer()),
                Err(ExchangeError::KeyNotReady { .. })
            );
            prop_assert!(not_ready);
        }
    }

    /// Property: a key is handed out only in Ready and Rotating
    #[test]
    fn prop_key_only_when_usable(
        transitions in prop::collection::vec(transition_strategy(), 1..40)
    ) {
        let ring = KeyRing::new(4);
        ring.open(&peer());

        for transition in transitions {
            ring.apply(&peer(), transition);
            let state = ring.status(&peer()).expect("entry stays open");
            let has_key = ring.symmetric_key_for(&peer()).is_ok();
            prop_assert_eq!(has_key, state.has_usable_key(), "state {:?}", state);
        }
    }

    /// Property: committed keys converge regardless of arrival order
    ///
    /// Two replicas see the same wraps in different orders and must end on
    /// the same generation and the same key.
    #[test]
    fn prop_wraps_converge_in_any_order(
        wraps in prop::collection::vec((key_strategy(), 1u64..6), 1..12)
            .prop_flat_map(|wraps| {
                let shuffled = Just(wraps.clone()).prop_shuffle();
                (Just(wraps), shuffled)
            })
    ) {
        let (in_order, shuffled) = wraps;
        let left = KeyRing::new(4);
        let right = KeyRing::new(4);
        left.open(&peer());
        right.open(&peer());

        for (key, generation) in in_order {
            left.apply(&peer(), Transition::KeyWrapped { key, generation });
        }
        for (key, generation) in shuffled {
            right.apply(&peer(), Transition::KeyWrapped { key, generation });
        }

        let left_key = left.symmetric_key_for(&peer())?;
        let right_key = right.symmetric_key_for(&peer())?;
        prop_assert_eq!(left_key.generation, right_key.generation);
        prop_assert_eq!(left_key.key.as_bytes(), right_key.key.as_bytes());
    }
}

#[test]
fn closed_entry_forgets_everything() {
    let ring = KeyRing::new(4);
    let ticket = ring.open(&peer()).ticket();
    ring.apply(&peer(), Transition::KeyWrapped { key: SymmetricKey::generate(), generation: 1 });

    assert!(ring.close(&peer()));
    assert!(ring.peers().is_empty());
    assert_eq!(
        ring.apply_for(&ticket, Transition::RotationConfirmed { generation: 2 }),
        ApplyOutcome::Ignored
    );
}
