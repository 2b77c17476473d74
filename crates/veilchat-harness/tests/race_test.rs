//! Races between request/response completions, push events and closes.
//!
//! The hub captures a fetch response when the request is made and holds it
//! while fetches are paused, so a push event or a close can overtake it.

use std::sync::Arc;

use veilchat_core::{ApplyOutcome, ExchangeError, KeyState, SessionConfig};
use veilchat_harness::{MemoryHub, Participant, fixtures::identity};

/// Bob initiates, Alice learns the key from the push event. Alice does not
/// know Bob's public key yet.
async fn bob_initiated() -> (Arc<MemoryHub>, Participant, Participant) {
    let hub = MemoryHub::new();
    let alice = Participant::join(&hub, "alice", identity(0), SessionConfig::default());
    let bob = Participant::join(&hub, "bob", identity(1), SessionConfig::default());

    bob.session().ensure_conversation(alice.id()).await.unwrap();
    alice.pump();
    (hub, alice, bob)
}

#[tokio::test]
async fn rotation_event_overtakes_older_fetch() {
    let (hub, alice, bob) = bob_initiated().await;
    hub.pause_fetches();

    // The fetch captures generation 1; the rotation to 2 lands first.
    let (synced, ()) = tokio::join!(alice.session().sync(bob.id()), async {
        tokio::task::yield_now().await;
        assert_eq!(bob.session().rotate(alice.id()).await, Ok(2));
        assert_eq!(alice.pump().applied, 1);
        hub.resume_fetches();
    });

    assert_eq!(synced, Ok(ApplyOutcome::Stale));
    let active = alice.session().keyring().symmetric_key_for(bob.id()).unwrap();
    let theirs = bob.session().keyring().symmetric_key_for(alice.id()).unwrap();
    assert_eq!(active.generation, 2);
    assert_eq!(active.key.as_bytes(), theirs.key.as_bytes());
}

#[tokio::test]
async fn fetch_overtakes_rotation_event() {
    let (_hub, alice, bob) = bob_initiated().await;

    assert_eq!(bob.session().rotate(alice.id()).await, Ok(2));
    assert_eq!(alice.session().sync(bob.id()).await, Ok(ApplyOutcome::Applied));

    // The push event for the same generation arrives second and is a no-op.
    let stats = alice.pump();
    assert_eq!(stats.stale, 1);

    let active = alice.session().keyring().symmetric_key_for(bob.id()).unwrap();
    let theirs = bob.session().keyring().symmetric_key_for(alice.id()).unwrap();
    assert_eq!(active.generation, 2);
    assert_eq!(active.key.as_bytes(), theirs.key.as_bytes());
}

#[tokio::test]
async fn close_during_handshake_drops_response() {
    let hub = MemoryHub::new();
    let alice = Participant::join(&hub, "alice", identity(0), SessionConfig::default());
    let bob = Participant::join(&hub, "bob", identity(1), SessionConfig::default());
    hub.pause_fetches();

    let (created, ()) = tokio::join!(alice.session().ensure_conversation(bob.id()), async {
        tokio::task::yield_now().await;
        assert_eq!(alice.session().status(bob.id()), Some(KeyState::Pending));
        assert!(alice.session().close(bob.id()));
        hub.resume_fetches();
    });

    assert_eq!(created, Ok(None));
    assert_eq!(alice.session().status(bob.id()), None);
    assert!(matches!(
        alice.session().encrypt_for(bob.id(), b"x"),
        Err(ExchangeError::KeyNotReady { .. })
    ));

    // Nothing reached Bob either.
    assert_eq!(hub.publishes(), 0);
    assert_eq!(bob.pump().total(), 0);
    assert_eq!(bob.session().status(alice.id()), None);
}

#[tokio::test]
async fn reopened_conversation_ignores_old_handshake() {
    let hub = MemoryHub::new();
    let alice = Participant::join(&hub, "alice", identity(0), SessionConfig::default());
    let bob = Participant::join(&hub, "bob", identity(1), SessionConfig::default());
    hub.pause_fetches();

    let (created, ()) = tokio::join!(alice.session().ensure_conversation(bob.id()), async {
        tokio::task::yield_now().await;
        alice.session().close(bob.id());
        alice.session().keyring().open(bob.id());
        hub.resume_fetches();
    });

    // The old handshake completed against a dead incarnation and sent
    // nothing.
    assert_eq!(created, Ok(Some(KeyState::Pending)));
    assert_eq!(hub.publishes(), 0);

    // A fresh attempt on the new incarnation goes through.
    assert_eq!(alice.session().ensure_conversation(bob.id()).await, Ok(Some(KeyState::Ready)));
    assert_eq!(hub.publishes(), 1);

    bob.pump();
    let ours = alice.session().keyring().symmetric_key_for(bob.id()).unwrap();
    let theirs = bob.session().keyring().symmetric_key_for(alice.id()).unwrap();
    assert_eq!(ours.generation, theirs.generation);
    assert_eq!(ours.key.as_bytes(), theirs.key.as_bytes());

    let envelope = alice.session().encrypt_for(bob.id(), b"second try").unwrap();
    assert_eq!(bob.session().decrypt_from(alice.id(), &envelope).unwrap(), b"second try");
}

#[tokio::test]
async fn close_during_rotation_fetch_publishes_nothing() {
    let hub = MemoryHub::new();
    let alice = Participant::join(&hub, "alice", identity(0), SessionConfig::default());
    let bob = Participant::join(&hub, "bob", identity(1), SessionConfig::default());

    // Alice takes Bob's wrap straight from the hub, skipping the announce
    // that would have told her his public key.
    bob.session().ensure_conversation(alice.id()).await.unwrap();
    alice.session().keyring().open(bob.id());
    let wrapped = hub.latest_wrap(bob.id(), alice.id()).unwrap();
    assert_eq!(alice.session().receive_wrapped_key(bob.id(), &wrapped), Ok(ApplyOutcome::Applied));
    assert_eq!(alice.session().keyring().public_key(bob.id()), None);

    let publishes = hub.publishes();
    hub.pause_fetches();

    // Alice has never fetched Bob's key, so her rotation waits on the hub.
    let (rotated, ()) = tokio::join!(alice.session().rotate(bob.id()), async {
        tokio::task::yield_now().await;
        alice.session().close(bob.id());
        hub.resume_fetches();
    });

    assert_eq!(
        rotated,
        Err(ExchangeError::RotationNotAllowed { peer: bob.id().clone(), state: None })
    );
    assert_eq!(hub.publishes(), publishes);
}

#[tokio::test]
async fn duplicate_handshake_is_claimed_once() {
    let hub = MemoryHub::new();
    let alice = Participant::join(&hub, "alice", identity(0), SessionConfig::default());
    let bob = Participant::join(&hub, "bob", identity(1), SessionConfig::default());
    hub.pause_fetches();

    let (first, second, ()) = tokio::join!(
        alice.session().ensure_conversation(bob.id()),
        alice.session().ensure_conversation(bob.id()),
        async {
            tokio::task::yield_now().await;
            hub.resume_fetches();
        }
    );

    assert_eq!(first, Ok(Some(KeyState::Ready)));
    // The second call found the handshake in flight and reported Pending.
    assert_eq!(second, Ok(Some(KeyState::Pending)));
    assert_eq!(hub.publishes(), 1);
}
