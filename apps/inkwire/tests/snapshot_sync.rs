use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use inkwire::connection::{ConnectionRegistry, EntryOrigin};
use inkwire::protocol::{Frame, PresenceUser};
use inkwire::transport::{MockTransport, TransportEvent};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

fn seeded_snapshot(contents: &str) -> String {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("content");
    {
        let mut txn = doc.transact_mut();
        text.push(&mut txn, contents);
    }
    let update = doc
        .transact()
        .encode_state_as_update_v1(&StateVector::default());
    BASE64.encode(update)
}

fn content_text(doc: &Doc) -> String {
    let text = doc.get_or_insert_text("content");
    let txn = doc.transact();
    text.get_string(&txn)
}

fn apply_base64(doc: &Doc, encoded: &str) {
    let bytes = BASE64.decode(encoded).unwrap();
    let update = Update::decode_v1(&bytes).unwrap();
    let mut txn = doc.transact_mut();
    txn.apply_update(update).unwrap();
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn snapshot_lands_before_any_remote_update() {
    let transport = MockTransport::new();
    let registry = ConnectionRegistry::new(Arc::clone(&transport) as _);

    let snapshot = seeded_snapshot("hello ");
    let (entry, origin) = registry.get_connection("doc-1", Some(&snapshot)).unwrap();
    assert_eq!(origin, EntryOrigin::Created);

    // The snapshot is already merged when get_connection returns; no remote
    // frame has had a chance to race it.
    assert_eq!(content_text(entry.doc()), "hello ");

    // A collaborator continues from the same snapshot.
    let remote = Doc::new();
    apply_base64(&remote, &snapshot);
    let since = remote.transact().state_vector();
    {
        let text = remote.get_or_insert_text("content");
        let mut txn = remote.transact_mut();
        text.push(&mut txn, "world");
    }
    let update = remote.transact().encode_state_as_update_v1(&since);
    transport.inject(
        "doc-1",
        Frame::Update {
            payload: Bytes::from(update),
        },
    );

    wait_until("remote update to merge on top of the snapshot", || {
        content_text(entry.doc()) == "hello world"
    })
    .await;
}

#[tokio::test]
async fn local_edits_are_forwarded_to_the_channel() {
    let transport = MockTransport::new();
    let registry = ConnectionRegistry::new(Arc::clone(&transport) as _);

    let (entry, _) = registry.get_connection("doc-2", None).unwrap();
    {
        let text = entry.doc().get_or_insert_text("content");
        let mut txn = entry.doc().transact_mut();
        text.push(&mut txn, "typed locally");
    }

    wait_until("local update on the wire", || {
        transport
            .sent()
            .iter()
            .any(|env| env.channel == "doc-2" && matches!(env.frame, Frame::Update { .. }))
    })
    .await;
}

#[tokio::test]
async fn remote_updates_are_not_echoed_back() {
    let transport = MockTransport::new();
    let registry = ConnectionRegistry::new(Arc::clone(&transport) as _);

    let (entry, _) = registry.get_connection("doc-3", None).unwrap();
    transport.clear_sent();

    let remote = Doc::new();
    {
        let text = remote.get_or_insert_text("content");
        let mut txn = remote.transact_mut();
        text.push(&mut txn, "from afar");
    }
    let update = remote
        .transact()
        .encode_state_as_update_v1(&StateVector::default());
    transport.inject(
        "doc-3",
        Frame::Update {
            payload: Bytes::from(update),
        },
    );

    wait_until("remote update to apply", || {
        content_text(entry.doc()) == "from afar"
    })
    .await;

    let echoed = transport
        .sent()
        .iter()
        .any(|env| matches!(env.frame, Frame::Update { .. }));
    assert!(!echoed, "applying a remote update must not rebroadcast it");
}

#[tokio::test]
async fn attach_from_a_peer_is_answered_with_missing_state() {
    let transport = MockTransport::new();
    let registry = ConnectionRegistry::new(Arc::clone(&transport) as _);

    let snapshot = seeded_snapshot("hello ");
    registry.get_connection("doc-4", Some(&snapshot)).unwrap();
    transport.clear_sent();

    // A peer with an empty document announces itself.
    let empty_sv = StateVector::default().encode_v1();
    transport.inject(
        "doc-4",
        Frame::Attach {
            state_vector: Bytes::from(empty_sv),
        },
    );

    wait_until("catch-up diff on the wire", || {
        transport.sent().iter().any(|env| {
            if let Frame::Update { payload } = &env.frame {
                let fresh = Doc::new();
                let update = Update::decode_v1(payload).unwrap();
                fresh.transact_mut().apply_update(update).unwrap();
                content_text(&fresh) == "hello "
            } else {
                false
            }
        })
    })
    .await;
}

#[tokio::test]
async fn presence_is_broadcast_and_remote_peers_are_tracked() {
    let transport = MockTransport::new();
    let registry = ConnectionRegistry::new(Arc::clone(&transport) as _);

    let (entry, _) = registry.get_connection("doc-5", None).unwrap();
    entry.provider().set_local_presence("u-a", "Ana");

    wait_until("local presence on the wire", || {
        transport.sent().iter().any(|env| {
            matches!(&env.frame, Frame::Presence { user } if user.label == "Ana")
        })
    })
    .await;

    transport.inject(
        "doc-5",
        Frame::Presence {
            user: PresenceUser {
                user_id: "u-b".to_string(),
                label: "Basil".to_string(),
                color: "#4fc3f7".to_string(),
            },
        },
    );
    wait_until("remote peer to appear", || {
        entry
            .provider()
            .peers()
            .iter()
            .any(|peer| peer.user_id == "u-b")
    })
    .await;
}

#[tokio::test]
async fn reconnect_reannounces_the_document() {
    let transport = MockTransport::new();
    let registry = ConnectionRegistry::new(Arc::clone(&transport) as _);

    registry.get_connection("doc-6", None).unwrap();
    transport.clear_sent();

    transport.emit(TransportEvent::Disconnected);
    transport.emit(TransportEvent::Reconnected);

    wait_until("re-announce after reconnect", || {
        transport
            .sent()
            .iter()
            .any(|env| matches!(env.frame, Frame::Attach { .. }))
    })
    .await;
}

#[tokio::test]
async fn detach_frame_is_sent_on_cleanup() {
    let transport = MockTransport::new();
    let registry = ConnectionRegistry::new(Arc::clone(&transport) as _);

    registry.get_connection("doc-7", None).unwrap();
    transport.clear_sent();
    registry.cleanup("doc-7");

    let detached = transport
        .sent()
        .iter()
        .any(|env| env.channel == "doc-7" && env.frame == Frame::Detach);
    assert!(detached, "cleanup must announce the channel detach");
}
