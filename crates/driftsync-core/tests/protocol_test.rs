//! End-to-end exercises of the protocol state machine against real shares.
//!
//! These drive both sides of the conversation directly: a listener serving a
//! populated share, and an initiator pulling a manifest delta and fetching
//! content into an empty share.

use std::{collections::BTreeMap, fs, time::Instant};

use driftsync_core::{
    Protocol, ProtocolAction, ProtocolError, Share, ShareMap, State,
    protocol::ProtocolConfig,
};
use driftsync_proto::{FileRecord, Handshake, Message, Update};
use sha2::{Digest, Sha256};

fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

fn write_file(root: &std::path::Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// A scanned share with the five-file tree from the handshake scenario.
fn populated_share() -> (tempfile::TempDir, String, ShareMap) {
    let dir = tempfile::tempdir().unwrap();
    for (rel, content) in
        [("a0", "a"), ("a1", "a"), ("wow/a0", "a"), ("wowa/a1", "a"), ("wowa/b2", "b2")]
    {
        write_file(dir.path(), rel, content);
    }

    let mut share = Share::open(dir.path(), None).unwrap();
    share.scan_all().unwrap();

    let share_id = share.share_id().to_string();
    let mut shares = ShareMap::new();
    shares.insert(share_id.clone(), share);
    (dir, share_id, shares)
}

fn empty_share() -> (tempfile::TempDir, String, ShareMap) {
    let dir = tempfile::tempdir().unwrap();
    let share = Share::open(dir.path(), None).unwrap();
    let share_id = share.share_id().to_string();
    let mut shares = ShareMap::new();
    shares.insert(share_id.clone(), share);
    (dir, share_id, shares)
}

fn listener() -> Protocol {
    Protocol::new(Default::default(), Instant::now(), ProtocolConfig::default())
}

fn remote_start(share_id: &str) -> Message {
    Message::Start(Handshake {
        software: "driftsync tests".to_string(),
        protocol: 1,
        features: Vec::new(),
        share_id: share_id.to_string(),
        access: "read_write".to_string(),
        peer: "fe".repeat(16),
        name: "peer-b".to_string(),
        time: "2024-03-01T10:00:00Z".to_string(),
    })
}

#[test]
fn handshake_then_manifest_lists_all_five_files() {
    let (_dir, share_id, mut shares) = populated_share();
    let mut proto = listener();
    let now = Instant::now();

    let actions = proto.handle_message(remote_start(&share_id), &mut shares, now).unwrap();
    assert_eq!(actions.len(), 1);
    let ProtocolAction::Send(Message::Go(go)) = &actions[0] else {
        panic!("expected Go, got {actions:?}");
    };
    assert_eq!(go.share_id, share_id);
    assert_eq!(proto.state(), State::Connected);
    assert_eq!(proto.peer().unwrap().name, "peer-b");

    let actions = proto
        .handle_message(Message::GetUpdates { since: BTreeMap::new() }, &mut shares, now)
        .unwrap();
    let ProtocolAction::Send(Message::Update(update)) = &actions[0] else {
        panic!("expected Update, got {actions:?}");
    };
    assert!(!update.partial);
    assert_eq!(update.files.len(), 5);
    assert_eq!(update.revision, shares[&share_id].revision());
}

#[test]
fn start_for_unknown_share_sends_cannot_start_and_closes() {
    let (_dir, _share_id, mut shares) = populated_share();
    let mut proto = listener();

    let actions = proto
        .handle_message(remote_start(&"00".repeat(32)), &mut shares, Instant::now())
        .unwrap();
    assert!(matches!(actions[0], ProtocolAction::Send(Message::CannotStart)));
    assert!(matches!(actions[1], ProtocolAction::Close { .. }));
}

#[test]
fn content_addressed_fetch_streams_one_byte_and_terminator() {
    let (_dir, share_id, mut shares) = populated_share();
    let mut proto = listener();
    let now = Instant::now();
    proto.handle_message(remote_start(&share_id), &mut shares, now).unwrap();

    let checksum = sha256_hex(b"a");
    let actions = proto
        .handle_message(Message::Get { checksum: checksum.clone() }, &mut shares, now)
        .unwrap();
    assert!(matches!(
        &actions[0],
        ProtocolAction::Send(Message::FileData { checksum: c }) if *c == checksum
    ));
    assert_eq!(proto.state(), State::Get);

    // The transport pump drains the source file chunk by chunk.
    let actions = proto.handle_outbound_drained().unwrap();
    let ProtocolAction::SendChunk(chunk) = &actions[0] else {
        panic!("expected chunk, got {actions:?}");
    };
    assert_eq!(chunk, b"a");
    assert_eq!(proto.state(), State::Get);

    let actions = proto.handle_outbound_drained().unwrap();
    let ProtocolAction::SendChunk(terminator) = &actions[0] else {
        panic!("expected terminator, got {actions:?}");
    };
    assert!(terminator.is_empty());
    assert_eq!(proto.state(), State::Connected);
}

#[test]
fn get_for_unknown_checksum_answers_no_such_file() {
    let (_dir, share_id, mut shares) = populated_share();
    let mut proto = listener();
    let now = Instant::now();
    proto.handle_message(remote_start(&share_id), &mut shares, now).unwrap();

    let missing = "99".repeat(32);
    let actions = proto
        .handle_message(Message::Get { checksum: missing.clone() }, &mut shares, now)
        .unwrap();
    assert!(matches!(
        &actions[0],
        ProtocolAction::Send(Message::NoSuchFile { checksum: c }) if *c == missing
    ));
    assert_eq!(proto.state(), State::Connected);
}

#[test]
fn messages_are_rejected_while_serving_content() {
    let (_dir, share_id, mut shares) = populated_share();
    let mut proto = listener();
    let now = Instant::now();
    proto.handle_message(remote_start(&share_id), &mut shares, now).unwrap();
    proto
        .handle_message(Message::Get { checksum: sha256_hex(b"a") }, &mut shares, now)
        .unwrap();
    assert_eq!(proto.state(), State::Get);

    let result = proto.handle_message(Message::Ping { timeout: 60 }, &mut shares, now);
    assert!(matches!(result, Err(ProtocolError::Unexpected { .. })));
}

#[test]
fn update_in_initial_state_is_a_protocol_error() {
    let (_dir, _share_id, mut shares) = populated_share();
    let mut proto = listener();

    let update = Message::Update(Update { revision: 1, partial: false, files: Vec::new() });
    let result = proto.handle_message(update, &mut shares, Instant::now());
    assert!(matches!(result, Err(ProtocolError::Unexpected { state: State::Initial, .. })));
}

#[test]
fn unknown_kind_is_a_protocol_error() {
    let (_dir, share_id, mut shares) = populated_share();
    let mut proto = listener();
    let now = Instant::now();
    proto.handle_message(remote_start(&share_id), &mut shares, now).unwrap();

    let result =
        proto.handle_message(Message::Unknown { raw: "{}".to_string() }, &mut shares, now);
    assert!(matches!(result, Err(ProtocolError::Unexpected { .. })));
}

#[test]
fn legacy_identity_is_ignored_when_connected() {
    let (_dir, share_id, mut shares) = populated_share();
    let mut proto = listener();
    let now = Instant::now();
    proto.handle_message(remote_start(&share_id), &mut shares, now).unwrap();

    let identity = Message::Identity {
        name: "peer-b".to_string(),
        time: "2024-03-01T10:00:00Z".to_string(),
    };
    assert!(proto.handle_message(identity, &mut shares, now).unwrap().is_empty());
}

/// Craft the `Go` a remote listener would answer our `Start` with.
fn remote_go(share_id: &str) -> Message {
    Message::Go(Handshake {
        software: "driftsync tests".to_string(),
        protocol: 1,
        features: Vec::new(),
        share_id: share_id.to_string(),
        access: "read_write".to_string(),
        peer: "fe".repeat(16),
        name: "peer-b".to_string(),
        time: "2024-03-01T10:00:00Z".to_string(),
    })
}

fn remote_record(path: &str, content: &[u8], rev: u64) -> FileRecord {
    FileRecord {
        checksum: sha256_hex(content),
        paths: vec![path.to_string()],
        last_changed_by: "fe".repeat(16),
        last_changed_rev: rev,
        mtime: "2024-03-01T10:00:00Z".to_string(),
        size: content.len() as u64,
        mode: 0o644,
        deleted: false,
        vclock: BTreeMap::from([("fe".repeat(16), rev)]),
    }
}

#[test]
fn initiator_pulls_manifest_and_fetches_content() {
    let (dir, share_id, mut shares) = empty_share();
    let mut proto = listener();
    let now = Instant::now();

    // Kick: Start goes out, we wait for Go.
    let actions = proto
        .handle_message(
            Message::InternalSendStart { share_id: share_id.clone() },
            &mut shares,
            now,
        )
        .unwrap();
    assert!(matches!(&actions[0], ProtocolAction::Send(Message::Start(h)) if h.share_id == share_id));
    assert_eq!(proto.state(), State::Wait4Go);

    // Go: we immediately ask for the delta.
    let actions = proto.handle_message(remote_go(&share_id), &mut shares, now).unwrap();
    assert!(matches!(&actions[0], ProtocolAction::Send(Message::GetUpdates { .. })));
    assert_eq!(proto.state(), State::Connected);

    // Delta with two files: exactly one Get goes out (one in flight at a
    // time), the second is queued.
    let first = remote_record("hello.txt", b"hello", 1);
    let second = remote_record("sub/world.txt", b"world", 2);
    let update = Message::Update(Update {
        revision: 3,
        partial: false,
        files: vec![first.clone(), second.clone()],
    });
    let actions = proto.handle_message(update, &mut shares, now).unwrap();
    assert_eq!(actions.len(), 1);
    assert!(matches!(
        &actions[0],
        ProtocolAction::Send(Message::Get { checksum }) if *checksum == first.checksum
    ));

    // Content for the first fetch arrives and verifies.
    proto
        .handle_message(
            Message::FileData { checksum: first.checksum.clone() },
            &mut shares,
            now,
        )
        .unwrap();
    proto.handle_payload_chunk(b"hel").unwrap();
    proto.handle_payload_chunk(b"lo").unwrap();
    let actions = proto.handle_payload_end(&mut shares).unwrap();

    assert_eq!(fs::read(dir.path().join("hello.txt")).unwrap(), b"hello");
    let row = shares[&share_id].get_by_path("hello.txt").unwrap().unwrap();
    assert_eq!(row.checksum, first.checksum);
    assert!(!row.to_checksum);

    // Completion releases the slot: the queued fetch goes out.
    assert!(matches!(
        &actions[0],
        ProtocolAction::Send(Message::Get { checksum }) if *checksum == second.checksum
    ));
}

#[test]
fn corrupt_payload_is_discarded_without_closing() {
    let (dir, share_id, mut shares) = empty_share();
    let mut proto = listener();
    let now = Instant::now();

    proto
        .handle_message(
            Message::InternalSendStart { share_id: share_id.clone() },
            &mut shares,
            now,
        )
        .unwrap();
    proto.handle_message(remote_go(&share_id), &mut shares, now).unwrap();

    let record = remote_record("file.txt", b"expected", 1);
    proto
        .handle_message(
            Message::Update(Update { revision: 1, partial: false, files: vec![record.clone()] }),
            &mut shares,
            now,
        )
        .unwrap();
    proto
        .handle_message(
            Message::FileData { checksum: record.checksum.clone() },
            &mut shares,
            now,
        )
        .unwrap();

    proto.handle_payload_chunk(b"tampered").unwrap();
    proto.handle_payload_end(&mut shares).unwrap();

    // Nothing committed; connection still usable.
    assert!(!dir.path().join("file.txt").exists());
    assert!(
        proto.handle_message(Message::Ping { timeout: 60 }, &mut shares, now).unwrap().is_empty()
    );
}

#[test]
fn file_data_for_wrong_checksum_is_fatal() {
    let (_dir, share_id, mut shares) = empty_share();
    let mut proto = listener();
    let now = Instant::now();

    proto
        .handle_message(
            Message::InternalSendStart { share_id: share_id.clone() },
            &mut shares,
            now,
        )
        .unwrap();
    proto.handle_message(remote_go(&share_id), &mut shares, now).unwrap();
    proto
        .handle_message(
            Message::Update(Update {
                revision: 1,
                partial: false,
                files: vec![remote_record("f", b"abc", 1)],
            }),
            &mut shares,
            now,
        )
        .unwrap();

    let result = proto.handle_message(
        Message::FileData { checksum: "11".repeat(32) },
        &mut shares,
        now,
    );
    assert!(matches!(result, Err(ProtocolError::WrongFileData { .. })));
}

#[test]
fn partial_updates_stay_in_get_updates_state() {
    let (_dir, share_id, mut shares) = empty_share();
    let mut proto = listener();
    let now = Instant::now();

    proto
        .handle_message(
            Message::InternalSendStart { share_id: share_id.clone() },
            &mut shares,
            now,
        )
        .unwrap();
    proto.handle_message(remote_go(&share_id), &mut shares, now).unwrap();

    let part = Message::Update(Update {
        revision: 1,
        partial: true,
        files: vec![remote_record("a", b"1", 1)],
    });
    proto.handle_message(part, &mut shares, now).unwrap();
    assert_eq!(proto.state(), State::GetUpdates);

    // Only Update is legal here.
    let result = proto.handle_message(
        Message::GetUpdates { since: BTreeMap::new() },
        &mut shares,
        now,
    );
    assert!(matches!(result, Err(ProtocolError::Unexpected { .. })));

    let tail = Message::Update(Update {
        revision: 2,
        partial: false,
        files: vec![remote_record("b", b"2", 2)],
    });
    proto.handle_message(tail, &mut shares, now).unwrap();
    assert_eq!(proto.state(), State::Connected);
}

#[test]
fn go_with_wrong_share_id_is_fatal() {
    let (_dir, share_id, mut shares) = empty_share();
    let mut proto = listener();
    let now = Instant::now();

    proto
        .handle_message(Message::InternalSendStart { share_id }, &mut shares, now)
        .unwrap();
    let result = proto.handle_message(remote_go(&"77".repeat(32)), &mut shares, now);
    assert!(matches!(result, Err(ProtocolError::ShareIdMismatch { .. })));
}

#[test]
fn cannot_start_reply_closes_cleanly() {
    let (_dir, share_id, mut shares) = empty_share();
    let mut proto = listener();
    let now = Instant::now();

    proto
        .handle_message(Message::InternalSendStart { share_id }, &mut shares, now)
        .unwrap();
    let actions = proto.handle_message(Message::CannotStart, &mut shares, now).unwrap();
    assert!(matches!(actions[0], ProtocolAction::Close { .. }));
}

#[test]
fn silence_past_twice_the_ping_window_closes() {
    let (_dir, share_id, mut shares) = populated_share();
    let config = ProtocolConfig { ping_timeout: std::time::Duration::from_secs(10) };
    let t0 = Instant::now();
    let mut proto = Protocol::new(Default::default(), t0, config);
    proto.handle_message(remote_start(&share_id), &mut shares, t0).unwrap();

    // Inside the window: a ping goes out, no close.
    let actions = proto.tick(t0 + std::time::Duration::from_secs(15));
    assert!(matches!(actions[0], ProtocolAction::Send(Message::Ping { timeout: 10 })));

    // Past 2 × timeout with no inbound traffic: close.
    let actions = proto.tick(t0 + std::time::Duration::from_secs(21));
    assert!(matches!(actions[0], ProtocolAction::Close { .. }));
}

#[test]
fn inbound_traffic_resets_the_receive_deadline() {
    let (_dir, share_id, mut shares) = populated_share();
    let config = ProtocolConfig { ping_timeout: std::time::Duration::from_secs(10) };
    let t0 = Instant::now();
    let mut proto = Protocol::new(Default::default(), t0, config);
    proto.handle_message(remote_start(&share_id), &mut shares, t0).unwrap();

    let t1 = t0 + std::time::Duration::from_secs(18);
    proto.handle_message(Message::Ping { timeout: 60 }, &mut shares, t1).unwrap();

    let actions = proto.tick(t0 + std::time::Duration::from_secs(25));
    assert!(!matches!(actions.first(), Some(ProtocolAction::Close { .. })));
}
