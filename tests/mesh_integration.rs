use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tempfile::tempdir;

use pim::config::MessengerConfig;
use pim::error::PimError;
use pim::session::Messenger;
use pim::store::inbox::{InboxConsumer, InboxListener};
use pim::store::paths::MeshPaths;

fn messenger_at(dir: &Path, session: &str) -> Messenger {
    let paths = MeshPaths::new(dir.join("mesh"));
    paths.ensure_dirs().unwrap();
    Messenger::with_parts(
        paths,
        MessengerConfig::default(),
        dir.join("repo"),
        session.into(),
    )
}

/// Scenario: two agents join an empty mesh, get distinct names, and a sent
/// message lands in the recipient's deliver callback via the inbox watcher.
#[test]
fn handshake_and_message() {
    let dir = tempdir().unwrap();
    let mut a = messenger_at(dir.path(), "sess-a");
    let mut b = messenger_at(dir.path(), "sess-b");

    let reg_a = a.join(None, None, None, false).unwrap();
    let reg_b = b.join(None, None, None, false).unwrap();
    assert_ne!(reg_a.name, reg_b.name);
    assert!(a.paths.registration_path(&reg_a.name).exists());

    // Start A's listener before B sends.
    let consumer = InboxConsumer::new(&a.paths, "sess-a");
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = std::sync::mpsc::channel();
    let listener_stop = stop.clone();
    let handle = std::thread::spawn(move || {
        let listener = InboxListener::new(consumer);
        let mut deliver = move |msg: &pim::store::inbox::Message| {
            let _ = tx.send((msg.from.clone(), msg.text.clone()));
        };
        listener.run(listener_stop, &mut deliver).unwrap();
    });

    std::thread::sleep(Duration::from_millis(100));
    b.send(&reg_a.name, "hi", None).unwrap();

    let (from, text) = rx
        .recv_timeout(Duration::from_secs(3))
        .expect("message should be delivered by the watcher");
    assert_eq!(from, reg_b.name);
    assert_eq!(text, "hi");

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();

    // Consumed: the inbox directory holds no message files.
    let leftover = std::fs::read_dir(a.paths.inbox_dir("sess-a"))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                .count()
        })
        .unwrap_or(0);
    assert_eq!(leftover, 0);
}

/// Scenario: a directory reservation blocks peer writes but never reads,
/// and releasing it unblocks the writer.
#[test]
fn reservation_blocks_writes_not_reads() {
    let dir = tempdir().unwrap();
    let mut a = messenger_at(dir.path(), "sess-a");
    let mut b = messenger_at(dir.path(), "sess-b");
    a.join(Some("A"), None, None, false).unwrap();
    b.join(Some("B"), None, None, false).unwrap();

    a.reserve(&["src/auth/".into()], Some("auth refactor"))
        .unwrap();

    let block = b.guard_write("src/auth/login.ts").unwrap().unwrap();
    assert_eq!(block.peer.name, "A");
    assert!(block.message().contains("auth refactor"));

    // Reads are never guarded: only write-class tool calls consult
    // guard_write, so there is nothing to check for a read here.

    a.release(&[], true).unwrap();
    // A fresh messenger sees the release immediately (no cache warm-up).
    let mut b2 = messenger_at(dir.path(), "sess-b");
    assert!(b2.guard_write("src/auth/login.ts").unwrap().is_none());
}

#[test]
fn dead_agents_are_swept_from_the_registry() {
    let dir = tempdir().unwrap();
    let mut a = messenger_at(dir.path(), "sess-a");
    a.join(Some("Live"), None, None, false).unwrap();

    // Forge a registration owned by a dead PID.
    let mut ghost = pim::store::registry::Registration::new("Ghost", "sess-ghost", "/repo");
    ghost.pid = 999_999_999;
    pim::store::atomic::write_json_atomic(&a.paths.registration_path("Ghost"), &ghost).unwrap();

    let names: Vec<String> = a
        .registry
        .active_agents()
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["Live"]);
    assert!(!a.paths.registration_path("Ghost").exists());

    let err = a.send("Ghost", "hello?", None).unwrap_err();
    assert!(matches!(err, PimError::NotFound(_)));
}

#[test]
fn rename_preserves_pending_messages() {
    let dir = tempdir().unwrap();
    let mut a = messenger_at(dir.path(), "sess-a");
    let mut b = messenger_at(dir.path(), "sess-b");
    a.join(Some("Alice"), None, None, false).unwrap();
    b.join(Some("Bob"), None, None, false).unwrap();

    a.send("Bob", "before rename", None).unwrap();
    b.rename("Bobby").unwrap();
    a.send("Bobby", "after rename", None).unwrap();

    // The inbox is keyed by session id, so both messages are there.
    let consumer = InboxConsumer::new(&b.paths, "sess-b");
    let mut texts = Vec::new();
    consumer.scan(&mut |m| texts.push(m.text.clone())).unwrap();
    assert_eq!(texts, vec!["before rename", "after rename"]);
}

#[test]
fn name_uniqueness_across_live_processes() {
    let dir = tempdir().unwrap();
    let mut a = messenger_at(dir.path(), "sess-a");
    let mut b = messenger_at(dir.path(), "sess-b");

    a.join(Some("Shared"), None, None, false).unwrap();
    assert!(matches!(
        b.join(Some("Shared"), None, None, false).unwrap_err(),
        PimError::NameTaken(_)
    ));

    // After a clean leave the name is free again.
    a.leave().unwrap();
    b.join(Some("Shared"), None, None, false).unwrap();
}
