use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};

use crate::error::{PimError, Result};
use crate::naming;
use crate::store::atomic;
use crate::store::paths::MeshPaths;
use crate::store::registry::{Registration, Registry};

/// Debounce window between an inbox event and the scan it triggers.
pub const SCAN_DEBOUNCE: Duration = Duration::from_millis(50);
/// Polling cadence once the platform watcher has been given up on.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1500);
/// Watcher (re)creation attempts before falling back to polling for good.
pub const MAX_WATCHER_RETRIES: u32 = 5;
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    /// Sender session id, so first-contact cues key on (name, session) and
    /// a reused name is not mistaken for a known sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_session: Option<String>,
    pub to: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

fn message_filename(ts: DateTime<Utc>, id: &str) -> String {
    let stamp = ts.format("%Y%m%d%H%M%S%3f");
    let short = id.get(..8).unwrap_or(id);
    format!("{stamp}-{short}.json")
}

/// Validate the target and enqueue atomically into its inbox. Fire-and-forget:
/// the sender never waits for delivery.
pub fn send_to(
    registry: &Registry,
    paths: &MeshPaths,
    from: &Registration,
    to: &str,
    text: &str,
    reply_to: Option<&str>,
) -> Result<Message> {
    naming::validate_name(to)?;
    let recipient: Registration = registry.read_live(to)?;

    let now = Utc::now();
    let msg = Message {
        id: uuid::Uuid::new_v4().to_string(),
        from: from.name.clone(),
        from_session: Some(from.session_id.clone()),
        to: to.into(),
        text: text.into(),
        timestamp: now,
        reply_to: reply_to.map(String::from),
    };

    let inbox = paths.inbox_dir(&recipient.session_id);
    fs::create_dir_all(&inbox)?;
    atomic::write_json_atomic(&inbox.join(message_filename(now, &msg.id)), &msg)?;
    Ok(msg)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub delivered: usize,
    pub deadlettered: usize,
}

/// Consumes an inbox directory: read, deliver, delete, in filename order.
/// Unreadable files are quarantined under `.deadletter/` and the scan
/// continues.
pub struct InboxConsumer {
    dir: PathBuf,
}

impl InboxConsumer {
    pub fn new(paths: &MeshPaths, session_id: &str) -> Self {
        Self {
            dir: paths.inbox_dir(session_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn scan(&self, deliver: &mut dyn FnMut(&Message)) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        if !self.dir.exists() {
            return Ok(report);
        }

        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        files.sort();

        for path in files {
            match fs::read_to_string(&path)
                .map_err(PimError::from)
                .and_then(|c| serde_json::from_str::<Message>(&c).map_err(PimError::from))
            {
                Ok(msg) => {
                    deliver(&msg);
                    let _ = fs::remove_file(&path);
                    report.delivered += 1;
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "dead-lettering message");
                    self.deadletter(&path);
                    report.deadlettered += 1;
                }
            }
        }
        Ok(report)
    }

    fn deadletter(&self, path: &Path) {
        let dir = self.dir.join(".deadletter");
        if fs::create_dir_all(&dir).is_err() {
            return;
        }
        let orig = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "message.json".into());
        let target = dir.join(format!("{orig}.bad-{}", Utc::now().timestamp_millis()));
        let _ = fs::rename(path, target);
    }
}

/// Exactly-once local effect: suppresses redelivery of an already-seen
/// message id (a deliver-then-crash can legally re-enqueue).
#[derive(Default)]
pub struct DeliveryDedup {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

const DEDUP_CAP: usize = 1024;

impl DeliveryDedup {
    /// Returns true the first time an id is seen.
    pub fn first_delivery(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > DEDUP_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// Re-entrancy guard around scans: a scan requested while one is running is
/// deferred and re-triggered when the first finishes.
#[derive(Default)]
pub struct ScanGate {
    state: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    running: bool,
    rerun: bool,
}

impl ScanGate {
    /// Run `scan` now, or defer it onto the in-flight scan.
    pub fn run(&self, mut scan: impl FnMut()) {
        {
            let mut state = self.state.lock().unwrap();
            if state.running {
                state.rerun = true;
                return;
            }
            state.running = true;
        }
        loop {
            scan();
            let mut state = self.state.lock().unwrap();
            if state.rerun {
                state.rerun = false;
            } else {
                state.running = false;
                return;
            }
        }
    }
}

/// Blocking inbox listener: platform watcher with debounce, falling back to
/// polling after repeated watcher failures. `stop` ends the loop.
pub struct InboxListener {
    consumer: InboxConsumer,
    gate: ScanGate,
}

impl InboxListener {
    pub fn new(consumer: InboxConsumer) -> Self {
        Self {
            consumer,
            gate: ScanGate::default(),
        }
    }

    pub fn run(
        &self,
        stop: Arc<AtomicBool>,
        deliver: &mut (dyn FnMut(&Message) + Send),
    ) -> Result<()> {
        fs::create_dir_all(self.consumer.dir())?;

        let deliver = Mutex::new(deliver);
        let scan = || {
            self.gate.run(|| {
                let mut deliver = deliver.lock().unwrap();
                if let Err(err) = self.consumer.scan(&mut **deliver) {
                    tracing::warn!(%err, "inbox scan failed");
                }
            });
        };

        // Drain anything that arrived before we started listening.
        scan();

        let mut retries = 0u32;
        while !stop.load(Ordering::Relaxed) {
            if retries >= MAX_WATCHER_RETRIES {
                // Permanent polling fallback for this session.
                tracing::warn!("inbox watcher unavailable; polling every 1.5s");
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(POLL_INTERVAL);
                    scan();
                }
                return Ok(());
            }

            let (tx, rx) = mpsc::channel::<()>();
            let watcher =
                notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                    Ok(_) => {
                        let _ = tx.send(());
                    }
                    Err(err) => {
                        tracing::warn!(%err, "inbox watcher error");
                    }
                });
            let mut watcher = match watcher {
                Ok(w) => w,
                Err(err) => {
                    tracing::warn!(%err, retries, "failed to create inbox watcher");
                    retries += 1;
                    std::thread::sleep(backoff(retries));
                    continue;
                }
            };
            if let Err(err) = watcher.watch(self.consumer.dir(), RecursiveMode::NonRecursive) {
                tracing::warn!(%err, retries, "failed to watch inbox dir");
                retries += 1;
                std::thread::sleep(backoff(retries));
                continue;
            }

            loop {
                if stop.load(Ordering::Relaxed) {
                    return Ok(());
                }
                match rx.recv_timeout(Duration::from_millis(250)) {
                    Ok(()) => {
                        // Debounce: coalesce the burst into one scan.
                        std::thread::sleep(SCAN_DEBOUNCE);
                        while rx.try_recv().is_ok() {}
                        scan();
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        retries += 1;
                        std::thread::sleep(backoff(retries));
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

fn backoff(retries: u32) -> Duration {
    let secs = 1u64 << retries.min(5);
    Duration::from_secs(secs).min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, MeshPaths, Registry) {
        let dir = tempdir().unwrap();
        let paths = MeshPaths::new(dir.path().join("mesh"));
        paths.ensure_dirs().unwrap();
        let registry = Registry::new(paths.clone());
        (dir, paths, registry)
    }

    fn join(registry: &Registry, name: &str) -> Registration {
        let reg = Registration::new(name, &format!("sess-{name}"), "/repo");
        registry.register(&reg).unwrap();
        reg
    }

    #[test]
    fn send_enqueues_into_recipient_session_inbox() {
        let (_dir, paths, registry) = setup();
        let alice = join(&registry, "Alice");
        let bob = join(&registry, "Bob");

        let msg = send_to(&registry, &paths, &alice, "Bob", "hi", None).unwrap();
        assert_eq!(msg.from, "Alice");
        assert_eq!(msg.to, "Bob");

        let files: Vec<_> = fs::read_dir(paths.inbox_dir(&bob.session_id))
            .unwrap()
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn send_to_unknown_or_dead_agent_fails() {
        let (_dir, paths, registry) = setup();
        let alice = join(&registry, "Alice");

        let err = send_to(&registry, &paths, &alice, "Ghost", "hi", None).unwrap_err();
        assert!(matches!(err, PimError::NotFound(_)));

        let mut dead = Registration::new("Dead", "sess-dead", "/repo");
        dead.pid = 999_999_999;
        atomic::write_json_atomic(&paths.registration_path("Dead"), &dead).unwrap();
        let err = send_to(&registry, &paths, &alice, "Dead", "hi", None).unwrap_err();
        assert!(matches!(err, PimError::NotActive(_)));
    }

    #[test]
    fn scan_delivers_in_filename_order_and_deletes() {
        let (_dir, paths, registry) = setup();
        let alice = join(&registry, "Alice");
        let bob = join(&registry, "Bob");

        for text in ["one", "two", "three"] {
            send_to(&registry, &paths, &alice, "Bob", text, None).unwrap();
            // Distinct millisecond prefixes keep filename order meaningful.
            std::thread::sleep(Duration::from_millis(2));
        }

        let consumer = InboxConsumer::new(&paths, &bob.session_id);
        let mut texts = Vec::new();
        let report = consumer.scan(&mut |m| texts.push(m.text.clone())).unwrap();
        assert_eq!(report.delivered, 3);
        assert_eq!(texts, vec!["one", "two", "three"]);

        let report = consumer.scan(&mut |_| {}).unwrap();
        assert_eq!(report.delivered, 0);
    }

    #[test]
    fn malformed_message_is_deadlettered_and_scan_continues() {
        let (_dir, paths, registry) = setup();
        let alice = join(&registry, "Alice");
        let bob = join(&registry, "Bob");
        let inbox = paths.inbox_dir(&bob.session_id);
        fs::create_dir_all(&inbox).unwrap();

        fs::write(inbox.join("00000000000000000-bad.json"), "NOT JSON").unwrap();
        send_to(&registry, &paths, &alice, "Bob", "good", None).unwrap();

        let consumer = InboxConsumer::new(&paths, &bob.session_id);
        let mut texts = Vec::new();
        let report = consumer.scan(&mut |m| texts.push(m.text.clone())).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.deadlettered, 1);
        assert_eq!(texts, vec!["good"]);

        let dead: Vec<String> = fs::read_dir(inbox.join(".deadletter"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].starts_with("00000000000000000-bad.json.bad-"));
    }

    #[test]
    fn dedup_is_first_delivery_only() {
        let mut dedup = DeliveryDedup::default();
        assert!(dedup.first_delivery("m1"));
        assert!(!dedup.first_delivery("m1"));
        assert!(dedup.first_delivery("m2"));
    }

    #[test]
    fn scan_gate_defers_reentrant_calls() {
        let gate = ScanGate::default();
        let mut count = 0;
        gate.run(|| count += 1);
        assert_eq!(count, 1);

        // A rerun request recorded mid-scan triggers exactly one more pass.
        {
            let mut state = gate.state.lock().unwrap();
            state.rerun = true;
        }
        let mut count = 0;
        gate.run(|| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn message_filenames_sort_chronologically() {
        let a = message_filename(Utc::now(), "aaaaaaaa-1111");
        std::thread::sleep(Duration::from_millis(2));
        let b = message_filename(Utc::now(), "bbbbbbbb-2222");
        assert!(a < b);
    }
}
