use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fs2::FileExt;

use crate::error::{PimError, Result};

/// Whether a process with the given PID is alive on this host.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// The PID that owns mesh state created by this invocation. `pim` runs as a
/// short-lived child of the agent process, so ownership and liveness track
/// the parent, not the CLI process itself.
pub fn owner_pid() -> u32 {
    unsafe { libc::getppid() as u32 }
}

/// Exclusive-create lock file whose content is the holder PID.
///
/// Contenders sleep `retry_delay` between attempts up to `max_retries`. A
/// lock older than `stale_after` whose PID is dead is evicted by the next
/// contender. The file is removed on drop.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    held: bool,
}

impl PidLock {
    pub fn acquire(
        path: &Path,
        stale_after: Duration,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut holder = None;
        let mut attempts = 0;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    // Best-effort: the lock is valid even if the PID write fails.
                    let _ = file.write_all(std::process::id().to_string().as_bytes());
                    return Ok(Self {
                        path: path.to_path_buf(),
                        held: true,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    holder = read_holder(path);
                    if is_stale(path, holder, stale_after) {
                        tracing::debug!(path = %path.display(), ?holder, "evicting stale lock");
                        // A successful eviction does not consume an attempt;
                        // a failed one falls through to the retry budget.
                        if fs::remove_file(path).is_ok() || !path.exists() {
                            continue;
                        }
                    }
                    attempts += 1;
                    if attempts >= max_retries {
                        break;
                    }
                    std::thread::sleep(retry_delay);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(PimError::Locked {
            path: path.display().to_string(),
            holder,
        })
    }

    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.held {
            let _ = fs::remove_file(&self.path);
            self.held = false;
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        self.remove();
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn is_stale(path: &Path, holder: Option<u32>, stale_after: Duration) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        // Vanished between attempts; treat as free.
        return true;
    };
    let age = meta
        .modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .unwrap_or(Duration::ZERO);
    if age < stale_after {
        return false;
    }
    match holder {
        Some(pid) => !pid_alive(pid),
        // Unreadable holder past the stale window: evict.
        None => true,
    }
}

const SWARM_STALE: Duration = Duration::from_secs(10);
const SWARM_RETRIES: u32 = 50;
const SWARM_RETRY_DELAY: Duration = Duration::from_millis(100);

const CREW_STALE: Duration = Duration::from_secs(600);

/// Serializes claim/completion mutations. Short critical sections only.
pub fn acquire_swarm_lock(path: &Path) -> Result<PidLock> {
    PidLock::acquire(path, SWARM_STALE, SWARM_RETRIES, SWARM_RETRY_DELAY)
}

/// Guards a multi-minute planning run: no retry loop, a held lock is an
/// immediate `locked` error for the caller.
pub fn acquire_crew_lock(path: &Path) -> Result<PidLock> {
    PidLock::acquire(path, CREW_STALE, 1, Duration::ZERO)
}

/// Advisory flock for short same-file append sections (the feed).
pub fn acquire_flock(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.lock_exclusive()?;
    Ok(file)
}

pub fn release_flock(file: File) -> Result<()> {
    file.unlock()?;
    Ok(())
}
