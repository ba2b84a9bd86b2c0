use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, MonitorResult};

/// Age after which a lock is reclaimed even when its holder still looks alive.
pub const DEFAULT_STALE_AFTER_HOURS: i64 = 24;

/// Grace period for a lock file whose holder record cannot be parsed yet.
const UNREADABLE_GRACE_SECS: u64 = 60;

/// Holder record written into the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    /// Process that created the lock.
    pub pid: u32,
    /// When the holder started its cycle.
    pub started_at: DateTime<Utc>,
}

impl LockHolder {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }

    /// Whether the holding process still exists on this host.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        is_pid_alive(self.pid)
    }

    /// Whether the lock has been held longer than `stale_after`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now.signed_duration_since(self.started_at) > stale_after
    }
}

/// Lock left behind by a cycle that never released it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StaleLock {
    /// The holding process is gone.
    DeadHolder {
        /// Previous holder.
        holder: LockHolder,
    },
    /// The holder exceeded the maximum cycle age.
    Expired {
        /// Previous holder.
        holder: LockHolder,
    },
    /// The lock file held no readable holder record past the grace period.
    Unreadable,
}

/// Single-flight lock for one logical model, held for the life of a cycle.
///
/// A crashed cycle leaves its lock file behind; the next acquire reclaims it
/// when the recorded pid is gone or the lock is older than the stale age.
#[derive(Debug)]
pub struct CycleGuard {
    path: PathBuf,
    reclaimed: Option<StaleLock>,
}

impl CycleGuard {
    /// Creates `<dir>/<model_name>.lock` exclusively, reclaiming stale locks
    /// older than [`DEFAULT_STALE_AFTER_HOURS`].
    pub fn acquire(dir: impl AsRef<Path>, model_name: &str) -> MonitorResult<Self> {
        Self::acquire_with(dir, model_name, Duration::hours(DEFAULT_STALE_AFTER_HOURS))
    }

    /// Same as [`Self::acquire`] with an explicit stale age.
    pub fn acquire_with(dir: impl AsRef<Path>, model_name: &str, stale_after: Duration) -> MonitorResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{model_name}.lock"));
        let in_progress = |path: &Path| MonitorError::CycleInProgress {
            model: model_name.to_string(),
            path: path.display().to_string(),
        };

        let mut reclaimed = None;
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let holder = serde_json::to_string(&LockHolder::current())?;
                    if let Err(err) = writeln!(file, "{holder}").and_then(|()| file.sync_all()) {
                        let _ = fs::remove_file(&path);
                        return Err(err.into());
                    }
                    return Ok(Self { path, reclaimed });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    match inspect(&path, stale_after)? {
                        Existing::Held => return Err(in_progress(&path)),
                        Existing::Released => {}
                        Existing::Stale(stale) => {
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(err) if err.kind() == ErrorKind::NotFound => {}
                                Err(err) => return Err(err.into()),
                            }
                            reclaimed = Some(stale);
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(in_progress(&path))
    }

    /// Lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stale lock removed while acquiring, if any.
    #[must_use]
    pub const fn reclaimed(&self) -> Option<&StaleLock> {
        self.reclaimed.as_ref()
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

enum Existing {
    Held,
    Released,
    Stale(StaleLock),
}

fn inspect(path: &Path, stale_after: Duration) -> MonitorResult<Existing> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Existing::Released),
        Err(err) => return Err(err.into()),
    };
    let Ok(holder) = serde_json::from_str::<LockHolder>(raw.trim()) else {
        let age = fs::metadata(path)?
            .modified()?
            .elapsed()
            .unwrap_or_default()
            .as_secs();
        return Ok(if age > UNREADABLE_GRACE_SECS {
            Existing::Stale(StaleLock::Unreadable)
        } else {
            Existing::Held
        });
    };
    if !holder.is_alive() {
        return Ok(Existing::Stale(StaleLock::DeadHolder { holder }));
    }
    if holder.is_expired(Utc::now(), stale_after) {
        return Ok(Existing::Stale(StaleLock::Expired { holder }));
    }
    Ok(Existing::Held)
}

fn is_pid_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let proc_root = Path::new("/proc");
    // Without procfs liveness is unknown; only the stale age applies.
    if !proc_root.join("self").exists() {
        return true;
    }
    proc_root.join(pid.to_string()).exists()
}
