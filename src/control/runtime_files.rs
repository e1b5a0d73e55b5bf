//! Runtime status and control files.
//!
//! Two co-located JSON files under the cache root let a second invocation
//! of the binary observe and steer a running crawl:
//!
//! - `runtime-status.json` is written by the running process on progress
//!   ticks (throttled to one write per 250 ms unless forced).
//! - `runtime-control.json` is written by anyone (`nugs cancel`, an
//!   external script) and polled by the running process through a small
//!   TTL cache.
//!
//! Both are written atomically; readers tolerate absent or partial files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::error::Result;
use crate::persist::write_atomic;

pub const STATUS_FILE: &str = "runtime-status.json";
pub const CONTROL_FILE: &str = "runtime-control.json";

/// Minimum interval between non-forced status writes.
const STATUS_WRITE_INTERVAL: Duration = Duration::from_millis(250);

/// Control file read cache TTL while running / while paused.
const CONTROL_TTL: Duration = Duration::from_secs(1);
const CONTROL_TTL_PAUSED: Duration = Duration::from_millis(100);

/// Lifecycle state advertised in the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
    Cancelled,
    /// Rewritten by a reader that found `running` with a dead pid.
    Stale,
}

/// On-disk shape of `runtime-status.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub pid: u32,
    pub state: RunState,
    pub label: String,
    pub percentage: f64,
    /// Bytes per second
    pub speed: f64,
    pub current: u64,
    pub total: u64,
    pub started_at: String,
    pub updated_at: String,
    pub errors: u32,
    pub warnings: u32,
}

/// On-disk shape of `runtime-control.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeControl {
    #[serde(default)]
    pub pause: bool,
    #[serde(default)]
    pub cancel: bool,
    #[serde(default)]
    pub updated_at: String,
}

/// Check whether a pid is alive on this machine.
pub fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    sys.process(Pid::from_u32(pid)).is_some()
}

/// Terminate a process: SIGTERM on POSIX, kill elsewhere.
pub fn terminate_pid(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    match sys.process(Pid::from_u32(pid)) {
        Some(process) => {
            #[cfg(unix)]
            {
                process
                    .kill_with(sysinfo::Signal::Term)
                    .unwrap_or_else(|| process.kill())
            }
            #[cfg(not(unix))]
            {
                process.kill()
            }
        }
        None => false,
    }
}

// ============================================================================
// Status publisher
// ============================================================================

/// Publishes the running crawl's progress to `runtime-status.json`.
pub struct StatusPublisher {
    path: PathBuf,
    pid: u32,
    started_at: String,
    last_write: Mutex<Option<Instant>>,
    errors: AtomicU32,
    warnings: AtomicU32,
}

impl StatusPublisher {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join(STATUS_FILE),
            pid: std::process::id(),
            started_at: Utc::now().to_rfc3339(),
            last_write: Mutex::new(None),
            errors: AtomicU32::new(0),
            warnings: AtomicU32::new(0),
        }
    }

    pub fn count_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_warning(&self) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_count(&self) -> u32 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn warning_count(&self) -> u32 {
        self.warnings.load(Ordering::Relaxed)
    }

    /// Publish a progress tick. Throttled unless `force`.
    pub fn update(
        &self,
        label: &str,
        percentage: f64,
        speed: f64,
        current: u64,
        total: u64,
        force: bool,
    ) {
        {
            let mut last = self.last_write.lock();
            if !force {
                if let Some(at) = *last {
                    if at.elapsed() < STATUS_WRITE_INTERVAL {
                        return;
                    }
                }
            }
            *last = Some(Instant::now());
        }
        self.write(RunState::Running, label, percentage, speed, current, total);
    }

    /// Write the terminal state with the accumulated counters.
    pub fn finalize(&self, state: RunState, label: &str) {
        self.write(state, label, 100.0, 0.0, 0, 0);
    }

    fn write(
        &self,
        state: RunState,
        label: &str,
        percentage: f64,
        speed: f64,
        current: u64,
        total: u64,
    ) {
        let status = RuntimeStatus {
            pid: self.pid,
            state,
            label: label.to_string(),
            percentage,
            speed,
            current,
            total,
            started_at: self.started_at.clone(),
            updated_at: Utc::now().to_rfc3339(),
            errors: self.errors.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
        };
        match serde_json::to_vec_pretty(&status) {
            Ok(bytes) => {
                if let Err(e) = write_atomic(&self.path, &bytes) {
                    debug!("runtime status write failed: {e}");
                }
            }
            Err(e) => debug!("runtime status serialize failed: {e}"),
        }
    }
}

/// Read the status file, rewriting `running` with a dead owner to `stale`.
pub fn read_status(cache_dir: &Path) -> Option<RuntimeStatus> {
    let path = cache_dir.join(STATUS_FILE);
    let contents = std::fs::read_to_string(&path).ok()?;
    let mut status: RuntimeStatus = match serde_json::from_str(&contents) {
        Ok(s) => s,
        Err(e) => {
            warn!("unreadable {}: {e}", path.display());
            return None;
        }
    };

    if status.state == RunState::Running && !pid_alive(status.pid) {
        status.state = RunState::Stale;
        if let Ok(bytes) = serde_json::to_vec_pretty(&status) {
            let _ = write_atomic(&path, &bytes);
        }
    }
    Some(status)
}

// ============================================================================
// Control channel
// ============================================================================

/// Write the control file (merging with the current contents).
pub fn write_control(cache_dir: &Path, pause: Option<bool>, cancel: Option<bool>) -> Result<()> {
    let path = cache_dir.join(CONTROL_FILE);
    let mut control = read_control_raw(&path).unwrap_or_default();
    if let Some(p) = pause {
        control.pause = p;
    }
    if let Some(c) = cancel {
        control.cancel = c;
    }
    control.updated_at = Utc::now().to_rfc3339();
    let bytes = serde_json::to_vec_pretty(&control).expect("control file serializes");
    write_atomic(&path, &bytes)
}

/// Remove the control file (start of a fresh crawl).
pub fn clear_control(cache_dir: &Path) {
    let _ = std::fs::remove_file(cache_dir.join(CONTROL_FILE));
}

fn read_control_raw(path: &Path) -> Option<RuntimeControl> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// TTL-cached reader for the control file.
///
/// The engine polls this at every wait-point; a 1 s cache keeps the
/// polling free, and a 100 ms cache while paused keeps resume snappy.
pub struct ControlReader {
    path: PathBuf,
    cached: Mutex<Option<(Instant, RuntimeControl)>>,
}

impl ControlReader {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join(CONTROL_FILE),
            cached: Mutex::new(None),
        }
    }

    /// Read through the cache; `paused` selects the short TTL.
    pub fn read(&self, paused: bool) -> RuntimeControl {
        let ttl = if paused { CONTROL_TTL_PAUSED } else { CONTROL_TTL };
        let mut cached = self.cached.lock();
        if let Some((at, control)) = &*cached {
            if at.elapsed() < ttl {
                return control.clone();
            }
        }
        let control = read_control_raw(&self.path).unwrap_or_default();
        *cached = Some((Instant::now(), control.clone()));
        control
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_status_write_and_read() {
        let temp = tempdir().unwrap();
        let publisher = StatusPublisher::new(temp.path());

        publisher.update("Test Show", 42.0, 1000.0, 3, 10, true);

        let status = read_status(temp.path()).unwrap();
        assert_eq!(status.state, RunState::Running);
        assert_eq!(status.label, "Test Show");
        assert_eq!(status.percentage, 42.0);
        assert_eq!(status.pid, std::process::id());
    }

    #[test]
    fn test_status_throttles_unforced_writes() {
        let temp = tempdir().unwrap();
        let publisher = StatusPublisher::new(temp.path());

        publisher.update("first", 1.0, 0.0, 1, 10, true);
        // Immediately after: unforced write must be dropped.
        publisher.update("second", 2.0, 0.0, 2, 10, false);

        let status = read_status(temp.path()).unwrap();
        assert_eq!(status.label, "first");

        // Forced write goes through regardless.
        publisher.update("third", 3.0, 0.0, 3, 10, true);
        let status = read_status(temp.path()).unwrap();
        assert_eq!(status.label, "third");
    }

    #[test]
    fn test_finalize_writes_terminal_state_and_counters() {
        let temp = tempdir().unwrap();
        let publisher = StatusPublisher::new(temp.path());
        publisher.count_error();
        publisher.count_warning();
        publisher.count_warning();

        publisher.finalize(RunState::Cancelled, "done");

        let status = read_status(temp.path()).unwrap();
        assert_eq!(status.state, RunState::Cancelled);
        assert_eq!(status.errors, 1);
        assert_eq!(status.warnings, 2);
    }

    #[test]
    fn test_read_status_rewrites_dead_owner_to_stale() {
        let temp = tempdir().unwrap();
        // Hand-craft a status owned by a pid that cannot be alive.
        let status = RuntimeStatus {
            pid: u32::MAX - 1,
            state: RunState::Running,
            label: "ghost".to_string(),
            percentage: 10.0,
            speed: 0.0,
            current: 1,
            total: 10,
            started_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
            errors: 0,
            warnings: 0,
        };
        let path = temp.path().join(STATUS_FILE);
        write_atomic(&path, &serde_json::to_vec(&status).unwrap()).unwrap();

        let read_back = read_status(temp.path()).unwrap();
        assert_eq!(read_back.state, RunState::Stale);

        // And the rewrite is persisted.
        let on_disk: RuntimeStatus =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.state, RunState::Stale);
    }

    #[test]
    fn test_read_status_missing_file() {
        let temp = tempdir().unwrap();
        assert!(read_status(temp.path()).is_none());
    }

    #[test]
    fn test_control_write_merges_fields() {
        let temp = tempdir().unwrap();

        write_control(temp.path(), Some(true), None).unwrap();
        write_control(temp.path(), None, Some(true)).unwrap();

        let reader = ControlReader::new(temp.path());
        let control = reader.read(false);
        assert!(control.pause);
        assert!(control.cancel);
        assert!(!control.updated_at.is_empty());
    }

    #[test]
    fn test_control_reader_caches_within_ttl() {
        let temp = tempdir().unwrap();
        write_control(temp.path(), Some(false), Some(false)).unwrap();

        let reader = ControlReader::new(temp.path());
        assert!(!reader.read(false).cancel);

        // A write landing inside the 1 s TTL is not observed yet.
        write_control(temp.path(), None, Some(true)).unwrap();
        assert!(!reader.read(false).cancel);
    }

    #[test]
    fn test_control_reader_short_ttl_while_paused() {
        let temp = tempdir().unwrap();
        write_control(temp.path(), Some(true), None).unwrap();

        let reader = ControlReader::new(temp.path());
        assert!(reader.read(true).pause);

        write_control(temp.path(), Some(false), None).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        // The 100 ms paused TTL has elapsed; resume is visible.
        assert!(!reader.read(true).pause);
    }

    #[test]
    fn test_clear_control() {
        let temp = tempdir().unwrap();
        write_control(temp.path(), Some(true), None).unwrap();
        clear_control(temp.path());
        assert!(!temp.path().join(CONTROL_FILE).exists());
    }

    #[test]
    fn test_own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }
}
