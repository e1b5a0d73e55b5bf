//! Cooperative pause/resume/cancel control plane.
//!
//! Three inputs converge on one [`CrawlController`]: terminal hotkeys,
//! the platform termination signal, and the file-based control channel
//! any other process can write. The engine observes all of them only at
//! designated wait-points, so a track that has started downloading always
//! completes or fails on its own.

pub mod hotkeys;
pub mod runtime_files;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::progress::render;
use crate::progress::{CurrentBox, MessagePriority};
use runtime_files::{ControlReader, RunState, StatusPublisher};

/// Sleep between pause-loop polls.
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Message shown while paused.
const PAUSED_MESSAGE: &str = "Paused - press Shift-P to resume, Shift-C to cancel";

/// Environment marker set on the re-spawned child after auto-detach.
pub const DETACH_ENV: &str = "NUGS_DETACHED";

/// Shared handle steering a running crawl.
#[derive(Clone)]
pub struct CrawlController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    paused: AtomicBool,
    cancelled: AtomicBool,
    current_box: CurrentBox,
    control: ControlReader,
    publisher: StatusPublisher,
}

impl CrawlController {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                paused: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                current_box: CurrentBox::new(),
                control: ControlReader::new(cache_dir),
                publisher: StatusPublisher::new(cache_dir),
            }),
        }
    }

    /// The cell the engine parks the batch's progress box in.
    pub fn current_box(&self) -> &CurrentBox {
        &self.inner.current_box
    }

    pub fn publisher(&self) -> &StatusPublisher {
        &self.inner.publisher
    }

    /// Request cancellation; observed at the next wait-point.
    pub fn request_cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        // Surface immediately on the display even between wait-points.
        if let Some(pb) = self.inner.current_box.get() {
            pb.set_cancelled();
            pb.update_message(
                MessagePriority::Error,
                "Cancelling after the current step...",
                Duration::from_secs(30),
            );
            render::render(&pb);
        }
    }

    pub fn toggle_pause(&self) {
        let was = self.inner.paused.fetch_xor(true, Ordering::SeqCst);
        info!("pause toggled: {}", if was { "resuming" } else { "pausing" });
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Publish a progress tick to the runtime status file.
    pub fn update_runtime_progress(
        &self,
        label: &str,
        percentage: f64,
        speed: f64,
        current: u64,
        total: u64,
    ) {
        self.inner
            .publisher
            .update(label, percentage, speed, current, total, false);
    }

    /// Write the terminal status record.
    pub fn finalize_runtime(&self, state: RunState, label: &str) {
        self.inner.publisher.finalize(state, label);
    }

    /// The cooperative wait-point.
    ///
    /// Called by the engine at loop boundaries: before each track, each
    /// segment batch, each upload and each batch item. Blocks while
    /// paused; returns [`Error::Cancelled`] once cancellation is observed
    /// from any source.
    pub async fn wait_if_paused_or_cancelled(&self) -> Result<()> {
        loop {
            let local_paused = self.is_paused();
            let control = self.inner.control.read(local_paused);

            if self.is_cancelled() || control.cancel {
                if let Some(pb) = self.inner.current_box.get() {
                    pb.set_cancelled();
                    pb.update_message(
                        MessagePriority::Error,
                        "Cancelled",
                        Duration::from_secs(30),
                    );
                    render::render_now(&pb);
                }
                return Err(Error::Cancelled);
            }

            let paused = local_paused || control.pause;
            if !paused {
                if let Some(pb) = self.inner.current_box.get() {
                    if pb.is_paused() {
                        pb.set_paused(false);
                        pb.update_message(
                            MessagePriority::Status,
                            "Resumed",
                            Duration::from_secs(3),
                        );
                        render::render_now(&pb);
                    }
                }
                return Ok(());
            }

            if let Some(pb) = self.inner.current_box.get() {
                if !pb.is_paused() {
                    pb.set_paused(true);
                    pb.update_message(
                        MessagePriority::Warning,
                        PAUSED_MESSAGE,
                        Duration::from_secs(3600),
                    );
                    render::render_now(&pb);
                }
            }
            tokio::time::sleep(PAUSE_POLL).await;
        }
    }
}

/// Whether this process was re-spawned by auto-detach.
pub fn is_detached() -> bool {
    std::env::var_os(DETACH_ENV).is_some()
}

/// Re-spawn the current executable detached from the terminal.
///
/// POSIX only: the child inherits the argument list plus the detach
/// marker so it will not detach again. Returns `Ok(true)` when a child
/// was spawned and this process should exit immediately.
pub fn detach_if_headless() -> Result<bool> {
    use std::io::IsTerminal;

    if is_detached() || std::io::stdin().is_terminal() {
        return Ok(false);
    }

    #[cfg(unix)]
    {
        let exe = std::env::current_exe()?;
        let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();
        let child = std::process::Command::new(exe)
            .args(args)
            .env(DETACH_ENV, "1")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        info!("detached: child pid {}", child.id());
        println!("Running detached (pid {}). Use `nugs status` to follow.", child.id());
        Ok(true)
    }
    #[cfg(not(unix))]
    {
        warn!("detach is not supported on this platform; running attached");
        Ok(false)
    }
}

/// Implementation of `nugs cancel`: steer a crawl owned by another pid.
///
/// Reads the status file, confirms the owner is alive, flips the control
/// file's cancel flag, and sends the platform termination signal as
/// belt-and-braces.
pub fn cancel_running(cache_dir: &Path) -> Result<CancelOutcome> {
    let Some(status) = runtime_files::read_status(cache_dir) else {
        return Ok(CancelOutcome::NothingRunning);
    };
    match status.state {
        RunState::Running => {}
        RunState::Stale => return Ok(CancelOutcome::StaleOwner(status.pid)),
        RunState::Completed | RunState::Cancelled => return Ok(CancelOutcome::NothingRunning),
    }

    runtime_files::write_control(cache_dir, None, Some(true))?;
    let signalled = runtime_files::terminate_pid(status.pid);
    if !signalled {
        warn!("could not signal pid {}", status.pid);
    }
    Ok(CancelOutcome::Requested {
        pid: status.pid,
        signalled,
    })
}

/// Result of a `nugs cancel` invocation.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    NothingRunning,
    StaleOwner(u32),
    Requested { pid: u32, signalled: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressBox;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_wait_point_passes_when_idle() {
        let temp = tempdir().unwrap();
        let controller = CrawlController::new(temp.path());
        controller.wait_if_paused_or_cancelled().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_point_observes_local_cancel() {
        let temp = tempdir().unwrap();
        let controller = CrawlController::new(temp.path());
        controller.request_cancel();

        let err = controller.wait_if_paused_or_cancelled().await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_point_observes_control_file_cancel() {
        let temp = tempdir().unwrap();
        // The control file is written before the controller's reader ever
        // caches, so the first read observes it.
        runtime_files::write_control(temp.path(), None, Some(true)).unwrap();
        let controller = CrawlController::new(temp.path());

        let err = controller.wait_if_paused_or_cancelled().await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_point_blocks_while_paused_then_resumes() {
        let temp = tempdir().unwrap();
        let controller = CrawlController::new(temp.path());
        let pb = Arc::new(ProgressBox::new());
        controller.current_box().set(pb.clone());

        controller.toggle_pause();
        assert!(controller.is_paused());

        let resume = controller.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            resume.toggle_pause();
        });

        let start = std::time::Instant::now();
        controller.wait_if_paused_or_cancelled().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(!pb.is_paused());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_point_marks_box_paused() {
        let temp = tempdir().unwrap();
        let controller = CrawlController::new(temp.path());
        let pb = Arc::new(ProgressBox::new());
        controller.current_box().set(pb.clone());

        controller.toggle_pause();
        let cancel = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.request_cancel();
        });

        // Paused first, then cancelled: the wait-point returns the sentinel.
        let err = controller.wait_if_paused_or_cancelled().await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(pb.is_cancelled());
    }

    #[test]
    fn test_cancel_running_with_no_status() {
        let temp = tempdir().unwrap();
        let outcome = cancel_running(temp.path()).unwrap();
        assert_eq!(outcome, CancelOutcome::NothingRunning);
    }

    #[test]
    fn test_cancel_running_with_stale_owner() {
        let temp = tempdir().unwrap();
        let status = runtime_files::RuntimeStatus {
            pid: u32::MAX - 1,
            state: RunState::Running,
            label: "ghost".into(),
            percentage: 0.0,
            speed: 0.0,
            current: 0,
            total: 0,
            started_at: chrono::Utc::now().to_rfc3339(),
            updated_at: chrono::Utc::now().to_rfc3339(),
            errors: 0,
            warnings: 0,
        };
        crate::persist::write_atomic(
            &temp.path().join(runtime_files::STATUS_FILE),
            &serde_json::to_vec(&status).unwrap(),
        )
        .unwrap();

        // read_status downgrades the dead owner to stale on the way in.
        let outcome = cancel_running(temp.path()).unwrap();
        assert_eq!(outcome, CancelOutcome::StaleOwner(u32::MAX - 1));
    }
}
