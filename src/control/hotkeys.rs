//! Raw-terminal hotkey capture.
//!
//! A dedicated thread reads stdin one byte at a time with the terminal in
//! raw mode (no echo, no canonical buffering) and translates keys into
//! controller requests:
//!
//! - `Ctrl+C` (0x03): request cancel
//! - `P` (Shift-P): toggle pause
//! - `C` (Shift-C): request cancel and exit the loop
//!
//! The loop is started only for download-capable commands attached to a
//! TTY and never in detached mode.

use std::io::Read;

use crossterm::terminal;
use tracing::{debug, warn};

use super::CrawlController;

/// RAII guard putting the terminal in raw mode for the process lifetime
/// of the hotkey loop.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Option<Self> {
        match terminal::enable_raw_mode() {
            Ok(()) => Some(Self),
            Err(e) => {
                warn!("could not enter raw terminal mode: {e}");
                None
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Spawn the hotkey reader thread.
///
/// The thread owns stdin for the crawl's lifetime; it exits on `C`, on
/// EOF, or when a read fails. The controller outlives it, so the handle
/// is detached.
pub fn spawn_hotkey_thread(controller: CrawlController) {
    std::thread::Builder::new()
        .name("hotkeys".to_string())
        .spawn(move || {
            let Some(_guard) = RawModeGuard::enable() else {
                return;
            };
            let mut stdin = std::io::stdin().lock();
            let mut byte = [0u8; 1];
            loop {
                match stdin.read(&mut byte) {
                    Ok(0) => break,
                    Ok(_) => match byte[0] {
                        0x03 => {
                            debug!("hotkey: ctrl-c, requesting cancel");
                            controller.request_cancel();
                        }
                        b'P' => {
                            debug!("hotkey: toggle pause");
                            controller.toggle_pause();
                        }
                        b'C' => {
                            debug!("hotkey: cancel and stop listening");
                            controller.request_cancel();
                            break;
                        }
                        _ => {}
                    },
                    Err(e) => {
                        debug!("hotkey read failed: {e}");
                        break;
                    }
                }
            }
        })
        .map(|_| ())
        .unwrap_or_else(|e| warn!("could not spawn hotkey thread: {e}"));
}

/// Spawn the termination-signal listener.
///
/// Maps the platform termination signal (SIGTERM on POSIX, Ctrl-Break
/// style events elsewhere) to a cancel request; `nugs cancel` sends the
/// signal as belt-and-braces next to the control file.
pub fn spawn_signal_listener(controller: CrawlController) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    term.recv().await;
                    debug!("SIGTERM received, requesting cancel");
                    controller.request_cancel();
                }
                Err(e) => warn!("could not install SIGTERM handler: {e}"),
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("termination signal received, requesting cancel");
                controller.request_cancel();
            }
        }
    });
}
