//! Progress-box state machine.
//!
//! One progress box lives for the whole batch and is reset between
//! albums. All field access goes through an internal mutex; the renderer
//! snapshots under the lock, writes to stdout unlocked, then re-acquires
//! to update its bookkeeping. A separate shared cell holds the "current
//! box" identity so the control plane can reach it without holding the
//! box's own mutex.
//!
//! # Phases
//!
//! `download → upload → verify → complete` is the only legal direction.
//! Paused and error are overlay flags, not phases: a paused upload is
//! still in the upload phase.

pub mod render;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Samples kept per stream for smoothing and the sparkline.
const SPEED_WINDOW: usize = 10;

/// Default minimum interval between renders.
pub const DEFAULT_RENDER_INTERVAL: Duration = Duration::from_millis(100);

/// Download/upload lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Download,
    Upload,
    Verify,
    Complete,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Download => "downloading",
            Phase::Upload => "uploading",
            Phase::Verify => "verifying",
            Phase::Complete => "complete",
        }
    }
}

/// Transient message priority; higher wins the display slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum MessagePriority {
    Status = 0,
    Warning = 1,
    Error = 2,
}

/// Batch context surviving per-album resets.
#[derive(Debug, Clone, Default)]
pub struct BatchContext {
    pub current_album: usize,
    pub total_albums: usize,
    pub complete: usize,
    pub failed: usize,
    pub start_time: Option<Instant>,
}

/// Renderer bookkeeping; only the renderer mutates these.
#[derive(Debug)]
pub struct RenderState {
    pub lines_drawn: usize,
    pub last_update_time: Instant,
    pub last_rendered_snapshot: u64,
    pub force_render: bool,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            lines_drawn: 0,
            last_update_time: Instant::now() - Duration::from_secs(1),
            last_rendered_snapshot: 0,
            force_render: false,
        }
    }
}

/// The single mutable display state behind the box's mutex.
#[derive(Debug)]
pub struct BoxState {
    // Identity
    pub show_title: String,
    pub sequence_id: u64,

    // Track position within the release
    pub track_number: u32,
    pub total_tracks: u32,

    // Accumulated across the release
    pub bytes_total_release: u64,
    pub tracks_completed: u32,

    // Download stream
    pub download_percent: f64,
    pub download_speed: f64,
    pub downloaded_bytes: u64,
    pub download_total_bytes: u64,

    // Upload stream
    pub upload_percent: f64,
    pub upload_speed: f64,
    pub uploaded_bytes: u64,
    pub upload_total_bytes: u64,

    // Last-10 instantaneous speeds per stream
    pub download_speeds: VecDeque<f64>,
    pub upload_speeds: VecDeque<f64>,

    pub download_eta: Option<String>,
    pub upload_eta: Option<String>,

    pub phase: Phase,

    // Message buckets: status, warning, error
    pub messages: [Option<String>; 3],
    pub message_priority: MessagePriority,
    pub message_expiry: Instant,

    pub is_paused: bool,
    pub is_cancelled: bool,
    pub has_error: bool,

    pub batch: Option<BatchContext>,
    pub mirror_enabled: bool,

    pub render: RenderState,
    pub render_interval: Duration,
}

impl Default for BoxState {
    fn default() -> Self {
        Self {
            show_title: String::new(),
            sequence_id: 0,
            track_number: 0,
            total_tracks: 0,
            bytes_total_release: 0,
            tracks_completed: 0,
            download_percent: 0.0,
            download_speed: 0.0,
            downloaded_bytes: 0,
            download_total_bytes: 0,
            upload_percent: 0.0,
            upload_speed: 0.0,
            uploaded_bytes: 0,
            upload_total_bytes: 0,
            download_speeds: VecDeque::with_capacity(SPEED_WINDOW),
            upload_speeds: VecDeque::with_capacity(SPEED_WINDOW),
            download_eta: None,
            upload_eta: None,
            phase: Phase::Download,
            messages: [None, None, None],
            message_priority: MessagePriority::Status,
            message_expiry: Instant::now(),
            is_paused: false,
            is_cancelled: false,
            has_error: false,
            batch: None,
            mirror_enabled: false,
            render: RenderState::default(),
            render_interval: DEFAULT_RENDER_INTERVAL,
        }
    }
}

impl BoxState {
    /// Key fields that force a render when they change.
    fn render_key(&self) -> u64 {
        // Cheap structural hash: enough to detect "something the user
        // must see now" changes between throttled renders.
        let mut key = self.track_number as u64;
        key = key.wrapping_mul(31).wrapping_add(self.message_priority as u64);
        key = key.wrapping_mul(31).wrapping_add(self.is_paused as u64);
        key = key.wrapping_mul(31).wrapping_add(self.is_cancelled as u64);
        key
    }
}

/// The shared progress box.
pub struct ProgressBox {
    state: Mutex<BoxState>,
}

impl ProgressBox {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BoxState::default()),
        }
    }

    /// Run `f` with the state locked.
    pub fn with<T>(&self, f: impl FnOnce(&mut BoxState) -> T) -> T {
        f(&mut self.state.lock())
    }

    /// Reset per-album fields for the next batch item.
    ///
    /// Batch context, render interval and the mirror flag survive; the
    /// render bookkeeping keeps `lines_drawn` so the next render clears
    /// the previous album's box off the terminal.
    pub fn reset_for_album(&self, show_title: &str, sequence_id: u64, total_tracks: u32) {
        let mut s = self.state.lock();
        let batch = s.batch.take();
        let mirror_enabled = s.mirror_enabled;
        let render_interval = s.render_interval;
        let lines_drawn = s.render.lines_drawn;

        *s = BoxState::default();
        s.show_title = show_title.to_string();
        s.sequence_id = sequence_id;
        s.total_tracks = total_tracks;
        s.batch = batch;
        s.mirror_enabled = mirror_enabled;
        s.render_interval = render_interval;
        s.render.lines_drawn = lines_drawn;
        s.render.force_render = true;
    }

    /// Transition to `next`, enforcing the forward-only phase graph.
    pub fn set_phase(&self, next: Phase) -> Result<()> {
        let mut s = self.state.lock();
        if s.phase == Phase::Complete {
            return Err(Error::config(format!(
                "invalid phase transition: complete → {}",
                next.label()
            )));
        }
        if next < s.phase {
            return Err(Error::config(format!(
                "invalid phase transition: {} → {}",
                s.phase.label(),
                next.label()
            )));
        }
        s.phase = next;
        s.render.force_render = true;
        Ok(())
    }

    /// Post a transient message.
    ///
    /// A message replaces the current one when its priority is at least
    /// the current priority, or when the current message has expired.
    /// Lower-priority updates against an unexpired message are dropped.
    pub fn update_message(&self, priority: MessagePriority, text: &str, duration: Duration) {
        let mut s = self.state.lock();
        let now = Instant::now();
        let expired = now > s.message_expiry;
        if priority >= s.message_priority || expired {
            s.messages = [None, None, None];
            s.messages[priority as usize] = Some(text.to_string());
            s.message_priority = priority;
            s.message_expiry = now + duration;
        }
    }

    /// Read the displayed message: highest non-empty bucket.
    ///
    /// Reading expires: once past the expiry instant all buckets are
    /// cleared and the priority floor resets.
    pub fn current_message(&self) -> Option<(MessagePriority, String)> {
        let mut s = self.state.lock();
        if Instant::now() > s.message_expiry {
            s.messages = [None, None, None];
            s.message_priority = MessagePriority::Status;
            return None;
        }
        for (idx, prio) in [
            (2, MessagePriority::Error),
            (1, MessagePriority::Warning),
            (0, MessagePriority::Status),
        ] {
            if let Some(text) = &s.messages[idx] {
                return Some((prio, text.clone()));
            }
        }
        None
    }

    /// Record a download progress tick.
    pub fn update_download(&self, downloaded: u64, total: u64, speed: f64) {
        let mut s = self.state.lock();
        s.downloaded_bytes = downloaded;
        s.download_total_bytes = total;
        s.download_speed = speed;
        s.download_percent = percent(downloaded, total);
        push_sample(&mut s.download_speeds, speed);
        let remaining = total.saturating_sub(downloaded) as f64;
        let speeds = s.download_speeds.make_contiguous().to_vec();
        s.download_eta = eta_seconds(remaining, &speeds).map(format_eta);
    }

    /// Record an upload progress tick.
    pub fn update_upload(&self, uploaded: u64, total: u64, speed: f64) {
        let mut s = self.state.lock();
        s.uploaded_bytes = uploaded;
        s.upload_total_bytes = total;
        s.upload_speed = speed;
        s.upload_percent = percent(uploaded, total);
        push_sample(&mut s.upload_speeds, speed);
        let remaining = total.saturating_sub(uploaded) as f64;
        let speeds = s.upload_speeds.make_contiguous().to_vec();
        s.upload_eta = eta_seconds(remaining, &speeds).map(format_eta);
    }

    /// Move to the next track within the release.
    pub fn start_track(&self, number: u32) {
        let mut s = self.state.lock();
        s.track_number = number;
        s.download_percent = 0.0;
        s.downloaded_bytes = 0;
        s.download_total_bytes = 0;
        s.download_eta = None;
    }

    /// Mark the current track finished.
    pub fn finish_track(&self, bytes: u64) {
        let mut s = self.state.lock();
        s.tracks_completed += 1;
        s.bytes_total_release += bytes;
    }

    pub fn set_paused(&self, paused: bool) {
        let mut s = self.state.lock();
        if s.is_paused != paused {
            s.is_paused = paused;
            s.render.force_render = true;
        }
    }

    pub fn set_cancelled(&self) {
        let mut s = self.state.lock();
        s.is_cancelled = true;
        s.render.force_render = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().is_cancelled
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().is_paused
    }

    /// Decide whether a render is due, consuming the force flag.
    ///
    /// A render happens when forced, when a key field changed since the
    /// last render, or when the render interval elapsed.
    pub fn take_render_due(&self) -> bool {
        let mut s = self.state.lock();
        let key = s.render_key();
        let due = s.render.force_render
            || key != s.render.last_rendered_snapshot
            || s.render.last_update_time.elapsed() >= s.render_interval;
        if due {
            s.render.force_render = false;
        }
        due
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, BoxState> {
        self.state.lock()
    }
}

impl Default for ProgressBox {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared owning reference to the batch's current progress box.
///
/// The control plane holds this cell so hotkeys and the file channel can
/// reach the box without touching engine internals.
#[derive(Clone, Default)]
pub struct CurrentBox(Arc<Mutex<Option<Arc<ProgressBox>>>>);

impl CurrentBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pb: Arc<ProgressBox>) {
        *self.0.lock() = Some(pb);
    }

    pub fn clear(&self) {
        *self.0.lock() = None;
    }

    pub fn get(&self) -> Option<Arc<ProgressBox>> {
        self.0.lock().clone()
    }
}

// ============================================================================
// Rate smoothing / ETA / sparkline primitives
// ============================================================================

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64) * 100.0
    }
}

fn push_sample(ring: &mut VecDeque<f64>, sample: f64) {
    if ring.len() == SPEED_WINDOW {
        ring.pop_front();
    }
    ring.push_back(sample);
}

/// Smoothed ETA in seconds, or `None` when it should be suppressed:
/// nothing remaining, no samples, a stalled average, or an estimate
/// outside the (1 s, 24 h) window that would only mislead.
pub fn eta_seconds(remaining: f64, samples: &[f64]) -> Option<f64> {
    if remaining <= 0.0 || samples.is_empty() {
        return None;
    }
    let avg = samples.iter().sum::<f64>() / samples.len() as f64;
    if avg < 0.001 {
        return None;
    }
    let eta = remaining / avg;
    if !(1.0..=86_400.0).contains(&eta) {
        return None;
    }
    Some(eta)
}

/// Format seconds as "2h03m", "4m11s" or "42s".
pub fn format_eta(seconds: f64) -> String {
    let total = seconds.round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h{m:02}m")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

const SPARK_BLOCKS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Render up to `max_width` most recent samples as a Unicode sparkline.
///
/// Samples are normalized across the window's min/max. When all samples
/// are equal the line is flat: all `▁` for zero, all `█` otherwise.
pub fn sparkline(samples: &[f64], max_width: usize) -> String {
    if samples.is_empty() || max_width == 0 {
        return String::new();
    }
    let start = samples.len().saturating_sub(max_width);
    let window = &samples[start..];

    let min = window.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = window.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    if (max - min).abs() < f64::EPSILON {
        let block = if max.abs() < f64::EPSILON {
            SPARK_BLOCKS[0]
        } else {
            SPARK_BLOCKS[7]
        };
        return std::iter::repeat_n(block, window.len()).collect();
    }

    window
        .iter()
        .map(|v| {
            let norm = (v - min) / (max - min);
            let idx = (norm * 7.0).round() as usize;
            SPARK_BLOCKS[idx.min(7)]
        })
        .collect()
}


/// Property-based tests using proptest
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// The sparkline never exceeds the width cap and only uses the
        /// fixed block set.
        #[test]
        fn sparkline_bounds(
            samples in prop::collection::vec(0.0f64..1e9, 0..40),
            width in 0usize..12,
        ) {
            let line = sparkline(&samples, width);
            prop_assert!(line.chars().count() <= width);
            for c in line.chars() {
                prop_assert!(SPARK_BLOCKS.contains(&c), "unexpected char {c}");
            }
        }

        /// ETA is finite and positive whenever it is produced.
        #[test]
        fn eta_is_sane(
            remaining in 0.0f64..1e12,
            samples in prop::collection::vec(0.0f64..1e9, 0..10),
        ) {
            if let Some(eta) = eta_seconds(remaining, &samples) {
                prop_assert!(eta.is_finite());
                prop_assert!((1.0..=86_400.0).contains(&eta));
            }
        }

        /// While an unexpired higher-priority message is displayed, a
        /// lower-priority update never changes the text.
        #[test]
        fn message_priority_monotonic(low_text in "[a-z]{1,12}") {
            let pb = ProgressBox::new();
            pb.update_message(MessagePriority::Error, "fixed", Duration::from_secs(600));
            pb.update_message(MessagePriority::Status, &low_text, Duration::from_secs(600));
            pb.update_message(MessagePriority::Warning, &low_text, Duration::from_secs(600));
            let (prio, text) = pb.current_message().unwrap();
            prop_assert_eq!(prio, MessagePriority::Error);
            prop_assert_eq!(text, "fixed");
        }
    }
}
