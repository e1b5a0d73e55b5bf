//! Progress-box terminal renderer.
//!
//! The renderer snapshots the box state under its lock, builds every line
//! off-lock, clears the previously drawn block with cursor-up sequences,
//! and writes the new frame. Only this module mutates the render
//! bookkeeping.

use std::io::Write;
use std::time::Instant;

use super::{MessagePriority, Phase, ProgressBox, sparkline};

/// Width bounds for the drawn box.
const MIN_WIDTH: usize = 79;
const MAX_WIDTH: usize = 120;

/// ANSI accents per phase / overlay.
const C_RESET: &str = "\x1b[0m";
const C_CYAN: &str = "\x1b[36m";
const C_MAGENTA: &str = "\x1b[35m";
const C_YELLOW: &str = "\x1b[33m";
const C_GREEN: &str = "\x1b[32m";
const C_RED: &str = "\x1b[31m";
const C_DIM: &str = "\x1b[2m";

/// Fields copied out of the box while its lock is held.
struct Snapshot {
    show_title: String,
    sequence_id: u64,
    track_number: u32,
    total_tracks: u32,
    tracks_completed: u32,
    bytes_total_release: u64,
    download_percent: f64,
    download_speed: f64,
    downloaded_bytes: u64,
    download_total_bytes: u64,
    upload_percent: f64,
    upload_speed: f64,
    uploaded_bytes: u64,
    upload_total_bytes: u64,
    download_speeds: Vec<f64>,
    upload_speeds: Vec<f64>,
    download_eta: Option<String>,
    upload_eta: Option<String>,
    phase: Phase,
    is_paused: bool,
    is_cancelled: bool,
    has_error: bool,
    mirror_enabled: bool,
    batch: Option<(usize, usize, usize, usize)>,
    lines_drawn: usize,
}

/// Render the box to stdout if a render is due.
pub fn render(pb: &ProgressBox) {
    render_forced(pb, false)
}

/// Render unconditionally (used for final frames).
pub fn render_now(pb: &ProgressBox) {
    render_forced(pb, true)
}

fn render_forced(pb: &ProgressBox, force: bool) {
    if !force && !pb.take_render_due() {
        return;
    }

    // Message reads expire, so take it before the snapshot lock.
    let message = pb.current_message();

    let snapshot = {
        let s = pb.lock();
        Snapshot {
            show_title: s.show_title.clone(),
            sequence_id: s.sequence_id,
            track_number: s.track_number,
            total_tracks: s.total_tracks,
            tracks_completed: s.tracks_completed,
            bytes_total_release: s.bytes_total_release,
            download_percent: s.download_percent,
            download_speed: s.download_speed,
            downloaded_bytes: s.downloaded_bytes,
            download_total_bytes: s.download_total_bytes,
            upload_percent: s.upload_percent,
            upload_speed: s.upload_speed,
            uploaded_bytes: s.uploaded_bytes,
            upload_total_bytes: s.upload_total_bytes,
            download_speeds: s.download_speeds.iter().copied().collect(),
            upload_speeds: s.upload_speeds.iter().copied().collect(),
            download_eta: s.download_eta.clone(),
            upload_eta: s.upload_eta.clone(),
            phase: s.phase,
            is_paused: s.is_paused,
            is_cancelled: s.is_cancelled,
            has_error: s.has_error,
            mirror_enabled: s.mirror_enabled,
            batch: s
                .batch
                .as_ref()
                .map(|b| (b.current_album, b.total_albums, b.complete, b.failed)),
            lines_drawn: s.render.lines_drawn,
        }
    };

    let width = box_width(terminal_width());
    let lines = build_lines(&snapshot, width, message.as_ref().map(|(p, t)| (*p, t.as_str())));

    // Stdout I/O happens with the lock released.
    let mut out = std::io::stdout().lock();
    let mut frame = String::new();
    for _ in 0..snapshot.lines_drawn {
        frame.push_str("\x1b[1A\x1b[2K");
    }
    for line in &lines {
        frame.push_str(line);
        frame.push('\n');
    }
    let _ = out.write_all(frame.as_bytes());
    let _ = out.flush();

    // Re-acquire to update bookkeeping.
    let mut s = pb.lock();
    s.render.lines_drawn = lines.len();
    s.render.last_update_time = Instant::now();
    s.render.last_rendered_snapshot = s.render_key();
}

/// Remove the drawn box from the terminal (end of batch).
pub fn clear(pb: &ProgressBox) {
    let lines_drawn = {
        let mut s = pb.lock();
        std::mem::take(&mut s.render.lines_drawn)
    };
    if lines_drawn == 0 {
        return;
    }
    let mut out = std::io::stdout().lock();
    let mut frame = String::new();
    for _ in 0..lines_drawn {
        frame.push_str("\x1b[1A\x1b[2K");
    }
    let _ = out.write_all(frame.as_bytes());
    let _ = out.flush();
}

fn terminal_width() -> usize {
    crossterm::terminal::size()
        .map(|(w, _)| w as usize)
        .unwrap_or(80)
}

/// Dynamic box width: 95% of the terminal, clamped to [79, 120].
fn box_width(term: usize) -> usize {
    ((term as f64 * 0.95) as usize).clamp(MIN_WIDTH, MAX_WIDTH)
}

fn accent(s: &Snapshot) -> &'static str {
    if s.is_cancelled || s.has_error {
        C_RED
    } else if s.is_paused {
        C_YELLOW
    } else {
        match s.phase {
            Phase::Download => C_CYAN,
            Phase::Upload => C_MAGENTA,
            Phase::Verify => C_YELLOW,
            Phase::Complete => C_GREEN,
        }
    }
}

fn build_lines(
    s: &Snapshot,
    width: usize,
    message: Option<(MessagePriority, &str)>,
) -> Vec<String> {
    let inner = width - 2;
    let color = accent(s);
    let mut lines = Vec::with_capacity(10);

    lines.push(format!("{color}┌{}┐{C_RESET}", "─".repeat(inner)));

    if let Some((current, total, complete, failed)) = s.batch {
        let bar = format!(" Batch {current}/{total}   ✓ {complete}  ✗ {failed}");
        lines.push(boxed(color, &bar, inner));
        lines.push(format!("{color}├{}┤{C_RESET}", "─".repeat(inner)));
    }

    let state = if s.is_cancelled {
        "cancelled"
    } else if s.is_paused {
        "paused"
    } else {
        s.phase.label()
    };
    lines.push(boxed(
        color,
        &format!(" Show {}  [{}]", s.sequence_id, state),
        inner,
    ));
    lines.push(boxed(color, &format!(" {}", s.show_title), inner));
    lines.push(format!("{color}├{}┤{C_RESET}", "─".repeat(inner)));

    lines.push(boxed(
        color,
        &format!(
            " Track {:02}/{:02}   {}/s",
            s.track_number,
            s.total_tracks,
            human_bytes(s.download_speed as u64)
        ),
        inner,
    ));

    let spark = sparkline(&s.download_speeds, 7);
    let eta = s.download_eta.as_deref().unwrap_or("--");
    lines.push(boxed(
        color,
        &format!(
            " ↓ {} {:5.1}%  {}/{}  ETA {}  {}",
            bar(s.download_percent, 24),
            s.download_percent,
            human_bytes(s.downloaded_bytes),
            human_bytes(s.download_total_bytes),
            eta,
            spark,
        ),
        inner,
    ));

    if s.mirror_enabled {
        let spark = sparkline(&s.upload_speeds, 7);
        let eta = s.upload_eta.as_deref().unwrap_or("--");
        lines.push(boxed(
            color,
            &format!(
                " ↑ {} {:5.1}%  {}/{}  ETA {}  {}",
                bar(s.upload_percent, 24),
                s.upload_percent,
                human_bytes(s.uploaded_bytes),
                human_bytes(s.upload_total_bytes),
                eta,
                spark,
            ),
            inner,
        ));
    }

    if let Some((priority, text)) = message {
        let (marker, mcolor) = match priority {
            MessagePriority::Error => ("✗", C_RED),
            MessagePriority::Warning => ("⚠", C_YELLOW),
            MessagePriority::Status => ("·", C_DIM),
        };
        lines.push(boxed(mcolor, &format!(" {marker} {text}"), inner));
    }

    lines.push(boxed(
        color,
        &format!(
            " Release: {}/{} tracks   {}",
            s.tracks_completed,
            s.total_tracks,
            human_bytes(s.bytes_total_release)
        ),
        inner,
    ));

    lines.push(format!("{color}└{}┘{C_RESET}", "─".repeat(inner)));
    lines
}

/// Wrap `content` in box borders, truncating/padding to `inner` columns.
///
/// Width math counts code points; wide glyphs may overrun by a column or
/// two, which the clear-and-redraw cycle tolerates.
fn boxed(color: &str, content: &str, inner: usize) -> String {
    let truncated: String = content.chars().take(inner).collect();
    let pad = inner - truncated.chars().count();
    format!("{color}│{C_RESET}{truncated}{}{color}│{C_RESET}", " ".repeat(pad))
}

/// A fixed-width unicode progress bar.
fn bar(percent: f64, width: usize) -> String {
    let filled = ((percent / 100.0) * width as f64).round() as usize;
    let filled = filled.min(width);
    format!("[{}{}]", "█".repeat(filled), "░".repeat(width - filled))
}

/// Human-readable byte counts, binary units.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
