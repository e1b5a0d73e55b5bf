//! Download engine: naming, dispatch, and the per-release coordinator.
//!
//! Releases download sequentially (the service rate-limits), with a
//! cooperative wait-point before every track. Track failures are logged
//! and the release continues; release failures end that release and the
//! batch continues.

pub mod audio;
pub mod hls;
pub mod quality;
pub mod video;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::api::dto::Container;
use crate::app::App;
use crate::control::runtime_files::RunState;
use crate::error::Result;
use crate::progress::render;
use crate::progress::{BatchContext, MessagePriority, ProgressBox};

/// Album folder names are capped at 120 Unicode code points.
const ALBUM_NAME_MAX_CHARS: usize = 120;
/// Video file stems are capped shorter to leave room for the resolution
/// marker and extension.
const VIDEO_NAME_MAX_CHARS: usize = 110;

/// Product format strings identifying a video SKU.
pub const VIDEO_FORMATS: [&str; 2] = ["VIDEO ON DEMAND", "LIVE HD VIDEO"];

// ============================================================================
// Naming rule
// ============================================================================

/// Replace filesystem-hostile characters and strip a trailing tab.
pub fn sanitize(name: &str) -> String {
    let mapped: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect();
    mapped.trim_end_matches('\t').to_string()
}

/// Truncate to at most `max` Unicode code points (never bytes).
fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Album folder name: `sanitize(artist - container_info)`, trailing
/// spaces trimmed before sanitizing, capped at 120 code points.
pub fn album_folder_name(artist_name: &str, container_info: &str) -> String {
    let raw = format!("{artist_name} - {container_info}");
    truncate_chars(&sanitize(raw.trim_end()), ALBUM_NAME_MAX_CHARS)
}

/// Video file name: like the album rule but capped at 110 code points
/// with the resolution marker appended before the extension.
pub fn video_file_name(artist_name: &str, title: &str, resolution_marker: &str) -> String {
    let raw = format!("{artist_name} - {title}");
    let stem = truncate_chars(&sanitize(raw.trim_end()), VIDEO_NAME_MAX_CHARS);
    format!("{stem}_{resolution_marker}.mp4")
}

/// Track file name within an album folder: `NN. <title>.<ext>`.
pub fn track_file_name(track_num: u32, title: &str, extension: &str) -> String {
    format!("{track_num:02}. {}{extension}", sanitize(title))
}

// ============================================================================
// Dispatch
// ============================================================================

/// What the caller asked to download from a mixed release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Audio,
    Video,
    Both,
}

impl OutputKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            "both" => Some(Self::Both),
            _ => None,
        }
    }
}

/// True when the release carries a video product.
pub fn has_video_sku(container: &Container) -> bool {
    container
        .products
        .iter()
        .chain(container.live_stream_products.iter())
        .any(|p| VIDEO_FORMATS.contains(&p.format_str.as_str()))
}

/// True when the release is video-only: a video SKU and zero tracks.
pub fn is_video_only(container: &Container) -> bool {
    has_video_sku(container) && container.tracks.is_empty()
}

/// Outcome of one release within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Downloaded,
    Skipped,
    Failed,
}

/// Download one release (audio, video or both per the request), reusing
/// the batch's progress box.
pub async fn download_container(
    app: &App,
    pb: &Arc<ProgressBox>,
    container: &Container,
    kind: OutputKind,
) -> Result<ReleaseOutcome> {
    app.controller.wait_if_paused_or_cancelled().await?;

    let video_only = is_video_only(container);
    let want_video = matches!(kind, OutputKind::Video | OutputKind::Both) || video_only;
    let want_audio = matches!(kind, OutputKind::Audio | OutputKind::Both) && !video_only;

    if want_audio && container.tracks.is_empty() && !has_video_sku(container) {
        warn!(
            container_id = container.container_id,
            "release has no tracks and no video product"
        );
        return Ok(ReleaseOutcome::Failed);
    }

    let mut outcome = ReleaseOutcome::Skipped;
    let mut audio_ran = false;

    if want_audio {
        audio_ran = true;
        match audio::download_release(app, pb, container).await {
            Ok(audio::AudioOutcome::Downloaded) => outcome = ReleaseOutcome::Downloaded,
            Ok(audio::AudioOutcome::Skipped) => {}
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(container_id = container.container_id, "release failed: {e}");
                app.controller.publisher().count_error();
                outcome = ReleaseOutcome::Failed;
            }
        }
    }

    if want_video {
        if audio_ran {
            // The video leg gets its own box cycle: the audio leg may have
            // driven the phase graph to completion already.
            let title = album_folder_name(&container.artist_name, &container.container_info);
            pb.reset_for_album(&format!("{title} (video)"), container.container_id, 0);
        }
        if !has_video_sku(container) {
            if kind == OutputKind::Video {
                warn!(
                    container_id = container.container_id,
                    "video requested but release has no video product"
                );
                return Ok(ReleaseOutcome::Failed);
            }
        } else {
            match video::download_video(app, pb, container).await {
                Ok(video::VideoOutcome::Downloaded) => outcome = ReleaseOutcome::Downloaded,
                Ok(video::VideoOutcome::Skipped) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(container_id = container.container_id, "video failed: {e}");
                    app.controller.publisher().count_error();
                    outcome = ReleaseOutcome::Failed;
                }
            }
        }
    }

    Ok(outcome)
}

/// Resolve container metadata, fetching when only an id is known.
pub async fn resolve_container(app: &App, container_id: u64) -> Result<Container> {
    app.client.get_container_meta(container_id).await
}

// ============================================================================
// Batch coordinator
// ============================================================================

/// Tally of a finished batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Walk a list of container ids sequentially, sharing one progress box.
///
/// Cancellation breaks the loop; the summary records how far it got.
pub async fn run_batch(
    app: &App,
    container_ids: &[u64],
    kind: OutputKind,
) -> Result<BatchSummary> {
    let pb = Arc::new(ProgressBox::new());
    pb.with(|s| {
        s.mirror_enabled = app.mirror.is_some();
        s.batch = Some(BatchContext {
            current_album: 0,
            total_albums: container_ids.len(),
            complete: 0,
            failed: 0,
            start_time: Some(std::time::Instant::now()),
        });
    });
    app.controller.current_box().set(pb.clone());

    let mut summary = BatchSummary::default();

    for (index, &container_id) in container_ids.iter().enumerate() {
        match app.controller.wait_if_paused_or_cancelled().await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                summary.cancelled = true;
                break;
            }
            Err(e) => return Err(e),
        }

        let container = match resolve_container(app, container_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(container_id, "could not resolve metadata: {e}");
                app.controller.publisher().count_error();
                summary.attempted += 1;
                summary.failed += 1;
                continue;
            }
        };

        let title = album_folder_name(&container.artist_name, &container.container_info);
        pb.reset_for_album(&title, container.container_id, container.tracks.len() as u32);
        pb.with(|s| {
            if let Some(batch) = s.batch.as_mut() {
                batch.current_album = index + 1;
            }
        });

        summary.attempted += 1;
        match download_container(app, &pb, &container, kind).await {
            Ok(ReleaseOutcome::Downloaded) => {
                summary.succeeded += 1;
                pb.with(|s| {
                    if let Some(batch) = s.batch.as_mut() {
                        batch.complete += 1;
                    }
                });
            }
            Ok(ReleaseOutcome::Skipped) => summary.skipped += 1,
            Ok(ReleaseOutcome::Failed) => {
                summary.failed += 1;
                pb.with(|s| {
                    s.has_error = true;
                    if let Some(batch) = s.batch.as_mut() {
                        batch.failed += 1;
                    }
                });
            }
            Err(e) if e.is_cancelled() => {
                summary.cancelled = true;
                break;
            }
            Err(e) => return Err(e),
        }

        app.controller.update_runtime_progress(
            &title,
            ((index + 1) as f64 / container_ids.len() as f64) * 100.0,
            0.0,
            (index + 1) as u64,
            container_ids.len() as u64,
        );
    }

    render::clear(&pb);
    app.controller.current_box().clear();

    let state = if summary.cancelled {
        RunState::Cancelled
    } else {
        RunState::Completed
    };
    app.controller.finalize_runtime(state, "batch finished");

    info!(
        attempted = summary.attempted,
        succeeded = summary.succeeded,
        skipped = summary.skipped,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "batch complete"
    );
    Ok(summary)
}

// ============================================================================
// Skip-if-present
// ============================================================================

/// Decide whether an album is already present locally or on the mirror.
///
/// A remote-check error is not fatal: the download proceeds and the
/// error is logged once.
pub async fn already_present(
    app: &App,
    pb: &ProgressBox,
    artist_folder: &str,
    album_folder: &str,
    local_path: &Path,
) -> bool {
    if local_path.exists() {
        pb.update_message(
            MessagePriority::Status,
            "Already downloaded, skipping",
            Duration::from_secs(3),
        );
        render::render(pb);
        return true;
    }
    if let Some(mirror) = &app.mirror {
        let remote = format!("{}/{}", mirror.audio_remote(artist_folder), album_folder);
        match mirror.exists(&remote).await {
            Ok(true) => {
                pb.update_message(
                    MessagePriority::Status,
                    "Already on the mirror, skipping",
                    Duration::from_secs(3),
                );
                render::render(pb);
                return true;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("remote presence check failed, downloading anyway: {e}");
                app.controller.publisher().count_warning();
            }
        }
    }
    false
}

/// Output paths for one release.
pub struct ReleasePaths {
    pub artist_folder: String,
    pub album_folder: String,
    pub album_path: PathBuf,
}

/// Compute the on-disk layout for a release: `<out>/<artist>/<album>/`.
pub fn release_paths(out_root: &str, container: &Container) -> ReleasePaths {
    let artist_folder = sanitize(&container.artist_name);
    let album_folder = album_folder_name(&container.artist_name, &container.container_info);
    let album_path = Path::new(out_root).join(&artist_folder).join(&album_folder);
    ReleasePaths {
        artist_folder,
        album_folder,
        album_path,
    }
}

impl BatchSummary {
    /// `remaining` for the gap-fill summary line.
    pub fn remaining(&self, planned: usize) -> usize {
        planned.saturating_sub(self.attempted)
    }
}


/// Property-based tests using proptest
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    const HOSTILE: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

    proptest! {
        /// Sanitized names contain none of the hostile characters.
        #[test]
        fn sanitize_closure(input in "\\PC{0,80}") {
            let out = sanitize(&input);
            for c in HOSTILE {
                prop_assert!(!out.contains(c), "found {c:?} in {out:?}");
            }
        }

        /// Sanitize is idempotent.
        #[test]
        fn sanitize_idempotent(input in "\\PC{0,80}") {
            let once = sanitize(&input);
            let twice = sanitize(&once);
            prop_assert_eq!(once, twice);
        }

        /// Album folder names never exceed 120 code points and stay clean
        /// under arbitrary artist/title input.
        #[test]
        fn album_name_bounded(
            artist in "\\PC{0,100}",
            info in "\\PC{0,200}",
        ) {
            let name = album_folder_name(&artist, &info);
            prop_assert!(name.chars().count() <= 120);
            for c in HOSTILE {
                prop_assert!(!name.contains(c));
            }
        }
    }
}
