//! Audio release downloader.
//!
//! Per track: probe the four platform ids for stream URLs, classify each
//! candidate against the quality table, then either select by the
//! configured format (with fallback) or switch into HLS-only mode when
//! the service offers nothing but a playlist. Tracks download
//! sequentially; a track failure is logged and the release continues.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::api::dto::{Container, Track};
use crate::app::App;
use crate::error::{Error, Result};
use crate::progress::render;
use crate::progress::{MessagePriority, Phase, ProgressBox};

use super::quality::{self, AudioFormat, Quality};
use super::{already_present, hls, release_paths, track_file_name};

/// Platform ids probed for stream candidates.
const PROBE_PLATFORMS: [u32; 4] = [1, 4, 7, 10];

/// Result of one release's audio path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioOutcome {
    Downloaded,
    Skipped,
}

/// Download every track of a release, then mirror it if configured.
pub async fn download_release(
    app: &App,
    pb: &Arc<ProgressBox>,
    container: &Container,
) -> Result<AudioOutcome> {
    let paths = release_paths(&app.config.output.audio_path, container);

    if already_present(app, pb, &paths.artist_folder, &paths.album_folder, &paths.album_path).await
    {
        return Ok(AudioOutcome::Skipped);
    }

    std::fs::create_dir_all(&paths.album_path)
        .map_err(|e| Error::Io(e).context(format!("creating {}", paths.album_path.display())))?;

    info!(
        container_id = container.container_id,
        album = %paths.album_folder,
        tracks = container.tracks.len(),
        "downloading release"
    );

    // Plan first: negotiate every track's format, then optionally HEAD the
    // direct URLs concurrently for a release-size estimate.
    let mut plans: Vec<(&Track, TrackPlan)> = Vec::with_capacity(container.tracks.len());
    for track in &container.tracks {
        app.controller.wait_if_paused_or_cancelled().await?;
        match plan_track(app, pb, track).await {
            Ok(plan) => plans.push((track, plan)),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(track_id = track.track_id, "negotiation failed: {e}");
                app.controller.publisher().count_error();
            }
        }
    }

    let direct_urls: Vec<String> = plans
        .iter()
        .filter_map(|(_, plan)| match plan {
            TrackPlan::Direct(q) => Some(q.url.clone()),
            TrackPlan::Hls(_) => None,
        })
        .collect();
    if direct_urls.len() > 1 {
        if let Some(total) = head_total_size(app.client.http(), &direct_urls).await {
            pb.update_message(
                MessagePriority::Status,
                &format!("Release size: {}", crate::progress::render::human_bytes(total)),
                Duration::from_secs(10),
            );
        }
    }

    for (track, plan) in plans {
        app.controller.wait_if_paused_or_cancelled().await?;
        pb.start_track(track.track_num);
        render::render(pb);

        match download_planned(app, pb, container, track, &plan, &paths.album_path).await {
            Ok(bytes) => {
                pb.finish_track(bytes);
                render::render(pb);
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(
                    track_id = track.track_id,
                    title = %track.song_title,
                    "track failed: {e}"
                );
                app.controller.publisher().count_error();
                pb.update_message(
                    MessagePriority::Warning,
                    &format!("Track {:02} failed: {e}", track.track_num),
                    Duration::from_secs(10),
                );
                render::render(pb);
            }
        }
    }

    upload_release(app, pb, &paths.artist_folder, &paths.album_folder, &paths.album_path).await?;
    pb.set_phase(Phase::Complete)?;
    render::render_now(pb);
    Ok(AudioOutcome::Downloaded)
}

/// How a planned track will be fetched.
enum TrackPlan {
    Direct(Quality),
    /// HLS placeholder URL; the master playlist decides the real quality.
    Hls(String),
}

/// Negotiate one track's format: probe, classify, select with fallback.
async fn plan_track(app: &App, pb: &Arc<ProgressBox>, track: &Track) -> Result<TrackPlan> {
    let candidates = probe_formats(app, track.track_id).await?;
    if candidates.is_empty() {
        return Err(Error::FormatUnavailable {
            track_id: track.track_id,
        });
    }

    if quality::is_hls_only(&candidates) {
        return Ok(TrackPlan::Hls(candidates[0].url.clone()));
    }

    let desired =
        AudioFormat::from_id(app.config.quality.audio_format).unwrap_or(AudioFormat::Flac);
    let selection = quality::select(&candidates, desired).ok_or(Error::FormatUnavailable {
        track_id: track.track_id,
    })?;
    if selection.fell_back && desired != AudioFormat::Sony360 {
        pb.update_message(
            MessagePriority::Status,
            &format!("Desired format unavailable, using {}", selection.quality.specs),
            Duration::from_secs(5),
        );
    }
    debug!(
        track_id = track.track_id,
        specs = %selection.quality.specs,
        "selected quality"
    );
    Ok(TrackPlan::Direct(selection.quality))
}

/// Download one planned track into the album directory; returns bytes.
async fn download_planned(
    app: &App,
    pb: &Arc<ProgressBox>,
    container: &Container,
    track: &Track,
    plan: &TrackPlan,
    album_path: &Path,
) -> Result<u64> {
    match plan {
        TrackPlan::Hls(url) => {
            let out = album_path.join(track_file_name(track.track_num, &track.song_title, ".m4a"));
            hls::download_hls_track(app, pb, url, &out).await
        }
        TrackPlan::Direct(quality) => {
            let out = album_path.join(track_file_name(
                track.track_num,
                &track.song_title,
                quality.extension,
            ));
            let label = format!(
                "{} - {:02} {}",
                container.artist_name, track.track_num, track.song_title
            );
            fetch_to_file(app, pb, &quality.url, &out, &label).await
        }
    }
}

/// Total size of the release via concurrent HEAD requests.
///
/// Bounded at 8 in flight with a 60 s overall budget; any failure or a
/// blown budget just suppresses the estimate.
pub async fn head_total_size(http: &reqwest::Client, urls: &[String]) -> Option<u64> {
    use futures::stream;

    let heads = stream::iter(urls.iter().map(|url| {
        let http = http.clone();
        async move {
            http.head(url.as_str())
                .send()
                .await
                .ok()
                .filter(|r| r.status().is_success())
                .and_then(|r| r.content_length())
        }
    }))
    .buffer_unordered(8)
    .collect::<Vec<Option<u64>>>();

    match tokio::time::timeout(Duration::from_secs(60), heads).await {
        Ok(sizes) if sizes.iter().all(|s| s.is_some()) => {
            Some(sizes.into_iter().flatten().sum())
        }
        Ok(_) => None,
        Err(_) => {
            debug!("size precomputation blew its budget");
            None
        }
    }
}

/// Probe each platform id and classify whatever URLs come back.
async fn probe_formats(app: &App, track_id: u64) -> Result<Vec<Quality>> {
    let session = app.session()?;
    let mut candidates = Vec::with_capacity(PROBE_PLATFORMS.len());
    for platform in PROBE_PLATFORMS {
        match app
            .client
            .get_stream_meta(track_id, 0, platform, &session.stream_params)
            .await
        {
            Ok(meta) if !meta.stream_link.is_empty() => {
                if let Some(q) = quality::classify_url(&meta.stream_link) {
                    candidates.push(q);
                }
            }
            Ok(_) => {}
            Err(e) => debug!(track_id, platform, "probe failed: {e}"),
        }
    }
    Ok(candidates)
}

/// Stream a direct URL into `dest`, feeding speed samples and progress.
pub async fn fetch_to_file(
    app: &App,
    pb: &Arc<ProgressBox>,
    url: &str,
    dest: &Path,
    label: &str,
) -> Result<u64> {
    let response = app
        .client
        .http()
        .get(url)
        .header(reqwest::header::RANGE, "bytes=0-")
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::service(status.as_u16(), "stream fetch rejected"));
    }
    let total = response.content_length().unwrap_or(0);

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let started = Instant::now();
    let mut written: u64 = 0;
    let mut last_tick = Instant::now();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;

        // Instantaneous speed: bytes since start over elapsed ms.
        if last_tick.elapsed() >= Duration::from_millis(100) {
            last_tick = Instant::now();
            let elapsed_ms = started.elapsed().as_millis().max(1) as f64;
            let speed = written as f64 / elapsed_ms * 1000.0;
            pb.update_download(written, total, speed);
            let percent = if total > 0 {
                written as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            app.controller
                .update_runtime_progress(label, percent, speed, written, total);
            render::render(pb);
        }
    }
    file.flush().await?;

    pb.update_download(written, total.max(written), 0.0);
    debug!(bytes = written, dest = %dest.display(), "track downloaded");
    Ok(written)
}

/// Mirror the finished release directory, verify, optionally delete.
async fn upload_release(
    app: &App,
    pb: &Arc<ProgressBox>,
    artist_folder: &str,
    album_folder: &str,
    album_path: &Path,
) -> Result<()> {
    let Some(mirror) = &app.mirror else {
        return Ok(());
    };

    app.controller.wait_if_paused_or_cancelled().await?;
    pb.set_phase(Phase::Upload)?;
    render::render_now(pb);

    let pb_ticks = pb.clone();
    mirror
        .upload_dir(album_path, artist_folder, album_folder, move |tick| {
            pb_ticks.update_upload(tick.transferred, tick.total, tick.speed);
            render::render(&pb_ticks);
        })
        .await?;

    if app.config.mirror.delete_after_upload {
        pb.set_phase(Phase::Verify)?;
        render::render_now(pb);
        mirror.verify_dir(album_path, artist_folder, album_folder).await?;
        std::fs::remove_dir_all(album_path)?;
        info!(album = album_folder, "verified upload, removed local copy");
    }
    Ok(())
}
