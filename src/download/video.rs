//! Video concert downloader.
//!
//! Resolves the video SKU and a manifest URL, picks an HLS variant for
//! the configured resolution (falling back down the ladder), fetches the
//! transport stream (single ranged segment for on-demand, sequential
//! append for live), writes a chapter metadata file when the release has
//! chapters, and remuxes everything into MP4 with ffmpeg.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use m3u8_rs::VariantStream;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::api::dto::{Container, Product};
use crate::app::App;
use crate::error::{Error, Result, ResultExt};
use crate::progress::render;
use crate::progress::{MessagePriority, Phase, ProgressBox};

use super::hls::{absolute_url, fetch_text};
use super::{VIDEO_FORMATS, sanitize, video_file_name};

/// Resolution fallback ladder walked on a miss, best first.
const RESOLUTION_LADDER: [&str; 4] = ["1440", "1080", "720", "480"];

/// Result of one release's video path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoOutcome {
    Downloaded,
    Skipped,
}

/// Download the video belonging to a release.
pub async fn download_video(
    app: &App,
    pb: &Arc<ProgressBox>,
    container: &Container,
) -> Result<VideoOutcome> {
    let sku = video_sku(container).ok_or_else(|| {
        Error::config(format!(
            "container {} has no video product",
            container.container_id
        ))
    })?;

    let manifest_url = resolve_manifest_url(app, container, sku).await?;
    let body = fetch_text(app, &manifest_url).await?;
    let master = match m3u8_rs::parse_playlist_res(body.as_bytes()) {
        Ok(m3u8_rs::Playlist::MasterPlaylist(m)) => m,
        Ok(m3u8_rs::Playlist::MediaPlaylist(_)) => {
            return Err(Error::decrypt("expected master playlist for video"));
        }
        Err(e) => return Err(Error::decrypt(format!("unparseable video manifest: {e}"))),
    };

    let wanted = app.config.wanted_resolution();
    let (variant, marker) = select_variant(&master.variants, wanted)
        .ok_or_else(|| Error::decrypt("no usable variant in video manifest"))?;
    info!(
        container_id = container.container_id,
        resolution = %marker,
        bandwidth = variant.bandwidth,
        "selected video variant"
    );

    let artist_folder = sanitize(&container.artist_name);
    let file_name = video_file_name(&container.artist_name, &container.container_info, &marker);
    let out_dir = Path::new(app.config.output.video_root()).join(&artist_folder);
    let out_path = out_dir.join(&file_name);

    if out_path.exists() {
        pb.update_message(
            MessagePriority::Status,
            "Video already downloaded, skipping",
            Duration::from_secs(3),
        );
        render::render(pb);
        return Ok(VideoOutcome::Skipped);
    }
    std::fs::create_dir_all(&out_dir)
        .with_context(format!("creating {}", out_dir.display()))?;

    let ts_path = out_path.with_extension("ts");
    let media_url = absolute_url(&manifest_url, &variant.uri)?;
    fetch_stream(app, pb, &media_url, &ts_path, &file_name).await?;

    let chapters_path = write_chapters(app, container, &ts_path).await?;
    app.ffmpeg
        .remux_to_mp4(&ts_path, chapters_path.as_deref(), &out_path)
        .await?;
    std::fs::remove_file(&ts_path)?;
    if let Some(chapters) = &chapters_path {
        std::fs::remove_file(chapters)?;
    }
    info!(out = %out_path.display(), "video remuxed");

    upload_video(app, pb, &artist_folder, &out_dir, &file_name, &out_path).await?;
    pb.set_phase(Phase::Complete)?;
    render::render_now(pb);
    Ok(VideoOutcome::Downloaded)
}

/// First product carrying a video format string.
pub fn video_sku(container: &Container) -> Option<&Product> {
    container
        .products
        .iter()
        .chain(container.live_stream_products.iter())
        .find(|p| VIDEO_FORMATS.contains(&p.format_str.as_str()))
}

/// Obtain a manifest URL: stream negotiation for subscribers, the
/// purchased-manifest endpoint for owned content.
async fn resolve_manifest_url(
    app: &App,
    container: &Container,
    sku: &Product,
) -> Result<String> {
    let session = app.session()?;

    match app
        .client
        .get_stream_meta(0, sku.sku_id, 1, &session.stream_params)
        .await
    {
        Ok(meta) if !meta.stream_link.is_empty() => return Ok(meta.stream_link),
        Ok(_) => debug!("stream negotiation returned no link, trying purchased manifest"),
        Err(e) if e.is_transient() => {
            debug!("stream negotiation failed ({e}), trying purchased manifest")
        }
        Err(e) => return Err(e),
    }

    let manifest = app
        .client
        .get_purchased_manifest_url(
            sku.sku_id,
            container.container_id,
            &session.user_id,
            &session.legacy.legacy_uguid,
        )
        .await?;
    if manifest.file_url.is_empty() {
        return Err(Error::service(200, "purchased manifest has no file URL"));
    }
    Ok(manifest.file_url)
}

/// Pick a variant for the wanted resolution.
///
/// "2160" is the best-available sentinel: the top-bandwidth variant wins
/// unconditionally and the marker comes from its actual resolution.
/// Otherwise variants are matched by their `WxH` suffix, falling down
/// the ladder until something matches.
pub fn select_variant<'a>(
    variants: &'a [VariantStream],
    wanted: &str,
) -> Option<(&'a VariantStream, String)> {
    if variants.is_empty() {
        return None;
    }
    let mut sorted: Vec<&VariantStream> = variants.iter().collect();
    sorted.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));

    if wanted == "2160" {
        let top = sorted[0];
        let marker = marker_for(&variant_height(top).unwrap_or_else(|| "2160".to_string()));
        return Some((top, marker));
    }

    let mut target = wanted.to_string();
    loop {
        if let Some(v) = sorted
            .iter()
            .find(|v| variant_height(v).map(|h| h == target).unwrap_or(false))
        {
            return Some((*v, marker_for(&target)));
        }
        // Walk down the ladder from just below the current target.
        let next = RESOLUTION_LADDER
            .iter()
            .position(|r| *r == target)
            .map(|i| i + 1)
            .unwrap_or(0);
        if next >= RESOLUTION_LADDER.len() {
            return None;
        }
        target = RESOLUTION_LADDER[next].to_string();
    }
}

/// Height component of a variant's `WxH` resolution attribute.
fn variant_height(variant: &VariantStream) -> Option<String> {
    variant.resolution.as_ref().map(|r| r.height.to_string())
}

/// Display marker: "2160" becomes "4K", everything else "<res>p".
fn marker_for(resolution: &str) -> String {
    if resolution == "2160" {
        "4K".to_string()
    } else {
        format!("{resolution}p")
    }
}

/// Extract the mandatory `showID` query value from a purchased-stream URL.
///
/// The service has been seen emitting the parameter more than once;
/// zero occurrences is an error, extras are ignored with a warning.
pub fn extract_show_id(url: &str) -> Result<u64> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::config(format!("bad purchased-stream URL: {e}")))?;
    let values: Vec<String> = parsed
        .query_pairs()
        .filter(|(k, _)| k == "showID")
        .map(|(_, v)| v.into_owned())
        .collect();
    match values.as_slice() {
        [] => Err(Error::config("purchased-stream URL carries no showID")),
        [only] => only
            .parse()
            .map_err(|_| Error::config(format!("showID is not a number: {only:?}"))),
        [first, ..] => {
            warn!("purchased-stream URL carries {} showID values, using the first", values.len());
            first
                .parse()
                .map_err(|_| Error::config(format!("showID is not a number: {first:?}")))
        }
    }
}

// ============================================================================
// Segment fetch
// ============================================================================

/// Download the variant's media stream into `ts_path`.
///
/// On-demand streams expose one long segment (the playlist's first two
/// segment URLs are identical) fetched with HTTP range resume. Live
/// streams list many segments appended sequentially; output is truncated
/// on restart so a rerun never duplicates data.
async fn fetch_stream(
    app: &App,
    pb: &Arc<ProgressBox>,
    media_url: &str,
    ts_path: &Path,
    label: &str,
) -> Result<()> {
    let body = fetch_text(app, media_url).await?;
    let media = match m3u8_rs::parse_playlist_res(body.as_bytes()) {
        Ok(m3u8_rs::Playlist::MediaPlaylist(m)) => m,
        Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => {
            return Err(Error::decrypt("nested master playlist"));
        }
        Err(e) => return Err(Error::decrypt(format!("unparseable media playlist: {e}"))),
    };

    let segments: Vec<String> = media
        .segments
        .iter()
        .map(|s| absolute_url(media_url, &s.uri))
        .collect::<Result<_>>()?;
    if segments.is_empty() {
        return Err(Error::decrypt("video playlist has no segments"));
    }

    let on_demand = segments.len() < 2 || segments[0] == segments[1];
    if on_demand {
        fetch_ranged(app, pb, &segments[0], ts_path, label).await
    } else {
        fetch_live(app, pb, &segments, ts_path, label).await
    }
}

/// One long segment with range resume: pick up where a previous partial
/// download left off.
async fn fetch_ranged(
    app: &App,
    pb: &Arc<ProgressBox>,
    url: &str,
    ts_path: &Path,
    label: &str,
) -> Result<()> {
    let existing = std::fs::metadata(ts_path).map(|m| m.len()).unwrap_or(0);
    let response = app
        .client
        .http()
        .get(url)
        .header(reqwest::header::RANGE, format!("bytes={existing}-"))
        .send()
        .await?;
    let status = response.status();
    if status.as_u16() == 416 {
        // Requested past the end: the file is already complete.
        debug!("ts already complete at {existing} bytes");
        return Ok(());
    }
    if !status.is_success() {
        return Err(Error::service(status.as_u16(), "video fetch rejected"));
    }
    let total = existing + response.content_length().unwrap_or(0);
    if existing > 0 {
        debug!(existing, "resuming video download");
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(ts_path)
        .await?;
    let mut stream = response.bytes_stream();
    let started = Instant::now();
    let mut written = existing;
    let mut last_tick = Instant::now();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        if last_tick.elapsed() >= Duration::from_millis(100) {
            last_tick = Instant::now();
            let elapsed_ms = started.elapsed().as_millis().max(1) as f64;
            let speed = (written - existing) as f64 / elapsed_ms * 1000.0;
            pb.update_download(written, total, speed);
            app.controller.update_runtime_progress(
                label,
                if total > 0 { written as f64 / total as f64 * 100.0 } else { 0.0 },
                speed,
                written,
                total,
            );
            render::render(pb);
        }
    }
    file.flush().await?;
    Ok(())
}

/// Many short segments appended in order, with a wait-point between
/// batches so pause/cancel stays responsive through long streams.
async fn fetch_live(
    app: &App,
    pb: &Arc<ProgressBox>,
    segments: &[String],
    ts_path: &Path,
    label: &str,
) -> Result<()> {
    // Truncate: a restarted live download must not duplicate segments.
    let mut file = tokio::fs::File::create(ts_path).await?;
    let started = Instant::now();
    let mut written: u64 = 0;

    for (index, url) in segments.iter().enumerate() {
        app.controller.wait_if_paused_or_cancelled().await?;

        let response = app.client.http().get(url.as_str()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::service(status.as_u16(), "segment fetch rejected"));
        }
        let bytes = response.bytes().await?;
        file.write_all(&bytes).await?;
        written += bytes.len() as u64;

        let elapsed_ms = started.elapsed().as_millis().max(1) as f64;
        let speed = written as f64 / elapsed_ms * 1000.0;
        pb.update_download(written, 0, speed);
        app.controller.update_runtime_progress(
            label,
            (index + 1) as f64 / segments.len() as f64 * 100.0,
            speed,
            (index + 1) as u64,
            segments.len() as u64,
        );
        render::render(pb);
    }
    file.flush().await?;
    debug!(segments = segments.len(), bytes = written, "live stream fetched");
    Ok(())
}

// ============================================================================
// Chapters
// ============================================================================

/// Write the ffmetadata chapters file when the release has chapters and
/// the config does not suppress them. Returns the file path to map in.
async fn write_chapters(
    app: &App,
    container: &Container,
    ts_path: &Path,
) -> Result<Option<PathBuf>> {
    if app.config.ffmpeg.skip_chapters || container.chapters.is_empty() {
        return Ok(None);
    }
    let duration = app.ffmpeg.probe_duration(ts_path).await?;
    let doc = crate::ffmpeg::build_chapters_metadata(&container.chapters, duration);
    let path = ts_path.with_extension("ffmeta");
    std::fs::write(&path, doc)?;
    debug!(chapters = container.chapters.len(), "chapter metadata written");
    Ok(Some(path))
}

// ============================================================================
// Upload
// ============================================================================

async fn upload_video(
    app: &App,
    pb: &Arc<ProgressBox>,
    artist_folder: &str,
    out_dir: &Path,
    file_name: &str,
    out_path: &Path,
) -> Result<()> {
    let Some(mirror) = &app.mirror else {
        return Ok(());
    };

    app.controller.wait_if_paused_or_cancelled().await?;
    pb.set_phase(Phase::Upload)?;
    render::render_now(pb);

    let pb_ticks = pb.clone();
    mirror
        .upload_file(out_path, artist_folder, file_name, move |tick| {
            pb_ticks.update_upload(tick.transferred, tick.total, tick.speed);
            render::render(&pb_ticks);
        })
        .await?;

    if app.config.mirror.delete_after_upload {
        pb.set_phase(Phase::Verify)?;
        render::render_now(pb);
        mirror.verify_file(file_name, out_dir, artist_folder).await?;
        std::fs::remove_file(out_path)?;
        info!(file = file_name, "verified upload, removed local copy");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(bandwidth: u64, width: u64, height: u64) -> VariantStream {
        VariantStream {
            bandwidth,
            resolution: Some(m3u8_rs::Resolution { width, height }),
            uri: format!("{height}p.m3u8"),
            ..Default::default()
        }
    }

    fn ladder() -> Vec<VariantStream> {
        vec![
            variant(1_000_000, 854, 480),
            variant(3_000_000, 1280, 720),
            variant(6_000_000, 1920, 1080),
            variant(16_000_000, 3840, 2160),
        ]
    }

    #[test]
    fn test_select_best_sentinel_takes_top_bandwidth() {
        let variants = ladder();
        let (v, marker) = select_variant(&variants, "2160").unwrap();
        assert_eq!(v.bandwidth, 16_000_000);
        assert_eq!(marker, "4K");
    }

    #[test]
    fn test_select_best_sentinel_derives_marker_from_actual() {
        // Top variant is only 1080p: sentinel still takes it, marker says so.
        let variants = vec![variant(6_000_000, 1920, 1080), variant(1_000_000, 854, 480)];
        let (v, marker) = select_variant(&variants, "2160").unwrap();
        assert_eq!(v.bandwidth, 6_000_000);
        assert_eq!(marker, "1080p");
    }

    #[test]
    fn test_select_exact_resolution() {
        let variants = ladder();
        let (v, marker) = select_variant(&variants, "720").unwrap();
        assert_eq!(v.resolution.as_ref().unwrap().height, 720);
        assert_eq!(marker, "720p");
    }

    #[test]
    fn test_select_falls_down_ladder() {
        // No 1440 variant: 1440 → 1080.
        let variants = ladder();
        let (v, marker) = select_variant(&variants, "1440").unwrap();
        assert_eq!(v.resolution.as_ref().unwrap().height, 1080);
        assert_eq!(marker, "1080p");
    }

    #[test]
    fn test_select_falls_to_bottom() {
        let variants = vec![variant(1_000_000, 854, 480)];
        let (v, marker) = select_variant(&variants, "1440").unwrap();
        assert_eq!(v.resolution.as_ref().unwrap().height, 480);
        assert_eq!(marker, "480p");
    }

    #[test]
    fn test_select_none_on_empty() {
        assert!(select_variant(&[], "1080").is_none());
    }

    #[test]
    fn test_extract_show_id_single() {
        let id = extract_show_id("https://play.nugs.net/p?showID=30478&x=1").unwrap();
        assert_eq!(id, 30478);
    }

    #[test]
    fn test_extract_show_id_zero_fails_cleanly() {
        assert!(extract_show_id("https://play.nugs.net/p?other=1").is_err());
    }

    #[test]
    fn test_extract_show_id_multiple_takes_first() {
        let id = extract_show_id("https://x/p?showID=1&showID=2").unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn test_extract_show_id_non_numeric_fails() {
        assert!(extract_show_id("https://x/p?showID=abc").is_err());
    }

    #[test]
    fn test_marker_for() {
        assert_eq!(marker_for("2160"), "4K");
        assert_eq!(marker_for("1080"), "1080p");
        assert_eq!(marker_for("480"), "480p");
    }
}
