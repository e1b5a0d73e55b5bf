//! Gap analysis: which of an artist's shows are not downloaded yet.
//!
//! Combines the per-artist metadata cache with the presence scanner to
//! compute the missing set, and drives the download engine to fill it.
//! The analysis itself never calls the service when a fresh cache
//! exists, so `gaps` works offline for recently-seen artists.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::app::App;
use crate::catalog::ARTIST_TTL;
use crate::download::{self, OutputKind, album_folder_name};
use crate::error::{Error, Result};
use crate::presence::ArtistPresenceIndex;

/// One show absent from both the local tree and the mirror.
#[derive(Debug, Clone, Serialize)]
pub struct MissingShow {
    pub container_id: u64,
    pub container_info: String,
    pub performance_date: String,
}

/// Result of analyzing one artist.
#[derive(Debug, Serialize)]
pub struct GapAnalysis {
    pub artist_id: u64,
    pub artist_name: String,
    pub total: usize,
    pub downloaded: usize,
    pub missing: Vec<MissingShow>,
    pub cache_used: bool,
    pub stale_use: bool,
}

impl GapAnalysis {
    /// Coverage ratio in percent.
    pub fn coverage(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.downloaded as f64 / self.total as f64 * 100.0
        }
    }
}

/// Compute the gap set for one artist.
pub async fn analyze_artist(app: &App, artist_id: u64) -> Result<GapAnalysis> {
    let meta = app
        .cache
        .get_artist_meta_cached(&app.client, artist_id, ARTIST_TTL)
        .await?;
    let containers = meta.containers();

    let artist_name = containers
        .first()
        .map(|c| c.artist_name.clone())
        .or_else(|| {
            app.cache
                .read_containers_index()
                .and_then(|idx| idx.values().find(|s| s.artist_id == artist_id).map(|s| s.artist_name.clone()))
        })
        .ok_or_else(|| Error::config(format!("artist {artist_id} has no containers")))?;

    let index = ArtistPresenceIndex::build(
        &app.config.output.audio_path,
        &artist_name,
        app.mirror.as_ref(),
    )
    .await;

    let mut downloaded = 0;
    let mut missing = Vec::new();
    for container in &containers {
        let album = album_folder_name(&container.artist_name, &container.container_info);
        if index.is_show_downloaded(&album, app.mirror.as_ref()).await {
            downloaded += 1;
        } else {
            missing.push(MissingShow {
                container_id: container.container_id,
                container_info: container.container_info.clone(),
                performance_date: container.performance_date.clone(),
            });
        }
    }

    info!(
        artist_id,
        artist = %artist_name,
        total = containers.len(),
        downloaded,
        missing = missing.len(),
        "gap analysis complete"
    );
    Ok(GapAnalysis {
        artist_id,
        artist_name,
        total: containers.len(),
        downloaded,
        missing,
        cache_used: meta.cache_used,
        stale_use: meta.stale_use,
    })
}

/// Summary of a fill run.
#[derive(Debug, Default, Serialize)]
pub struct FillSummary {
    pub planned: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub remaining: usize,
    pub cancelled: bool,
}

/// Fill every gap for the given artists, one shared progress box.
///
/// Failures are tallied and the run continues; user cancellation breaks
/// the loop and `remaining` records what never started.
pub async fn fill_gaps(app: &App, artist_ids: &[u64], kind: OutputKind) -> Result<FillSummary> {
    let mut planned: Vec<u64> = Vec::new();
    for &artist_id in artist_ids {
        match analyze_artist(app, artist_id).await {
            Ok(analysis) => {
                planned.extend(analysis.missing.iter().map(|m| m.container_id));
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(artist_id, "gap analysis failed, skipping artist: {e}");
                app.controller.publisher().count_error();
            }
        }
    }

    if planned.is_empty() {
        return Ok(FillSummary::default());
    }

    let batch = download::run_batch(app, &planned, kind).await?;
    Ok(FillSummary {
        planned: planned.len(),
        attempted: batch.attempted,
        succeeded: batch.succeeded + batch.skipped,
        failed: batch.failed,
        remaining: batch.remaining(planned.len()),
        cancelled: batch.cancelled,
    })
}

/// Parse a performance date in either service format:
/// abbreviated "24/01/01" (yy/mm/dd) or long "Jan 02, 2006".
pub fn parse_performance_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%y/%m/%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%b %d, %Y"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::dto::{Container, ContainerPage};
    use crate::app::App;
    use crate::config::Config;
    use tempfile::tempdir;

    fn container(id: u64, artist: &str, info: &str, date: &str) -> Container {
        Container {
            container_id: id,
            artist_id: 1125,
            artist_name: artist.to_string(),
            container_info: info.to_string(),
            performance_date: date.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_performance_date_abbreviated() {
        let date = parse_performance_date("24/01/01").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }

    #[test]
    fn test_parse_performance_date_long() {
        let date = parse_performance_date("Jan 02, 2006").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2006, 1, 2).unwrap());
    }

    #[test]
    fn test_parse_performance_date_garbage() {
        assert!(parse_performance_date("not a date").is_none());
        assert!(parse_performance_date("").is_none());
    }

    #[test]
    fn test_coverage_math() {
        let analysis = GapAnalysis {
            artist_id: 1,
            artist_name: "A".into(),
            total: 4,
            downloaded: 1,
            missing: vec![],
            cache_used: true,
            stale_use: false,
        };
        assert_eq!(analysis.coverage(), 25.0);

        let empty = GapAnalysis {
            total: 0,
            downloaded: 0,
            ..analysis
        };
        assert_eq!(empty.coverage(), 100.0);
    }

    /// S2: one of two cached shows exists locally; the other is the gap.
    #[tokio::test]
    async fn test_analyze_artist_from_cache_and_local_tree() {
        let temp = tempdir().unwrap();
        let cache_dir = temp.path().join("cache");
        let out_dir = temp.path().join("music");

        // Seed the artist cache with two shows.
        let pages = vec![ContainerPage {
            containers: vec![
                container(101, "Test Artist", "2024-01-01 Venue", "24/01/01"),
                container(102, "Test Artist", "2023-01-01 Venue", "23/01/01"),
            ],
        }];
        let app = {
            let mut config = Config::default();
            config.output.audio_path = out_dir.to_str().unwrap().to_string();
            App::with_cache_dir(config, cache_dir.clone()).unwrap()
        };
        {
            use crate::persist::write_atomic;
            let artist_cache = crate::catalog::ArtistCache {
                artist_id: 1125,
                cached_at: chrono::Utc::now().to_rfc3339(),
                pages,
            };
            write_atomic(
                &cache_dir.join("artists").join("artist_1125.json"),
                &serde_json::to_vec(&artist_cache).unwrap(),
            )
            .unwrap();
        }

        // One of the two shows is already on disk.
        std::fs::create_dir_all(
            out_dir
                .join("Test Artist")
                .join("Test Artist - 2024-01-01 Venue"),
        )
        .unwrap();

        let analysis = analyze_artist(&app, 1125).await.unwrap();
        assert_eq!(analysis.total, 2);
        assert_eq!(analysis.downloaded, 1);
        assert_eq!(analysis.missing.len(), 1);
        assert_eq!(analysis.missing[0].container_id, 102);
        assert!(analysis.cache_used);
        assert!(!analysis.stale_use);
    }
}
