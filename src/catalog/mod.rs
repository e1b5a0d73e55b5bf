//! File-backed catalog cache and its secondary indexes.
//!
//! Four artifacts live under the cache root, all written atomically and
//! serialized by the cache lock:
//!
//! - `catalog.json`: the last-fetched recent-items list
//! - `catalog_meta.json`: bookkeeping about that fetch
//! - `artists_index.json`: lowercased artist name → artist id
//! - `containers_index.json`: container id → summary
//!
//! Readers never lock: the atomic rename gives each read of a single file
//! a consistent view. Cross-file consistency is best-effort by design;
//! the indexes are derivable from the catalog at any time.
//!
//! Per-artist metadata is cached separately under `artists/` with a 24 h
//! TTL and a stale-on-error fallback.

pub mod gaps;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::NugsClient;
use crate::api::dto::{Container, ContainerPage};
use crate::config::RefreshConfig;
use crate::error::{Error, Result};
use crate::persist::{with_cache_lock, write_atomic};

pub const CATALOG_FILE: &str = "catalog.json";
pub const META_FILE: &str = "catalog_meta.json";
pub const ARTISTS_INDEX_FILE: &str = "artists_index.json";
pub const CONTAINERS_INDEX_FILE: &str = "containers_index.json";

/// Per-artist metadata cache TTL.
pub const ARTIST_TTL: Duration = Duration::from_secs(24 * 3600);

/// Bump when the cache layout changes incompatibly.
const CACHE_VERSION: u32 = 2;

/// Bookkeeping for the last catalog update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogMeta {
    /// UTC RFC3339
    pub last_updated: String,
    pub cache_version: u32,
    pub total_shows: usize,
    pub total_artists: usize,
    pub api_method: String,
    /// Seconds the update took
    pub update_duration: f64,
}

/// Entry in `containers_index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub artist_id: u64,
    pub artist_name: String,
    pub container_info: String,
    pub performance_date: String,
}

/// Per-artist cache file: the raw pages as the service returned them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtistCache {
    pub artist_id: u64,
    /// UTC RFC3339
    pub cached_at: String,
    pub pages: Vec<ContainerPage>,
}

/// Outcome of a cached artist-metadata read.
#[derive(Debug)]
pub struct ArtistMeta {
    pub pages: Vec<ContainerPage>,
    /// The cache satisfied the request (fresh or stale).
    pub cache_used: bool,
    /// The cache was stale but a refresh failed, so it was used anyway.
    pub stale_use: bool,
}

impl ArtistMeta {
    /// Flatten pages into one container list, preserving page order.
    pub fn containers(&self) -> Vec<&Container> {
        self.pages.iter().flat_map(|p| p.containers.iter()).collect()
    }
}

/// Handle to the on-disk catalog cache.
pub struct CatalogCache {
    dir: PathBuf,
}

impl CatalogCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ========================================================================
    // Latest-catalog update
    // ========================================================================

    /// Replace the catalog and rebuild both indexes from scratch.
    ///
    /// Everything happens under the cache lock so no other writer
    /// interleaves; each file is still written atomically so concurrent
    /// readers stay correct.
    pub fn update_latest(
        &self,
        containers: &[Container],
        api_method: &str,
        update_duration: Duration,
    ) -> Result<CatalogMeta> {
        let meta = with_cache_lock(&self.dir, || {
            write_atomic(
                &self.dir.join(CATALOG_FILE),
                &serde_json::to_vec(containers).expect("containers serialize"),
            )?;

            let mut artists: HashMap<String, u64> = HashMap::new();
            let mut index: HashMap<u64, ContainerSummary> = HashMap::new();
            for c in containers {
                artists
                    .entry(c.artist_name.trim().to_lowercase())
                    .or_insert(c.artist_id);
                index.insert(
                    c.container_id,
                    ContainerSummary {
                        artist_id: c.artist_id,
                        artist_name: c.artist_name.clone(),
                        container_info: c.container_info.clone(),
                        performance_date: c.performance_date.clone(),
                    },
                );
            }

            let meta = CatalogMeta {
                last_updated: Utc::now().to_rfc3339(),
                cache_version: CACHE_VERSION,
                total_shows: containers.len(),
                total_artists: artists.len(),
                api_method: api_method.to_string(),
                update_duration: update_duration.as_secs_f64(),
            };

            write_atomic(
                &self.dir.join(META_FILE),
                &serde_json::to_vec_pretty(&meta).expect("meta serializes"),
            )?;
            write_atomic(
                &self.dir.join(ARTISTS_INDEX_FILE),
                &serde_json::to_vec(&artists).expect("index serializes"),
            )?;
            write_atomic(
                &self.dir.join(CONTAINERS_INDEX_FILE),
                &serde_json::to_vec(&index).expect("index serializes"),
            )?;
            Ok(meta)
        })?;

        info!(
            shows = meta.total_shows,
            artists = meta.total_artists,
            "catalog cache updated"
        );
        Ok(meta)
    }

    /// Fetch the latest catalog from the service and persist it.
    pub async fn refresh_from_service(&self, client: &NugsClient) -> Result<CatalogMeta> {
        let start = std::time::Instant::now();
        let containers = client.get_latest_catalog().await?;
        self.update_latest(&containers, "catalog.containersAll", start.elapsed())
    }

    // ========================================================================
    // Readers (lock-free)
    // ========================================================================

    pub fn read_catalog(&self) -> Option<Vec<Container>> {
        self.read_artifact(CATALOG_FILE)
    }

    pub fn read_meta(&self) -> Option<CatalogMeta> {
        self.read_artifact(META_FILE)
    }

    pub fn read_artists_index(&self) -> Option<HashMap<String, u64>> {
        self.read_artifact(ARTISTS_INDEX_FILE)
    }

    pub fn read_containers_index(&self) -> Option<HashMap<u64, ContainerSummary>> {
        self.read_artifact(CONTAINERS_INDEX_FILE)
    }

    /// Resolve an artist name (case-insensitive) to its id.
    pub fn lookup_artist(&self, name: &str) -> Option<u64> {
        self.read_artists_index()?
            .get(&name.trim().to_lowercase())
            .copied()
    }

    /// Read an artifact; a parse failure is logged and treated as absent.
    fn read_artifact<T: serde::de::DeserializeOwned>(&self, file: &str) -> Option<T> {
        let path = self.dir.join(file);
        let contents = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(v) => Some(v),
            Err(e) => {
                let err = Error::corrupt(&path, e.to_string());
                warn!("{err}");
                None
            }
        }
    }

    // ========================================================================
    // Per-artist metadata cache
    // ========================================================================

    fn artist_cache_path(&self, artist_id: u64) -> PathBuf {
        self.dir.join("artists").join(format!("artist_{artist_id}.json"))
    }

    fn read_artist_cache(&self, artist_id: u64) -> Option<ArtistCache> {
        let path = self.artist_cache_path(artist_id);
        let contents = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(v) => Some(v),
            Err(e) => {
                let err = Error::corrupt(&path, e.to_string());
                warn!("{err}");
                None
            }
        }
    }

    fn write_artist_cache(&self, artist_id: u64, pages: &[ContainerPage]) -> Result<()> {
        let cache = ArtistCache {
            artist_id,
            cached_at: Utc::now().to_rfc3339(),
            pages: pages.to_vec(),
        };
        write_atomic(
            &self.artist_cache_path(artist_id),
            &serde_json::to_vec(&cache).expect("artist cache serializes"),
        )
    }

    /// Get an artist's container pages through the cache.
    ///
    /// Policy:
    /// 1. A cache younger than `ttl` is returned as-is.
    /// 2. Otherwise the service is asked; success overwrites the cache.
    /// 3. A refresh failure falls back to the cache regardless of age;
    ///    only when there is no cache at all does the error propagate.
    pub async fn get_artist_meta_cached(
        &self,
        client: &NugsClient,
        artist_id: u64,
        ttl: Duration,
    ) -> Result<ArtistMeta> {
        let cached = self.read_artist_cache(artist_id);

        if let Some(cache) = &cached {
            if let Ok(at) = DateTime::parse_from_rfc3339(&cache.cached_at) {
                let age = Utc::now().signed_duration_since(at.with_timezone(&Utc));
                if age.to_std().map(|a| a <= ttl).unwrap_or(false) {
                    debug!(artist_id, "artist cache fresh");
                    return Ok(ArtistMeta {
                        pages: cache.pages.clone(),
                        cache_used: true,
                        stale_use: false,
                    });
                }
            }
        }

        match client.get_artist_meta(artist_id).await {
            Ok(pages) => {
                if let Err(e) = self.write_artist_cache(artist_id, &pages) {
                    warn!(artist_id, "could not persist artist cache: {e}");
                }
                Ok(ArtistMeta {
                    pages,
                    cache_used: false,
                    stale_use: false,
                })
            }
            Err(e) => match cached {
                Some(cache) => {
                    warn!(artist_id, "refresh failed, using stale artist cache: {e}");
                    Ok(ArtistMeta {
                        pages: cache.pages,
                        cache_used: true,
                        stale_use: true,
                    })
                }
                None => Err(e),
            },
        }
    }
}

// ============================================================================
// Auto-refresh scheduling
// ============================================================================

/// The most recent scheduled refresh tick at or before `now`.
///
/// Daily: today at HH:MM in the configured timezone, or yesterday when
/// the tick has not been reached yet today. Weekly: the most recent
/// occurrence on the anchor weekday (the weekday of the last update; see
/// DESIGN.md for the interpretation choice).
pub fn last_scheduled_tick(
    config: &RefreshConfig,
    now: DateTime<Utc>,
    anchor_weekday: Option<Weekday>,
) -> Result<DateTime<Utc>> {
    let (hour, minute) = crate::config::parse_refresh_time(&config.time)?;
    let tz: Tz = config
        .timezone
        .parse()
        .map_err(|_| Error::config(format!("unknown timezone {:?}", config.timezone)))?;

    let local_now = now.with_timezone(&tz);
    let mut date = local_now.date_naive();

    // Step back until the tick at HH:MM on `date` is in the past.
    let mut tick = local_tick(&tz, date, hour, minute);
    if tick.map(|t| t > local_now).unwrap_or(true) {
        date = date.pred_opt().ok_or_else(|| Error::config("date underflow"))?;
        tick = local_tick(&tz, date, hour, minute);
    }

    if config.interval == "weekly" {
        let anchor = anchor_weekday.unwrap_or_else(|| date.weekday());
        while date.weekday() != anchor {
            date = date.pred_opt().ok_or_else(|| Error::config("date underflow"))?;
        }
        tick = local_tick(&tz, date, hour, minute);
    }

    tick.map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| Error::config("refresh tick not representable in timezone"))
}

/// Resolve a wall-clock time in `tz`, taking the earlier instant when DST
/// makes it ambiguous.
fn local_tick(tz: &Tz, date: chrono::NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Tz>> {
    tz.with_ymd_and_hms(date.year(), date.month(), date.day(), hour, minute, 0)
        .earliest()
}

/// Whether the catalog is due for its scheduled refresh.
pub fn refresh_due(meta: Option<&CatalogMeta>, config: &RefreshConfig, now: DateTime<Utc>) -> bool {
    if !config.enabled {
        return false;
    }
    let Some(meta) = meta else {
        // Never updated: always due.
        return true;
    };
    let Ok(last) = DateTime::parse_from_rfc3339(&meta.last_updated) else {
        return true;
    };
    let last = last.with_timezone(&Utc);

    let anchor = if config.interval == "weekly" {
        config
            .timezone
            .parse::<Tz>()
            .ok()
            .map(|tz| last.with_timezone(&tz).weekday())
    } else {
        None
    };

    match last_scheduled_tick(config, now, anchor) {
        Ok(tick) => last < tick,
        Err(e) => {
            warn!("auto-refresh schedule invalid: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::dto::Track;
    use tempfile::tempdir;

    fn container(id: u64, artist_id: u64, artist: &str, info: &str) -> Container {
        Container {
            container_id: id,
            artist_id,
            artist_name: artist.to_string(),
            container_info: info.to_string(),
            performance_date: "24/01/01".to_string(),
            tracks: vec![Track {
                track_id: id * 10,
                track_num: 1,
                song_title: "Song".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_update_latest_writes_all_artifacts() {
        let temp = tempdir().unwrap();
        let cache = CatalogCache::new(temp.path());

        let containers = vec![
            container(1, 10, "Alpha Band", "Show A"),
            container(2, 10, "Alpha Band", "Show B"),
            container(3, 20, "Beta Duo", "Show C"),
        ];
        let meta = cache
            .update_latest(&containers, "catalog.containersAll", Duration::from_secs(2))
            .unwrap();

        assert_eq!(meta.total_shows, 3);
        assert_eq!(meta.total_artists, 2);
        assert_eq!(meta.cache_version, CACHE_VERSION);

        let artists = cache.read_artists_index().unwrap();
        assert_eq!(artists.get("alpha band"), Some(&10));
        assert_eq!(artists.get("beta duo"), Some(&20));

        let index = cache.read_containers_index().unwrap();
        assert_eq!(index[&3].artist_name, "Beta Duo");

        assert_eq!(cache.read_catalog().unwrap().len(), 3);
        assert!(cache.read_meta().is_some());
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_json() {
        // S1: writers under the lock + atomic renames mean readers always
        // parse a complete file, old or new.
        let temp = tempdir().unwrap();
        let dir = temp.path().to_path_buf();
        let cache = CatalogCache::new(&dir);
        cache
            .update_latest(&[container(1, 1, "A", "x")], "m", Duration::ZERO)
            .unwrap();

        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let readers: Vec<_> = (0..20)
            .map(|_| {
                let dir = dir.clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    let cache = CatalogCache::new(&dir);
                    let mut reads = 0usize;
                    while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                        // read_artifact returns None only for parse errors
                        // or a missing file; the file always exists here.
                        assert!(cache.read_catalog().is_some(), "reader saw partial JSON");
                        reads += 1;
                    }
                    reads
                })
            })
            .collect();

        for i in 0..30 {
            let containers: Vec<_> = (0..3)
                .map(|j| container(i * 10 + j, j, &format!("artist-{j}"), "show"))
                .collect();
            cache
                .update_latest(&containers, "m", Duration::ZERO)
                .unwrap();
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        for r in readers {
            assert!(r.join().unwrap() > 0);
        }

        let meta = cache.read_meta().unwrap();
        assert_eq!(meta.total_shows, 3);
    }

    #[test]
    fn test_corrupt_artifact_treated_as_absent() {
        let temp = tempdir().unwrap();
        let cache = CatalogCache::new(temp.path());
        std::fs::write(temp.path().join(META_FILE), b"{not json").unwrap();
        assert!(cache.read_meta().is_none());
    }

    #[test]
    fn test_artist_cache_roundtrip() {
        let temp = tempdir().unwrap();
        let cache = CatalogCache::new(temp.path());

        let pages = vec![ContainerPage {
            containers: vec![container(101, 1125, "Test Artist", "Show")],
        }];
        cache.write_artist_cache(1125, &pages).unwrap();

        let read = cache.read_artist_cache(1125).unwrap();
        assert_eq!(read.artist_id, 1125);
        assert_eq!(read.pages[0].containers[0].container_id, 101);
    }

    #[tokio::test]
    async fn test_artist_meta_fresh_cache_skips_service() {
        let temp = tempdir().unwrap();
        let cache = CatalogCache::new(temp.path());
        let pages = vec![ContainerPage {
            containers: vec![container(101, 1125, "Test Artist", "Show")],
        }];
        cache.write_artist_cache(1125, &pages).unwrap();

        // The client points at an unroutable address: any service call
        // would fail, so success proves the cache satisfied the request.
        let client = NugsClient::with_base_url("http://127.0.0.1:1");
        let meta = cache
            .get_artist_meta_cached(&client, 1125, ARTIST_TTL)
            .await
            .unwrap();
        assert!(meta.cache_used);
        assert!(!meta.stale_use);
        assert_eq!(meta.containers().len(), 1);
    }

    #[tokio::test]
    async fn test_artist_meta_stale_fallback_on_refresh_error() {
        let temp = tempdir().unwrap();
        let cache = CatalogCache::new(temp.path());
        let pages = vec![ContainerPage {
            containers: vec![container(101, 1125, "Test Artist", "Show")],
        }];
        cache.write_artist_cache(1125, &pages).unwrap();

        let client = NugsClient::with_base_url("http://127.0.0.1:1");
        // Zero TTL: the cache is immediately stale and a refresh is
        // attempted; the refresh fails and the stale pages come back.
        let meta = cache
            .get_artist_meta_cached(&client, 1125, Duration::ZERO)
            .await
            .unwrap();
        assert!(meta.cache_used);
        assert!(meta.stale_use);
    }

    #[tokio::test]
    async fn test_artist_meta_no_cache_propagates_error() {
        let temp = tempdir().unwrap();
        let cache = CatalogCache::new(temp.path());
        let client = NugsClient::with_base_url("http://127.0.0.1:1");
        let result = cache
            .get_artist_meta_cached(&client, 999, ARTIST_TTL)
            .await;
        assert!(result.is_err());
    }

    // ========================================================================
    // Auto-refresh schedule
    // ========================================================================

    fn refresh_config(time: &str, tz: &str, interval: &str) -> RefreshConfig {
        RefreshConfig {
            enabled: true,
            time: time.to_string(),
            timezone: tz.to_string(),
            interval: interval.to_string(),
        }
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_daily_tick_today_when_past() {
        let config = refresh_config("05:00", "America/New_York", "daily");
        // 06:00 local on 2024-06-10 (EDT, UTC-4) = 10:00 UTC
        let now = utc("2024-06-10T10:00:00Z");
        let tick = last_scheduled_tick(&config, now, None).unwrap();
        // Tick is 05:00 EDT = 09:00 UTC same day
        assert_eq!(tick, utc("2024-06-10T09:00:00Z"));
    }

    #[test]
    fn test_daily_tick_yesterday_when_before() {
        let config = refresh_config("05:00", "America/New_York", "daily");
        // 04:00 local = 08:00 UTC: today's tick not reached yet
        let now = utc("2024-06-10T08:00:00Z");
        let tick = last_scheduled_tick(&config, now, None).unwrap();
        assert_eq!(tick, utc("2024-06-09T09:00:00Z"));
    }

    #[test]
    fn test_weekly_tick_steps_back_to_anchor() {
        let config = refresh_config("05:00", "UTC", "weekly");
        // 2024-06-12 is a Wednesday; anchor Monday
        let now = utc("2024-06-12T12:00:00Z");
        let tick = last_scheduled_tick(&config, now, Some(Weekday::Mon)).unwrap();
        assert_eq!(tick, utc("2024-06-10T05:00:00Z"));
    }

    #[test]
    fn test_refresh_due_scenarios() {
        let config = refresh_config("05:00", "America/New_York", "daily");
        let now = utc("2024-06-10T10:00:00Z"); // 06:00 local

        // Updated yesterday 04:00 local (08:00 UTC): before today's tick.
        let stale = CatalogMeta {
            last_updated: "2024-06-09T08:00:00+00:00".to_string(),
            cache_version: CACHE_VERSION,
            total_shows: 0,
            total_artists: 0,
            api_method: String::new(),
            update_duration: 0.0,
        };
        assert!(refresh_due(Some(&stale), &config, now));

        // Updated after today's tick: not due.
        let fresh = CatalogMeta {
            last_updated: "2024-06-10T09:30:00+00:00".to_string(),
            ..stale.clone()
        };
        assert!(!refresh_due(Some(&fresh), &config, now));

        // Never updated: due.
        assert!(refresh_due(None, &config, now));

        // Disabled: never due.
        let mut disabled = config.clone();
        disabled.enabled = false;
        assert!(!refresh_due(Some(&stale), &disabled, now));
    }

    #[test]
    fn test_refresh_due_weekly_same_weekday() {
        let config = refresh_config("05:00", "UTC", "weekly");
        // Last updated Monday 2024-06-03 06:00 UTC (after that Monday's tick).
        let meta = CatalogMeta {
            last_updated: "2024-06-03T06:00:00+00:00".to_string(),
            cache_version: CACHE_VERSION,
            total_shows: 0,
            total_artists: 0,
            api_method: String::new(),
            update_duration: 0.0,
        };
        // Following Wednesday: the Monday 2024-06-10 tick has passed.
        assert!(refresh_due(Some(&meta), &config, utc("2024-06-12T12:00:00Z")));
        // Same Monday, later in the day: not due.
        assert!(!refresh_due(Some(&meta), &config, utc("2024-06-03T20:00:00Z")));
    }
}
