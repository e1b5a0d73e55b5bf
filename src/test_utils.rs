//! Test utilities and fixtures for nugs tests.
//!
//! This module provides common mock factories and filesystem helpers to
//! reduce boilerplate in tests.
//!
//! # Example
//!
//! ```ignore
//! use nugs::test_utils::{mock_container, temp_app};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let (app, _dir) = temp_app();
//!     let container = mock_container(23329);
//!     // ... test logic
//! }
//! ```

use tempfile::TempDir;

use crate::api::dto::{Chapter, Container, ContainerPage, Product, Track};
use crate::app::App;
use crate::catalog::ArtistCache;
use crate::config::Config;
use crate::persist::write_atomic;

/// Creates an [`App`] rooted in a temporary cache directory.
///
/// The config points both output paths into the same temp directory.
/// Keep the TempDir alive for the duration of your test.
pub fn temp_app() -> (App, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let mut config = Config::default();
    config.output.audio_path = dir.path().join("music").display().to_string();

    let app = App::with_cache_dir(config, dir.path().join("cache"))
        .expect("Failed to build test app");
    (app, dir)
}

/// Creates a mock Container with sensible defaults.
///
/// Customize using struct update syntax:
///
/// ```ignore
/// let container = Container {
///     artist_name: "Other Artist".to_string(),
///     ..mock_container(1)
/// };
/// ```
pub fn mock_container(container_id: u64) -> Container {
    Container {
        container_id,
        artist_id: 1125,
        artist_name: "Test Artist".to_string(),
        container_info: format!("2024-01-{:02} The Venue, City, ST", container_id % 28 + 1),
        venue_name: "The Venue".to_string(),
        venue_city: "City".to_string(),
        venue_state: "ST".to_string(),
        performance_date: "24/01/01".to_string(),
        availability_type: "available".to_string(),
        container_type: "show".to_string(),
        tracks: vec![
            mock_track(container_id * 100 + 1, 1),
            mock_track(container_id * 100 + 2, 2),
        ],
        products: Vec::new(),
        live_stream_products: Vec::new(),
        chapters: Vec::new(),
    }
}

/// Creates a mock video-only Container (video SKU, no tracks).
pub fn mock_video_container(container_id: u64) -> Container {
    Container {
        tracks: Vec::new(),
        products: vec![Product {
            sku_id: container_id * 10,
            format_str: "VIDEO ON DEMAND".to_string(),
        }],
        chapters: vec![
            Chapter {
                chapter_seconds: 0.0,
                chapter_name: "Intro".to_string(),
            },
            Chapter {
                chapter_seconds: 600.0,
                chapter_name: "Set One".to_string(),
            },
        ],
        ..mock_container(container_id)
    }
}

/// Creates a mock Track.
pub fn mock_track(track_id: u64, track_num: u32) -> Track {
    Track {
        track_id,
        track_num,
        song_title: format!("Song {track_num}"),
    }
}

/// Seed an artist cache file the way the engine persists it.
pub fn seed_artist_cache(app: &App, artist_id: u64, containers: Vec<Container>) {
    let cache = ArtistCache {
        artist_id,
        cached_at: chrono::Utc::now().to_rfc3339(),
        pages: vec![ContainerPage { containers }],
    };
    write_atomic(
        &app.cache
            .dir()
            .join("artists")
            .join(format!("artist_{artist_id}.json")),
        &serde_json::to_vec(&cache).expect("cache serializes"),
    )
    .expect("Failed to seed artist cache");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_container_defaults() {
        let container = mock_container(7);
        assert_eq!(container.container_id, 7);
        assert_eq!(container.artist_name, "Test Artist");
        assert_eq!(container.tracks.len(), 2);
        assert_eq!(container.tracks[1].track_num, 2);
    }

    #[test]
    fn test_mock_video_container_is_video_only() {
        let container = mock_video_container(7);
        assert!(container.tracks.is_empty());
        assert!(crate::download::is_video_only(&container));
        assert_eq!(container.chapters.len(), 2);
    }

    #[test]
    fn test_temp_app_has_isolated_dirs() {
        let (app, dir) = temp_app();
        assert!(app.cache.dir().starts_with(dir.path()));
        assert!(app.config.output.audio_path.starts_with(&dir.path().display().to_string()));
    }

    #[tokio::test]
    async fn test_seed_artist_cache_is_readable() {
        let (app, _dir) = temp_app();
        seed_artist_cache(&app, 1125, vec![mock_container(1), mock_container(2)]);

        let client = crate::api::NugsClient::with_base_url("http://127.0.0.1:1");
        let meta = app
            .cache
            .get_artist_meta_cached(&client, 1125, crate::catalog::ARTIST_TTL)
            .await
            .unwrap();
        assert!(meta.cache_used);
        assert_eq!(meta.containers().len(), 2);
    }
}
