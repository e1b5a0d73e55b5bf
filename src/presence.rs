//! Presence scanning: is a release already downloaded or mirrored?
//!
//! For one artist the scanner builds an [`ArtistPresenceIndex`] from two
//! sources: the immediate subdirectories of the artist's local output
//! folder, and (when mirroring) a bulk `rclone lsf` of the artist's
//! remote folder. When the bulk remote listing fails, per-show probes
//! fill in later with a deduplicated warning.

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, warn};

use crate::download::sanitize;
use crate::mirror::Mirror;
use crate::persist::WarnOnce;

/// Remote half of the presence index.
#[derive(Debug)]
pub enum RemoteSet {
    /// Mirroring is disabled; only the local set matters.
    Disabled,
    /// Bulk listing succeeded.
    Listed(HashSet<String>),
    /// Bulk listing failed; fall back to per-show probes.
    Failed,
}

/// Cached presence knowledge for one artist.
pub struct ArtistPresenceIndex {
    /// Sanitized artist folder name, shared by local and remote layouts.
    pub artist_folder: String,
    pub local: HashSet<String>,
    pub remote: RemoteSet,
    probe_warn: WarnOnce,
}

impl ArtistPresenceIndex {
    /// Scan the local tree and, when mirroring, the remote folder.
    pub async fn build(out_root: &str, artist_name: &str, mirror: Option<&Mirror>) -> Self {
        let artist_folder = sanitize(artist_name);
        let local = list_local_albums(&Path::new(out_root).join(&artist_folder));
        debug!(artist = artist_name, local = local.len(), "local presence scanned");

        let remote = match mirror {
            None => RemoteSet::Disabled,
            Some(mirror) => {
                let remote_path = mirror.audio_remote(&artist_folder);
                match mirror.list_dirs(&remote_path).await {
                    Ok(dirs) => {
                        debug!(artist = artist_name, remote = dirs.len(), "remote presence listed");
                        RemoteSet::Listed(dirs.into_iter().collect())
                    }
                    Err(e) => {
                        warn!("bulk remote listing failed for {artist_name}: {e}");
                        RemoteSet::Failed
                    }
                }
            }
        };

        Self {
            artist_folder,
            local,
            remote,
            probe_warn: WarnOnce::new(),
        }
    }

    /// Build from already-known sets (tests, offline analysis).
    pub fn from_sets(artist_folder: &str, local: HashSet<String>, remote: RemoteSet) -> Self {
        Self {
            artist_folder: artist_folder.to_string(),
            local,
            remote,
            probe_warn: WarnOnce::new(),
        }
    }

    /// Whether a show's expected album folder is present anywhere.
    ///
    /// When the bulk remote listing failed, a per-show probe runs; probe
    /// errors count as "not found" with a once-per-artist warning.
    pub async fn is_show_downloaded(&self, album_folder: &str, mirror: Option<&Mirror>) -> bool {
        if self.local.contains(album_folder) {
            return true;
        }
        match &self.remote {
            RemoteSet::Disabled => false,
            RemoteSet::Listed(remote) => remote.contains(album_folder),
            RemoteSet::Failed => {
                let Some(mirror) = mirror else { return false };
                let path = format!(
                    "{}/{}",
                    mirror.audio_remote(&self.artist_folder),
                    album_folder
                );
                match mirror.exists(&path).await {
                    Ok(present) => present,
                    Err(e) => {
                        self.probe_warn.warn(&format!(
                            "per-show remote probe failed, treating as missing: {e}"
                        ));
                        false
                    }
                }
            }
        }
    }
}

/// Immediate subdirectory names of an artist's local folder.
fn list_local_albums(artist_path: &Path) -> HashSet<String> {
    let Ok(entries) = std::fs::read_dir(artist_path) else {
        return HashSet::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_local_presence() {
        let temp = tempdir().unwrap();
        let artist_dir = temp.path().join("Test Artist");
        std::fs::create_dir_all(artist_dir.join("Test Artist - 2024-01-01 Venue")).unwrap();
        // A stray file must not count as an album.
        std::fs::write(artist_dir.join("notes.txt"), b"x").unwrap();

        let index = ArtistPresenceIndex::build(
            temp.path().to_str().unwrap(),
            "Test Artist",
            None,
        )
        .await;

        assert_eq!(index.local.len(), 1);
        assert!(
            index
                .is_show_downloaded("Test Artist - 2024-01-01 Venue", None)
                .await
        );
        assert!(!index.is_show_downloaded("Test Artist - Other Show", None).await);
    }

    #[tokio::test]
    async fn test_missing_artist_folder_is_empty() {
        let temp = tempdir().unwrap();
        let index =
            ArtistPresenceIndex::build(temp.path().to_str().unwrap(), "Nobody", None).await;
        assert!(index.local.is_empty());
        assert!(matches!(index.remote, RemoteSet::Disabled));
    }

    #[tokio::test]
    async fn test_artist_folder_is_sanitized() {
        let temp = tempdir().unwrap();
        let index =
            ArtistPresenceIndex::build(temp.path().to_str().unwrap(), "AC/DC", None).await;
        assert_eq!(index.artist_folder, "AC_DC");
    }

    #[tokio::test]
    async fn test_remote_listed_set_consulted() {
        let mut remote = HashSet::new();
        remote.insert("Artist - Mirrored Show".to_string());
        let index =
            ArtistPresenceIndex::from_sets("Artist", HashSet::new(), RemoteSet::Listed(remote));

        assert!(index.is_show_downloaded("Artist - Mirrored Show", None).await);
        assert!(!index.is_show_downloaded("Artist - Absent Show", None).await);
    }

    #[tokio::test]
    async fn test_remote_failed_without_mirror_is_missing() {
        let index = ArtistPresenceIndex::from_sets("Artist", HashSet::new(), RemoteSet::Failed);
        assert!(!index.is_show_downloaded("Artist - Show", None).await);
    }

    #[tokio::test]
    async fn test_local_wins_regardless_of_remote_state() {
        let mut local = HashSet::new();
        local.insert("Artist - Show".to_string());
        let index = ArtistPresenceIndex::from_sets("Artist", local, RemoteSet::Failed);
        assert!(index.is_show_downloaded("Artist - Show", None).await);
    }
}
