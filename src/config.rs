//! Configuration system using a JSON file.
//!
//! Config lives at `~/.nugs/config.json`, falling back to
//! `~/.config/nugs/config.json` when the former's parent cannot be
//! determined. The file carries credentials, so it is written with mode
//! 0600 inside a 0700 directory; on load, looser modes are tightened on
//! POSIX and warned about on Windows.
//!
//! Settings are grouped into sections mirroring what they control: auth,
//! quality, output paths, ffmpeg invocation, the remote mirror, and the
//! catalog auto-refresh schedule.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::persist;

/// Audio format ids accepted in config: 1=ALAC, 2=FLAC, 3=MQA, 4=360RA, 5=AAC.
pub const AUDIO_FORMATS: std::ops::RangeInclusive<u8> = 1..=5;
/// Video format ids map to target resolutions.
pub const VIDEO_RESOLUTIONS: [&str; 5] = ["480", "720", "1080", "1440", "2160"];

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service credentials
    pub auth: AuthConfig,

    /// Download quality selection
    pub quality: QualityConfig,

    /// Output directories
    pub output: OutputConfig,

    /// FFmpeg invocation settings
    pub ffmpeg: FfmpegConfig,

    /// Remote mirror (rclone) settings
    pub mirror: MirrorConfig,

    /// Catalog auto-refresh schedule
    pub refresh: RefreshConfig,
}

/// Service credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Account email
    pub email: String,
    /// Account password
    pub password: String,
    /// Bearer token; takes precedence over email/password when set.
    /// A leading "Bearer " prefix is stripped on load.
    pub token: String,
}

/// Download quality selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Audio format: 1=ALAC, 2=FLAC, 3=MQA, 4=360RA, 5=AAC
    pub audio_format: u8,
    /// Video format: 1..5 mapping to 480/720/1080/1440/2160
    pub video_format: u8,
    /// Default media when a release has both: "audio", "video" or "both"
    pub default_output: String,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            audio_format: 2,
            video_format: 3,
            default_output: "audio".to_string(),
        }
    }
}

/// Output directories
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Audio releases root
    pub audio_path: String,
    /// Video root; empty means "use audio_path"
    pub video_path: String,
}

impl OutputConfig {
    /// Effective video output root.
    pub fn video_root(&self) -> &str {
        if self.video_path.is_empty() {
            &self.audio_path
        } else {
            &self.video_path
        }
    }
}

/// FFmpeg invocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FfmpegConfig {
    /// Binary name or absolute path
    pub binary: String,
    /// Skip writing chapter metadata into videos
    pub skip_chapters: bool,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            skip_chapters: false,
        }
    }
}

/// Remote mirror (rclone) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Mirror the local tree to a remote after each download
    pub enabled: bool,
    /// rclone remote name (e.g. "gdrive")
    pub remote: String,
    /// Remote base path for audio releases
    pub audio_base: String,
    /// Remote base path for video files; empty means "use audio_base"
    pub video_base: String,
    /// rclone --transfers value
    pub transfers: u32,
    /// Remove the local copy after a verified upload
    pub delete_after_upload: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            remote: String::new(),
            audio_base: String::new(),
            video_base: String::new(),
            transfers: 4,
            delete_after_upload: false,
        }
    }
}

impl MirrorConfig {
    /// Effective remote base for videos.
    pub fn video_base(&self) -> &str {
        if self.video_base.is_empty() {
            &self.audio_base
        } else {
            &self.video_base
        }
    }
}

/// Catalog auto-refresh schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Refresh the catalog cache automatically at startup when due
    pub enabled: bool,
    /// Local wall-clock time of the scheduled tick, "HH:MM"
    pub time: String,
    /// IANA timezone name the tick is evaluated in
    pub timezone: String,
    /// "daily" or "weekly"
    pub interval: String,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            time: "05:00".to_string(),
            timezone: "UTC".to_string(),
            interval: "daily".to_string(),
        }
    }
}

impl Config {
    /// Validate field ranges. Called after load and before first use.
    pub fn validate(&self) -> Result<()> {
        if !AUDIO_FORMATS.contains(&self.quality.audio_format) {
            return Err(Error::config(format!(
                "audio_format must be 1-5, got {}",
                self.quality.audio_format
            )));
        }
        if !AUDIO_FORMATS.contains(&self.quality.video_format) {
            return Err(Error::config(format!(
                "video_format must be 1-5, got {}",
                self.quality.video_format
            )));
        }
        match self.quality.default_output.as_str() {
            "audio" | "video" | "both" => {}
            other => {
                return Err(Error::config(format!(
                    "default_output must be audio, video or both, got {other:?}"
                )));
            }
        }
        if self.mirror.enabled {
            if self.mirror.remote.is_empty() {
                return Err(Error::config("mirror.remote is required when mirroring"));
            }
            if self.mirror.transfers < 1 {
                return Err(Error::config("mirror.transfers must be at least 1"));
            }
        }
        if self.refresh.enabled {
            parse_refresh_time(&self.refresh.time)?;
            if self.refresh.timezone.parse::<chrono_tz::Tz>().is_err() {
                return Err(Error::config(format!(
                    "unknown timezone {:?}",
                    self.refresh.timezone
                )));
            }
            match self.refresh.interval.as_str() {
                "daily" | "weekly" => {}
                other => {
                    return Err(Error::config(format!(
                        "refresh.interval must be daily or weekly, got {other:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Target video resolution string ("480".."2160") for the configured format.
    pub fn wanted_resolution(&self) -> &'static str {
        VIDEO_RESOLUTIONS[(self.quality.video_format as usize - 1).min(4)]
    }
}

/// Parse "HH:MM" into (hour, minute).
pub fn parse_refresh_time(s: &str) -> Result<(u32, u32)> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| Error::config(format!("refresh.time must be HH:MM, got {s:?}")))?;
    let hour: u32 = h
        .parse()
        .map_err(|_| Error::config(format!("bad hour in refresh.time {s:?}")))?;
    let minute: u32 = m
        .parse()
        .map_err(|_| Error::config(format!("bad minute in refresh.time {s:?}")))?;
    if hour > 23 || minute > 59 {
        return Err(Error::config(format!("refresh.time out of range: {s:?}")));
    }
    Ok((hour, minute))
}

// ============================================================================
// Config File Operations
// ============================================================================

/// Get the config directory path: `~/.nugs`, or the OS config dir.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Some(home.join(".nugs"));
    }
    dirs::config_dir().map(|d| d.join("nugs"))
}

/// Get the full path to the config file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.json"))
}

/// Get the cache root: `~/.cache/nugs`.
pub fn cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("nugs"))
}

/// Load configuration from disk.
///
/// Returns `Ok(None)` when no config file exists (first run). Parse errors
/// are fatal: a broken credentials file should be fixed, not silently
/// replaced with defaults.
pub fn load() -> Result<Option<Config>> {
    let Some(path) = config_path() else {
        return Err(Error::config("could not determine config directory"));
    };
    if !path.exists() {
        return Ok(None);
    }

    tighten_permissions(&path);

    let contents = fs::read_to_string(&path)?;
    let mut config: Config = serde_json::from_str(&contents)
        .map_err(|e| Error::config(format!("failed to parse {}: {e}", path.display())))?;

    // Tokens pasted from browser tooling often carry the scheme prefix.
    if let Some(stripped) = config.auth.token.strip_prefix("Bearer ") {
        config.auth.token = stripped.to_string();
    }

    config.validate()?;
    info!("Loaded config from {}", path.display());
    Ok(Some(config))
}

/// Save configuration to disk with restrictive modes.
pub fn save(config: &Config) -> Result<()> {
    let dir = config_dir().ok_or_else(|| Error::config("could not determine config directory"))?;
    fs::create_dir_all(&dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    }

    let path = dir.join("config.json");
    let contents = serde_json::to_vec_pretty(config)
        .map_err(|e| Error::config(format!("failed to serialize config: {e}")))?;
    persist::write_atomic_mode(&path, &contents, 0o600)?;

    info!("Saved config to {}", path.display());
    Ok(())
}

/// Tighten insecure file modes in place (POSIX) or warn (elsewhere).
#[cfg_attr(not(unix), allow(unused_variables))]
fn tighten_permissions(path: &std::path::Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(path) {
            let mode = meta.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                warn!(
                    "config file {} had mode {:o}; tightening to 600",
                    path.display(),
                    mode
                );
                let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
            }
        }
        if let Some(dir) = path.parent() {
            if let Ok(meta) = fs::metadata(dir) {
                let mode = meta.permissions().mode() & 0o777;
                if mode & 0o077 != 0 {
                    let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        warn!(
            "config file permissions are not enforced on this platform; \
             ensure {} is private",
            path.display()
        );
    }
}

// ============================================================================
// First-run prompt
// ============================================================================

/// Interactively collect the minimum viable config on first run.
///
/// Only asks for credentials, formats and the audio output directory;
/// everything else keeps its default and can be edited in the file.
pub fn first_run_prompt() -> Result<Config> {
    println!("No config found, let's set one up.\n");

    let mut config = Config::default();
    config.auth.email = prompt("nugs.net email")?;
    config.auth.password = prompt("nugs.net password")?;

    let format = prompt("audio format [1=ALAC 2=FLAC 3=MQA 4=360RA 5=AAC] (2)")?;
    if !format.is_empty() {
        config.quality.audio_format = format
            .parse()
            .map_err(|_| Error::config(format!("not a format number: {format:?}")))?;
    }

    config.output.audio_path = prompt("download directory")?;

    config.validate()?;
    save(&config)?;
    println!("\n✓ Config written to {:?}", config_path().unwrap_or_default());
    Ok(config)
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

// ============================================================================
// Tests
// ============================================================================
