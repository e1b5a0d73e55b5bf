//! Remote mirror operations via rclone.
//!
//! The mirror is plain rclone invoked as a child process with a fixed
//! command shape per operation:
//!
//! - directory upload: `rclone copy <local> <remote>:<base>/<artist>/<album> -P --transfers=<N>`
//! - file upload: `rclone copyto <local> <remote>:<base>/<artist>/<file> -P --transfers=<N>`
//! - verify: `rclone check --one-way ...`
//! - listing: `rclone lsf ...`
//!
//! With `-P` rclone emits a stats block on stdout; a streaming parser
//! turns those lines into upload-side progress ticks.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::MirrorConfig;
use crate::error::{Error, Result};

static STATS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Transferred:\s+([\d.]+)\s*([KMGT]?i?B)?\s*/\s*([\d.]+)\s*([KMGT]?i?B),\s*(\d+)%,\s*([\d.]+)\s*([KMGT]?i?B)/s",
    )
    .expect("valid regex")
});

/// One parsed rclone stats tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadTick {
    pub transferred: u64,
    pub total: u64,
    pub percent: u32,
    /// Bytes per second
    pub speed: f64,
}

/// Remote mirror handle built from the mirror config section.
pub struct Mirror {
    remote: String,
    audio_base: String,
    video_base: String,
    transfers: u32,
}

impl Mirror {
    pub fn new(config: &MirrorConfig) -> Self {
        Self {
            remote: config.remote.clone(),
            audio_base: config.audio_base.clone(),
            video_base: config.video_base().to_string(),
            transfers: config.transfers.max(1),
        }
    }

    /// Verify rclone is on PATH; the mirror is useless without it.
    pub async fn check_available(&self) -> Result<()> {
        let result = Command::new("rclone")
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => Ok(()),
            Ok(_) | Err(_) => Err(Error::ToolMissing { tool: "rclone" }),
        }
    }

    /// Remote path for an artist's audio folder.
    pub fn audio_remote(&self, artist: &str) -> String {
        format!("{}:{}/{}", self.remote, self.audio_base, artist)
    }

    /// Remote path for an artist's video folder.
    pub fn video_remote(&self, artist: &str) -> String {
        format!("{}:{}/{}", self.remote, self.video_base, artist)
    }

    // ========================================================================
    // Command shapes
    // ========================================================================

    /// `rclone copy` arguments for a directory upload.
    pub fn copy_dir_args(&self, local: &Path, artist: &str, album: &str) -> Vec<String> {
        vec![
            "copy".to_string(),
            local.display().to_string(),
            format!("{}:{}/{}/{}", self.remote, self.audio_base, artist, album),
            "-P".to_string(),
            format!("--transfers={}", self.transfers),
        ]
    }

    /// `rclone copyto` arguments for a single-file upload.
    pub fn copy_file_args(&self, local: &Path, artist: &str, file_name: &str) -> Vec<String> {
        vec![
            "copyto".to_string(),
            local.display().to_string(),
            format!("{}:{}/{}/{}", self.remote, self.video_base, artist, file_name),
            "-P".to_string(),
            format!("--transfers={}", self.transfers),
        ]
    }

    /// `rclone check` arguments verifying a directory upload.
    pub fn check_dir_args(&self, local: &Path, artist: &str, album: &str) -> Vec<String> {
        vec![
            "check".to_string(),
            "--one-way".to_string(),
            local.display().to_string(),
            format!("{}:{}/{}/{}", self.remote, self.audio_base, artist, album),
        ]
    }

    /// `rclone check` arguments verifying a single-file upload.
    pub fn check_file_args(
        &self,
        file_name: &str,
        local_dir: &Path,
        artist: &str,
    ) -> Vec<String> {
        vec![
            "check".to_string(),
            "--one-way".to_string(),
            "--include".to_string(),
            file_name.to_string(),
            local_dir.display().to_string(),
            format!("{}:{}/{}", self.remote, self.video_base, artist),
        ]
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// List immediate subdirectory names under an artist's remote folder.
    pub async fn list_dirs(&self, remote_path: &str) -> Result<Vec<String>> {
        let output = Command::new("rclone")
            .arg("lsf")
            .arg("--dirs-only")
            .arg(remote_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|_| Error::ToolMissing { tool: "rclone" })?;
        if !output.status.success() {
            return Err(Error::tool_failure(
                "rclone",
                output.status.code().unwrap_or(-1),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim_end_matches('/').to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Probe whether a single remote path exists.
    pub async fn exists(&self, remote_path: &str) -> Result<bool> {
        let output = Command::new("rclone")
            .arg("lsf")
            .arg("--max-depth")
            .arg("1")
            .arg(remote_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|_| Error::ToolMissing { tool: "rclone" })?;
        // rclone exits 3 for "directory not found"; other failures are
        // real errors the caller decides how to treat.
        match output.status.code() {
            Some(0) => Ok(true),
            Some(3) => Ok(false),
            code => Err(Error::tool_failure(
                "rclone",
                code.unwrap_or(-1),
                &String::from_utf8_lossy(&output.stderr),
            )),
        }
    }

    /// Upload a release directory, streaming stats into `on_tick`.
    pub async fn upload_dir(
        &self,
        local: &Path,
        artist: &str,
        album: &str,
        on_tick: impl FnMut(UploadTick),
    ) -> Result<()> {
        self.run_with_stats(self.copy_dir_args(local, artist, album), on_tick)
            .await
    }

    /// Upload a single file, streaming stats into `on_tick`.
    pub async fn upload_file(
        &self,
        local: &Path,
        artist: &str,
        file_name: &str,
        on_tick: impl FnMut(UploadTick),
    ) -> Result<()> {
        self.run_with_stats(self.copy_file_args(local, artist, file_name), on_tick)
            .await
    }

    /// Verify a directory upload with a one-way check.
    pub async fn verify_dir(&self, local: &Path, artist: &str, album: &str) -> Result<()> {
        self.run_quiet(self.check_dir_args(local, artist, album)).await
    }

    /// Verify a single-file upload with a one-way check.
    pub async fn verify_file(
        &self,
        file_name: &str,
        local_dir: &Path,
        artist: &str,
    ) -> Result<()> {
        self.run_quiet(self.check_file_args(file_name, local_dir, artist))
            .await
    }

    async fn run_quiet(&self, args: Vec<String>) -> Result<()> {
        debug!("rclone {}", args.join(" "));
        let output = Command::new("rclone")
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|_| Error::ToolMissing { tool: "rclone" })?;
        if !output.status.success() {
            return Err(Error::tool_failure(
                "rclone",
                output.status.code().unwrap_or(-1),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(())
    }

    async fn run_with_stats(
        &self,
        args: Vec<String>,
        mut on_tick: impl FnMut(UploadTick),
    ) -> Result<()> {
        debug!("rclone {}", args.join(" "));
        let mut child = Command::new("rclone")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|_| Error::ToolMissing { tool: "rclone" })?;

        // rclone -P redraws its stats block; read it line-wise and parse
        // whatever looks like a Transferred line.
        let stdout = child.stdout.take().expect("stdout was piped");
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(tick) = parse_stats_line(&line) {
                on_tick(tick);
            }
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::tool_failure(
                "rclone",
                output.status.code().unwrap_or(-1),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(())
    }
}

/// Parse one rclone `-P` stats line.
pub fn parse_stats_line(line: &str) -> Option<UploadTick> {
    // Strip the carriage returns/escape garbage -P interleaves.
    let clean: String = line.chars().filter(|c| !c.is_control()).collect();
    let caps = STATS_RE.captures(&clean)?;

    let transferred = to_bytes(caps[1].parse().ok()?, caps.get(2).map_or("B", |m| m.as_str()));
    let total = to_bytes(caps[3].parse().ok()?, &caps[4]);
    let percent: u32 = caps[5].parse().ok()?;
    let speed = to_bytes_f(caps[6].parse().ok()?, &caps[7]);

    Some(UploadTick {
        transferred,
        total,
        percent,
        speed,
    })
}

fn to_bytes(value: f64, unit: &str) -> u64 {
    to_bytes_f(value, unit) as u64
}

fn to_bytes_f(value: f64, unit: &str) -> f64 {
    let factor = match unit {
        "B" | "" => 1.0,
        "KiB" | "KB" => 1024.0,
        "MiB" | "MB" => 1024.0 * 1024.0,
        "GiB" | "GB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" | "TB" => 1024.0f64.powi(4),
        other => {
            warn!("unknown rclone unit {other:?}");
            1.0
        }
    };
    value * factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn mirror() -> Mirror {
        Mirror::new(&MirrorConfig {
            enabled: true,
            remote: "gdrive".to_string(),
            audio_base: "/Music/Nugs".to_string(),
            video_base: String::new(),
            transfers: 4,
            delete_after_upload: false,
        })
    }

    #[test]
    fn test_copy_dir_command_shape() {
        let args = mirror().copy_dir_args(&PathBuf::from("/tmp/x/album-dir"), "Artist", "album-dir");
        assert_eq!(
            args,
            vec![
                "copy",
                "/tmp/x/album-dir",
                "gdrive:/Music/Nugs/Artist/album-dir",
                "-P",
                "--transfers=4",
            ]
        );
    }

    #[test]
    fn test_copy_file_command_shape() {
        let args = mirror().copy_file_args(&PathBuf::from("/tmp/x/video.mp4"), "Artist", "video.mp4");
        assert_eq!(
            args,
            vec![
                "copyto",
                "/tmp/x/video.mp4",
                "gdrive:/Music/Nugs/Artist/video.mp4",
                "-P",
                "--transfers=4",
            ]
        );
    }

    #[test]
    fn test_check_dir_command_shape() {
        let args = mirror().check_dir_args(&PathBuf::from("/tmp/x/album-dir"), "Artist", "album-dir");
        assert_eq!(
            args,
            vec![
                "check",
                "--one-way",
                "/tmp/x/album-dir",
                "gdrive:/Music/Nugs/Artist/album-dir",
            ]
        );
    }

    #[test]
    fn test_check_file_command_shape() {
        let args = mirror().check_file_args("video.mp4", &PathBuf::from("/tmp/x"), "Artist");
        assert_eq!(
            args,
            vec![
                "check",
                "--one-way",
                "--include",
                "video.mp4",
                "/tmp/x",
                "gdrive:/Music/Nugs/Artist",
            ]
        );
    }

    #[test]
    fn test_transfers_floor_is_one() {
        let m = Mirror::new(&MirrorConfig {
            transfers: 0,
            remote: "r".to_string(),
            ..Default::default()
        });
        let args = m.copy_dir_args(&PathBuf::from("/a"), "b", "c");
        assert!(args.contains(&"--transfers=1".to_string()));
    }

    #[test]
    fn test_video_base_falls_back_to_audio_base() {
        let m = mirror();
        assert_eq!(m.video_remote("Artist"), "gdrive:/Music/Nugs/Artist");
    }

    #[test]
    fn test_parse_stats_line() {
        let line = "Transferred:   \t   12.345 MiB / 100 MiB, 12%, 1.5 MiB/s, ETA 1m2s";
        let tick = parse_stats_line(line).unwrap();
        assert_eq!(tick.total, 100 * 1024 * 1024);
        assert_eq!(tick.percent, 12);
        assert!((tick.speed - 1.5 * 1024.0 * 1024.0).abs() < 1.0);
        assert_eq!(tick.transferred, (12.345 * 1024.0 * 1024.0) as u64);
    }

    #[test]
    fn test_parse_stats_line_ignores_other_lines() {
        assert!(parse_stats_line("Checks:  5 / 5, 100%").is_none());
        assert!(parse_stats_line("Elapsed time: 3.2s").is_none());
        assert!(parse_stats_line("").is_none());
    }

    #[test]
    fn test_parse_stats_line_gib_units() {
        let line = "Transferred:   1.2 GiB / 2.4 GiB, 50%, 25.0 MiB/s, ETA 49s";
        let tick = parse_stats_line(line).unwrap();
        assert_eq!(tick.percent, 50);
        assert_eq!(tick.total, (2.4 * 1024.0 * 1024.0 * 1024.0) as u64);
    }
}
