//! FFmpeg subprocess wrapper.
//!
//! Three invocations, all with a defined command shape:
//!
//! - duration probe: `ffmpeg -hide_banner -i <ts>` with no output file.
//!   ffmpeg exits 1 and prints `Duration: H:MM:SS.cc` on stderr; that
//!   exit code is the expected path, not a failure.
//! - remux: `ffmpeg -hide_banner -i <ts> [-f ffmetadata -i <chapters>
//!   -map_metadata 1] -c copy <out.mp4>`
//! - HLS audio: `ffmpeg -i pipe: -c:a copy <out.m4a>` fed the decrypted
//!   transport stream on stdin.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::api::dto::Chapter;
use crate::error::{Error, Result};

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Duration:\s+(\d+):(\d{2}):(\d{2})\.(\d+)").expect("valid regex"));

/// FFmpeg invoker bound to a configured binary name/path.
pub struct Ffmpeg {
    binary: String,
}

impl Ffmpeg {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Verify the binary is runnable.
    pub async fn check_available(&self) -> Result<()> {
        let result = Command::new(&self.binary)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => Ok(()),
            Ok(_) | Err(_) => Err(Error::ToolMissing { tool: "ffmpeg" }),
        }
    }

    /// Probe a media file's duration in seconds.
    ///
    /// ffmpeg exits non-zero because no output file is given; the call
    /// only fails when the duration line is absent from stderr.
    pub async fn probe_duration(&self, input: &Path) -> Result<f64> {
        let output = Command::new(&self.binary)
            .arg("-hide_banner")
            .arg("-i")
            .arg(input)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|_| Error::ToolMissing { tool: "ffmpeg" })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        parse_duration(&stderr).ok_or_else(|| {
            Error::tool_failure("ffmpeg", output.status.code().unwrap_or(-1), &stderr)
        })
    }

    /// Remux a transport stream into MP4, optionally mapping in a chapter
    /// metadata file. Streams are copied, never re-encoded.
    pub async fn remux_to_mp4(
        &self,
        ts: &Path,
        chapters: Option<&Path>,
        out: &Path,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-hide_banner").arg("-y").arg("-i").arg(ts);
        if let Some(chapters) = chapters {
            cmd.arg("-f")
                .arg("ffmetadata")
                .arg("-i")
                .arg(chapters)
                .arg("-map_metadata")
                .arg("1");
        }
        cmd.arg("-c").arg("copy").arg(out);
        debug!("remuxing {} -> {}", ts.display(), out.display());
        run_checked(cmd, "ffmpeg").await
    }

    /// Copy an AAC elementary/transport stream from stdin into an `.m4a`.
    pub async fn pipe_to_m4a(&self, data: &[u8], out: &Path) -> Result<()> {
        let mut child = Command::new(&self.binary)
            .arg("-hide_banner")
            .arg("-y")
            .arg("-i")
            .arg("pipe:")
            .arg("-c:a")
            .arg("copy")
            .arg(out)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|_| Error::ToolMissing { tool: "ffmpeg" })?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin.write_all(data).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::tool_failure(
                "ffmpeg",
                output.status.code().unwrap_or(-1),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        Ok(())
    }
}

async fn run_checked(mut cmd: Command, tool: &'static str) -> Result<()> {
    let output = cmd
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|_| Error::ToolMissing { tool })?;
    if !output.status.success() {
        return Err(Error::tool_failure(
            tool,
            output.status.code().unwrap_or(-1),
            &String::from_utf8_lossy(&output.stderr),
        ));
    }
    Ok(())
}

/// Pull `Duration: H:MM:SS.cc` out of ffmpeg's stderr chatter.
pub fn parse_duration(stderr: &str) -> Option<f64> {
    let caps = DURATION_RE.captures(stderr)?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    let frac_digits = caps[4].len() as i32;
    let frac: f64 = caps[4].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds + frac / 10f64.powi(frac_digits))
}

// ============================================================================
// Chapter metadata
// ============================================================================

/// Build an ffmetadata document for a chapter list.
///
/// Each chapter ends one second before the next starts; the last runs to
/// the probed total duration. Chapters whose successor starts at or
/// before them are dropped (bad metadata happens).
pub fn build_chapters_metadata(chapters: &[Chapter], total_duration: f64) -> String {
    let mut doc = String::from(";FFMETADATA1\n");

    for (i, chapter) in chapters.iter().enumerate() {
        let start = chapter.chapter_seconds.round() as i64;
        let end = match chapters.get(i + 1) {
            Some(next) => {
                if next.chapter_seconds <= chapter.chapter_seconds {
                    continue;
                }
                next.chapter_seconds.round() as i64 - 1
            }
            None => total_duration.round() as i64,
        };
        if end <= start {
            continue;
        }
        doc.push_str("[CHAPTER]\nTIMEBASE=1/1\n");
        doc.push_str(&format!("START={start}\n"));
        doc.push_str(&format!("END={end}\n"));
        doc.push_str(&format!("title={}\n", escape_metadata(&chapter.chapter_name)));
    }
    doc
}

/// Escape the characters ffmetadata treats specially.
fn escape_metadata(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '=' | ';' | '#' | '\\' | '\n' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(seconds: f64, name: &str) -> Chapter {
        Chapter {
            chapter_seconds: seconds,
            chapter_name: name.to_string(),
        }
    }

    #[test]
    fn test_parse_duration_typical_stderr() {
        let stderr = "Input #0, mpegts, from 'show.ts':\n  \
                      Duration: 01:23:45.67, start: 1.400000, bitrate: 5000 kb/s\n";
        let d = parse_duration(stderr).unwrap();
        assert!((d - (3600.0 + 23.0 * 60.0 + 45.67)).abs() < 0.001);
    }

    #[test]
    fn test_parse_duration_absent() {
        assert!(parse_duration("ffmpeg: nothing useful here").is_none());
    }

    #[test]
    fn test_chapters_metadata_basic() {
        let chapters = vec![
            chapter(0.0, "Intro"),
            chapter(312.4, "Set One"),
            chapter(3600.0, "Encore"),
        ];
        let doc = build_chapters_metadata(&chapters, 4000.0);

        assert!(doc.starts_with(";FFMETADATA1\n"));
        // First chapter ends one second before the second starts (rounded).
        assert!(doc.contains("START=0\nEND=311\ntitle=Intro"));
        assert!(doc.contains("START=312\nEND=3599\ntitle=Set One"));
        // Last chapter runs to the probed duration.
        assert!(doc.contains("START=3600\nEND=4000\ntitle=Encore"));
        assert_eq!(doc.matches("[CHAPTER]").count(), 3);
        assert_eq!(doc.matches("TIMEBASE=1/1").count(), 3);
    }

    #[test]
    fn test_chapters_metadata_skips_non_monotonic() {
        let chapters = vec![
            chapter(100.0, "Good"),
            chapter(50.0, "Out of order"),
            chapter(100.0, "Duplicate start"),
        ];
        // "Good" is skipped because its successor starts before it;
        // "Out of order" ends at 99 (duplicate start -1 ... ) etc.
        let doc = build_chapters_metadata(&chapters, 200.0);
        assert!(!doc.contains("title=Good"));
        assert!(doc.contains("title=Duplicate start"));
    }

    #[test]
    fn test_chapters_metadata_drops_zero_length() {
        // Successor one second later: end = start, dropped.
        let chapters = vec![chapter(10.0, "Blink"), chapter(11.0, "Next")];
        let doc = build_chapters_metadata(&chapters, 100.0);
        assert!(!doc.contains("title=Blink"));
        assert!(doc.contains("title=Next"));
    }

    #[test]
    fn test_escape_metadata() {
        assert_eq!(escape_metadata("a=b;c#d\\e"), "a\\=b\\;c\\#d\\\\e");
        assert_eq!(escape_metadata("plain title"), "plain title");
    }
}
