//! Stream quality classification and format fallback.
//!
//! The service encodes the delivered quality in the stream URL path. A
//! URL is classified against an ordered substring table; ordering is
//! load-bearing because MQA streams are delivered as `.mqa24 ... .flac`
//! URLs and must not be mistaken for plain FLAC.
//!
//! Format selection walks a fallback chain from the user's desired format
//! until a probed candidate matches.

use std::sync::LazyLock;

use regex::Regex;

/// Audio delivery formats, in the service's numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AudioFormat {
    Alac = 1,
    Flac = 2,
    Mqa = 3,
    Sony360 = 4,
    Aac = 5,
    /// The release is only available as an HLS playlist; quality is
    /// negotiated from the master playlist instead of the URL path.
    HlsOnly = 6,
}

impl AudioFormat {
    /// The config-facing format number (1-5; HLS is never user-selected).
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Alac),
            2 => Some(Self::Flac),
            3 => Some(Self::Mqa),
            4 => Some(Self::Sony360),
            5 => Some(Self::Aac),
            6 => Some(Self::HlsOnly),
            _ => None,
        }
    }
}

/// A classified stream candidate.
#[derive(Debug, Clone)]
pub struct Quality {
    pub format: AudioFormat,
    /// Human-readable specs, e.g. "16-bit / 44.1 kHz FLAC"
    pub specs: String,
    /// Output file extension including the dot
    pub extension: &'static str,
    pub url: String,
}

/// Ordered (substring, format, specs, extension) table.
///
/// `.mqa24/` MUST come before the loose `.flac` fallback entry: an MQA
/// URL contains both markers and the first hit wins.
const QUALITY_TABLE: &[(&str, AudioFormat, &str, &str)] = &[
    (".alac16/", AudioFormat::Alac, "16-bit / 44.1 kHz ALAC", ".m4a"),
    (".mqa24/", AudioFormat::Mqa, "24-bit / 48 kHz MQA", ".flac"),
    (".flac16/", AudioFormat::Flac, "16-bit / 44.1 kHz FLAC", ".flac"),
    (".flac?", AudioFormat::Flac, "16-bit / 44.1 kHz FLAC", ".flac"),
    (".s360/", AudioFormat::Sony360, "360 Reality Audio", ".mp4"),
    (".aac150/", AudioFormat::Aac, "150 Kbps AAC", ".m4a"),
    (".m3u8?", AudioFormat::HlsOnly, "HLS", ".m4a"),
];

/// Classify a stream URL against the quality table.
///
/// Returns `None` for URLs matching no known marker; the caller treats
/// that probe as a missing candidate.
pub fn classify_url(url: &str) -> Option<Quality> {
    for (marker, format, specs, extension) in QUALITY_TABLE {
        if url.contains(marker) {
            return Some(Quality {
                format: *format,
                specs: (*specs).to_string(),
                extension,
                url: url.to_string(),
            });
        }
    }
    None
}

/// One fallback step: the next format to try when `from` has no candidate.
///
/// `Sony360` doubles as the "best available" sentinel: its chain walks
/// down through MQA and FLAC to AAC.
pub fn fallback_step(from: AudioFormat) -> Option<AudioFormat> {
    match from {
        AudioFormat::Alac => Some(AudioFormat::Flac),
        AudioFormat::Flac => Some(AudioFormat::Aac),
        AudioFormat::Mqa => Some(AudioFormat::Flac),
        AudioFormat::Sony360 => Some(AudioFormat::Mqa),
        AudioFormat::Aac => None,
        AudioFormat::HlsOnly => None,
    }
}

/// Outcome of selecting a candidate for a desired format.
#[derive(Debug)]
pub struct Selection {
    pub quality: Quality,
    /// True when the desired format was unavailable and a fallback fired.
    /// The engine shows an info message unless the desired format was the
    /// "best available" sentinel (360RA).
    pub fell_back: bool,
}

/// Pick a candidate matching `desired`, walking the fallback chain.
pub fn select(candidates: &[Quality], desired: AudioFormat) -> Option<Selection> {
    let mut wanted = desired;
    let mut fell_back = false;
    loop {
        if let Some(q) = candidates.iter().find(|c| c.format == wanted) {
            return Some(Selection {
                quality: q.clone(),
                fell_back,
            });
        }
        wanted = fallback_step(wanted)?;
        fell_back = true;
    }
}

/// True when every candidate is the HLS placeholder, which switches the
/// track into HLS-only mode.
pub fn is_hls_only(candidates: &[Quality]) -> bool {
    !candidates.is_empty()
        && candidates
            .iter()
            .all(|c| c.format == AudioFormat::HlsOnly)
}

static HLS_BITRATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[./_])(\d{2,4})k?[./_]").expect("valid regex"));

/// Parse the bitrate out of an HLS media-playlist URL (e.g. `.../aac_160k/...`).
pub fn parse_hls_bitrate(url: &str) -> Option<u32> {
    HLS_BITRATE_RE
        .captures(url)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

// ============================================================================
// Media-kind URL classification
// ============================================================================

/// What kind of thing a user-supplied service URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Album,
    PlaylistUser,
    PlaylistLibrary,
    PlaylistCatalog,
    Video,
    Artist,
    LivestreamA,
    LivestreamB,
    LivestreamC,
    PurchasedLivestream,
    VideoAlt,
    Release,
}

static URL_PATTERNS: LazyLock<Vec<(Regex, MediaKind)>> = LazyLock::new(|| {
    // Order matters: more specific paths first.
    [
        (r"/watch/livestream/exclusive/(\d+)", MediaKind::LivestreamA),
        (r"/watch/livestream/(\d+)", MediaKind::LivestreamB),
        (r"/purchased/livestream/(\d+)", MediaKind::PurchasedLivestream),
        (r"/livestream/(\d+)", MediaKind::LivestreamC),
        (r"/playlist/mine/(\d+)", MediaKind::PlaylistUser),
        (r"/playlist/library/(\d+)", MediaKind::PlaylistLibrary),
        (r"/playlist/(\d+)", MediaKind::PlaylistCatalog),
        (r"/exclusive-video/(\d+)", MediaKind::VideoAlt),
        (r"/video/(\d+)", MediaKind::Video),
        (r"/artist/(\d+)", MediaKind::Artist),
        (r"/album/(\d+)", MediaKind::Album),
        (r"/release/(\d+)", MediaKind::Release),
    ]
    .into_iter()
    .map(|(pat, kind)| (Regex::new(pat).expect("valid regex"), kind))
    .collect()
});

/// Classify a pasted service URL into a media kind and its numeric id.
pub fn classify_media_url(url: &str) -> Option<(MediaKind, u64)> {
    for (re, kind) in URL_PATTERNS.iter() {
        if let Some(caps) = re.captures(url) {
            if let Ok(id) = caps[1].parse() {
                return Some((*kind, id));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_each_marker() {
        let cases = [
            ("https://cdn/x.alac16/t.m4a", AudioFormat::Alac, ".m4a"),
            ("https://cdn/x.flac16/t.flac", AudioFormat::Flac, ".flac"),
            ("https://cdn/x.mqa24/t.flac", AudioFormat::Mqa, ".flac"),
            ("https://cdn/x.s360/t.mp4", AudioFormat::Sony360, ".mp4"),
            ("https://cdn/x.aac150/t.m4a", AudioFormat::Aac, ".m4a"),
            ("https://cdn/playlist.m3u8?tok=1", AudioFormat::HlsOnly, ".m4a"),
        ];
        for (url, format, ext) in cases {
            let q = classify_url(url).unwrap_or_else(|| panic!("no match for {url}"));
            assert_eq!(q.format, format, "for {url}");
            assert_eq!(q.extension, ext, "for {url}");
        }
    }

    #[test]
    fn test_mqa_wins_over_loose_flac() {
        // An MQA URL also contains ".flac?"; the MQA row is earlier.
        let q = classify_url("https://cdn/show.mqa24/track.flac?tok").unwrap();
        assert_eq!(q.format, AudioFormat::Mqa);
    }

    #[test]
    fn test_mqa_wins_when_both_markers_present() {
        let q = classify_url("https://cdn/a.mqa24/b.flac16/t.flac").unwrap();
        assert_eq!(q.format, AudioFormat::Mqa);
    }

    #[test]
    fn test_unknown_url_is_none() {
        assert!(classify_url("https://cdn/plain/file.mp3").is_none());
    }

    #[test]
    fn test_select_exact_match_no_fallback() {
        let candidates = vec![
            classify_url("https://c/x.flac16/t.flac").unwrap(),
            classify_url("https://c/x.aac150/t.m4a").unwrap(),
        ];
        let sel = select(&candidates, AudioFormat::Flac).unwrap();
        assert_eq!(sel.quality.format, AudioFormat::Flac);
        assert!(!sel.fell_back);
    }

    #[test]
    fn test_select_alac_falls_to_flac_then_aac() {
        let candidates = vec![classify_url("https://c/x.aac150/t.m4a").unwrap()];
        let sel = select(&candidates, AudioFormat::Alac).unwrap();
        assert_eq!(sel.quality.format, AudioFormat::Aac);
        assert!(sel.fell_back);
    }

    #[test]
    fn test_select_mqa_falls_to_flac() {
        let candidates = vec![classify_url("https://c/x.flac16/t.flac").unwrap()];
        let sel = select(&candidates, AudioFormat::Mqa).unwrap();
        assert_eq!(sel.quality.format, AudioFormat::Flac);
        assert!(sel.fell_back);
    }

    #[test]
    fn test_select_none_when_chain_exhausted() {
        let candidates = vec![classify_url("https://c/x.alac16/t.m4a").unwrap()];
        // Desired AAC has no fallback and no AAC candidate exists.
        assert!(select(&candidates, AudioFormat::Aac).is_none());
    }

    #[test]
    fn test_is_hls_only() {
        let hls = vec![classify_url("https://c/p.m3u8?a=1").unwrap()];
        assert!(is_hls_only(&hls));

        let mixed = vec![
            classify_url("https://c/p.m3u8?a=1").unwrap(),
            classify_url("https://c/x.flac16/t.flac").unwrap(),
        ];
        assert!(!is_hls_only(&mixed));
        assert!(!is_hls_only(&[]));
    }

    #[test]
    fn test_parse_hls_bitrate() {
        assert_eq!(parse_hls_bitrate("https://c/aac_160k/chunk.m3u8"), Some(160));
        assert_eq!(parse_hls_bitrate("https://c/stream.256.m3u8"), Some(256));
        assert_eq!(parse_hls_bitrate("https://c/master.m3u8"), None);
    }

    #[test]
    fn test_classify_media_urls() {
        let cases = [
            ("https://play.nugs.net/release/23329", MediaKind::Release, 23329),
            ("https://play.nugs.net/artist/1125", MediaKind::Artist, 1125),
            ("https://play.nugs.net/watch/livestream/exclusive/30478", MediaKind::LivestreamA, 30478),
            ("https://play.nugs.net/watch/livestream/30479", MediaKind::LivestreamB, 30479),
            ("https://play.nugs.net/purchased/livestream/555", MediaKind::PurchasedLivestream, 555),
            ("https://play.nugs.net/livestream/556", MediaKind::LivestreamC, 556),
            ("https://play.nugs.net/playlist/mine/88", MediaKind::PlaylistUser, 88),
            ("https://play.nugs.net/playlist/12", MediaKind::PlaylistCatalog, 12),
            ("https://play.nugs.net/video/456", MediaKind::Video, 456),
        ];
        for (url, kind, id) in cases {
            assert_eq!(classify_media_url(url), Some((kind, id)), "for {url}");
        }
        assert_eq!(classify_media_url("https://example.com/nothing"), None);
    }
}

/// Property-based tests using proptest
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// The fallback chain always terminates within the format count.
        #[test]
        fn fallback_terminates(id in 1u8..=5) {
            let mut format = AudioFormat::from_id(id).unwrap();
            let mut steps = 0;
            while let Some(next) = fallback_step(format) {
                format = next;
                steps += 1;
                prop_assert!(steps <= 10, "fallback chain did not terminate");
            }
        }

        /// Classification is deterministic and stable: re-classifying the
        /// classified URL yields the same format.
        #[test]
        fn classification_is_stable(
            prefix in "[a-z]{1,10}",
            marker_idx in 0usize..7,
        ) {
            let markers = [".alac16/", ".mqa24/", ".flac16/", ".flac?", ".s360/", ".aac150/", ".m3u8?"];
            let url = format!("https://cdn/{}{}track", prefix, markers[marker_idx]);
            if let Some(first) = classify_url(&url) {
                let second = classify_url(&first.url).unwrap();
                prop_assert_eq!(first.format, second.format);
            }
        }

        /// A URL containing the MQA marker never classifies as plain FLAC,
        /// regardless of what else the URL contains.
        #[test]
        fn mqa_priority(suffix in "[a-z0-9./?=_-]{0,30}") {
            let url = format!("https://cdn/show.mqa24/track{suffix}");
            let q = classify_url(&url).unwrap();
            prop_assert_eq!(q.format, AudioFormat::Mqa);
        }
    }
}
