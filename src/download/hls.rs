//! HLS-only audio fetch with AES-128-CBC decryption.
//!
//! Some releases are only offered as an HLS master playlist. The track
//! is then a single encrypted transport-stream segment: fetch the media
//! playlist, pull the 16-byte key and the hex IV, decrypt, and hand the
//! plaintext to ffmpeg for a copy-remux into `.m4a`. Only AAC comes out
//! of this path and no tags are written.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use aes::Aes128;
use aes::cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding};
use tracing::{debug, info};

use crate::app::App;
use crate::error::{Error, Result};
use crate::progress::render;
use crate::progress::{MessagePriority, ProgressBox};

use super::quality::parse_hls_bitrate;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

const AES_BLOCK: usize = 16;

/// Name of the intermediate encrypted segment next to the output file.
const TEMP_ENC_NAME: &str = "temp_enc.ts";

/// Pick the best variant from a master playlist URL.
///
/// Variants are sorted by descending bandwidth and the top one wins; the
/// display specs are derived from the bitrate encoded in the media URL.
pub async fn resolve_master(app: &App, master_url: &str) -> Result<(String, String)> {
    let body = fetch_text(app, master_url).await?;
    let master = match m3u8_rs::parse_playlist_res(body.as_bytes()) {
        Ok(m3u8_rs::Playlist::MasterPlaylist(m)) => m,
        Ok(m3u8_rs::Playlist::MediaPlaylist(_)) => {
            // Already a media playlist; nothing to pick.
            return Ok((master_url.to_string(), "AAC".to_string()));
        }
        Err(e) => return Err(Error::decrypt(format!("unparseable master playlist: {e}"))),
    };

    let mut variants = master.variants;
    if variants.is_empty() {
        return Err(Error::decrypt("master playlist has no variants"));
    }
    variants.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));
    let top = &variants[0];

    let media_url = absolute_url(master_url, &top.uri)?;
    let specs = match parse_hls_bitrate(&media_url) {
        Some(kbps) => format!("{kbps} Kbps AAC"),
        None => format!("{} Kbps AAC", top.bandwidth / 1000),
    };
    debug!(bandwidth = top.bandwidth, specs = %specs, "picked HLS variant");
    Ok((media_url, specs))
}

/// Download an HLS-only track: playlist, key, IV, segment, decrypt, remux.
pub async fn download_hls_track(
    app: &App,
    pb: &Arc<ProgressBox>,
    placeholder_url: &str,
    out: &Path,
) -> Result<u64> {
    let (media_url, specs) = resolve_master(app, placeholder_url).await?;
    pb.update_message(
        MessagePriority::Status,
        &format!("HLS-only release: {specs}"),
        Duration::from_secs(5),
    );
    render::render(pb);

    let body = fetch_text(app, &media_url).await?;
    let media = match m3u8_rs::parse_playlist_res(body.as_bytes()) {
        Ok(m3u8_rs::Playlist::MediaPlaylist(m)) => m,
        Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => {
            return Err(Error::decrypt("expected media playlist, got master"));
        }
        Err(e) => return Err(Error::decrypt(format!("unparseable media playlist: {e}"))),
    };

    let segment = media
        .segments
        .first()
        .ok_or_else(|| Error::decrypt("media playlist has no segments"))?;
    let key_info = segment
        .key
        .as_ref()
        .ok_or_else(|| Error::decrypt("segment carries no encryption key"))?;
    let key_url = key_info
        .uri
        .as_ref()
        .ok_or_else(|| Error::decrypt("key has no URI"))?;
    let iv = parse_iv(key_info.iv.as_deref())?;

    let key_bytes = fetch_bytes(app, &absolute_url(&media_url, key_url)?).await?;
    if key_bytes.len() != AES_BLOCK {
        return Err(Error::decrypt(format!(
            "expected a 16-byte key, got {}",
            key_bytes.len()
        )));
    }

    // Fetch the encrypted segment to a temp file beside the output.
    let temp = out
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(TEMP_ENC_NAME);
    let segment_url = absolute_url(&media_url, &segment.uri)?;
    let encrypted = fetch_bytes(app, &segment_url).await?;
    std::fs::write(&temp, &encrypted)?;

    let plaintext = decrypt_segment(&encrypted, &key_bytes, &iv)?;
    app.ffmpeg.pipe_to_m4a(&plaintext, out).await?;

    std::fs::remove_file(&temp)?;
    info!(out = %out.display(), bytes = plaintext.len(), "HLS track decrypted");
    Ok(plaintext.len() as u64)
}

/// AES-128-CBC decrypt a whole segment, then strip PKCS#5 padding.
pub fn decrypt_segment(data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % AES_BLOCK != 0 {
        return Err(Error::decrypt(format!(
            "ciphertext length {} is not a positive multiple of {AES_BLOCK}",
            data.len()
        )));
    }
    let decryptor = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| Error::decrypt(format!("bad key/IV: {e}")))?;

    let mut buf = data.to_vec();
    let decrypted = decryptor
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|e| Error::decrypt(format!("block decrypt failed: {e}")))?
        .to_vec();
    pkcs5_unpad(decrypted)
}

/// Remove PKCS#5 trailing padding with full validation.
///
/// Rejects: empty buffers, a padding value of zero or larger than
/// min(len, block size), and padding bytes that disagree with the
/// padding length.
fn pkcs5_unpad(mut data: Vec<u8>) -> Result<Vec<u8>> {
    let Some(&last) = data.last() else {
        return Err(Error::decrypt("cannot unpad an empty buffer"));
    };
    let pad = last as usize;
    if pad == 0 || pad > AES_BLOCK || pad > data.len() {
        return Err(Error::decrypt(format!("invalid padding value {pad}")));
    }
    let body = data.len() - pad;
    if data[body..].iter().any(|&b| b as usize != pad) {
        return Err(Error::decrypt("inconsistent padding bytes"));
    }
    data.truncate(body);
    Ok(data)
}

/// Parse an EXT-X-KEY IV attribute ("0x0102...0f10") into 16 bytes.
fn parse_iv(iv: Option<&str>) -> Result<Vec<u8>> {
    let iv = iv.ok_or_else(|| Error::decrypt("key has no IV"))?;
    let hex_str = iv.strip_prefix("0x").or_else(|| iv.strip_prefix("0X")).unwrap_or(iv);
    let bytes = hex::decode(hex_str).map_err(|e| Error::decrypt(format!("bad IV hex: {e}")))?;
    if bytes.len() != AES_BLOCK {
        return Err(Error::decrypt(format!(
            "expected a 16-byte IV, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Resolve a possibly-relative playlist URI against its playlist's URL.
pub fn absolute_url(base: &str, uri: &str) -> Result<String> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(uri.to_string());
    }
    let parsed = reqwest::Url::parse(base)
        .and_then(|b| b.join(uri))
        .map_err(|e| Error::decrypt(format!("cannot resolve {uri:?} against {base:?}: {e}")))?;
    Ok(parsed.to_string())
}

pub(super) async fn fetch_text(app: &App, url: &str) -> Result<String> {
    let response = app.client.http().get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::service(status.as_u16(), "playlist fetch rejected"));
    }
    Ok(response.text().await?)
}

async fn fetch_bytes(app: &App, url: &str) -> Result<Vec<u8>> {
    let response = app.client.http().get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::service(status.as_u16(), "fetch rejected"));
    }
    Ok(response.bytes().await?.to_vec())
}
