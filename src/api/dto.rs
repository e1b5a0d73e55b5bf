//! nugs.net API Data Transfer Objects
//!
//! These types match EXACTLY what the service returns.
//! DO NOT add fields that aren't in the API response.
//! DO NOT use these types outside the api/catalog/download modules -
//! they ARE the persisted cache format, so field names are load-bearing.

use serde::{Deserialize, Serialize};

/// Envelope most `api.aspx` methods wrap their payload in.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiEnvelope<T> {
    #[serde(rename = "methodName", default)]
    pub method_name: String,
    #[serde(rename = "responseAvailabilityCode", default)]
    pub availability_code: i32,
    #[serde(rename = "Response")]
    pub response: T,
}

/// Token endpoint response (OAuth password grant).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub token_type: String,
}

/// `connect/userinfo` response; only the subject id matters.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub sub: String,
}

/// Subscription record.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub legacy_subscription_id: String,
    /// Regular plan
    pub plan: Option<SubscriptionPlan>,
    /// Promotional plan; takes precedence for the access-list id
    pub promo: Option<PromoInfo>,
    /// "01/02/2006 15:04:05"
    #[serde(default)]
    pub start_stamp: String,
    /// Same format as `start_stamp`
    #[serde(default)]
    pub end_stamp: String,
    #[serde(default)]
    pub is_content_accessible: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPlan {
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoInfo {
    pub plan: Option<SubscriptionPlan>,
}

/// A release: the service's unit of distribution (album, show, video).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    #[serde(rename = "containerID", default)]
    pub container_id: u64,
    #[serde(rename = "artistID", default)]
    pub artist_id: u64,
    #[serde(default)]
    pub artist_name: String,
    /// Free-form title, e.g. "2024-01-01 The Venue, City, ST"
    #[serde(default)]
    pub container_info: String,
    #[serde(default)]
    pub venue_name: String,
    #[serde(default)]
    pub venue_city: String,
    #[serde(default)]
    pub venue_state: String,
    /// Either "24/01/01" or "Jan 02, 2006"
    #[serde(default)]
    pub performance_date: String,
    #[serde(default)]
    pub availability_type: String,
    #[serde(default)]
    pub container_type: String,
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub live_stream_products: Vec<Product>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

/// Track within a container.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    #[serde(rename = "trackID", default)]
    pub track_id: u64,
    #[serde(default)]
    pub track_num: u32,
    #[serde(default)]
    pub song_title: String,
}

/// Purchasable format attached to a container.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(rename = "skuID", default)]
    pub sku_id: u64,
    /// e.g. "VIDEO ON DEMAND", "LIVE HD VIDEO", "FLAC"
    #[serde(default)]
    pub format_str: String,
}

/// Chapter marker inside a video container.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    #[serde(default)]
    pub chapter_seconds: f64,
    #[serde(default)]
    pub chapter_name: String,
}

/// One page of an artist's container list.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPage {
    #[serde(default)]
    pub containers: Vec<Container>,
}

/// Directory entry from the all-artists listing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtistEntry {
    #[serde(rename = "artistID", default)]
    pub artist_id: u64,
    #[serde(default)]
    pub artist_name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtistList {
    #[serde(default)]
    pub artists: Vec<ArtistEntry>,
}

/// Playlist metadata (catalog or user playlists).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    #[serde(rename = "playlistID", default)]
    pub playlist_id: u64,
    #[serde(default)]
    pub playlist_name: String,
    #[serde(default)]
    pub items: Vec<PlaylistItem>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItem {
    #[serde(rename = "trackID", default)]
    pub track_id: u64,
    #[serde(rename = "containerID", default)]
    pub container_id: u64,
    #[serde(default)]
    pub song_title: String,
    #[serde(default)]
    pub artist_name: String,
}

/// Stream URL negotiation response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMeta {
    #[serde(default)]
    pub stream_link: String,
}

/// Purchased-content manifest response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchasedManifest {
    #[serde(default)]
    pub file_url: String,
}

// ============================================================================
// CONTRACT TESTS
// These verify our DTOs match what the real API returns.
// If these fail, the API has changed and we need to update our DTOs.
// ============================================================================
