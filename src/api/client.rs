//! nugs.net HTTP client
//!
//! Thin typed wrapper over the service endpoints. The client performs no
//! retries; transient-failure policy lives with the callers (the artist
//! cache falls back to stale data, the download engine logs and moves on).
//!
//! IMPORTANT: two different User-Agent strings are in play. The identity
//! and subscription endpoints accept the mobile string; the legacy
//! `api.aspx`/`secureApi.aspx` endpoints validate the android-legacy
//! string. Both must be sent bit-exact or the service rejects the call.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::api::auth::StreamParams;
use crate::api::dto;
use crate::error::{Error, Result};

/// Mobile app User-Agent, required by the identity/subscription endpoints.
const USER_AGENT_MOBILE: &str = "NugsNet/3.26.724 (Android; 7.1.2; Asus; ASUS_Z01QD)";
/// Legacy android User-Agent, required by the api.aspx endpoints.
const USER_AGENT_LEGACY: &str = "nugsnetAndroid";

/// OAuth client id; boundary-protocol constant carried verbatim.
const CLIENT_ID: &str = "Eg7HuH873H65r5rt325UytR5429";
/// Developer key sent on legacy stream negotiation; carried verbatim.
const DEV_KEY: &str = "x7f54tgbdyc64y656thy47er4";

const TOKEN_URL: &str = "https://id.nugs.net/connect/token";
const USERINFO_URL: &str = "https://id.nugs.net/connect/userinfo";
const SUBSCRIPTION_URL: &str = "https://subscriptions.nugs.net/api/v1/me/subscriptions";
const API_BASE: &str = "https://streamapi.nugs.net";

/// Page size for artist container pagination.
const ARTIST_PAGE_LIMIT: u32 = 100;

/// nugs.net API client
pub struct NugsClient {
    http: reqwest::Client,
    api_base: String,
    id_base: (String, String, String),
}

impl NugsClient {
    /// Create a new client.
    ///
    /// The cookie store is part of the session contract with the legacy
    /// endpoints, so a client/jar construction failure is a startup error,
    /// not something to paper over.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(Error::Transport)?;

        Ok(Self {
            http,
            api_base: API_BASE.to_string(),
            id_base: (
                TOKEN_URL.to_string(),
                USERINFO_URL.to_string(),
                SUBSCRIPTION_URL.to_string(),
            ),
        })
    }

    /// Create a client pointed at a test server.
    #[cfg(test)]
    pub fn with_base_url(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            http: reqwest::Client::builder()
                .cookie_store(true)
                .build()
                .expect("Failed to build HTTP client"),
            api_base: base.clone(),
            id_base: (
                format!("{base}/connect/token"),
                format!("{base}/connect/userinfo"),
                format!("{base}/subscriptions"),
            ),
        }
    }

    // ============ Identity ============

    /// Exchange email/password for a bearer token.
    pub async fn auth(&self, email: &str, password: &str) -> Result<String> {
        let form = [
            ("client_id", CLIENT_ID),
            ("grant_type", "password"),
            (
                "scope",
                "email profile openid nugsnet:api nugsnet:legacyapi offline_access",
            ),
            ("username", email),
            ("password", password),
        ];
        let response = self
            .http
            .post(&self.id_base.0)
            .header(reqwest::header::USER_AGENT, USER_AGENT_MOBILE)
            .form(&form)
            .send()
            .await?;
        let token: dto::TokenResponse = check(response).await?;
        Ok(token.access_token)
    }

    /// Fetch the authenticated user's subject id.
    pub async fn get_user_info(&self, token: &str) -> Result<dto::UserInfo> {
        let response = self
            .http
            .get(&self.id_base.1)
            .header(reqwest::header::USER_AGENT, USER_AGENT_MOBILE)
            .bearer_auth(token)
            .send()
            .await?;
        check(response).await
    }

    /// Fetch the user's subscription record.
    pub async fn get_subscription(&self, token: &str) -> Result<dto::SubscriptionInfo> {
        let response = self
            .http
            .get(&self.id_base.2)
            .header(reqwest::header::USER_AGENT, USER_AGENT_MOBILE)
            .bearer_auth(token)
            .send()
            .await?;
        check(response).await
    }

    // ============ Catalog ============

    /// Fetch one release's metadata.
    pub async fn get_container_meta(&self, container_id: u64) -> Result<dto::Container> {
        let url = format!(
            "{}/api.aspx?method=catalog.container&containerID={}&vdisp=1",
            self.api_base, container_id
        );
        let envelope: dto::ApiEnvelope<dto::Container> = self.get_legacy(&url).await?;
        Ok(envelope.response)
    }

    /// Fetch an artist's containers, paginated.
    ///
    /// Pagination contract: `limit=100`, `startOffset` begins at 1 and
    /// advances by the returned count; a page with zero containers ends the
    /// walk. The raw pages are returned because the per-artist cache
    /// persists page boundaries as received.
    pub async fn get_artist_meta(&self, artist_id: u64) -> Result<Vec<dto::ContainerPage>> {
        let mut pages = Vec::new();
        let mut offset: u64 = 1;
        loop {
            let url = format!(
                "{}/api.aspx?method=catalog.containersAll&artistList={}&limit={}&startOffset={}&availType=1",
                self.api_base, artist_id, ARTIST_PAGE_LIMIT, offset
            );
            let envelope: dto::ApiEnvelope<dto::ContainerPage> = self.get_legacy(&url).await?;
            let count = envelope.response.containers.len();
            debug!(artist_id, offset, count, "fetched artist page");
            if count == 0 {
                break;
            }
            offset += count as u64;
            pages.push(envelope.response);
        }
        Ok(pages)
    }

    /// Fetch the all-artists directory.
    pub async fn get_artist_list(&self) -> Result<dto::ArtistList> {
        let url = format!("{}/api.aspx?method=catalog.artists", self.api_base);
        let envelope: dto::ApiEnvelope<dto::ArtistList> = self.get_legacy(&url).await?;
        Ok(envelope.response)
    }

    /// Fetch the recent-items catalog used to (re)build the local cache.
    pub async fn get_latest_catalog(&self) -> Result<Vec<dto::Container>> {
        let url = format!(
            "{}/api.aspx?method=catalog.containersAll&limit=20000&startOffset=1&availType=1",
            self.api_base
        );
        let envelope: dto::ApiEnvelope<dto::ContainerPage> = self.get_legacy(&url).await?;
        Ok(envelope.response.containers)
    }

    /// Fetch playlist items; `is_catalog` selects the catalog endpoint over
    /// the user-library one.
    pub async fn get_playlist_meta(
        &self,
        playlist_id: u64,
        email: &str,
        legacy_token: &str,
        is_catalog: bool,
    ) -> Result<dto::Playlist> {
        let method = if is_catalog {
            "catalog.playlist"
        } else {
            "user.playlist"
        };
        let url = format!(
            "{}/api.aspx?method={}&playlistID={}&username={}&token={}",
            self.api_base, method, playlist_id, email, legacy_token
        );
        let envelope: dto::ApiEnvelope<dto::Playlist> = self.get_legacy(&url).await?;
        Ok(envelope.response)
    }

    // ============ Streams ============

    /// Negotiate a stream URL for a track on one platform id.
    ///
    /// The download engine probes platform ids {1,4,7,10} and classifies
    /// whatever URLs come back; a failed probe is simply a missing
    /// candidate, so callers treat errors per-probe.
    pub async fn get_stream_meta(
        &self,
        track_id: u64,
        sku_id: u64,
        platform_id: u32,
        params: &StreamParams,
    ) -> Result<dto::StreamMeta> {
        let url = format!(
            "{}/bigriver/subPlayer.aspx?platformID={}&trackID={}&skuId={}&app=1&\
             subscriptionID={}&subCostplanIDAccessList={}&nn_userID={}&\
             startDateStamp={}&endDateStamp={}&devKey={}",
            self.api_base,
            platform_id,
            track_id,
            sku_id,
            params.subscription_id,
            params.plan_id,
            params.user_id,
            params.start_stamp,
            params.end_stamp,
            DEV_KEY,
        );
        self.get_legacy(&url).await
    }

    /// Fetch the manifest URL for purchased (owned) video content.
    pub async fn get_purchased_manifest_url(
        &self,
        sku_id: u64,
        show_id: u64,
        user_id: &str,
        ugu_id: &str,
    ) -> Result<dto::PurchasedManifest> {
        let url = format!(
            "{}/secureApi.aspx?method=user.downloadManifest&skuID={}&showID={}&\
             nn_userID={}&uguID={}&orgn=nndesktop",
            self.api_base, sku_id, show_id, user_id, ugu_id
        );
        self.get_legacy(&url).await
    }

    /// GET a legacy endpoint with the android User-Agent and decode JSON.
    async fn get_legacy<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT_LEGACY)
            .send()
            .await?;
        check(response).await
    }

    /// Borrow the underlying HTTP client for raw media fetches.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

/// Triage a response: decode JSON on 2xx, surface a typed error otherwise.
async fn check<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::service(status.as_u16(), &body));
    }
    if status == StatusCode::NO_CONTENT {
        return Err(Error::service(status.as_u16(), "empty response"));
    }
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| Error::service(status.as_u16(), &format!("{e}: {body}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = NugsClient::new().unwrap();
        assert_eq!(client.api_base, "https://streamapi.nugs.net");
    }

    #[test]
    fn test_client_with_custom_url() {
        let client = NugsClient::with_base_url("http://localhost:8080");
        assert_eq!(client.api_base, "http://localhost:8080");
        assert_eq!(client.id_base.0, "http://localhost:8080/connect/token");
    }

    #[test]
    fn test_user_agents_are_fixed() {
        // The service validates these strings; they are part of the
        // protocol and must never be derived from the crate version.
        assert_eq!(
            USER_AGENT_MOBILE,
            "NugsNet/3.26.724 (Android; 7.1.2; Asus; ASUS_Z01QD)"
        );
        assert_eq!(USER_AGENT_LEGACY, "nugsnetAndroid");
    }

    #[test]
    fn test_stream_url_shape() {
        // The subPlayer query must carry every stream param plus the dev key.
        let params = StreamParams {
            subscription_id: "sub".into(),
            plan_id: "plan".into(),
            user_id: "user".into(),
            start_stamp: 100,
            end_stamp: 200,
        };
        let url = format!(
            "{}/bigriver/subPlayer.aspx?platformID={}&trackID={}&skuId={}&app=1&\
             subscriptionID={}&subCostplanIDAccessList={}&nn_userID={}&\
             startDateStamp={}&endDateStamp={}&devKey={}",
            "https://streamapi.nugs.net",
            4,
            999,
            0,
            params.subscription_id,
            params.plan_id,
            params.user_id,
            params.start_stamp,
            params.end_stamp,
            DEV_KEY,
        );
        assert!(url.contains("platformID=4"));
        assert!(url.contains("trackID=999"));
        assert!(url.contains("startDateStamp=100"));
        assert!(url.contains("devKey="));
    }
}
