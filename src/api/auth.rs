//! Token plumbing: JWT payload extraction and subscription stream params.
//!
//! The bearer token issued by the identity service is a JWT whose payload
//! carries the legacy API token and uguid the older endpoints still
//! require. We never verify the signature - the token is ours, we only
//! need to read two claims out of the middle segment.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Claims we extract from the bearer JWT payload.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyClaims {
    #[serde(default)]
    pub legacy_token: String,
    #[serde(default)]
    pub legacy_uguid: String,
}

/// Decode the payload segment of a JWT and pull out the legacy claims.
pub fn extract_legacy_claims(bearer: &str) -> Result<LegacyClaims> {
    let payload = bearer
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::config("bearer token is not a JWT"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::config(format!("bad JWT payload encoding: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::config(format!("bad JWT payload JSON: {e}")))
}

/// Parameters carried on every stream-negotiation call.
///
/// Timestamps are POSIX seconds derived from the subscription record's
/// "01/02/2006 15:04:05" strings.
#[derive(Debug, Clone, Default)]
pub struct StreamParams {
    pub subscription_id: String,
    /// Promo plan id when the subscription is promotional, else the
    /// regular plan id.
    pub plan_id: String,
    pub user_id: String,
    pub start_stamp: i64,
    pub end_stamp: i64,
}

/// Parse a subscription timestamp ("01/02/2006 15:04:05", month first)
/// into POSIX seconds.
pub fn parse_sub_stamp(s: &str) -> Result<i64> {
    let dt = NaiveDateTime::parse_from_str(s, "%m/%d/%Y %H:%M:%S")
        .map_err(|e| Error::config(format!("bad subscription timestamp {s:?}: {e}")))?;
    Ok(dt.and_utc().timestamp())
}

impl StreamParams {
    /// Build stream params from the subscription record and user id.
    pub fn from_subscription(
        sub: &crate::api::dto::SubscriptionInfo,
        user_id: &str,
    ) -> Result<Self> {
        // Promotional subscriptions gate access on the promo plan id.
        let plan_id = sub
            .promo
            .as_ref()
            .and_then(|p| p.plan.as_ref())
            .or(sub.plan.as_ref())
            .map(|p| p.plan_id.clone())
            .unwrap_or_default();

        Ok(Self {
            subscription_id: sub.legacy_subscription_id.clone(),
            plan_id,
            user_id: user_id.to_string(),
            start_stamp: parse_sub_stamp(&sub.start_stamp)?,
            end_stamp: parse_sub_stamp(&sub.end_stamp)?,
        })
    }
}
