//! Application context.
//!
//! One [`App`] is built per invocation and passed explicitly into the
//! engine; there is no process-global state beyond the tracing
//! subscriber. Construction authenticates eagerly for commands that need
//! the service and skips it for cache-only ones.

use std::path::PathBuf;

use tracing::{debug, info};

use crate::api::auth::{StreamParams, extract_legacy_claims};
use crate::api::{LegacyClaims, NugsClient};
use crate::catalog::CatalogCache;
use crate::config::{self, Config};
use crate::control::CrawlController;
use crate::error::{Error, Result};
use crate::ffmpeg::Ffmpeg;
use crate::mirror::Mirror;

/// Everything the engine needs, built once at startup.
pub struct App {
    pub config: Config,
    pub client: NugsClient,
    pub cache: CatalogCache,
    pub controller: CrawlController,
    pub ffmpeg: Ffmpeg,
    /// Present only when the mirror is enabled and rclone was found.
    pub mirror: Option<Mirror>,
    /// Populated by [`App::login`].
    pub session: Option<Session>,
}

/// Authenticated session state.
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub legacy: LegacyClaims,
    pub stream_params: StreamParams,
}

impl App {
    /// Build the context without touching the network.
    pub fn new(config: Config) -> Result<Self> {
        let cache_dir = config::cache_dir()
            .ok_or_else(|| Error::config("could not determine cache directory"))?;
        std::fs::create_dir_all(&cache_dir)?;

        let client = NugsClient::new()?;
        let controller = CrawlController::new(&cache_dir);
        let ffmpeg = Ffmpeg::new(config.ffmpeg.binary.clone());
        let mirror = if config.mirror.enabled {
            Some(Mirror::new(&config.mirror))
        } else {
            None
        };

        Ok(Self {
            config,
            client,
            cache: CatalogCache::new(cache_dir),
            controller,
            ffmpeg,
            mirror,
            session: None,
        })
    }

    /// Build with an explicit cache directory (tests).
    pub fn with_cache_dir(config: Config, cache_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        let client = NugsClient::new()?;
        let controller = CrawlController::new(&cache_dir);
        let ffmpeg = Ffmpeg::new(config.ffmpeg.binary.clone());
        let mirror = if config.mirror.enabled {
            Some(Mirror::new(&config.mirror))
        } else {
            None
        };
        Ok(Self {
            config,
            client,
            cache: CatalogCache::new(cache_dir),
            controller,
            ffmpeg,
            mirror,
            session: None,
        })
    }

    /// Authenticate and derive the stream parameters.
    ///
    /// A configured token short-circuits the password grant. Subscription
    /// problems (lapsed, no access) surface here, before any download
    /// starts.
    pub async fn login(&mut self) -> Result<()> {
        let token = if !self.config.auth.token.is_empty() {
            debug!("using configured bearer token");
            self.config.auth.token.clone()
        } else {
            if self.config.auth.email.is_empty() || self.config.auth.password.is_empty() {
                return Err(Error::config(
                    "no credentials: set auth.email/auth.password or auth.token",
                ));
            }
            self.client
                .auth(&self.config.auth.email, &self.config.auth.password)
                .await?
        };

        let legacy = extract_legacy_claims(&token)?;
        let user = self.client.get_user_info(&token).await?;
        let subscription = self.client.get_subscription(&token).await?;
        if !subscription.is_content_accessible {
            return Err(Error::config(
                "subscription does not grant content access",
            ));
        }
        let stream_params = StreamParams::from_subscription(&subscription, &user.sub)?;

        info!(user = %user.sub, "authenticated");
        self.session = Some(Session {
            token,
            user_id: user.sub,
            legacy,
            stream_params,
        });
        Ok(())
    }

    /// The active session, or a config error if `login` never ran.
    pub fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::config("not authenticated"))
    }

    /// Make sure external tools required by this invocation exist.
    pub async fn check_tools(&self, needs_ffmpeg: bool) -> Result<()> {
        if needs_ffmpeg {
            self.ffmpeg.check_available().await?;
        }
        if let Some(mirror) = &self.mirror {
            mirror.check_available().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_app_construction_without_mirror() {
        let temp = tempdir().unwrap();
        let app = App::with_cache_dir(Config::default(), temp.path().to_path_buf()).unwrap();
        assert!(app.mirror.is_none());
        assert!(app.session.is_none());
    }

    #[test]
    fn test_app_construction_with_mirror() {
        let temp = tempdir().unwrap();
        let mut config = Config::default();
        config.mirror.enabled = true;
        config.mirror.remote = "gdrive".to_string();
        let app = App::with_cache_dir(config, temp.path().to_path_buf()).unwrap();
        assert!(app.mirror.is_some());
    }

    #[test]
    fn test_session_before_login_errors() {
        let temp = tempdir().unwrap();
        let app = App::with_cache_dir(Config::default(), temp.path().to_path_buf()).unwrap();
        assert!(app.session().is_err());
    }

    #[tokio::test]
    async fn test_login_requires_credentials() {
        let temp = tempdir().unwrap();
        let mut app = App::with_cache_dir(Config::default(), temp.path().to_path_buf()).unwrap();
        let err = app.login().await.unwrap_err();
        assert!(err.to_string().contains("credentials"));
    }
}
