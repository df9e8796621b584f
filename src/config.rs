//! Configuration for the SmartMark client

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_SITE_URL: &str = "http://localhost:3000";
pub const DEFAULT_DATA_DIR: &str = ".smartmark";
/// Path the identity provider redirects back to after Google sign-in.
pub const CALLBACK_PATH: &str = "/auth/callback";
pub const SESSION_FILE: &str = "session.json";
pub const PREFERENCES_FILE: &str = "preferences.json";

/// Project endpoints, local storage location and timing knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Supabase project URL
    pub supabase_url: Url,

    /// The anonymous API key for the project
    pub anon_key: String,

    /// Origin the OAuth callback is served from
    pub site_url: Url,

    /// Directory holding `session.json` and `preferences.json`
    pub data_dir: PathBuf,

    /// HTTP request timeout
    pub request_timeout: Duration,

    /// Tokens expiring within this margin are refreshed before use
    pub refresh_margin: Duration,

    /// Realtime heartbeat interval
    pub heartbeat_interval: Duration,

    /// First wait before resubscribing a dropped change feed; doubles per failed attempt
    pub reconnect_delay: Duration,
}

impl Config {
    /// Creates a configuration, validating the project URL and key.
    pub fn new(supabase_url: &str, anon_key: &str) -> Result<Self> {
        let supabase_url = Url::parse(supabase_url)?;
        if anon_key.trim().is_empty() {
            return Err(Error::config("anon_key cannot be empty"));
        }
        Ok(Self {
            supabase_url,
            anon_key: anon_key.to_string(),
            site_url: Url::parse(DEFAULT_SITE_URL)?,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            request_timeout: Duration::from_secs(30),
            refresh_margin: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
        })
    }

    /// Reads `SUPABASE_URL`, `SUPABASE_ANON_KEY` and the optional
    /// `SMARTMARK_SITE_URL` / `SMARTMARK_DATA_DIR` from the environment.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("SUPABASE_URL")
            .map_err(|_| Error::config("SUPABASE_URL environment variable not found"))?;
        let anon_key = std::env::var("SUPABASE_ANON_KEY")
            .map_err(|_| Error::config("SUPABASE_ANON_KEY environment variable not found"))?;

        let mut config = Self::new(&url, &anon_key)?;
        if let Ok(site_url) = std::env::var("SMARTMARK_SITE_URL") {
            config = config.with_site_url(&site_url)?;
        }
        if let Ok(data_dir) = std::env::var("SMARTMARK_DATA_DIR") {
            config = config.with_data_dir(data_dir);
        }
        Ok(config)
    }

    pub fn with_site_url(mut self, site_url: &str) -> Result<Self> {
        self.site_url = Url::parse(site_url)?;
        Ok(self)
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, value: Duration) -> Self {
        self.request_timeout = value;
        self
    }

    pub fn with_refresh_margin(mut self, value: Duration) -> Self {
        self.refresh_margin = value;
        self
    }

    pub fn with_heartbeat_interval(mut self, value: Duration) -> Self {
        self.heartbeat_interval = value;
        self
    }

    pub fn with_reconnect_delay(mut self, value: Duration) -> Self {
        self.reconnect_delay = value;
        self
    }

    /// Project URL without the trailing slash `Url` always carries.
    pub fn base_url(&self) -> &str {
        self.supabase_url.as_str().trim_end_matches('/')
    }

    /// `{site_url}/auth/callback`
    pub fn redirect_url(&self) -> Result<Url> {
        Ok(self.site_url.join(CALLBACK_PATH)?)
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join(SESSION_FILE)
    }

    pub fn preferences_path(&self) -> PathBuf {
        self.data_dir.join(PREFERENCES_FILE)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_applies_defaults() {
        let config = Config::new("https://abc.supabase.co", "anon").unwrap();

        assert_eq!(config.base_url(), "https://abc.supabase.co");
        assert_eq!(
            config.redirect_url().unwrap().as_str(),
            "http://localhost:3000/auth/callback"
        );
        assert_eq!(config.session_path(), PathBuf::from(".smartmark/session.json"));
        assert_eq!(config.refresh_margin, Duration::from_secs(60));
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            Config::new("https://abc.supabase.co", "  "),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(matches!(Config::new("not a url", "anon"), Err(Error::Url(_))));
    }

    #[test]
    fn site_url_path_is_replaced_by_callback() {
        let config = Config::new("https://abc.supabase.co", "anon")
            .unwrap()
            .with_site_url("https://marks.example.com/app/")
            .unwrap();

        assert_eq!(
            config.redirect_url().unwrap().as_str(),
            "https://marks.example.com/auth/callback"
        );
    }
}
