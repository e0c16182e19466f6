use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gateway::ProviderKind;
use crate::storage::OAuthState;

const DEFAULT_PROVIDER: ProviderKind = ProviderKind::OneDrive;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
const DEFAULT_FOLDER_TTL_SECS: u64 = 60 * 60;
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const MICROSOFT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub provider: ProviderKind,
    /// Overrides the remote store's base url.
    pub api_base: Option<String>,
    pub token_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub cache_db: PathBuf,
    pub sync_interval: Duration,
    pub folder_ttl: Duration,
    /// Folder loaded on start.
    pub folder: Option<String>,
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let read_secs = |name: &str, default: u64| {
            Duration::from_secs(
                read(name)
                    .and_then(|value| value.parse::<u64>().ok())
                    .filter(|value| *value > 0)
                    .unwrap_or(default),
            )
        };

        let provider = read("SLIDEBOX_PROVIDER")
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_PROVIDER);
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        let cache_db = read("SLIDEBOX_CACHE_DB")
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_cache_db);

        Self {
            provider,
            api_base: read("SLIDEBOX_API_BASE"),
            token_url: read("SLIDEBOX_TOKEN_URL")
                .unwrap_or_else(|| default_token_url(provider).to_string()),
            client_id: read("SLIDEBOX_CLIENT_ID"),
            client_secret: read("SLIDEBOX_CLIENT_SECRET"),
            scope: read("SLIDEBOX_SCOPE"),
            access_token: read("SLIDEBOX_ACCESS_TOKEN"),
            refresh_token: read("SLIDEBOX_REFRESH_TOKEN"),
            cache_db,
            sync_interval: read_secs("SLIDEBOX_SYNC_INTERVAL_SECS", DEFAULT_SYNC_INTERVAL_SECS),
            folder_ttl: read_secs("SLIDEBOX_FOLDER_TTL_SECS", DEFAULT_FOLDER_TTL_SECS),
            folder: read("SLIDEBOX_FOLDER"),
        }
    }

    /// Credentials given directly in the environment, if any. A refresh
    /// token alone is enough; the access token is then fetched on first use.
    pub fn env_oauth_state(&self) -> Option<OAuthState> {
        if self.access_token.is_none() && self.refresh_token.is_none() {
            return None;
        }
        Some(OAuthState {
            access_token: self.access_token.clone().unwrap_or_default(),
            refresh_token: self.refresh_token.clone(),
            // Unknown expiry: a given access token is used until rejected,
            // an absent one forces a refresh.
            expires_at: if self.access_token.is_some() { None } else { Some(0) },
            scope: self.scope.clone(),
            token_type: None,
        })
    }
}

fn default_token_url(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::GoogleDrive => GOOGLE_TOKEN_URL,
        ProviderKind::OneDrive => MICROSOFT_TOKEN_URL,
    }
}

fn default_cache_db() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("slidebox")
        .join("cache.sqlite")
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> SessionConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        SessionConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = config(&[]);
        assert_eq!(config.provider, ProviderKind::OneDrive);
        assert_eq!(config.token_url, MICROSOFT_TOKEN_URL);
        assert_eq!(config.sync_interval, Duration::from_secs(30));
        assert_eq!(config.folder_ttl, Duration::from_secs(3600));
        assert!(config.cache_db.ends_with("slidebox/cache.sqlite"));
        assert!(config.env_oauth_state().is_none());
    }

    #[test]
    fn invalid_or_zero_numbers_fall_back() {
        let config = config(&[
            ("SLIDEBOX_SYNC_INTERVAL_SECS", "0"),
            ("SLIDEBOX_FOLDER_TTL_SECS", "soon"),
        ]);
        assert_eq!(config.sync_interval, Duration::from_secs(30));
        assert_eq!(config.folder_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn provider_selects_its_token_endpoint() {
        let config = config(&[
            ("SLIDEBOX_PROVIDER", "googledrive"),
            ("SLIDEBOX_SYNC_INTERVAL_SECS", "5"),
        ]);
        assert_eq!(config.provider, ProviderKind::GoogleDrive);
        assert_eq!(config.token_url, GOOGLE_TOKEN_URL);
        assert_eq!(config.sync_interval, Duration::from_secs(5));
    }

    #[test]
    fn cache_path_expands_home() {
        let home = PathBuf::from("/home/ada");
        assert_eq!(
            expand_with_home("~/photos/cache.sqlite", &home),
            PathBuf::from("/home/ada/photos/cache.sqlite")
        );
        assert_eq!(expand_with_home("/tmp/c.sqlite", &home), PathBuf::from("/tmp/c.sqlite"));
    }

    #[test]
    fn refresh_token_alone_forces_a_refresh() {
        let state = config(&[("SLIDEBOX_REFRESH_TOKEN", "r-1")])
            .env_oauth_state()
            .unwrap();
        assert_eq!(state.refresh_token.as_deref(), Some("r-1"));
        assert_eq!(state.expires_at, Some(0));

        let state = config(&[("SLIDEBOX_ACCESS_TOKEN", "a-1")])
            .env_oauth_state()
            .unwrap();
        assert_eq!(state.access_token, "a-1");
        assert_eq!(state.expires_at, None);
    }
}
