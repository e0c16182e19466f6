use std::sync::Arc;

use anyhow::Context;
use slidebox::cache::PersistentCache;
use slidebox::clock::{Clock, SystemClock};
use slidebox::config::SessionConfig;
use slidebox::extraction::ExtractionService;
use slidebox::gateway::{CompanionBlobGateway, InlinePropertiesGateway, ProviderKind};
use slidebox::session::TriageSession;
use slidebox::shell;
use slidebox::state::TriageStateStore;
use slidebox::storage::TokenStorage;
use slidebox::sync::SyncCoordinator;
use slidebox::token_provider::{SharedCredentials, TokenProvider};
use slidebox_core::{DriveClient, GraphClient, OAuthClient};
use tracing::{info, warn};

/// What the process was asked to do. Later variants take precedence when
/// several flags are given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CliMode {
    Run,
    Logout,
    Version,
    Help,
}

impl CliMode {
    /// Reads the flags following the program name.
    fn from_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        args.into_iter().skip(1).try_fold(CliMode::Run, |mode, arg| {
            let requested = match arg.as_str() {
                "--logout" => CliMode::Logout,
                "--version" | "-V" => CliMode::Version,
                "--help" | "-h" => CliMode::Help,
                other => anyhow::bail!("unknown argument: {other} (see --help)"),
            };
            Ok(mode.max(requested))
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("slidebox=info".parse()?),
        )
        .init();

    match CliMode::from_args(std::env::args())? {
        CliMode::Logout => {
            TokenStorage::new()?.delete()?;
            eprintln!("saved credentials removed");
            return Ok(());
        }
        CliMode::Version => {
            println!("slidebox {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        CliMode::Help => {
            println!("Usage: slidebox [--logout | --version | --help]");
            println!("  --logout    Remove saved OAuth credentials and exit");
            println!("  --version   Print the version and exit");
            println!("Configuration is read from SLIDEBOX_* environment variables (or .env).");
            return Ok(());
        }
        CliMode::Run => {}
    }

    let config = SessionConfig::from_env();
    let credentials = SharedCredentials::new(token_provider(&config)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = PersistentCache::open(&config.cache_db, config.folder_ttl, Arc::clone(&clock)).await;
    info!(provider = %config.provider, cache = cache.is_enabled(), "starting session");

    match config.provider {
        ProviderKind::GoogleDrive => {
            let client = match config.api_base.as_deref() {
                Some(base) => DriveClient::with_base_url(base, ""),
                None => DriveClient::new(""),
            }
            .context("invalid drive api url")?;
            let gateway = InlinePropertiesGateway::new(client, credentials);
            let store = TriageStateStore::new(gateway, clock);
            let mut session: TriageSession<_, TokenProvider> =
                TriageSession::new(store, cache, None, ExtractionService::default());
            shell::run(&mut session, &config).await
        }
        ProviderKind::OneDrive => {
            let client = match config.api_base.as_deref() {
                Some(base) => GraphClient::with_base_url(base, ""),
                None => GraphClient::new(""),
            }
            .context("invalid graph api url")?;
            let sync = SyncCoordinator::spawn(client.clone(), credentials.clone());
            let gateway = CompanionBlobGateway::new(client, credentials);
            let store = TriageStateStore::new(gateway, clock);
            let mut session = TriageSession::new(store, cache, Some(sync), ExtractionService::default());
            shell::run(&mut session, &config).await
        }
    }
}

/// Env-provided credentials win over the keyring. Refreshed tokens are
/// written back to the keyring whenever it is available.
fn token_provider(config: &SessionConfig) -> anyhow::Result<TokenProvider> {
    let oauth_client = match config.client_id.as_deref() {
        Some(client_id) => Some(
            OAuthClient::new(&config.token_url, client_id, config.client_secret.clone())
                .context("invalid oauth token url")?,
        ),
        None => None,
    };
    let storage = TokenStorage::new();

    if let Some(state) = config.env_oauth_state() {
        let provider = TokenProvider::new(state, oauth_client);
        return Ok(match storage {
            Ok(storage) => provider.with_storage(storage),
            Err(err) => {
                warn!("keyring unavailable, refreshed tokens will not be saved: {err}");
                provider
            }
        });
    }

    let storage = storage.context("failed to open the keyring")?;
    let state = storage
        .load()
        .context("no saved credentials; set SLIDEBOX_ACCESS_TOKEN or SLIDEBOX_REFRESH_TOKEN")?;
    Ok(TokenProvider::new(state, oauth_client).with_storage(storage))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(args: &[&str]) -> anyhow::Result<CliMode> {
        CliMode::from_args(
            std::iter::once("slidebox")
                .chain(args.iter().copied())
                .map(str::to_string),
        )
    }

    #[test]
    fn no_flags_runs_the_shell() {
        assert_eq!(mode(&[]).unwrap(), CliMode::Run);
    }

    #[test]
    fn each_flag_selects_its_mode() {
        assert_eq!(mode(&["--logout"]).unwrap(), CliMode::Logout);
        assert_eq!(mode(&["-V"]).unwrap(), CliMode::Version);
        assert_eq!(mode(&["-h"]).unwrap(), CliMode::Help);
    }

    #[test]
    fn help_wins_over_other_flags() {
        assert_eq!(mode(&["--logout", "--help"]).unwrap(), CliMode::Help);
        assert_eq!(mode(&["--version", "--logout"]).unwrap(), CliMode::Version);
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let err = mode(&["--logout", "--verbose"]).unwrap_err();
        assert!(err.to_string().contains("--verbose"));
    }
}
