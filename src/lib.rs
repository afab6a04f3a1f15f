//! Hush wallet core
//!
//! Finds or launches a full node, keeps an RPC session to it alive, builds
//! and submits payments, and pairs with the companion mobile app. Progress
//! is reported to the UI through [`events::EventSink`].

use std::path::PathBuf;
use std::sync::Arc;

pub mod backoff;
pub mod error;
pub mod events;
pub mod logging;
pub mod node;
pub mod pairing;
pub mod tx;
pub mod update;

pub use error::{ErrorKind, RpcError, WalletError};
pub use events::{EventSink, SharedEventSink, WalletEvent};

use node::resolver::{EmbeddedOptions, RpcProbe};
use node::session::http_rpc_factory;
use node::{ConfigResolver, ConfigSource, DaemonLauncher, SessionConfig, SessionDeps, SessionHandle, WalletSettings};
use update::{GitHubReleaseFeed, ReleaseFeed};

/// Directory holding the wallet's own settings and logs
pub fn app_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hushwallet")
}

pub fn log_dir() -> PathBuf {
    app_config_dir().join("logs")
}

/// Expand environment variables and ~ in user-entered paths
/// Windows: %VAR% style
/// Unix: ~ expands to HOME
pub fn expand_path(path: &str) -> String {
    let mut result = path.trim().to_string();

    #[cfg(windows)]
    {
        let mut from = 0;
        while let Some(start) = result[from..].find('%').map(|i| i + from) {
            let Some(len) = result[start + 1..].find('%') else {
                break;
            };
            let name = &result[start + 1..start + 1 + len];
            match std::env::var(name) {
                Ok(value) => {
                    result = format!("{}{}{}", &result[..start], value, &result[start + 2 + len..]);
                    from = start + value.len();
                }
                // Leave unknown variables alone
                Err(_) => from = start + 1,
            }
        }
    }

    #[cfg(not(windows))]
    {
        if let Some(rest) = result.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                result = home.join(rest).to_string_lossy().to_string();
            }
        } else if result == "~" {
            if let Some(home) = dirs::home_dir() {
                result = home.to_string_lossy().to_string();
            }
        }
    }

    result
}

/// Where to look for a node, in order. A manual connection uses only the
/// saved settings and never falls back to an embedded node.
pub fn connection_sources(settings: &WalletSettings, manual: bool) -> Vec<ConfigSource> {
    if manual {
        return vec![ConfigSource::Manual(settings.clone())];
    }
    let mut sources = vec![ConfigSource::NodeConfFile(
        EmbeddedOptions::from_settings(settings).conf_path,
    )];
    if settings.has_connection() {
        sources.push(ConfigSource::Saved(settings.clone()));
    }
    sources
}

/// Resolve a node and start the RPC session for it, launching the embedded
/// daemon when nothing answers
pub async fn start_session(
    settings: &WalletSettings,
    manual: bool,
    events: SharedEventSink,
) -> Result<SessionHandle, WalletError> {
    let resolver = ConfigResolver::new(RpcProbe, EmbeddedOptions::from_settings(settings))
        .with_events(events.clone());
    let resolution = resolver.resolve(&connection_sources(settings, manual)).await?;

    if let Some(err) = &resolution.config_write_error {
        log::warn!("Continuing without a saved node configuration: {}", err);
    }

    let release_feed = settings
        .check_updates
        .then(|| Arc::new(GitHubReleaseFeed::default()) as Arc<dyn ReleaseFeed>);
    let deps = SessionDeps {
        rpc_factory: http_rpc_factory(),
        launcher: Some(Arc::new(DaemonLauncher::new())),
        release_feed,
        events,
    };

    Ok(node::connect(
        resolution.endpoint,
        resolution.launch,
        SessionConfig::default(),
        deps,
    ))
}
