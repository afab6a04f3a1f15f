//! Config resolution
//!
//! Turns the candidate configuration sources into exactly one endpoint and
//! an optional launch plan for the embedded daemon.

use super::config::{
    cookie_path, generate_node_conf, write_node_conf, AuthScheme, GeneratedCredentials, Network,
    NodeConfFile, NodeEndpoint, WalletSettings,
};
use super::manager::{LaunchPlan, DEFAULT_STARTUP_TIMEOUT};
use super::rpc::{NodeRpc, RetryPolicies, RpcClient};
use crate::error::{RpcError, WalletError};
use crate::events::{SharedEventSink, WalletEvent};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Where a node configuration may come from, in priority order
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// An existing node configuration file
    NodeConfFile(PathBuf),
    /// Connection settings saved by the wallet
    Saved(WalletSettings),
    /// The user explicitly asked for this connection and nothing else
    Manual(WalletSettings),
    None,
}

/// Result of a lightweight reachability probe
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    Reachable,
    /// Answering but still warming up; counts as reachable
    Busy,
    AuthRejected,
    Unreachable,
}

impl From<Result<serde_json::Value, RpcError>> for ProbeResult {
    fn from(result: Result<serde_json::Value, RpcError>) -> Self {
        match result {
            Ok(_) => ProbeResult::Reachable,
            Err(RpcError::NodeBusy(_)) => ProbeResult::Busy,
            Err(RpcError::AuthenticationFailed) => ProbeResult::AuthRejected,
            // Something answered on the port, just not as expected
            Err(RpcError::Node { .. }) | Err(RpcError::Malformed { .. }) => ProbeResult::Reachable,
            Err(RpcError::Unreachable(_)) => ProbeResult::Unreachable,
        }
    }
}

#[async_trait]
pub trait NodeProbe: Send + Sync {
    async fn probe(&self, endpoint: &NodeEndpoint) -> ProbeResult;
}

/// Probes with a single `getinfo`, no retry
#[derive(Debug, Default, Clone, Copy)]
pub struct RpcProbe;

#[async_trait]
impl NodeProbe for RpcProbe {
    async fn probe(&self, endpoint: &NodeEndpoint) -> ProbeResult {
        match RpcClient::with_timeout(endpoint.clone(), PROBE_TIMEOUT) {
            Ok(client) => client
                .with_policies(RetryPolicies::none())
                .request("getinfo", vec![])
                .await
                .into(),
            Err(e) => {
                log::warn!("Cannot probe {}: {}", endpoint.url(), e);
                ProbeResult::Unreachable
            }
        }
    }
}

/// Settings for the embedded-node fallback
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedOptions {
    pub disabled: bool,
    pub network: Network,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub daemon_path: PathBuf,
    pub use_tor: bool,
    pub startup_timeout: Duration,
}

impl EmbeddedOptions {
    /// Platform defaults for the given settings
    pub fn from_settings(settings: &WalletSettings) -> Self {
        let data_dir = settings.get_data_directory();
        Self {
            disabled: settings.embedded_disabled,
            network: settings.network,
            conf_path: data_dir.join(super::config::NODE_CONF_FILE),
            data_dir,
            daemon_path: super::config::embedded_daemon_path(),
            use_tor: settings.use_tor,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }
}

/// The endpoint to connect to, and whether to launch a daemon for it
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub endpoint: NodeEndpoint,
    pub launch: Option<LaunchPlan>,
    /// Set when a generated configuration could not be written
    pub config_write_error: Option<String>,
}

impl Resolution {
    pub fn should_launch_embedded(&self) -> bool {
        self.launch.is_some()
    }
}

pub struct ConfigResolver<P: NodeProbe> {
    probe: P,
    embedded: EmbeddedOptions,
    events: Option<SharedEventSink>,
}

impl<P: NodeProbe> ConfigResolver<P> {
    pub fn new(probe: P, embedded: EmbeddedOptions) -> Self {
        Self {
            probe,
            embedded,
            events: None,
        }
    }

    pub fn with_events(mut self, events: SharedEventSink) -> Self {
        self.events = Some(events);
        self
    }

    /// Resolve sources in order. The first reachable external node wins;
    /// otherwise an embedded node is planned unless that is disabled.
    pub async fn resolve(&self, sources: &[ConfigSource]) -> Result<Resolution, WalletError> {
        for source in sources {
            let Some(endpoint) = self.candidate(source)? else {
                continue;
            };

            log::info!("Probing node at {}", endpoint.url());
            match self.probe.probe(&endpoint).await {
                ProbeResult::Reachable | ProbeResult::Busy => {
                    log::info!("Using external node at {}", endpoint.url());
                    return Ok(Resolution {
                        endpoint,
                        launch: None,
                        config_write_error: None,
                    });
                }
                ProbeResult::AuthRejected => {
                    return Err(WalletError::Authentication(format!(
                        "the node at {} rejected the RPC username / password",
                        endpoint.socket_addr()
                    )));
                }
                ProbeResult::Unreachable => {
                    if let ConfigSource::Manual(_) = source {
                        return Err(WalletError::Configuration(format!(
                            "couldn't connect to the manually configured node at {}",
                            endpoint.socket_addr()
                        )));
                    }
                    log::info!("No node answering at {}", endpoint.url());
                }
            }
        }

        if self.embedded.disabled {
            return Err(WalletError::Configuration(
                "couldn't connect to the configured node; not starting embedded node because \
                 embedded launching is disabled"
                    .to_string(),
            ));
        }

        Ok(self.synthesize())
    }

    fn candidate(&self, source: &ConfigSource) -> Result<Option<NodeEndpoint>, WalletError> {
        match source {
            ConfigSource::NodeConfFile(path) => {
                if !path.exists() {
                    return Ok(None);
                }
                match NodeConfFile::load(path) {
                    Ok(conf) => Ok(Some(conf.endpoint())),
                    Err(e) => {
                        log::warn!("{}", e);
                        Ok(None)
                    }
                }
            }
            ConfigSource::Saved(settings) => {
                Ok(settings.has_connection().then(|| settings.endpoint()))
            }
            ConfigSource::Manual(settings) => {
                if !settings.has_connection() || settings.port == 0 {
                    return Err(WalletError::Configuration(
                        "manual connection requested but settings not configured".to_string(),
                    ));
                }
                Ok(Some(settings.endpoint()))
            }
            ConfigSource::None => Ok(None),
        }
    }

    /// Loopback endpoint for an embedded node. Reuses credentials from an
    /// existing conf file, else generates and writes a fresh one.
    fn synthesize(&self) -> Resolution {
        let opts = &self.embedded;
        let mut config_write_error = None;

        let existing = opts
            .conf_path
            .exists()
            .then(|| NodeConfFile::load(&opts.conf_path).ok())
            .flatten();

        let (network, port, auth) = match existing {
            Some(conf) => {
                let auth = if conf.has_credentials() {
                    conf.endpoint().auth
                } else {
                    AuthScheme::Cookie {
                        path: cookie_path(&opts.data_dir, conf.network()),
                    }
                };
                (conf.network(), conf.rpc_port(), auth)
            }
            None => {
                let port = opts.network.default_rpc_port();
                let creds = GeneratedCredentials::random();
                let content = generate_node_conf(opts.network, port, &creds, opts.use_tor);
                let auth = match write_node_conf(&opts.conf_path, &content) {
                    Ok(()) => AuthScheme::UserPassword {
                        user: creds.user,
                        password: creds.password,
                    },
                    Err(e) => {
                        // The daemon falls back to cookie auth without a conf file
                        log::warn!("Could not write node configuration: {}", e);
                        if let Some(events) = &self.events {
                            events.emit(WalletEvent::ConfigWriteFailed {
                                path: opts.conf_path.display().to_string(),
                                error: e.clone(),
                            });
                        }
                        config_write_error = Some(e);
                        AuthScheme::Cookie {
                            path: cookie_path(&opts.data_dir, opts.network),
                        }
                    }
                };
                (opts.network, port, auth)
            }
        };

        log::info!("Planning embedded node on 127.0.0.1:{} ({})", port, network.as_str());

        Resolution {
            endpoint: NodeEndpoint {
                host: "127.0.0.1".to_string(),
                port,
                auth,
                use_tor: opts.use_tor,
            },
            launch: Some(LaunchPlan {
                daemon_path: opts.daemon_path.clone(),
                data_dir: opts.data_dir.clone(),
                conf_path: opts.conf_path.clone(),
                network,
                rpc_port: port,
                use_tor: opts.use_tor,
                extra_args: Vec::new(),
                startup_timeout: opts.startup_timeout,
            }),
            config_write_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers by port and records what was probed
    #[derive(Default)]
    struct FakeProbe {
        by_port: HashMap<u16, ProbeResult>,
        probed: Mutex<Vec<u16>>,
    }

    impl FakeProbe {
        fn with(mut self, port: u16, result: ProbeResult) -> Self {
            self.by_port.insert(port, result);
            self
        }
    }

    #[async_trait]
    impl NodeProbe for FakeProbe {
        async fn probe(&self, endpoint: &NodeEndpoint) -> ProbeResult {
            self.probed.lock().unwrap().push(endpoint.port);
            self.by_port
                .get(&endpoint.port)
                .cloned()
                .unwrap_or(ProbeResult::Unreachable)
        }
    }

    fn options(dir: &std::path::Path) -> EmbeddedOptions {
        EmbeddedOptions {
            disabled: false,
            network: Network::Mainnet,
            data_dir: dir.to_path_buf(),
            conf_path: dir.join("HUSH3.conf"),
            daemon_path: dir.join("hushd"),
            use_tor: false,
            startup_timeout: Duration::from_secs(5),
        }
    }

    fn saved(port: u16) -> WalletSettings {
        WalletSettings {
            port,
            rpc_user: Some("u".into()),
            rpc_password: Some("p".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reachable_external_node_is_used_without_launch() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ConfigResolver::new(FakeProbe::default().with(4000, ProbeResult::Busy), options(dir.path()));

        let resolution = resolver
            .resolve(&[ConfigSource::None, ConfigSource::Saved(saved(4000))])
            .await
            .unwrap();
        assert!(!resolution.should_launch_embedded());
        assert_eq!(resolution.endpoint.port, 4000);
        assert!(!dir.path().join("HUSH3.conf").exists());
    }

    #[tokio::test]
    async fn test_unreachable_synthesizes_embedded_node() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ConfigResolver::new(FakeProbe::default(), options(dir.path()));

        let resolution = resolver.resolve(&[ConfigSource::Saved(saved(4000))]).await.unwrap();
        let plan = resolution.launch.clone().unwrap();
        assert_eq!(plan.rpc_port, 18031);
        assert_eq!(resolution.endpoint.host, "127.0.0.1");
        assert!(resolution.config_write_error.is_none());

        // Credentials in the endpoint match the generated file
        let conf = NodeConfFile::load(&plan.conf_path).unwrap();
        assert_eq!(resolution.endpoint.auth, conf.endpoint().auth);
        assert!(!conf.is_daemon_mode());
    }

    #[tokio::test]
    async fn test_existing_conf_credentials_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("HUSH3.conf"), "rpcuser=me\nrpcpassword=pw\nrpcport=5555\n").unwrap();
        let resolver = ConfigResolver::new(FakeProbe::default(), options(dir.path()));

        let resolution = resolver
            .resolve(&[ConfigSource::NodeConfFile(dir.path().join("HUSH3.conf"))])
            .await
            .unwrap();
        assert_eq!(resolution.endpoint.port, 5555);
        assert_eq!(
            resolution.endpoint.auth,
            AuthScheme::UserPassword { user: "me".into(), password: "pw".into() }
        );
        assert!(resolution.should_launch_embedded());
    }

    #[tokio::test]
    async fn test_embedded_disabled_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.disabled = true;
        let resolver = ConfigResolver::new(FakeProbe::default(), opts);

        let err = resolver.resolve(&[ConfigSource::Saved(saved(4000))]).await.unwrap_err();
        assert!(matches!(err, WalletError::Configuration(ref m) if m.contains("embedded launching is disabled")));
    }

    #[tokio::test]
    async fn test_auth_rejection_stops_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let probe = FakeProbe::default().with(4000, ProbeResult::AuthRejected);
        let resolver = ConfigResolver::new(probe, options(dir.path()));

        let err = resolver
            .resolve(&[ConfigSource::Saved(saved(4000)), ConfigSource::Saved(saved(4001))])
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::Authentication(_)));
        assert_eq!(*resolver.probe.probed.lock().unwrap(), vec![4000]);
    }

    #[tokio::test]
    async fn test_manual_connection_requires_settings() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ConfigResolver::new(FakeProbe::default(), options(dir.path()));

        let err = resolver
            .resolve(&[ConfigSource::Manual(WalletSettings::default())])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WalletError::Configuration("manual connection requested but settings not configured".into())
        );

        let err = resolver.resolve(&[ConfigSource::Manual(saved(4000))]).await.unwrap_err();
        assert!(matches!(err, WalletError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_config_write_failure_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let mut opts = options(dir.path());
        opts.conf_path = blocker.join("HUSH3.conf");

        let (sink, mut rx) = ChannelSink::shared();
        let resolver = ConfigResolver::new(FakeProbe::default(), opts).with_events(sink);

        let resolution = resolver.resolve(&[ConfigSource::None]).await.unwrap();
        assert!(resolution.config_write_error.is_some());
        assert!(matches!(resolution.endpoint.auth, AuthScheme::Cookie { .. }));
        assert!(matches!(rx.try_recv().unwrap(), WalletEvent::ConfigWriteFailed { .. }));
    }

    #[test]
    fn test_probe_result_from_rpc() {
        assert_eq!(ProbeResult::from(Err(RpcError::NodeBusy("x".into()))), ProbeResult::Busy);
        assert_eq!(ProbeResult::from(Err(RpcError::AuthenticationFailed)), ProbeResult::AuthRejected);
        assert_eq!(
            ProbeResult::from(Err(RpcError::Unreachable("refused".into()))),
            ProbeResult::Unreachable
        );
    }
}
