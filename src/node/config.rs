//! Node configuration types and persistence
//!
//! Three kinds of configuration meet here:
//! - the node's own `HUSH3.conf` (parsed, and generated when we launch an
//!   embedded node),
//! - the wallet's saved connection settings (`settings.json`),
//! - the resolved [`NodeEndpoint`] an RPC session is built from.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Name of the node's configuration file
pub const NODE_CONF_FILE: &str = "HUSH3.conf";

/// Tor SOCKS proxy expected to be running locally
pub const TOR_PROXY_ADDR: &str = "127.0.0.1:9050";

/// Network the node runs on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }

    pub fn default_rpc_port(&self) -> u16 {
        match self {
            Network::Mainnet => 18031,
            Network::Testnet => 28031,
        }
    }

    pub fn from_testnet_flag(testnet: bool) -> Self {
        if testnet {
            Network::Testnet
        } else {
            Network::Mainnet
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            other => Err(format!("unknown network '{}'", other)),
        }
    }
}

/// How RPC requests authenticate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthScheme {
    /// Cookie written by the node on startup; read on every request since
    /// it changes each time the node restarts
    Cookie { path: PathBuf },
    UserPassword { user: String, password: String },
}

impl AuthScheme {
    /// Resolve to a `user:password` pair, reading the cookie if needed
    pub fn credentials(&self) -> Option<String> {
        match self {
            AuthScheme::Cookie { path } => fs::read_to_string(path)
                .ok()
                .map(|content| content.trim().to_string())
                .filter(|content| !content.is_empty()),
            AuthScheme::UserPassword { user, password } => Some(format!("{}:{}", user, password)),
        }
    }
}

/// Replacement RPC credentials entered by the user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl From<Credentials> for AuthScheme {
    fn from(creds: Credentials) -> Self {
        AuthScheme::UserPassword {
            user: creds.user,
            password: creds.password,
        }
    }
}

/// Where and how to reach a node. Immutable once a session is built from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeEndpoint {
    pub host: String,
    pub port: u16,
    pub auth: AuthScheme,
    pub use_tor: bool,
}

impl NodeEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }

    /// `host:port`, for TCP readiness checks
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self.host.as_str(), "127.0.0.1" | "localhost" | "::1")
    }

    /// Same endpoint with replaced credentials
    pub fn with_auth(&self, auth: AuthScheme) -> Self {
        Self {
            auth,
            ..self.clone()
        }
    }
}

/// Connection settings saved by the wallet (settings.json)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WalletSettings {
    #[serde(default)]
    pub network: Network,

    #[serde(default = "default_rpc_host")]
    pub host: String,

    /// 0 means use the network default
    #[serde(default)]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_user: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_password: Option<String>,

    /// Node data directory (for cookie auth and conf discovery)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_directory: Option<String>,

    #[serde(default)]
    pub use_tor: bool,

    /// Never start an embedded node (`--no-embedded`)
    #[serde(default)]
    pub embedded_disabled: bool,

    /// Allow user-chosen fees (fees are public, so this leaks metadata)
    #[serde(default)]
    pub allow_custom_fees: bool,

    /// Check the release feed on connect
    #[serde(default = "default_true")]
    pub check_updates: bool,
}

fn default_rpc_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            network: Network::default(),
            host: default_rpc_host(),
            port: 0,
            rpc_user: None,
            rpc_password: None,
            data_directory: None,
            use_tor: false,
            embedded_disabled: false,
            allow_custom_fees: false,
            check_updates: true,
        }
    }
}

impl WalletSettings {
    /// Get the path to the settings file
    pub fn settings_path() -> PathBuf {
        crate::app_config_dir().join("settings.json")
    }

    /// Load settings from disk, or return defaults if not found
    pub fn load() -> Self {
        Self::load_from(&Self::settings_path())
    }

    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                log::warn!("Ignoring unreadable settings at {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> Result<(), String> {
        self.save_to(&Self::settings_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings dir: {}", e))?;
        }

        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        fs::write(path, contents).map_err(|e| format!("Failed to write settings: {}", e))?;

        log::info!("Wallet settings saved to {}", path.display());
        Ok(())
    }

    /// Get the effective RPC port (using network default if not specified)
    pub fn effective_rpc_port(&self) -> u16 {
        if self.port > 0 {
            self.port
        } else {
            self.network.default_rpc_port()
        }
    }

    /// A host to try is configured
    pub fn has_connection(&self) -> bool {
        !self.host.trim().is_empty()
    }

    /// Data directory for this config (user supplied or platform default)
    pub fn get_data_directory(&self) -> PathBuf {
        match &self.data_directory {
            Some(dir) if !dir.is_empty() => PathBuf::from(crate::expand_path(dir)),
            _ => default_node_data_dir(),
        }
    }

    /// Build the endpoint these settings describe. Without explicit
    /// credentials the node's cookie file is used.
    pub fn endpoint(&self) -> NodeEndpoint {
        let auth = match (&self.rpc_user, &self.rpc_password) {
            (Some(user), Some(password)) if !user.is_empty() => AuthScheme::UserPassword {
                user: user.clone(),
                password: password.clone(),
            },
            _ => AuthScheme::Cookie {
                path: cookie_path(&self.get_data_directory(), self.network),
            },
        };

        NodeEndpoint {
            host: self.host.trim().to_string(),
            port: self.effective_rpc_port(),
            auth,
            use_tor: self.use_tor,
        }
    }
}

/// Parsed node configuration file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeConfFile {
    pub path: Option<PathBuf>,
    entries: HashMap<String, String>,
}

impl NodeConfFile {
    /// Parse `key=value` lines. Comments, blank lines and `[section]`
    /// headers are skipped; later keys override earlier ones.
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('['))
            .filter_map(|line| {
                let (key, value) = line.split_once('=')?;
                let value = value.split('#').next().unwrap_or("").trim();
                Some((key.trim().to_lowercase(), value.to_string()))
            })
            .collect();

        Self {
            path: None,
            entries,
        }
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let mut conf = Self::parse(&content);
        conf.path = Some(path.to_path_buf());
        Ok(conf)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("1") | Some("true"))
    }

    /// `daemon=1` makes the node fork into the background, which breaks
    /// embedded supervision
    pub fn is_daemon_mode(&self) -> bool {
        self.flag("daemon")
    }

    pub fn network(&self) -> Network {
        Network::from_testnet_flag(self.flag("testnet"))
    }

    pub fn rpc_port(&self) -> u16 {
        self.get("rpcport")
            .and_then(|p| p.parse().ok())
            .unwrap_or_else(|| self.network().default_rpc_port())
    }

    pub fn rpc_host(&self) -> String {
        match self.get("rpcconnect").or_else(|| self.get("rpcbind")) {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => default_rpc_host(),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.get("rpcuser").is_some_and(|u| !u.is_empty()) && self.get("rpcpassword").is_some()
    }

    pub fn uses_tor(&self) -> bool {
        self.get("proxy").is_some_and(|p| p == TOR_PROXY_ADDR)
    }

    /// Directory holding the conf file (the node's data directory)
    pub fn data_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = self.get("datadir").filter(|d| !d.is_empty()) {
            return Some(PathBuf::from(crate::expand_path(dir)));
        }
        self.path.as_ref().and_then(|p| p.parent()).map(Path::to_path_buf)
    }

    /// Endpoint described by this file. Falls back to cookie auth when no
    /// rpcuser/rpcpassword is configured.
    pub fn endpoint(&self) -> NodeEndpoint {
        let auth = if self.has_credentials() {
            AuthScheme::UserPassword {
                user: self.get("rpcuser").unwrap_or_default().to_string(),
                password: self.get("rpcpassword").unwrap_or_default().to_string(),
            }
        } else {
            let data_dir = self.data_dir().unwrap_or_else(default_node_data_dir);
            AuthScheme::Cookie {
                path: cookie_path(&data_dir, self.network()),
            }
        };

        NodeEndpoint {
            host: self.rpc_host(),
            port: self.rpc_port(),
            auth,
            use_tor: self.uses_tor(),
        }
    }
}

/// Freshly generated RPC credentials
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedCredentials {
    pub user: String,
    pub password: String,
}

impl GeneratedCredentials {
    pub fn random() -> Self {
        Self {
            user: random_token(16),
            password: random_token(32),
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate conf file content for an embedded node
pub fn generate_node_conf(network: Network, port: u16, creds: &GeneratedCredentials, use_tor: bool) -> String {
    let mut lines = vec![
        "# Generated by Hush wallet".to_string(),
        "# Do not set daemon=1, the wallet supervises this node".to_string(),
        "".to_string(),
        "server=1".to_string(),
        "rpcbind=127.0.0.1".to_string(),
        "rpcallowip=127.0.0.1".to_string(),
        format!("rpcport={}", port),
        format!("rpcuser={}", creds.user),
        format!("rpcpassword={}", creds.password),
    ];

    if network == Network::Testnet {
        lines.push("testnet=1".to_string());
    }

    if use_tor {
        lines.push(format!("proxy={}", TOR_PROXY_ADDR));
    }

    lines.join("\n")
}

/// Write a conf file, creating its directory
pub fn write_node_conf(path: &Path, content: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create data directory: {}", e))?;
    }

    fs::write(path, content).map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;

    log::info!("{} written to {}", NODE_CONF_FILE, path.display());
    Ok(())
}

/// Cookie file location depends on network
pub fn cookie_path(data_dir: &Path, network: Network) -> PathBuf {
    match network {
        Network::Mainnet => data_dir.join(".cookie"),
        Network::Testnet => data_dir.join("testnet3").join(".cookie"),
    }
}

/// Get the default node data directory
pub fn default_node_data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Hush")
            .join("HUSH3")
    }

    #[cfg(target_os = "macos")]
    {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Hush")
            .join("HUSH3")
    }

    #[cfg(target_os = "linux")]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hush")
            .join("HUSH3")
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        PathBuf::from(".").join("HUSH3")
    }
}

/// Default location of the node conf file
pub fn default_node_conf_path() -> PathBuf {
    default_node_data_dir().join(NODE_CONF_FILE)
}

/// Get the path to the embedded daemon binary (shipped next to the wallet)
pub fn embedded_daemon_path() -> PathBuf {
    let dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));

    #[cfg(target_os = "windows")]
    {
        dir.join("hushd.exe")
    }

    #[cfg(not(target_os = "windows"))]
    {
        dir.join("hushd")
    }
}
