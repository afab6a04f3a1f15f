//! Node connectivity
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    node module                          │
//! ├─────────────────────────────────────────────────────────┤
//! │  config.rs   - Conf file, saved settings, endpoints     │
//! │  resolver.rs - Pick an endpoint or plan an embedded node│
//! │  manager.rs  - Embedded daemon lifecycle                │
//! │  rpc.rs      - JSON-RPC client and error classification │
//! │  session.rs  - Polling task owning the connection state │
//! │  state.rs    - ConnectionState and SyncStatus           │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod manager;
pub mod resolver;
pub mod rpc;
pub mod session;
pub mod state;

pub use config::{AuthScheme, Credentials, Network, NodeEndpoint, WalletSettings};
pub use manager::{DaemonLauncher, LaunchPlan, Launcher};
pub use resolver::{ConfigResolver, ConfigSource, Resolution};
pub use rpc::{NodeRpc, RpcClient};
pub use session::{connect, SessionConfig, SessionDeps, SessionHandle};
pub use state::{ConnectionState, SyncStatus};
