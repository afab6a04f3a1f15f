//! RPC session
//!
//! One task owns the connection: it launches the embedded daemon when asked
//! to, polls the node on a fixed interval, and is the only writer of
//! [`ConnectionState`] and [`SyncStatus`]. Everyone else reads snapshots
//! through a [`SessionHandle`] or receives events.

use super::config::{Credentials, NodeEndpoint};
use super::manager::{LaunchPlan, Launcher, DEFAULT_STOP_GRACE};
use super::rpc::{NodeRpc, RpcClient};
use super::state::{ConnectionState, SyncStatus};
use crate::backoff::BackoffPolicy;
use crate::error::{RpcError, WalletError};
use crate::events::{ErrorEvent, SharedEventSink, WalletEvent};
use crate::update::{check_for_update, ReleaseFeed};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Builds the RPC client for an endpoint
pub type RpcFactory = Arc<dyn Fn(&NodeEndpoint) -> Result<Arc<dyn NodeRpc>, WalletError> + Send + Sync>;

/// The session's current client, replaced on every connection attempt
pub type RpcWatch = watch::Receiver<Option<Arc<dyn NodeRpc>>>;

/// Factory producing HTTP clients
pub fn http_rpc_factory() -> RpcFactory {
    Arc::new(|endpoint: &NodeEndpoint| {
        RpcClient::new(endpoint.clone()).map(|client| Arc::new(client) as Arc<dyn NodeRpc>)
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    /// Blocks behind the network tip still counted as synced
    pub sync_tolerance: u64,
    /// Consecutive zero-peer ticks after Connected before warning
    pub no_peers_ticks: u32,
    /// Consecutive failed polls before an attempt is declared failed
    pub failure_threshold: u32,
    /// Delay between attempts. Attempts never stop; the count only grows
    /// the delay.
    pub reconnect: BackoffPolicy,
    pub stop_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            sync_tolerance: 2,
            no_peers_ticks: 6,
            failure_threshold: BackoffPolicy::network().max_attempts,
            reconnect: BackoffPolicy::new(u32::MAX, Duration::from_secs(1), Duration::from_secs(30)),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Collaborators of a session
#[derive(Clone)]
pub struct SessionDeps {
    pub rpc_factory: RpcFactory,
    pub launcher: Option<Arc<dyn Launcher>>,
    pub release_feed: Option<Arc<dyn ReleaseFeed>>,
    pub events: SharedEventSink,
}

enum Control {
    Retry(Option<Credentials>),
    Shutdown(oneshot::Sender<()>),
}

/// Read side and control of a running session
pub struct SessionHandle {
    state: watch::Receiver<ConnectionState>,
    status: watch::Receiver<Option<SyncStatus>>,
    rpc: RpcWatch,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn sync_status(&self) -> Option<SyncStatus> {
        self.status.borrow().clone()
    }

    /// Client for the current endpoint, once one has been built
    pub fn rpc(&self) -> Option<Arc<dyn NodeRpc>> {
        self.rpc.borrow().clone()
    }

    pub fn subscribe_rpc(&self) -> RpcWatch {
        self.rpc.clone()
    }

    /// Resume after a halt (rejected credentials, bad configuration).
    /// New credentials replace the endpoint's auth scheme.
    pub fn retry(&self, credentials: Option<Credentials>) {
        let _ = self.control.send(Control::Retry(credentials));
    }

    /// Stop polling, stop an embedded node we launched, and wait for the
    /// session task to end
    pub async fn shutdown(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.control.send(Control::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        let _ = self.task.await;
    }
}

/// Start a session for `endpoint`, launching the embedded node first when a
/// plan is given
pub fn connect(
    endpoint: NodeEndpoint,
    launch: Option<LaunchPlan>,
    config: SessionConfig,
    deps: SessionDeps,
) -> SessionHandle {
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (status_tx, status_rx) = watch::channel(None);
    let (rpc_tx, rpc_rx) = watch::channel(None);
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let session = Session {
        endpoint,
        launch,
        launched: false,
        reached_connected: false,
        config,
        deps,
        state_tx,
        status_tx,
        rpc_tx,
        control_rx,
    };
    let task = tokio::spawn(session.run());

    SessionHandle {
        state: state_rx,
        status: status_rx,
        rpc: rpc_rx,
        control: control_tx,
        task,
    }
}

/// How one connection attempt ended
enum AttemptEnd {
    /// Failed in a way the policy retries on its own
    Transient,
    /// Needs the user; wait for an explicit retry
    Halt,
    Retry(Option<Credentials>),
    Shutdown(Option<oneshot::Sender<()>>),
}

struct Session {
    endpoint: NodeEndpoint,
    launch: Option<LaunchPlan>,
    /// Whether the daemon is ours to stop
    launched: bool,
    /// The current attempt got as far as Connected
    reached_connected: bool,
    config: SessionConfig,
    deps: SessionDeps,
    state_tx: watch::Sender<ConnectionState>,
    status_tx: watch::Sender<Option<SyncStatus>>,
    rpc_tx: watch::Sender<Option<Arc<dyn NodeRpc>>>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl Session {
    async fn run(mut self) {
        let mut failed_attempts = 0u32;

        loop {
            let end = self.attempt().await;

            let end = match end {
                AttemptEnd::Transient => {
                    if std::mem::take(&mut self.reached_connected) {
                        failed_attempts = 0;
                    }
                    let delay = self.config.reconnect.delay_for(failed_attempts);
                    failed_attempts = failed_attempts.saturating_add(1);
                    log::info!("Reconnecting in {:?}", delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        control = self.control_rx.recv() => Self::control_end(control),
                    }
                }
                AttemptEnd::Halt => {
                    log::warn!("Connection halted until the user retries");
                    Self::control_end(self.control_rx.recv().await)
                }
                other => other,
            };

            match end {
                AttemptEnd::Retry(credentials) => {
                    failed_attempts = 0;
                    if let Some(credentials) = credentials {
                        self.endpoint = self.endpoint.with_auth(credentials.into());
                    }
                }
                AttemptEnd::Shutdown(ack) => {
                    self.teardown().await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return;
                }
                AttemptEnd::Transient | AttemptEnd::Halt => {}
            }
        }
    }

    fn control_end(control: Option<Control>) -> AttemptEnd {
        match control {
            Some(Control::Retry(credentials)) => AttemptEnd::Retry(credentials),
            Some(Control::Shutdown(ack)) => AttemptEnd::Shutdown(Some(ack)),
            // Every handle is gone
            None => AttemptEnd::Shutdown(None),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        log::info!("Connection state: {}", state.label());
        self.state_tx.send_replace(state.clone());
        self.deps.events.emit(WalletEvent::ConnectionState(state));
    }

    fn surface(&self, err: &WalletError) {
        log::error!("{}", err);
        self.set_state(ConnectionState::error(err));
        self.deps.events.emit(WalletEvent::Error(ErrorEvent::from(err)));
    }

    fn fail(&self, err: WalletError) -> AttemptEnd {
        self.surface(&err);
        if err.requires_user_action() {
            AttemptEnd::Halt
        } else {
            AttemptEnd::Transient
        }
    }

    /// One connection attempt: optional launch, then polling until the
    /// attempt fails or the caller intervenes
    async fn attempt(&mut self) -> AttemptEnd {
        let rpc = match (self.deps.rpc_factory)(&self.endpoint) {
            Ok(rpc) => rpc,
            Err(e) => return self.fail(e),
        };
        self.rpc_tx.send_replace(Some(rpc.clone()));

        if let Some(plan) = self.launch.clone() {
            if !self.launched {
                if let Some(end) = self.launch_daemon(&plan).await {
                    return end;
                }
            }
        }

        self.set_state(ConnectionState::WaitingForDaemon);
        self.poll(rpc).await
    }

    async fn launch_daemon(&mut self, plan: &LaunchPlan) -> Option<AttemptEnd> {
        let launcher = match &self.deps.launcher {
            Some(launcher) => launcher.clone(),
            None => {
                return Some(self.fail(WalletError::Configuration(
                    "embedded node requested but no launcher is available".to_string(),
                )))
            }
        };

        self.set_state(ConnectionState::Launching);
        match launcher.launch(plan).await {
            Ok(outcome) => {
                log::info!("Embedded node up: {:?}", outcome);
                self.launched = true;
                None
            }
            // Still starting: keep polling it as a waiting daemon
            Err(WalletError::NodeBusy(msg)) => {
                log::warn!("{}", msg);
                self.launched = true;
                None
            }
            Err(e) => Some(self.fail(e)),
        }
    }

    async fn poll(&mut self, rpc: Arc<dyn NodeRpc>) -> AttemptEnd {
        let mut failures = 0u32;
        let mut zero_peer_ticks = 0u32;
        let mut version_checked = false;
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                control = self.control_rx.recv() => return Self::control_end(control),
            }

            let status = match rpc.sync_status().await {
                Ok(status) => status,
                Err(RpcError::AuthenticationFailed) => {
                    return self.fail(RpcError::AuthenticationFailed.into());
                }
                Err(RpcError::NodeBusy(msg)) => {
                    // Warm-up is expected and never counts as a failure
                    log::debug!("Node warming up: {}", msg);
                    self.set_state(ConnectionState::WaitingForDaemon);
                    continue;
                }
                Err(e) => {
                    failures += 1;
                    log::debug!("Status poll failed ({}/{}): {}", failures, self.config.failure_threshold, e);
                    if failures >= self.config.failure_threshold {
                        return self.fail(e.into());
                    }
                    continue;
                }
            };
            failures = 0;

            if !version_checked {
                version_checked = true;
                self.spawn_version_check(&status.version_string);
            }

            let was_connected = *self.state_tx.borrow() == ConnectionState::Connected;
            let synced = status.is_synced(self.config.sync_tolerance);
            let next = if synced && (status.peer_count > 0 || was_connected) {
                ConnectionState::Connected
            } else {
                ConnectionState::Syncing
            };

            if next == ConnectionState::Connected && status.peer_count == 0 {
                zero_peer_ticks += 1;
                if zero_peer_ticks == self.config.no_peers_ticks {
                    log::warn!("Node has no peer connections");
                    self.deps.events.emit(WalletEvent::NoPeers);
                }
            } else {
                zero_peer_ticks = 0;
            }

            if next == ConnectionState::Connected {
                self.reached_connected = true;
            }
            self.status_tx.send_replace(Some(status.clone()));
            self.set_state(next);
            self.deps.events.emit(WalletEvent::SyncStatus(status));
        }
    }

    /// Compare the node version with the release feed, off the polling path
    fn spawn_version_check(&self, node_version: &str) {
        let Some(feed) = self.deps.release_feed.clone() else {
            return;
        };
        let events = self.deps.events.clone();
        let node_version = node_version.to_string();

        tokio::spawn(async move {
            match check_for_update(feed.as_ref(), &node_version).await {
                Ok(info) if info.available => {
                    log::info!(
                        "Node version {} is older than latest release {}",
                        info.current_version,
                        info.latest_version
                    );
                    events.emit(WalletEvent::VersionMismatch {
                        node_version: info.current_version,
                        latest_version: info.latest_version,
                    });
                }
                Ok(_) => {}
                Err(e) => log::warn!("Version check failed: {}", e),
            }
        });
    }

    async fn teardown(&mut self) {
        if self.launched {
            let rpc = self.rpc_tx.borrow().clone();
            if let (Some(launcher), Some(rpc)) = (self.deps.launcher.clone(), rpc) {
                if let Err(e) = launcher.stop(rpc.as_ref(), self.config.stop_grace).await {
                    log::warn!("Failed to stop embedded node: {}", e);
                }
            }
            self.launched = false;
        }
        self.rpc_tx.send_replace(None);
        self.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;
    use crate::node::config::{AuthScheme, Network};
    use crate::node::manager::LaunchOutcome;
    use crate::node::rpc::mock::MockNode;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn endpoint() -> NodeEndpoint {
        NodeEndpoint {
            host: "127.0.0.1".into(),
            port: 18031,
            auth: AuthScheme::UserPassword {
                user: "old".into(),
                password: "old".into(),
            },
            use_tor: false,
        }
    }

    fn info(blocks: u64, peers: u64) -> serde_json::Value {
        json!({"blocks": blocks, "connections": peers, "build": "v3.6.0", "testnet": false})
    }

    fn config() -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_secs(1),
            ..Default::default()
        }
    }

    struct Harness {
        node: Arc<MockNode>,
        endpoints: Arc<Mutex<Vec<NodeEndpoint>>>,
        deps: SessionDeps,
        events: UnboundedReceiver<WalletEvent>,
    }

    fn harness() -> Harness {
        let node = Arc::new(MockNode::new());
        node.respond("getblockchaininfo", Ok(json!({"headers": 1000, "estimatedheight": 1000})));
        let endpoints = Arc::new(Mutex::new(Vec::new()));
        let (events, rx) = ChannelSink::shared();

        let factory_node = node.clone();
        let seen = endpoints.clone();
        let rpc_factory: RpcFactory = Arc::new(move |endpoint: &NodeEndpoint| {
            seen.lock().unwrap().push(endpoint.clone());
            Ok(factory_node.clone() as Arc<dyn NodeRpc>)
        });

        Harness {
            node,
            endpoints,
            deps: SessionDeps {
                rpc_factory,
                launcher: None,
                release_feed: None,
                events,
            },
            events: rx,
        }
    }

    /// Collect events until `stop` matches one
    async fn collect_until(
        rx: &mut UnboundedReceiver<WalletEvent>,
        stop: impl Fn(&WalletEvent) -> bool,
    ) -> Vec<WalletEvent> {
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = stop(&event);
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    fn states(events: &[WalletEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                WalletEvent::ConnectionState(state) => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_then_syncing_then_connected() {
        let mut h = harness();
        h.node.script(
            "getinfo",
            vec![
                Err(RpcError::Unreachable("connection refused".into())),
                Err(RpcError::NodeBusy("Loading block index...".into())),
                Ok(info(500, 8)),
            ],
        );
        h.node.respond("getinfo", Ok(info(999, 8)));

        let handle = connect(endpoint(), None, config(), h.deps.clone());
        let events = collect_until(&mut h.events, |e| {
            *e == WalletEvent::ConnectionState(ConnectionState::Connected)
        })
        .await;

        assert_eq!(
            states(&events),
            vec![
                ConnectionState::WaitingForDaemon,
                ConnectionState::Syncing,
                ConnectionState::Connected,
            ]
        );
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(handle.sync_status().unwrap().current_block_height, 999);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_halts_until_retry_with_new_credentials() {
        let mut h = harness();
        h.node.script("getinfo", vec![Err(RpcError::AuthenticationFailed)]);
        h.node.respond("getinfo", Ok(info(1000, 3)));

        let handle = connect(endpoint(), None, config(), h.deps.clone());
        let events = collect_until(&mut h.events, |e| matches!(e, WalletEvent::Error(_))).await;
        assert!(matches!(
            handle.state(),
            ConnectionState::Error { kind: crate::error::ErrorKind::Authentication, .. }
        ));
        assert!(states(&events).contains(&ConnectionState::WaitingForDaemon));

        // No automatic reconnect, however long we wait
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.node.count("getinfo"), 1);

        let mut rpc = handle.subscribe_rpc();
        rpc.mark_unchanged();

        handle.retry(Some(Credentials {
            user: "new".into(),
            password: "secret".into(),
        }));
        let events = collect_until(&mut h.events, |e| {
            *e == WalletEvent::ConnectionState(ConnectionState::Connected)
        })
        .await;
        assert_eq!(
            states(&events),
            vec![ConnectionState::WaitingForDaemon, ConnectionState::Connected]
        );

        let endpoints = h.endpoints.lock().unwrap().clone();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(
            endpoints[1].auth,
            AuthScheme::UserPassword { user: "new".into(), password: "secret".into() }
        );
        // Followers of the client see the rebuilt one
        assert!(rpc.has_changed().unwrap());
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_node_reports_error_and_reconnects() {
        let mut h = harness();
        let threshold = config().failure_threshold as usize;
        h.node.script(
            "getinfo",
            (0..threshold)
                .map(|_| Err(RpcError::Unreachable("connection refused".into())))
                .collect(),
        );
        h.node.respond("getinfo", Ok(info(1000, 2)));

        let handle = connect(endpoint(), None, config(), h.deps.clone());
        let events = collect_until(&mut h.events, |e| {
            *e == WalletEvent::ConnectionState(ConnectionState::Connected)
        })
        .await;

        let states = states(&events);
        assert!(matches!(
            states[1],
            ConnectionState::Error { kind: crate::error::ErrorKind::Network, .. }
        ));
        // The new attempt starts from WaitingForDaemon again
        assert_eq!(states[2], ConnectionState::WaitingForDaemon);
        assert_eq!(*states.last().unwrap(), ConnectionState::Connected);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_peers_warning_keeps_state() {
        let mut h = harness();
        h.node.script("getinfo", vec![Ok(info(1000, 4))]);
        h.node.respond("getinfo", Ok(info(1000, 0)));

        let handle = connect(endpoint(), None, config(), h.deps.clone());
        let events = collect_until(&mut h.events, |e| *e == WalletEvent::NoPeers).await;

        assert_eq!(*states(&events).last().unwrap(), ConnectionState::Connected);
        let zero_peer_polls = events
            .iter()
            .filter(|e| matches!(e, WalletEvent::SyncStatus(s) if s.peer_count == 0))
            .count();
        // The warning goes out on the sixth zero-peer poll, before its status event
        assert_eq!(zero_peer_polls, 5);
        assert_eq!(handle.state(), ConnectionState::Connected);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_restarts_after_reaching_connected() {
        let mut h = harness();
        let threshold = config().failure_threshold as usize;
        let outage = || {
            (0..threshold).map(|_| Err::<serde_json::Value, _>(RpcError::Unreachable("connection reset".into())))
        };
        let mut script = vec![Ok(info(1000, 4))];
        script.extend(outage());
        script.push(Ok(info(1000, 4)));
        script.extend(outage());
        h.node.script("getinfo", script);
        h.node.respond("getinfo", Ok(info(1000, 4)));

        let handle = connect(endpoint(), None, config(), h.deps.clone());
        let mut gaps = Vec::new();
        let mut failed_at = None;
        while gaps.len() < 2 {
            match h.events.recv().await {
                Some(WalletEvent::ConnectionState(ConnectionState::Error { .. })) => {
                    failed_at = Some(tokio::time::Instant::now());
                }
                Some(WalletEvent::ConnectionState(ConnectionState::WaitingForDaemon)) => {
                    if let Some(at) = failed_at.take() {
                        gaps.push(at.elapsed());
                    }
                }
                Some(_) => {}
                None => break,
            }
        }

        // Each outage followed a Connected stretch, so both wait the base delay
        let base = config().reconnect.base_delay;
        assert_eq!(gaps, vec![base, base]);
        handle.shutdown().await;
    }

    struct FakeLauncher {
        launched: Mutex<Vec<LaunchPlan>>,
        stopped: Mutex<u32>,
        /// Returned by the next launch instead of success
        refusal: Mutex<Option<WalletError>>,
    }

    impl FakeLauncher {
        fn new() -> Self {
            Self {
                launched: Mutex::new(Vec::new()),
                stopped: Mutex::new(0),
                refusal: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(&self, plan: &LaunchPlan) -> Result<LaunchOutcome, WalletError> {
            self.launched.lock().unwrap().push(plan.clone());
            if let Some(err) = self.refusal.lock().unwrap().take() {
                return Err(err);
            }
            Ok(LaunchOutcome::Spawned { pid: Some(4242) })
        }

        async fn stop(&self, rpc: &dyn NodeRpc, _grace: Duration) -> Result<(), WalletError> {
            *self.stopped.lock().unwrap() += 1;
            rpc.stop().await.map_err(WalletError::from)
        }
    }

    fn plan() -> LaunchPlan {
        LaunchPlan {
            daemon_path: "/opt/hush/hushd".into(),
            data_dir: "/tmp/hush".into(),
            conf_path: "/tmp/hush/HUSH3.conf".into(),
            network: Network::Mainnet,
            rpc_port: 18031,
            use_tor: false,
            extra_args: vec![],
            startup_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_launch_halts_until_retry() {
        let mut h = harness();
        h.node.respond("getinfo", Ok(info(1000, 5)));
        let launcher = Arc::new(FakeLauncher::new());
        *launcher.refusal.lock().unwrap() = Some(WalletError::Configuration(
            "HUSH3.conf sets daemon=1; remove it to let the wallet start the node".into(),
        ));
        h.deps.launcher = Some(launcher.clone());

        let handle = connect(endpoint(), Some(plan()), config(), h.deps.clone());
        collect_until(&mut h.events, |e| matches!(e, WalletEvent::Error(_))).await;
        assert!(matches!(
            handle.state(),
            ConnectionState::Error { kind: crate::error::ErrorKind::Configuration, .. }
        ));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
        assert_eq!(h.node.count("getinfo"), 0);

        handle.retry(None);
        collect_until(&mut h.events, |e| {
            *e == WalletEvent::ConnectionState(ConnectionState::Connected)
        })
        .await;
        assert_eq!(launcher.launched.lock().unwrap().len(), 2);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_precedes_waiting_and_shutdown_stops_node() {
        let mut h = harness();
        h.node.respond("getinfo", Ok(info(1000, 5)));
        h.node.respond("stop", Ok(json!("Hush server stopping")));
        let launcher = Arc::new(FakeLauncher::new());
        h.deps.launcher = Some(launcher.clone());

        let handle = connect(endpoint(), Some(plan()), config(), h.deps.clone());
        let events = collect_until(&mut h.events, |e| {
            *e == WalletEvent::ConnectionState(ConnectionState::Connected)
        })
        .await;
        assert_eq!(
            states(&events),
            vec![
                ConnectionState::Launching,
                ConnectionState::WaitingForDaemon,
                ConnectionState::Connected,
            ]
        );

        handle.shutdown().await;
        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
        assert_eq!(*launcher.stopped.lock().unwrap(), 1);
        assert_eq!(h.node.count("stop"), 1);

        let events = collect_until(&mut h.events, |e| {
            *e == WalletEvent::ConnectionState(ConnectionState::Disconnected)
        })
        .await;
        assert!(!events.is_empty());
    }

    struct FixedFeed;

    #[async_trait]
    impl ReleaseFeed for FixedFeed {
        async fn latest_version(&self) -> Result<String, String> {
            Ok("v3.7.0".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_mismatch_is_informational() {
        let mut h = harness();
        h.node.respond("getinfo", Ok(info(1000, 5)));
        h.deps.release_feed = Some(Arc::new(FixedFeed));

        let handle = connect(endpoint(), None, config(), h.deps.clone());
        let events = collect_until(&mut h.events, |e| matches!(e, WalletEvent::VersionMismatch { .. })).await;

        assert!(events.contains(&WalletEvent::VersionMismatch {
            node_version: "3.6.0".into(),
            latest_version: "3.7.0".into(),
        }));
        assert!(!handle.state().is_error());
        handle.shutdown().await;
    }
}
