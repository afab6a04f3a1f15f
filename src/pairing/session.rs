//! Pairing session
//!
//! One task owns the link to the companion device. It walks the transport
//! chain (direct, then relayed), checks the peer's `Hello`, keeps the link
//! alive with heartbeats and routes requests both ways. The current
//! [`PairingSnapshot`] is published through a watch channel and as events.

use super::connection_string::ConnectionString;
use super::transport::{PairingLink, PairingTransport, PairingTransports};
use super::{PairingMessage, PairingRequest, PairingResponse, PairingSnapshot, PairingState, TransportKind};
use crate::backoff::BackoffPolicy;
use crate::error::WalletError;
use crate::events::{ErrorEvent, SharedEventSink, WalletEvent};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct PairingConfig {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Missed intervals tolerated before the link counts as lost
    pub heartbeat_grace: u32,
    /// Upper bound for the whole direct attempt, handshake included
    pub direct_timeout: Duration,
    pub request_timeout: Duration,
    /// Skip the direct transport entirely
    pub relay_only: bool,
    /// Re-run the transport chain after a lost link. `None` stays
    /// disconnected until the caller starts a new session.
    pub reconnect: Option<BackoffPolicy>,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_grace: 3,
            direct_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
            relay_only: false,
            reconnect: Some(BackoffPolicy::network()),
        }
    }
}

impl PairingConfig {
    fn silence_limit(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_grace
    }
}

/// Request initiated by the companion device. Answer it with
/// [`PairingHandle::respond`].
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRequest {
    pub id: u64,
    pub body: PairingRequest,
}

enum Command {
    Request {
        body: PairingRequest,
        reply: oneshot::Sender<Result<PairingResponse, WalletError>>,
    },
    Respond {
        id: u64,
        body: PairingResponse,
    },
    Disconnect(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct PairingHandle {
    snapshot: watch::Receiver<PairingSnapshot>,
    commands: mpsc::UnboundedSender<Command>,
    request_timeout: Duration,
    task: Arc<JoinHandle<()>>,
}

impl PairingHandle {
    pub fn snapshot(&self) -> PairingSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PairingSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.borrow().is_connected()
    }

    /// Send a request to the device and wait for its answer. Fails with
    /// `NotConnected` straight away unless a link is up; nothing is queued.
    pub async fn request(&self, body: PairingRequest) -> Result<PairingResponse, WalletError> {
        if !self.is_connected() {
            return Err(WalletError::NotConnected);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Request { body, reply: reply_tx })
            .map_err(|_| WalletError::NotConnected)?;

        tokio::time::timeout(self.request_timeout, reply_rx)
            .await
            .map_err(|_| WalletError::Network("paired device did not answer in time".to_string()))?
            .unwrap_or(Err(WalletError::NotConnected))
    }

    pub fn respond(&self, id: u64, body: PairingResponse) -> Result<(), WalletError> {
        if !self.is_connected() {
            return Err(WalletError::NotConnected);
        }
        self.commands
            .send(Command::Respond { id, body })
            .map_err(|_| WalletError::NotConnected)
    }

    /// End the session. The snapshot stays readable afterwards.
    pub async fn disconnect(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start pairing with the device described by `conn`. Peer requests arrive
/// on the returned receiver.
pub fn start(
    conn: ConnectionString,
    config: PairingConfig,
    transports: PairingTransports,
    events: SharedEventSink,
) -> (PairingHandle, mpsc::UnboundedReceiver<PeerRequest>) {
    let (snapshot_tx, snapshot_rx) = watch::channel(PairingSnapshot::new(conn.device_id.clone()));
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let request_timeout = config.request_timeout;

    let session = Session {
        conn,
        config,
        transports,
        events,
        snapshot_tx,
        commands: command_rx,
        peer_tx,
        pending: HashMap::new(),
        next_id: 1,
    };
    let task = tokio::spawn(session.run());

    let handle = PairingHandle {
        snapshot: snapshot_rx,
        commands: command_tx,
        request_timeout,
        task: Arc::new(task),
    };
    (handle, peer_rx)
}

enum LinkEnd {
    Lost(String),
    Disconnect(oneshot::Sender<()>),
}

struct Session {
    conn: ConnectionString,
    config: PairingConfig,
    transports: PairingTransports,
    events: SharedEventSink,
    snapshot_tx: watch::Sender<PairingSnapshot>,
    commands: mpsc::UnboundedReceiver<Command>,
    peer_tx: mpsc::UnboundedSender<PeerRequest>,
    pending: HashMap<u64, oneshot::Sender<Result<PairingResponse, WalletError>>>,
    next_id: u64,
}

impl Session {
    async fn run(mut self) {
        let mut attempt = 0u32;
        loop {
            self.set_state(PairingState::Connecting, None);

            match self.establish().await {
                Ok((link, kind)) => {
                    attempt = 0;
                    self.snapshot_tx.send_modify(|s| s.last_seen = Some(Utc::now()));
                    self.set_state(PairingState::Connected, Some(kind));

                    match self.serve(link).await {
                        LinkEnd::Disconnect(ack) => {
                            self.close();
                            let _ = ack.send(());
                            return;
                        }
                        LinkEnd::Lost(reason) => {
                            log::warn!("Pairing link to {} lost: {}", self.conn.device_id, reason);
                            self.close();
                        }
                    }
                }
                Err(err) => {
                    log::warn!("Pairing with {} failed: {}", self.conn.device_id, err);
                    self.set_state(PairingState::Disconnected, None);
                    self.events.emit(WalletEvent::Error(ErrorEvent::from(&err)));
                }
            }

            let delay = match &self.config.reconnect {
                Some(policy) if policy.allows(attempt) => Some(policy.delay_for(attempt)),
                _ => None,
            };
            attempt = attempt.saturating_add(1);

            if !self.idle(delay).await {
                return;
            }
        }
    }

    /// Direct first unless disabled, then the relay. A direct failure is
    /// only logged.
    async fn establish(&mut self) -> Result<(PairingLink, TransportKind), WalletError> {
        if !self.config.relay_only && self.conn.direct.is_some() {
            let direct = self.transports.direct.clone();
            match tokio::time::timeout(self.config.direct_timeout, self.open_and_greet(direct.as_ref())).await {
                Ok(Ok(link)) => return Ok((link, TransportKind::Direct)),
                Ok(Err(e)) => log::info!("Direct pairing unavailable, trying relay: {}", e),
                Err(_) => log::info!("Direct pairing timed out, trying relay"),
            }
        }

        if self.conn.relay.is_none() {
            return Err(WalletError::Network(
                "direct pairing failed and no relay is configured".to_string(),
            ));
        }
        let relay = self.transports.relay.clone();
        let link = self.open_and_greet(relay.as_ref()).await?;
        Ok((link, TransportKind::Relayed))
    }

    async fn open_and_greet(&self, transport: &dyn PairingTransport) -> Result<PairingLink, WalletError> {
        let mut link = transport.open(&self.conn).await?;

        let first = tokio::time::timeout(self.config.handshake_timeout, link.inbound.recv())
            .await
            .map_err(|_| WalletError::Network("paired device did not say hello in time".to_string()))?;

        match first {
            Some(PairingMessage::Hello { device_id }) if device_id == self.conn.device_id => {
                let _ = link.outbound.send(PairingMessage::Hello { device_id });
                log::info!("Paired with {} over {} link", self.conn.device_id, transport.kind().as_str());
                Ok(link)
            }
            Some(PairingMessage::Hello { device_id }) => Err(WalletError::Authentication(format!(
                "unexpected device '{}' answered the pairing",
                device_id
            ))),
            Some(other) => Err(WalletError::Malformed(format!("expected hello, got {:?}", other))),
            None => Err(WalletError::Network("pairing link closed during handshake".to_string())),
        }
    }

    /// Run a connected link until it is lost or the caller disconnects
    async fn serve(&mut self, mut link: PairingLink) -> LinkEnd {
        let interval = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        // Pushed back by every inbound frame
        let silence = tokio::time::sleep(self.config.silence_limit());
        tokio::pin!(silence);

        loop {
            tokio::select! {
                message = link.inbound.recv() => {
                    let Some(message) = message else {
                        return LinkEnd::Lost("link closed".to_string());
                    };
                    silence.as_mut().reset(Instant::now() + self.config.silence_limit());
                    self.snapshot_tx.send_modify(|s| s.last_seen = Some(Utc::now()));
                    self.handle_message(message);
                }
                _ = &mut silence => return LinkEnd::Lost("heartbeat missed".to_string()),
                _ = ticker.tick() => {
                    self.pending.retain(|_, reply| !reply.is_closed());
                    if link.outbound.send(PairingMessage::Heartbeat).is_err() {
                        return LinkEnd::Lost("link closed".to_string());
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Request { body, reply }) => {
                        let id = self.next_id;
                        self.next_id += 1;
                        if link.outbound.send(PairingMessage::Request { id, body }).is_err() {
                            let _ = reply.send(Err(WalletError::NotConnected));
                            return LinkEnd::Lost("link closed".to_string());
                        }
                        self.pending.insert(id, reply);
                    }
                    Some(Command::Respond { id, body }) => {
                        if link.outbound.send(PairingMessage::Response { id, body }).is_err() {
                            return LinkEnd::Lost("link closed".to_string());
                        }
                    }
                    Some(Command::Disconnect(ack)) => return LinkEnd::Disconnect(ack),
                    None => {
                        let (ack, _) = oneshot::channel();
                        return LinkEnd::Disconnect(ack);
                    }
                },
            }
        }
    }

    fn handle_message(&mut self, message: PairingMessage) {
        match message {
            PairingMessage::Heartbeat | PairingMessage::Hello { .. } => {}
            PairingMessage::Request { id, body } => {
                log::info!("Request {} from paired device", id);
                let _ = self.peer_tx.send(PeerRequest { id, body });
            }
            PairingMessage::Response { id, body } => match self.pending.remove(&id) {
                Some(reply) => {
                    let _ = reply.send(Ok(body));
                }
                None => log::debug!("Dropping response to unknown request {}", id),
            },
        }
    }

    /// Wait out a reconnect delay while still answering commands. `None`
    /// waits until the caller disconnects. Returns false once it has.
    async fn idle(&mut self, delay: Option<Duration>) -> bool {
        let sleep = tokio::time::sleep(delay.unwrap_or_default());
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep, if delay.is_some() => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Request { reply, .. }) => {
                        let _ = reply.send(Err(WalletError::NotConnected));
                    }
                    Some(Command::Respond { .. }) => {}
                    Some(Command::Disconnect(ack)) => {
                        let _ = ack.send(());
                        return false;
                    }
                    None => return false,
                },
            }
        }
    }

    /// Drop to Disconnected, keeping last_seen, and fail outstanding requests
    fn close(&mut self) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(WalletError::NotConnected));
        }
        self.set_state(PairingState::Disconnected, None);
    }

    fn set_state(&self, state: PairingState, transport: Option<TransportKind>) {
        self.snapshot_tx.send_modify(|s| {
            s.state = state;
            s.transport = transport;
        });
        let snapshot = self.snapshot_tx.borrow().clone();
        log::debug!("Pairing state for {}: {:?}", snapshot.device_id, snapshot.state);
        self.events.emit(WalletEvent::PairingState(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use url::Url;

    enum Behavior {
        Fail,
        Hang,
        Links(Mutex<VecDeque<PairingLink>>),
    }

    struct FakeTransport {
        kind: TransportKind,
        behavior: Behavior,
        opened: AtomicUsize,
    }

    impl FakeTransport {
        fn new(kind: TransportKind, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                kind,
                behavior,
                opened: AtomicUsize::new(0),
            })
        }

        /// Transport handing out links whose peer ends the test drives
        fn with_peers(kind: TransportKind, count: usize) -> (Arc<Self>, Vec<PairingLink>) {
            let mut ours = VecDeque::new();
            let mut peers = Vec::new();
            for _ in 0..count {
                let (a, b) = PairingLink::pair();
                ours.push_back(a);
                peers.push(b);
            }
            (Self::new(kind, Behavior::Links(Mutex::new(ours))), peers)
        }
    }

    #[async_trait]
    impl PairingTransport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn open(&self, _conn: &ConnectionString) -> Result<PairingLink, WalletError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Fail => Err(WalletError::Network("no route to host".into())),
                Behavior::Hang => std::future::pending().await,
                Behavior::Links(links) => links
                    .lock()
                    .unwrap()
                    .pop_front()
                    .ok_or_else(|| WalletError::Network("no more links".into())),
            }
        }
    }

    fn conn() -> ConnectionString {
        ConnectionString {
            device_id: "phone-1".into(),
            hint: TransportKind::Direct,
            direct: Some(Url::parse("ws://192.168.1.20:8237/").unwrap()),
            relay: Some(Url::parse("wss://wormhole.example.org/pair").unwrap()),
            secret: "00112233445566778899aabbccddeeff".into(),
        }
    }

    fn hello(peer: &PairingLink) {
        peer.outbound
            .send(PairingMessage::Hello {
                device_id: "phone-1".into(),
            })
            .unwrap();
    }

    fn no_reconnect() -> PairingConfig {
        PairingConfig {
            reconnect: None,
            ..Default::default()
        }
    }

    async fn wait_for(handle: &PairingHandle, state: PairingState) -> PairingSnapshot {
        let mut rx = handle.subscribe();
        let snapshot = rx.wait_for(|s| s.state == state).await.unwrap().clone();
        snapshot
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_relay_when_direct_hangs() {
        let direct = FakeTransport::new(TransportKind::Direct, Behavior::Hang);
        let (relay, peers) = FakeTransport::with_peers(TransportKind::Relayed, 1);
        hello(&peers[0]);

        let (sink, mut events) = ChannelSink::shared();
        let transports = PairingTransports {
            direct: direct.clone(),
            relay: relay.clone(),
        };
        let (handle, _requests) = start(conn(), no_reconnect(), transports, sink);

        let snapshot = wait_for(&handle, PairingState::Connected).await;
        assert_eq!(snapshot.transport, Some(TransportKind::Relayed));
        assert!(snapshot.last_seen.is_some());
        assert_eq!(direct.opened.load(Ordering::SeqCst), 1);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                WalletEvent::PairingState(s) => states.push(s.state),
                WalletEvent::Error(e) => panic!("direct failure surfaced: {:?}", e),
                _ => {}
            }
        }
        assert_eq!(states, vec![PairingState::Connecting, PairingState::Connected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_silence_disconnects_and_keeps_last_seen() {
        let (direct, mut peers) = FakeTransport::with_peers(TransportKind::Direct, 1);
        let relay = FakeTransport::new(TransportKind::Relayed, Behavior::Fail);
        let mut peer = peers.remove(0);
        hello(&peer);

        let transports = PairingTransports { direct, relay };
        let (handle, _requests) = start(conn(), no_reconnect(), transports, ChannelSink::shared().0);

        let connected = wait_for(&handle, PairingState::Connected).await;
        assert_eq!(connected.transport, Some(TransportKind::Direct));
        let started = Instant::now();

        let lost = wait_for(&handle, PairingState::Disconnected).await;
        // Interval times grace, not a tick later
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));
        assert_eq!(lost.last_seen, connected.last_seen);
        assert_eq!(lost.transport, None);

        // Our hello echo and heartbeats reached the peer
        assert!(matches!(peer.inbound.recv().await, Some(PairingMessage::Hello { .. })));
        assert_eq!(peer.inbound.recv().await, Some(PairingMessage::Heartbeat));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_heartbeat_extends_the_deadline() {
        let (direct, mut peers) = FakeTransport::with_peers(TransportKind::Direct, 1);
        let relay = FakeTransport::new(TransportKind::Relayed, Behavior::Fail);
        let peer = peers.remove(0);
        hello(&peer);

        let transports = PairingTransports { direct, relay };
        let (handle, _requests) = start(conn(), no_reconnect(), transports, ChannelSink::shared().0);
        wait_for(&handle, PairingState::Connected).await;
        let started = Instant::now();

        tokio::time::sleep(Duration::from_secs(20)).await;
        peer.outbound.send(PairingMessage::Heartbeat).unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(handle.is_connected());

        wait_for(&handle, PairingState::Disconnected).await;
        assert!(started.elapsed() >= Duration::from_secs(50));
        assert!(started.elapsed() < Duration::from_secs(51));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_fail_fast_when_not_connected() {
        let direct = FakeTransport::new(TransportKind::Direct, Behavior::Fail);
        let relay = FakeTransport::new(TransportKind::Relayed, Behavior::Fail);
        let (sink, mut events) = ChannelSink::shared();
        let transports = PairingTransports { direct, relay };
        let (handle, _requests) = start(conn(), no_reconnect(), transports, sink);

        let body = PairingRequest::PaymentRequest { uri: "hush:x".into() };
        assert_eq!(handle.request(body.clone()).await, Err(WalletError::NotConnected));

        // Both transports fail, once, and the session settles disconnected
        let error = loop {
            match events.recv().await {
                Some(WalletEvent::Error(e)) => break e,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        };
        assert_eq!(error.kind, crate::error::ErrorKind::Network);
        assert_eq!(handle.snapshot().state, PairingState::Disconnected);
        assert_eq!(handle.request(body).await, Err(WalletError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_response_and_peer_requests() {
        let (direct, mut peers) = FakeTransport::with_peers(TransportKind::Direct, 1);
        let relay = FakeTransport::new(TransportKind::Relayed, Behavior::Fail);
        let mut peer = peers.remove(0);
        hello(&peer);

        let transports = PairingTransports { direct, relay };
        let (handle, mut requests) = start(conn(), no_reconnect(), transports, ChannelSink::shared().0);
        wait_for(&handle, PairingState::Connected).await;

        // Device answers whatever we ask
        tokio::spawn(async move {
            while let Some(message) = peer.inbound.recv().await {
                if let PairingMessage::Request { id, .. } = message {
                    peer.outbound
                        .send(PairingMessage::Response {
                            id,
                            body: PairingResponse::Accepted,
                        })
                        .unwrap();
                    peer.outbound
                        .send(PairingMessage::Request {
                            id: 99,
                            body: PairingRequest::PaymentRequest {
                                uri: "hush:t1abc?amt=1".into(),
                            },
                        })
                        .unwrap();
                }
            }
        });

        let body = PairingRequest::ShareAddress {
            address: "zs1abc".into(),
            label: Some("Savings".into()),
        };
        let response = handle.request(body).await.unwrap();
        assert_eq!(response, PairingResponse::Accepted);

        let inbound = requests.recv().await.unwrap();
        assert_eq!(inbound.id, 99);
        assert!(handle.respond(inbound.id, PairingResponse::Accepted).is_ok());

        handle.disconnect().await;
        assert_eq!(handle.snapshot().state, PairingState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_device_is_rejected() {
        let (direct, peers) = FakeTransport::with_peers(TransportKind::Direct, 1);
        peers[0]
            .outbound
            .send(PairingMessage::Hello {
                device_id: "someone-else".into(),
            })
            .unwrap();
        let mut conn = conn();
        conn.relay = None;

        let relay = FakeTransport::new(TransportKind::Relayed, Behavior::Fail);
        let transports = PairingTransports { direct, relay: relay.clone() };
        let (sink, mut events) = ChannelSink::shared();
        let (handle, _requests) = start(conn, no_reconnect(), transports, sink);

        while let Some(event) = events.recv().await {
            if matches!(event, WalletEvent::Error(_)) {
                break;
            }
        }
        assert_eq!(handle.snapshot().state, PairingState::Disconnected);
        assert_eq!(relay.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_lost_link() {
        let (direct, mut peers) = FakeTransport::with_peers(TransportKind::Direct, 2);
        let relay = FakeTransport::new(TransportKind::Relayed, Behavior::Fail);
        let first = peers.remove(0);
        let second = peers.remove(0);
        hello(&first);
        hello(&second);

        let config = PairingConfig {
            reconnect: Some(BackoffPolicy::new(3, Duration::from_secs(1), Duration::from_secs(4))),
            ..Default::default()
        };
        let transports = PairingTransports { direct: direct.clone(), relay };
        let (handle, _requests) = start(conn(), config, transports, ChannelSink::shared().0);

        wait_for(&handle, PairingState::Connected).await;
        drop(first);
        wait_for(&handle, PairingState::Disconnected).await;
        wait_for(&handle, PairingState::Connected).await;
        assert_eq!(direct.opened.load(Ordering::SeqCst), 2);

        handle.disconnect().await;
        drop(second);
    }
}
