//! Transport manager: discovery sessions, per-device connection lifecycle, chunked sends,
//! broadcast, and challenge-response authentication over any [`Radio`].
//!
//! One background task consumes radio events (discoveries, inbound links, chunk frames,
//! drops) and owns reassembly. Callers drive the outbound side through async methods.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::challenge::{
    decode_signature, encode_signature, respond, Challenge, ChallengeError, ChallengeVerifier,
    DEFAULT_CHALLENGE_VALIDITY,
};
use crate::chunk::{MessageCodec, Reassembly, DEFAULT_CHUNK_SIZE, DEFAULT_REASSEMBLY_TIMEOUT};
use crate::error::LinkError;
use crate::identity::{DeviceIdentity, PublicKey};
use crate::protocol::{LinkCommand, Message, MessageKind};
use crate::radio::{DiscoveredDevice, Radio, RadioEvent};
use crate::trust::SharedTrustStore;
use crate::wire::{encode_frame, FrameBuffer, DEFAULT_WRITE_SIZE};

/// Tunables for one transport instance.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Message payload bytes per chunk.
    pub max_chunk_size: usize,
    /// Largest single radio write (link MTU). Encoded frames are cut to fit.
    pub max_write_size: usize,
    /// Pause between consecutive chunk writes to one device.
    pub inter_chunk_delay: Duration,
    pub connect_timeout: Duration,
    pub challenge_validity: Duration,
    pub reassembly_timeout: Duration,
    /// Refuse non-command sends to links that have not passed `authenticate`.
    pub require_verified_peers: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            max_write_size: DEFAULT_WRITE_SIZE,
            inter_chunk_delay: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(10),
            challenge_validity: DEFAULT_CHALLENGE_VALIDITY,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            require_verified_peers: false,
        }
    }
}

/// Per-device link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Discovered,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Disconnected, Discovered)
                | (Disconnected, Connecting)
                | (Discovered, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

/// Snapshot of one known device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub device_id: String,
    pub name: Option<String>,
    pub state: ConnectionState,
    /// Key proven by the last successful `authenticate` on this link.
    pub verified_key: Option<PublicKey>,
    pub last_activity_at: Instant,
}

/// An application message received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub device_id: String,
    pub message: Message,
    /// Set when the link had been authenticated at delivery time.
    pub verified_key: Option<PublicKey>,
}

pub type IncomingMessages = mpsc::UnboundedReceiver<Incoming>;

/// Devices found by one scan session, each id at most once. Ends on `stop_scan`;
/// dropping it lets the next `start_scan` open a fresh session.
pub struct DiscoveryStream {
    rx: mpsc::UnboundedReceiver<DiscoveredDevice>,
}

impl Stream for DiscoveryStream {
    type Item = DiscoveredDevice;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct Link {
    name: Option<String>,
    state: ConnectionState,
    verified_key: Option<PublicKey>,
    last_activity_at: Instant,
    /// Serializes sends so chunks of two messages never interleave.
    send_lock: Arc<Mutex<()>>,
    /// Flipped on disconnect; in-flight sends watch it.
    closed: watch::Sender<bool>,
}

impl Link {
    fn new(name: Option<String>, state: ConnectionState) -> Self {
        Self {
            name,
            state,
            verified_key: None,
            last_activity_at: Instant::now(),
            send_lock: Arc::new(Mutex::new(())),
            closed: watch::channel(false).0,
        }
    }

    fn advance(&mut self, device_id: &str, to: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(to),
            "{:?} -> {:?}",
            self.state,
            to
        );
        tracing::debug!(device_id, from = ?self.state, to = ?to, "link state");
        self.state = to;
        self.last_activity_at = Instant::now();
    }

    /// Fresh link session: new cancellation flag, no proven key.
    fn reopen(&mut self) {
        self.verified_key = None;
        self.closed = watch::channel(false).0;
    }

    fn info(&self, device_id: &str) -> ConnectionInfo {
        ConnectionInfo {
            device_id: device_id.to_string(),
            name: self.name.clone(),
            state: self.state,
            verified_key: self.verified_key,
            last_activity_at: self.last_activity_at,
        }
    }
}

struct ScanSession {
    tx: mpsc::UnboundedSender<DiscoveredDevice>,
    seen: HashSet<String>,
}

type AuthReply = (PublicKey, Vec<u8>);

struct Shared {
    radio: Arc<dyn Radio>,
    identity: Arc<DeviceIdentity>,
    trust: SharedTrustStore,
    config: TransportConfig,
    sender: String,
    links: Mutex<HashMap<String, Link>>,
    scan: Mutex<Option<ScanSession>>,
    /// Partial frames per peer.
    inbound: Mutex<HashMap<String, FrameBuffer>>,
    codec: Mutex<MessageCodec>,
    verifier: Mutex<ChallengeVerifier>,
    /// nonce -> (device asked, reply slot)
    pending_auth: Mutex<HashMap<String, (String, oneshot::Sender<AuthReply>)>>,
    incoming: mpsc::UnboundedSender<Incoming>,
}

/// Connection and messaging front end. Dropping it stops event processing.
pub struct TransportManager {
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Resolves once the link's closed flag is set or its sender is gone.
async fn closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

impl TransportManager {
    /// Attach to `radio` and start processing its events. Inbound application messages
    /// arrive on the returned receiver.
    pub fn start(
        radio: Arc<dyn Radio>,
        identity: Arc<DeviceIdentity>,
        trust: SharedTrustStore,
        config: TransportConfig,
    ) -> (Self, IncomingMessages) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        radio.on_receive(event_tx);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            sender: identity.public_key().fingerprint(),
            codec: Mutex::new(MessageCodec::new(config.reassembly_timeout)),
            verifier: Mutex::new(ChallengeVerifier::new(config.challenge_validity)),
            radio,
            identity,
            trust,
            config,
            links: Mutex::new(HashMap::new()),
            scan: Mutex::new(None),
            inbound: Mutex::new(HashMap::new()),
            pending_auth: Mutex::new(HashMap::new()),
            incoming: incoming_tx,
        });
        let pump_shared = shared.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                pump_shared.handle_event(event).await;
            }
            tracing::debug!("radio event stream closed");
        });
        (Self { shared, pump }, incoming_rx)
    }

    /// Sender id stamped on link commands (this device's key fingerprint).
    pub fn sender_id(&self) -> &str {
        &self.shared.sender
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Begin a scan session. `Ok(None)` when one is already active. Idle entries left by
    /// earlier sessions are forgotten; the new session reports every device it hears.
    pub async fn start_scan(&self) -> Result<Option<DiscoveryStream>, LinkError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let abandoned = {
            let mut scan = self.shared.scan.lock().await;
            let abandoned = match scan.as_ref() {
                Some(session) if !session.tx.is_closed() => {
                    tracing::debug!("scan already active");
                    return Ok(None);
                }
                Some(_) => true,
                None => false,
            };
            *scan = Some(ScanSession {
                tx,
                seen: HashSet::new(),
            });
            abandoned
        };
        if abandoned {
            tracing::debug!("previous discovery stream was dropped; restarting scan");
            let _ = self.shared.radio.stop_scan().await;
        }
        self.shared.links.lock().await.retain(|_, link| {
            !matches!(
                link.state,
                ConnectionState::Discovered | ConnectionState::Disconnected
            )
        });
        if let Err(e) = self.shared.radio.start_scan().await {
            *self.shared.scan.lock().await = None;
            tracing::warn!(error = %e, "scan failed to start");
            return Err(e);
        }
        tracing::info!("scan started");
        Ok(Some(DiscoveryStream { rx }))
    }

    /// End the scan session, if any. Connections are unaffected.
    pub async fn stop_scan(&self) -> Result<(), LinkError> {
        if self.shared.scan.lock().await.take().is_none() {
            return Ok(());
        }
        tracing::info!("scan stopped");
        self.shared.radio.stop_scan().await
    }

    pub async fn is_scanning(&self) -> bool {
        self.shared
            .scan
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| !session.tx.is_closed())
    }

    /// Open a link. Already-connected devices succeed immediately. A failed attempt leaves
    /// the device `Disconnected`; ids that were never discovered are forgotten.
    pub async fn connect(&self, device_id: &str) -> Result<(), LinkError> {
        let (mut cancel_rx, known) = {
            let mut links = self.shared.links.lock().await;
            let known = links.contains_key(device_id);
            let link = links
                .entry(device_id.to_string())
                .or_insert_with(|| Link::new(None, ConnectionState::Disconnected));
            match link.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Disconnecting => {
                    return Err(LinkError::ConnectionFailed {
                        device_id: device_id.to_string(),
                        reason: format!("link is {:?}", link.state),
                    });
                }
                ConnectionState::Disconnected | ConnectionState::Discovered => {
                    link.reopen();
                    link.advance(device_id, ConnectionState::Connecting);
                    (link.closed.subscribe(), known)
                }
            }
        };
        self.shared.inbound.lock().await.remove(device_id);

        let attempt = tokio::time::timeout(
            self.shared.config.connect_timeout,
            self.shared.radio.connect(device_id),
        );
        let result = tokio::select! {
            _ = closed(&mut cancel_rx) => Err(LinkError::Cancelled(device_id.to_string())),
            outcome = attempt => match outcome {
                Ok(result) => result,
                Err(_) => {
                    let _ = self.shared.radio.disconnect(device_id).await;
                    Err(LinkError::ConnectTimeout(device_id.to_string()))
                }
            },
        };

        let cancelled = *cancel_rx.borrow();
        let connected = {
            let mut links = self.shared.links.lock().await;
            let mut connected = false;
            if let Some(link) = links
                .get_mut(device_id)
                .filter(|l| l.state == ConnectionState::Connecting && !cancelled)
            {
                if result.is_ok() {
                    link.advance(device_id, ConnectionState::Connected);
                    connected = true;
                } else {
                    link.advance(device_id, ConnectionState::Disconnected);
                }
            }
            let idle = links
                .get(device_id)
                .is_some_and(|l| l.state == ConnectionState::Disconnected);
            if !connected && !known && idle {
                links.remove(device_id);
            }
            connected
        };
        match result {
            Ok(()) if connected => {
                tracing::info!(device_id, "connected");
                Ok(())
            }
            Err(e) if !cancelled => {
                tracing::warn!(device_id, error = %e, "connect failed");
                Err(e)
            }
            _ => {
                let _ = self.shared.radio.disconnect(device_id).await;
                tracing::info!(device_id, "connect attempt cancelled");
                Err(LinkError::Cancelled(device_id.to_string()))
            }
        }
    }

    /// Close a link, cancelling any send in flight. A pending `connect` is abandoned and
    /// fails with `Cancelled`. No-op for devices that are neither connected nor connecting.
    pub async fn disconnect(&self, device_id: &str) -> Result<(), LinkError> {
        {
            let mut links = self.shared.links.lock().await;
            match links.get_mut(device_id) {
                Some(link) if link.state == ConnectionState::Connected => {
                    link.advance(device_id, ConnectionState::Disconnecting);
                    link.closed.send_replace(true);
                }
                Some(link) if link.state == ConnectionState::Connecting => {
                    link.closed.send_replace(true);
                    link.advance(device_id, ConnectionState::Disconnected);
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
        let result = self.shared.radio.disconnect(device_id).await;
        self.shared.finish_disconnect(device_id).await;
        tracing::info!(device_id, "disconnected");
        result
    }

    /// Send one message. Chunks go out in index order, paced by `inter_chunk_delay`.
    pub async fn send(&self, device_id: &str, message: &Message) -> Result<(), LinkError> {
        self.shared.send(device_id, message).await
    }

    /// Send to every connected device concurrently. Returns how many sends succeeded.
    pub async fn broadcast(&self, message: &Message) -> usize {
        let targets = self.connected_devices().await;
        let results =
            futures::future::join_all(targets.iter().map(|id| self.shared.send(id, message)))
                .await;
        let delivered = results.iter().filter(|r| r.is_ok()).count();
        tracing::info!(delivered, targets = targets.len(), "broadcast");
        delivered
    }

    /// Prove the peer on `device_id` holds a trusted private key. Marks the link verified.
    pub async fn authenticate(&self, device_id: &str) -> Result<PublicKey, LinkError> {
        let shared = &self.shared;
        let challenge = shared.verifier.lock().await.issue();
        let nonce = challenge.nonce().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        shared
            .pending_auth
            .lock()
            .await
            .insert(nonce.clone(), (device_id.to_string(), reply_tx));

        let request = Message::command(
            shared.sender.clone(),
            &LinkCommand::Challenge {
                nonce: nonce.clone(),
            },
        )
        .map_err(|e| LinkError::Encode(e.to_string()));
        let sent = match request {
            Ok(request) => shared.send(device_id, &request).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            shared.pending_auth.lock().await.remove(&nonce);
            shared.verifier.lock().await.abandon(&nonce);
            return Err(e);
        }

        let (public_key, signature) =
            match tokio::time::timeout(shared.config.challenge_validity, reply_rx).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => {
                    shared.verifier.lock().await.abandon(&nonce);
                    return Err(LinkError::NotConnected(device_id.to_string()));
                }
                Err(_) => {
                    shared.pending_auth.lock().await.remove(&nonce);
                    shared.verifier.lock().await.abandon(&nonce);
                    tracing::warn!(device_id, "challenge expired without a response");
                    return Err(ChallengeError::ChallengeExpired.into());
                }
            };

        let verdict = shared
            .verifier
            .lock()
            .await
            .verify(&challenge, &signature, &public_key);
        if let Err(e) = verdict {
            tracing::warn!(device_id, error = %e, "challenge verification failed");
            return Err(e.into());
        }
        if !shared.trust.read().await.is_trusted(&public_key) {
            tracing::warn!(
                device_id,
                fingerprint = %public_key.fingerprint(),
                "peer proved a key that is not trusted"
            );
            return Err(LinkError::Untrusted(device_id.to_string()));
        }

        let mut links = shared.links.lock().await;
        match links.get_mut(device_id) {
            Some(link) if link.state == ConnectionState::Connected => {
                link.verified_key = Some(public_key);
                link.last_activity_at = Instant::now();
            }
            _ => return Err(LinkError::NotConnected(device_id.to_string())),
        }
        tracing::info!(device_id, fingerprint = %public_key.fingerprint(), "peer verified");
        Ok(public_key)
    }

    /// Every known device, sorted by id.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let links = self.shared.links.lock().await;
        let mut out: Vec<ConnectionInfo> = links.iter().map(|(id, l)| l.info(id)).collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    pub async fn connection(&self, device_id: &str) -> Option<ConnectionInfo> {
        let links = self.shared.links.lock().await;
        links.get(device_id).map(|l| l.info(device_id))
    }

    /// Current state; devices the transport does not track are `Disconnected`.
    pub async fn state(&self, device_id: &str) -> ConnectionState {
        let links = self.shared.links.lock().await;
        links
            .get(device_id)
            .map_or(ConnectionState::Disconnected, |l| l.state)
    }

    /// Ids of devices in `Connected` state, sorted.
    pub async fn connected_devices(&self) -> Vec<String> {
        let links = self.shared.links.lock().await;
        let mut ids: Vec<String> = links
            .iter()
            .filter(|(_, l)| l.state == ConnectionState::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn is_connected(&self, device_id: &str) -> bool {
        let links = self.shared.links.lock().await;
        links
            .get(device_id)
            .is_some_and(|l| l.state == ConnectionState::Connected)
    }

    pub async fn is_verified(&self, device_id: &str) -> bool {
        let links = self.shared.links.lock().await;
        links.get(device_id).is_some_and(|l| {
            l.state == ConnectionState::Connected && l.verified_key.is_some()
        })
    }

    /// Evict stale reassembly buffers and expire unanswered challenges.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let evicted = self.shared.codec.lock().await.sweep(now);
        let expired = self.shared.verifier.lock().await.prune(now);
        evicted + expired
    }
}

impl Shared {
    async fn send(&self, device_id: &str, message: &Message) -> Result<(), LinkError> {
        let (send_lock, mut closed_rx) = {
            let links = self.links.lock().await;
            let link = links
                .get(device_id)
                .filter(|l| l.state == ConnectionState::Connected)
                .ok_or_else(|| LinkError::NotConnected(device_id.to_string()))?;
            if self.config.require_verified_peers
                && link.verified_key.is_none()
                && message.kind != MessageKind::Command
            {
                return Err(LinkError::Untrusted(device_id.to_string()));
            }
            (link.send_lock.clone(), link.closed.subscribe())
        };

        if self.config.max_write_size == 0 {
            return Err(LinkError::Encode("max_write_size must be at least 1".into()));
        }
        let chunks = MessageCodec::encode(message, self.config.max_chunk_size)
            .map_err(|e| LinkError::Encode(e.to_string()))?;
        let frames = chunks
            .iter()
            .map(encode_frame)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LinkError::Encode(e.to_string()))?;

        let _serial = send_lock.lock().await;
        for (i, frame) in frames.iter().enumerate() {
            if *closed_rx.borrow() {
                return Err(LinkError::Cancelled(device_id.to_string()));
            }
            if i > 0 && !self.config.inter_chunk_delay.is_zero() {
                tokio::select! {
                    _ = closed(&mut closed_rx) => {
                        return Err(LinkError::Cancelled(device_id.to_string()));
                    }
                    _ = tokio::time::sleep(self.config.inter_chunk_delay) => {}
                }
            }
            for piece in frame.chunks(self.config.max_write_size) {
                tokio::select! {
                    biased;
                    _ = closed(&mut closed_rx) => {
                        return Err(LinkError::Cancelled(device_id.to_string()));
                    }
                    written = self.radio.write(device_id, piece) => {
                        if let Err(e) = written {
                            tracing::warn!(
                                device_id,
                                message_id = %message.id,
                                chunk = i,
                                error = %e,
                                "chunk write failed; send aborted"
                            );
                            return Err(e);
                        }
                    }
                }
            }
        }

        if let Some(link) = self.links.lock().await.get_mut(device_id) {
            link.last_activity_at = Instant::now();
        }
        tracing::debug!(device_id, message_id = %message.id, chunks = frames.len(), "sent");
        Ok(())
    }

    async fn finish_disconnect(&self, device_id: &str) {
        {
            let mut links = self.links.lock().await;
            if let Some(mut link) = links.remove(device_id) {
                link.closed.send_replace(true);
                if link.state == ConnectionState::Connected {
                    link.advance(device_id, ConnectionState::Disconnecting);
                }
                if link.state == ConnectionState::Disconnecting {
                    link.advance(device_id, ConnectionState::Disconnected);
                }
            }
        }
        self.inbound.lock().await.remove(device_id);
        self.codec.lock().await.drop_peer(device_id);
        // Dropping the reply slots fails the waiting authenticate calls.
        self.pending_auth
            .lock()
            .await
            .retain(|_, (asked, _)| asked != device_id);
    }

    async fn handle_event(self: &Arc<Self>, event: RadioEvent) {
        match event {
            RadioEvent::Discovered(device) => self.on_discovered(device).await,
            RadioEvent::PeerConnected { device_id } => {
                let mut links = self.links.lock().await;
                let link = links
                    .entry(device_id.clone())
                    .or_insert_with(|| Link::new(None, ConnectionState::Disconnected));
                if matches!(
                    link.state,
                    ConnectionState::Disconnected | ConnectionState::Discovered
                ) {
                    link.reopen();
                    link.advance(&device_id, ConnectionState::Connecting);
                    link.advance(&device_id, ConnectionState::Connected);
                    drop(links);
                    self.inbound.lock().await.remove(&device_id);
                    tracing::info!(device_id = %device_id, "peer connected");
                }
            }
            RadioEvent::Received { device_id, bytes } => self.on_frame(device_id, &bytes).await,
            RadioEvent::PeerDisconnected { device_id } => {
                let live = self.links.lock().await.contains_key(&device_id);
                if live {
                    self.finish_disconnect(&device_id).await;
                    tracing::info!(device_id = %device_id, "peer disconnected");
                }
            }
        }
    }

    async fn on_discovered(&self, device: DiscoveredDevice) {
        {
            let mut links = self.links.lock().await;
            let link = links
                .entry(device.id.clone())
                .or_insert_with(|| Link::new(None, ConnectionState::Disconnected));
            if device.name.is_some() {
                link.name.clone_from(&device.name);
            }
            if link.state == ConnectionState::Disconnected {
                link.advance(&device.id, ConnectionState::Discovered);
            }
        }
        let mut scan = self.scan.lock().await;
        if let Some(session) = scan.as_mut() {
            if session.seen.insert(device.id.clone()) {
                tracing::debug!(device_id = %device.id, rssi = ?device.rssi, "discovered");
                let _ = session.tx.send(device);
            }
        }
    }

    async fn on_frame(self: &Arc<Self>, device_id: String, bytes: &[u8]) {
        {
            let mut links = self.links.lock().await;
            match links.get_mut(&device_id) {
                Some(link) if link.state == ConnectionState::Connected => {
                    link.last_activity_at = Instant::now();
                }
                _ => {
                    tracing::debug!(device_id = %device_id, "frame from unconnected device dropped");
                    return;
                }
            }
        }
        let mut chunks = Vec::new();
        {
            let mut inbound = self.inbound.lock().await;
            let buffer = inbound.entry(device_id.clone()).or_default();
            buffer.push(bytes);
            loop {
                match buffer.next_chunk() {
                    Ok(Some(chunk)) => chunks.push(chunk),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(device_id = %device_id, error = %e, "bad frame; buffer reset");
                        break;
                    }
                }
            }
        }
        for chunk in chunks {
            let now = Instant::now();
            let outcome = {
                let mut codec = self.codec.lock().await;
                codec.sweep(now);
                codec.receive(&device_id, chunk, now)
            };
            match outcome {
                Ok(Reassembly::Complete(message)) => {
                    self.dispatch(device_id.clone(), message).await
                }
                Ok(Reassembly::Incomplete) => {}
                Err(e) => tracing::warn!(device_id = %device_id, error = %e, "chunk rejected"),
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, device_id: String, message: Message) {
        match message.link_command() {
            Some(LinkCommand::Challenge { nonce }) => {
                let shared = self.clone();
                // Answer off the event task; sends pace themselves with sleeps.
                tokio::spawn(async move { shared.answer_challenge(&device_id, nonce).await });
            }
            Some(LinkCommand::Response {
                nonce,
                public_key,
                signature,
            }) => {
                let mut pending = self.pending_auth.lock().await;
                let ours = pending
                    .get(&nonce)
                    .is_some_and(|(asked, _)| *asked == device_id);
                let slot = if ours { pending.remove(&nonce) } else { None };
                match slot {
                    Some((_, slot)) => {
                        let _ = slot.send((public_key, decode_signature(&signature)));
                    }
                    None => {
                        tracing::warn!(device_id = %device_id, "unsolicited challenge response")
                    }
                }
            }
            None => {
                let verified_key = self
                    .links
                    .lock()
                    .await
                    .get(&device_id)
                    .and_then(|l| l.verified_key);
                tracing::debug!(
                    device_id = %device_id,
                    message_id = %message.id,
                    kind = ?message.kind,
                    "message received"
                );
                let _ = self.incoming.send(Incoming {
                    device_id,
                    message,
                    verified_key,
                });
            }
        }
    }

    async fn answer_challenge(&self, device_id: &str, nonce: String) {
        let signature = respond(&Challenge::from_nonce(nonce.as_str()), &self.identity);
        let reply = LinkCommand::Response {
            nonce,
            public_key: *self.identity.public_key(),
            signature: encode_signature(&signature),
        };
        let sent = match Message::command(self.sender.clone(), &reply) {
            Ok(message) => self.send(device_id, &message).await,
            Err(e) => Err(LinkError::Encode(e.to_string())),
        };
        match sent {
            Ok(()) => tracing::debug!(device_id, "answered challenge"),
            Err(e) => tracing::warn!(device_id, error = %e, "could not answer challenge"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::radio::sim::{SimulatedAir, SimulatedRadio};
    use crate::trust::{TrustStore, TrustedDevice};
    use futures::StreamExt;

    fn fast_config() -> TransportConfig {
        TransportConfig {
            inter_chunk_delay: Duration::from_millis(1),
            connect_timeout: Duration::from_millis(500),
            challenge_validity: Duration::from_millis(500),
            ..TransportConfig::default()
        }
    }

    struct Node {
        radio: SimulatedRadio,
        identity: Arc<DeviceIdentity>,
        trust: SharedTrustStore,
        transport: TransportManager,
        incoming: IncomingMessages,
    }

    fn node(air: &SimulatedAir, id: &str, config: TransportConfig) -> Node {
        let radio = air.join(id, Some(id));
        let identity = Arc::new(DeviceIdentity::generate());
        let trust = TrustStore::new().into_shared();
        let (transport, incoming) = TransportManager::start(
            Arc::new(radio.clone()),
            identity.clone(),
            trust.clone(),
            config,
        );
        Node {
            radio,
            identity,
            trust,
            transport,
            incoming,
        }
    }

    /// A node with no transport: sees raw radio events, never answers.
    fn bare(air: &SimulatedAir, id: &str) -> (SimulatedRadio, mpsc::UnboundedReceiver<RadioEvent>) {
        let radio = air.join(id, Some(id));
        let (tx, rx) = mpsc::unbounded_channel();
        radio.on_receive(tx);
        (radio, rx)
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<RadioEvent>) -> Vec<Chunk> {
        let mut buffer = FrameBuffer::new();
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RadioEvent::Received { bytes, .. } = event {
                buffer.push(&bytes);
                while let Some(chunk) = buffer.next_chunk().unwrap() {
                    out.push(chunk);
                }
            }
        }
        out
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    async fn trust(store: &SharedTrustStore, identity: &DeviceIdentity) {
        store.write().await.add(TrustedDevice {
            public_key: *identity.public_key(),
            display_name: None,
        });
    }

    #[test]
    fn state_machine_edges() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Discovered));
        assert!(Discovered.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(Disconnecting.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Disconnected));
        assert!(!Discovered.can_transition_to(Connected));
    }

    #[tokio::test]
    async fn broadcast_with_no_connections_is_zero() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        assert_eq!(a.transport.broadcast(&Message::text("A", "hi")).await, 0);
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let _b = bare(&air, "B");
        let err = a
            .transport
            .send("B", &Message::text("A", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NotConnected(id) if id == "B"));
    }

    #[tokio::test]
    async fn chunks_arrive_in_index_order() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let (_b, mut b_rx) = bare(&air, "B");
        a.transport.connect("B").await.unwrap();
        let msg = Message::text("A", &"x".repeat(200));
        a.transport.send("B", &msg).await.unwrap();
        let chunks = frames(&mut b_rx);
        assert!(chunks.len() > 5);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index as usize, i);
            assert_eq!(c.total_chunks as usize, chunks.len());
        }
    }

    #[tokio::test]
    async fn concurrent_sends_to_one_device_do_not_interleave() {
        let air = SimulatedAir::new();
        let a = Arc::new(node(&air, "A", fast_config()));
        let (_b, mut b_rx) = bare(&air, "B");
        a.transport.connect("B").await.unwrap();
        let first = Message::text("A", &"1".repeat(120));
        let second = Message::text("A", &"2".repeat(120));
        let (r1, r2) = tokio::join!(
            a.transport.send("B", &first),
            a.transport.send("B", &second)
        );
        r1.unwrap();
        r2.unwrap();
        let ids: Vec<[u8; 16]> = frames(&mut b_rx).iter().map(|c| c.message_id).collect();
        let switches = ids.windows(2).filter(|w| w[0] != w[1]).count();
        assert_eq!(switches, 1);
    }

    #[tokio::test]
    async fn failed_chunk_write_aborts_send() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let (_b, mut b_rx) = bare(&air, "B");
        a.transport.connect("B").await.unwrap();
        // A full chunk frame takes three 20-byte writes; the fourth starts the second frame.
        a.radio.fail_write_at(4);
        let err = a
            .transport
            .send("B", &Message::text("A", &"y".repeat(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::WriteFailed { .. }));
        assert_eq!(frames(&mut b_rx).len(), 1);
        assert_eq!(a.radio.writes(), 4);
    }

    #[tokio::test]
    async fn writes_fit_the_link_mtu() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let (_b, mut b_rx) = bare(&air, "B");
        a.transport.connect("B").await.unwrap();
        let msg = Message::text("A", "bed 12 needs review");
        a.transport.send("B", &msg).await.unwrap();

        let mut sizes = Vec::new();
        let mut buffer = FrameBuffer::new();
        let mut chunks = Vec::new();
        while let Ok(event) = b_rx.try_recv() {
            if let RadioEvent::Received { bytes, .. } = event {
                sizes.push(bytes.len());
                buffer.push(&bytes);
                while let Some(chunk) = buffer.next_chunk().unwrap() {
                    chunks.push(chunk);
                }
            }
        }
        assert!(sizes.iter().all(|&n| n <= DEFAULT_WRITE_SIZE));
        assert!(sizes.len() > chunks.len());
        assert_eq!(chunks.len() as u32, chunks[0].total_chunks);
        assert_eq!(buffer.buffered(), 0);
    }

    #[tokio::test]
    async fn disconnect_cancels_in_flight_send() {
        let air = SimulatedAir::new();
        let config = TransportConfig {
            inter_chunk_delay: Duration::from_millis(100),
            ..fast_config()
        };
        let a = Arc::new(node(&air, "A", config));
        let _b = bare(&air, "B");
        a.transport.connect("B").await.unwrap();
        let sender = a.clone();
        let send = tokio::spawn(async move {
            let msg = Message::text("A", &"z".repeat(400));
            sender.transport.send("B", &msg).await
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        a.transport.disconnect("B").await.unwrap();
        let err = send.await.unwrap().unwrap_err();
        assert!(matches!(err, LinkError::Cancelled(id) if id == "B"));
        assert!(a.radio.writes() < 15);
        assert!(!a.radio.is_linked_to("B"));
        assert!(a.transport.connection("B").await.is_none());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let _b = bare(&air, "B");
        a.transport.disconnect("B").await.unwrap();
        a.transport.connect("B").await.unwrap();
        a.transport.disconnect("B").await.unwrap();
        a.transport.disconnect("B").await.unwrap();
        assert!(a.transport.connected_devices().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out() {
        let air = SimulatedAir::new();
        let config = TransportConfig {
            connect_timeout: Duration::from_millis(50),
            ..fast_config()
        };
        let a = node(&air, "A", config);
        let _b = bare(&air, "B");
        a.radio.set_connect_delay(Some(Duration::from_secs(5)));
        let err = a.transport.connect("B").await.unwrap_err();
        assert!(matches!(err, LinkError::ConnectTimeout(id) if id == "B"));
        assert_eq!(a.transport.state("B").await, ConnectionState::Disconnected);
        assert!(a.transport.connection("B").await.is_none());
        assert!(!a.radio.is_linked_to("B"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_connecting_cancels_attempt() {
        let air = SimulatedAir::new();
        let a = Arc::new(node(&air, "A", fast_config()));
        let _b = bare(&air, "B");
        a.radio.set_connect_delay(Some(Duration::from_millis(100)));
        let connector = a.clone();
        let attempt = tokio::spawn(async move { connector.transport.connect("B").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a.transport.state("B").await, ConnectionState::Connecting);

        a.transport.disconnect("B").await.unwrap();
        let err = attempt.await.unwrap().unwrap_err();
        assert!(matches!(err, LinkError::Cancelled(id) if id == "B"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(a.transport.state("B").await, ConnectionState::Disconnected);
        assert!(!a.radio.is_linked_to("B"));

        a.radio.set_connect_delay(None);
        a.transport.connect("B").await.unwrap();
        assert!(a.transport.is_connected("B").await);
    }

    #[tokio::test]
    async fn connect_failures_leave_link_disconnected() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let (b, _b_rx) = bare(&air, "B");
        b.reject_connections(true);
        assert!(matches!(
            a.transport.connect("B").await,
            Err(LinkError::ConnectionFailed { .. })
        ));
        assert!(matches!(
            a.transport.connect("nobody").await,
            Err(LinkError::DeviceNotFound(_))
        ));
        a.radio.set_permission_granted(false);
        b.reject_connections(false);
        assert!(matches!(
            a.transport.connect("B").await,
            Err(LinkError::PermissionDenied)
        ));
        assert!(a.transport.connected_devices().await.is_empty());
    }

    #[tokio::test]
    async fn scan_reports_each_device_once() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let _b = bare(&air, "B");
        let _c = bare(&air, "C");
        let mut stream = a.transport.start_scan().await.unwrap().unwrap();
        assert!(a.transport.start_scan().await.unwrap().is_none());
        let mut seen = vec![
            stream.next().await.unwrap().id,
            stream.next().await.unwrap().id,
        ];
        seen.sort();
        assert_eq!(seen, ["B", "C"]);

        air.advertise("B");
        let _d = bare(&air, "D");
        air.advertise("D");
        settle().await;
        a.transport.stop_scan().await.unwrap();
        a.transport.stop_scan().await.unwrap();
        let rest: Vec<String> = stream.map(|d| d.id).collect().await;
        assert_eq!(rest, ["D"]);
        assert_eq!(
            a.transport.connection("D").await.unwrap().state,
            ConnectionState::Discovered
        );
    }

    #[tokio::test]
    async fn dropped_discovery_stream_ends_session() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let _b = bare(&air, "B");
        let stream = a.transport.start_scan().await.unwrap().unwrap();
        drop(stream);
        assert!(!a.transport.is_scanning().await);

        let mut again = a
            .transport
            .start_scan()
            .await
            .unwrap()
            .expect("a fresh session");
        assert!(a.transport.is_scanning().await);
        assert_eq!(again.next().await.unwrap().id, "B");
    }

    #[tokio::test]
    async fn new_scan_forgets_idle_devices() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let (b, _b_rx) = bare(&air, "B");
        let _c = bare(&air, "C");
        let mut stream = a.transport.start_scan().await.unwrap().unwrap();
        stream.next().await.unwrap();
        stream.next().await.unwrap();
        a.transport.stop_scan().await.unwrap();

        b.reject_connections(true);
        assert!(a.transport.connect("B").await.is_err());
        assert_eq!(
            a.transport.connection("B").await.unwrap().state,
            ConnectionState::Disconnected
        );
        assert!(a.transport.connect("nobody").await.is_err());
        assert!(a.transport.connection("nobody").await.is_none());

        air.set_advertising("C", false);
        let mut again = a.transport.start_scan().await.unwrap().unwrap();
        assert_eq!(again.next().await.unwrap().id, "B");
        settle().await;
        let known: Vec<String> = a
            .transport
            .connections()
            .await
            .into_iter()
            .map(|c| c.device_id)
            .collect();
        assert_eq!(known, ["B"]);
    }

    #[tokio::test]
    async fn messages_are_delivered_to_peer() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let mut b = node(&air, "B", fast_config());
        a.transport.connect("B").await.unwrap();
        let msg = Message::text("ward-3", "bed 12 needs review");
        a.transport.send("B", &msg).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), b.incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.device_id, "A");
        assert_eq!(got.message, msg);
        assert_eq!(got.verified_key, None);
        assert!(b.transport.is_connected("A").await);
    }

    #[tokio::test]
    async fn broadcast_counts_successes() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let _b = bare(&air, "B");
        let _c = bare(&air, "C");
        a.transport.connect("B").await.unwrap();
        a.transport.connect("C").await.unwrap();
        assert_eq!(a.transport.broadcast(&Message::text("A", "all")).await, 2);
        a.radio.fail_write_at(1);
        assert_eq!(a.transport.broadcast(&Message::text("A", "all")).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_writes_to_devices_concurrently() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let _b = bare(&air, "B");
        let _c = bare(&air, "C");
        a.transport.connect("B").await.unwrap();
        a.transport.connect("C").await.unwrap();
        let write_delay = Duration::from_millis(10);
        a.radio.set_write_delay(Some(write_delay));

        let started = tokio::time::Instant::now();
        let msg = Message::text("A", &"w".repeat(60));
        assert_eq!(a.transport.broadcast(&msg).await, 2);
        let elapsed = started.elapsed();
        let writes = u32::try_from(a.radio.writes()).unwrap();
        assert!(writes >= 6);
        // Serialized writes would take at least `writes * write_delay`.
        assert!(elapsed < write_delay * writes, "{elapsed:?} for {writes} writes");
    }

    #[tokio::test]
    async fn peer_drop_disconnects_link() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let _b = bare(&air, "B");
        a.transport.connect("B").await.unwrap();
        air.drop_link("A", "B");
        settle().await;
        assert!(!a.transport.is_connected("B").await);
        assert!(matches!(
            a.transport.send("B", &Message::text("A", "x")).await,
            Err(LinkError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn authenticate_trusted_peer() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let mut b = node(&air, "B", fast_config());
        trust(&a.trust, &b.identity).await;
        a.transport.connect("B").await.unwrap();
        let key = a.transport.authenticate("B").await.unwrap();
        assert_eq!(key, *b.identity.public_key());
        assert!(a.transport.is_verified("B").await);
        // Link commands stay inside the transport.
        assert!(b.incoming.try_recv().is_err());

        a.transport.send("B", &Message::text("A", "after")).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), b.incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.message.as_text(), Some("after"));
    }

    #[tokio::test]
    async fn authenticate_untrusted_peer_fails() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let _b = node(&air, "B", fast_config());
        a.transport.connect("B").await.unwrap();
        let err = a.transport.authenticate("B").await.unwrap_err();
        assert!(matches!(err, LinkError::Untrusted(id) if id == "B"));
        assert!(!a.transport.is_verified("B").await);
    }

    #[tokio::test(start_paused = true)]
    async fn authenticate_silent_peer_expires() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let _b = bare(&air, "B");
        a.transport.connect("B").await.unwrap();
        let err = a.transport.authenticate("B").await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::Auth(ChallengeError::ChallengeExpired)
        ));
    }

    #[tokio::test]
    async fn verified_peers_required_when_configured() {
        let air = SimulatedAir::new();
        let config = TransportConfig {
            require_verified_peers: true,
            ..fast_config()
        };
        let a = node(&air, "A", config);
        let b = node(&air, "B", fast_config());
        trust(&a.trust, &b.identity).await;
        a.transport.connect("B").await.unwrap();
        assert!(matches!(
            a.transport.send("B", &Message::text("A", "early")).await,
            Err(LinkError::Untrusted(_))
        ));
        a.transport.authenticate("B").await.unwrap();
        a.transport
            .send("B", &Message::text("A", "late"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reconnect_clears_verification() {
        let air = SimulatedAir::new();
        let a = node(&air, "A", fast_config());
        let b = node(&air, "B", fast_config());
        trust(&a.trust, &b.identity).await;
        a.transport.connect("B").await.unwrap();
        a.transport.authenticate("B").await.unwrap();
        a.transport.disconnect("B").await.unwrap();
        a.transport.connect("B").await.unwrap();
        assert!(!a.transport.is_verified("B").await);
    }
}
