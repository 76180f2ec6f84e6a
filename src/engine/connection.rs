// Gisma Link: Connection Manager
//
// One STOMP connection for the lifetime of the application, shared by every
// chat. Owns the transport link and all subscriptions.
//
// Lifecycle:
//   connect()     single-flight: concurrent callers join one in-flight attempt
//   bindings      destination → callback key; survive reconnects, are applied
//                 (SUBSCRIBE) whenever a link comes up
//   link lost     active subscription ids are dropped with the link, bindings
//                 kept, reconnect scheduled with min(base * 2^attempt, cap)
//   disconnect()  stops reconnecting, forgets bindings and callbacks
//
// Every link carries a generation number. Events from a link whose generation
// is no longer current are ignored, so a torn-down socket can never reach the
// handlers of its successor. The state mutex is never held across an await and
// handlers are invoked after it is released.

use super::backoff::reconnect_delay;
use super::reply::{decode_metadata, decode_reply};
use super::stomp::{Command, Frame};
use super::transport::{Handshake, Transport, TransportEvent};
use super::ws::WsTransport;
use crate::atoms::constants::*;
use crate::atoms::error::{ConnectError, LinkError, LinkResult};
use crate::atoms::types::{ChatMetadata, ReplyFrame};
use crate::config::ClientConfig;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Callback for one per-chat reply channel.
pub type ReplyHandler = Arc<dyn Fn(ReplyFrame) + Send + Sync>;
/// Callback for the new-chat metadata channel.
pub type MetadataHandler = Arc<dyn Fn(LinkResult<ChatMetadata>) + Send + Sync>;

type PendingConnect = Shared<BoxFuture<'static, Result<(), ConnectError>>>;

// ── Options ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// `(outgoing, incoming)` heart-beat request in milliseconds.
    pub heartbeat: (u64, u64),
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            reconnect_delay: Duration::from_millis(RECONNECT_BASE_DELAY_MS),
            max_reconnect_delay: Duration::from_millis(MAX_RECONNECT_DELAY_MS),
            heartbeat: (HEARTBEAT_OUTGOING_MS, HEARTBEAT_INCOMING_MS),
        }
    }
}

impl From<&ClientConfig> for ConnectionOptions {
    fn from(config: &ClientConfig) -> Self {
        ConnectionOptions {
            connect_timeout: config.connect_timeout(),
            reconnect_delay: config.reconnect_delay(),
            max_reconnect_delay: config.max_reconnect_delay(),
            heartbeat: config.heartbeat(),
        }
    }
}

// ── State ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingKind {
    Reply,
    Metadata,
}

#[derive(Debug, Clone)]
struct Binding {
    kind: BindingKind,
    key: String,
}

/// The socket currently in use, valid only after CONNECTED.
struct LiveLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<Frame>,
    /// destination → STOMP subscription id on this link
    active: HashMap<String, String>,
}

impl LiveLink {
    fn subscribe(&mut self, next_id: &mut u64, destination: &str) {
        *next_id += 1;
        let id = format!("sub-{}", next_id);
        debug!("[connection] SUBSCRIBE {} as {}", destination, id);
        let _ = self.outbound.send(Frame::subscribe(&id, destination));
        self.active.insert(destination.to_string(), id);
    }

    fn unsubscribe(&mut self, destination: &str) {
        if let Some(id) = self.active.remove(destination) {
            debug!("[connection] UNSUBSCRIBE {} ({})", destination, id);
            let _ = self.outbound.send(Frame::unsubscribe(&id));
        }
    }

    fn destination_of(&self, subscription: &str) -> Option<&str> {
        self.active
            .iter()
            .find(|(_, id)| id.as_str() == subscription)
            .map(|(dest, _)| dest.as_str())
    }
}

#[derive(Default)]
struct State {
    should_connect: bool,
    link: Option<LiveLink>,
    pending: Option<PendingConnect>,
    attempt: u32,
    generation: u64,
    reconnect_timer: Option<JoinHandle<()>>,
    handshake: Handshake,
    bindings: HashMap<String, Binding>,
    reply_handlers: HashMap<String, ReplyHandler>,
    metadata_handlers: HashMap<String, MetadataHandler>,
    next_sub_id: u64,
}

enum Route {
    Reply(ReplyHandler),
    Metadata(MetadataHandler),
}

struct Inner {
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    state: Mutex<State>,
    /// Wakes in-flight handshakes when `disconnect()` runs.
    cancelled: Notify,
}

// ── Public handle ──────────────────────────────────────────────────────

pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, options: ConnectionOptions) -> Self {
        ConnectionManager {
            inner: Arc::new(Inner {
                transport,
                options,
                state: Mutex::new(State::default()),
                cancelled: Notify::new(),
            }),
        }
    }

    /// WebSocket transport built from `config`.
    pub fn from_config(config: &ClientConfig) -> LinkResult<Self> {
        let transport = WsTransport::from_config(config)?;
        Ok(Self::new(Arc::new(transport), ConnectionOptions::from(config)))
    }

    /// Credentials for the next socket. The current link is left alone.
    pub fn set_handshake(&self, handshake: Handshake) {
        self.inner.state.lock().handshake = handshake;
    }

    /// Resolve once a STOMP session is up. Idempotent; concurrent callers
    /// share one attempt and one socket.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        Arc::clone(&self.inner).connect().await
    }

    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn subscribe_to_reply(&self, destination: &str, handler: ReplyHandler, key: &str) {
        let mut st = self.inner.state.lock();
        st.reply_handlers.insert(key.to_string(), handler);
        bind(&mut st, destination, Binding { kind: BindingKind::Reply, key: key.to_string() });
    }

    pub fn subscribe_to_metadata(&self, handler: MetadataHandler, key: &str) {
        let mut st = self.inner.state.lock();
        st.metadata_handlers.insert(key.to_string(), handler);
        bind(&mut st, METADATA_DESTINATION, Binding { kind: BindingKind::Metadata, key: key.to_string() });
    }

    pub fn unsubscribe(&self, destination: &str) {
        let mut st = self.inner.state.lock();
        if st.bindings.remove(destination).is_some() {
            debug!("[connection] Binding removed: {}", destination);
        }
        if let Some(link) = st.link.as_mut() {
            link.unsubscribe(destination);
        }
    }

    /// Drop a reply callback; its destination stays bound.
    pub fn clear_reply_handler(&self, key: &str) {
        self.inner.state.lock().reply_handlers.remove(key);
    }

    /// Publish `payload` as JSON, connecting first if needed.
    pub async fn send_message<T>(&self, payload: &T, destination: &str) -> LinkResult<()>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_string(payload)?;
        self.connect()
            .await
            .map_err(|e| LinkError::NotConnected(e.to_string()))?;

        let st = self.inner.state.lock();
        let link = st
            .link
            .as_ref()
            .ok_or_else(|| LinkError::NotConnected("link closed before publish".into()))?;
        link.outbound
            .send(Frame::send(destination, body))
            .map_err(|_| LinkError::NotConnected("socket closed before publish".into()))?;
        debug!("[connection] SEND {}", destination);
        Ok(())
    }

    /// Host returned to the foreground: skip the backoff wait if a reconnect
    /// is due and nothing is in flight.
    pub fn on_visibility_change(&self, visible: bool) {
        if !visible {
            return;
        }
        let resume = {
            let mut st = self.inner.state.lock();
            let idle = st.should_connect && st.link.is_none() && st.pending.is_none();
            if idle {
                if let Some(timer) = st.reconnect_timer.take() {
                    timer.abort();
                }
            }
            idle
        };
        if resume {
            info!("[connection] Visible again, reconnecting now");
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                if let Err(e) = inner.connect().await {
                    debug!("[connection] Foreground reconnect failed: {}", e);
                }
            });
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().link.is_some()
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }

    /// Destinations with a live SUBSCRIBE on the current link.
    pub fn active_destinations(&self) -> Vec<String> {
        let st = self.inner.state.lock();
        let mut out: Vec<String> = st
            .link
            .as_ref()
            .map(|l| l.active.keys().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Destinations that will be (re)subscribed whenever a link comes up.
    pub fn bound_destinations(&self) -> Vec<String> {
        let mut out: Vec<String> = self.inner.state.lock().bindings.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.state.lock().attempt
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.disconnect();
    }
}

/// Record `binding` and, when a link is up, replace any live subscription on
/// the same destination.
fn bind(st: &mut State, destination: &str, binding: Binding) {
    match st.link.as_mut() {
        Some(link) => {
            link.unsubscribe(destination);
            link.subscribe(&mut st.next_sub_id, destination);
        }
        None => debug!("[connection] Binding {} deferred until connected", destination),
    }
    st.bindings.insert(destination.to_string(), binding);
}

// ── Internals ──────────────────────────────────────────────────────────

impl Inner {
    async fn connect(self: Arc<Self>) -> Result<(), ConnectError> {
        let attempt = {
            let mut st = self.state.lock();
            st.should_connect = true;
            if st.link.is_some() {
                return Ok(());
            }
            match &st.pending {
                Some(pending) => pending.clone(),
                None => {
                    st.generation += 1;
                    let generation = st.generation;
                    let handshake = st.handshake.clone();
                    let this = Arc::clone(&self);
                    let pending: PendingConnect =
                        async move { this.establish(generation, handshake).await }.boxed().shared();
                    st.pending = Some(pending.clone());
                    // runs to completion even if every caller stops waiting
                    tokio::spawn(pending.clone());
                    pending
                }
            }
        };
        attempt.await
    }

    async fn establish(self: Arc<Self>, generation: u64, handshake: Handshake) -> Result<(), ConnectError> {
        let timeout_ms = self.options.connect_timeout.as_millis() as u64;
        let cancelled = self.cancelled.notified();
        debug!("[connection] Connecting (generation {})", generation);
        if handshake.is_anonymous() {
            warn!("[connection] No session credentials; the server may refuse the socket");
        }

        let outcome = tokio::select! {
            r = tokio::time::timeout(self.options.connect_timeout, self.open_stomp(&handshake)) => match r {
                Ok(r) => r,
                Err(_) => Err(ConnectError::Timeout(timeout_ms)),
            },
            _ = cancelled => Err(ConnectError::Cancelled),
        };

        let mut guard = self.state.lock();
        if guard.generation != generation {
            // disconnect() ran meanwhile; dropping the link closes the socket
            return Err(ConnectError::Cancelled);
        }
        guard.pending = None;

        match outcome {
            Ok((outbound, inbound)) => {
                let st = &mut *guard;
                st.attempt = 0;
                if let Some(timer) = st.reconnect_timer.take() {
                    timer.abort();
                }
                let mut link = LiveLink { generation, outbound, active: HashMap::new() };
                for destination in st.bindings.keys() {
                    link.subscribe(&mut st.next_sub_id, destination);
                }
                let restored = link.active.len();
                st.link = Some(link);
                drop(guard);

                info!("[connection] Connected ({} subscription(s) applied)", restored);
                tokio::spawn(Arc::clone(&self).dispatch(generation, inbound));
                Ok(())
            }
            Err(e) => {
                warn!("[connection] Connect failed: {}", e);
                self.schedule_reconnect(&mut guard);
                Err(e)
            }
        }
    }

    /// Open a socket and run the STOMP CONNECT / CONNECTED exchange.
    async fn open_stomp(
        &self,
        handshake: &Handshake,
    ) -> Result<(mpsc::UnboundedSender<Frame>, mpsc::UnboundedReceiver<TransportEvent>), ConnectError> {
        let link = self.transport.open(handshake).await.map_err(|e| match e {
            LinkError::Transport(m) => ConnectError::Transport(m),
            other => ConnectError::Transport(other.to_string()),
        })?;
        let (outbound, mut inbound) = (link.outbound, link.inbound);

        let mut connect = Frame::connect(&self.transport.host(), self.options.heartbeat);
        if let Some(token) = &handshake.bearer_token {
            connect = connect.header("Authorization", format!("Bearer {}", token));
        }
        outbound
            .send(connect)
            .map_err(|_| ConnectError::Transport("socket closed during handshake".into()))?;

        loop {
            match inbound.recv().await {
                Some(TransportEvent::Frame(frame)) => match frame.command {
                    Command::Connected => return Ok((outbound, inbound)),
                    Command::Error => {
                        let message = frame.get("message").unwrap_or("Unknown error");
                        return Err(ConnectError::Protocol(message.to_string()));
                    }
                    other => debug!("[connection] Ignoring {} before CONNECTED", other),
                },
                Some(TransportEvent::Closed(reason)) => return Err(ConnectError::Transport(reason)),
                None => return Err(ConnectError::Transport("socket closed during handshake".into())),
            }
        }
    }

    /// Per-link reader: routes MESSAGE frames in arrival order until the link
    /// ends or is superseded.
    async fn dispatch(self: Arc<Self>, generation: u64, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        let reason = loop {
            let Some(event) = inbound.recv().await else {
                break "transport dropped".to_string();
            };
            if !self.is_current(generation) {
                debug!("[connection] Dispatcher for generation {} retired", generation);
                return;
            }
            match event {
                TransportEvent::Frame(frame) => match frame.command {
                    Command::Message => self.deliver(generation, &frame),
                    Command::Error => {
                        break format!("STOMP error: {}", frame.get("message").unwrap_or("Unknown error"));
                    }
                    other => debug!("[connection] Ignoring {} frame", other),
                },
                TransportEvent::Closed(reason) => break reason,
            }
        };
        self.link_lost(generation, &reason);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state
            .lock()
            .link
            .as_ref()
            .is_some_and(|l| l.generation == generation)
    }

    fn deliver(&self, generation: u64, frame: &Frame) {
        let route = {
            let st = self.state.lock();
            let Some(link) = st.link.as_ref().filter(|l| l.generation == generation) else {
                return;
            };
            let Some(destination) = frame.get("subscription").and_then(|id| link.destination_of(id)) else {
                debug!("[connection] MESSAGE for unknown subscription {:?}", frame.get("subscription"));
                return;
            };
            match st.bindings.get(destination) {
                Some(Binding { kind: BindingKind::Reply, key }) => st.reply_handlers.get(key).cloned().map(Route::Reply),
                Some(Binding { kind: BindingKind::Metadata, key }) => {
                    st.metadata_handlers.get(key).cloned().map(Route::Metadata)
                }
                None => None,
            }
        };

        match route {
            Some(Route::Reply(handler)) => handler(decode_reply(&frame.body)),
            Some(Route::Metadata(handler)) => handler(decode_metadata(&frame.body)),
            None => debug!("[connection] No handler for MESSAGE, dropped"),
        }
    }

    fn link_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        let mut st = self.state.lock();
        if !st.link.as_ref().is_some_and(|l| l.generation == generation) {
            return;
        }
        // subscription ids die with the link; bindings are re-applied later
        st.link = None;
        warn!("[connection] Connection lost: {}", reason);
        self.schedule_reconnect(&mut st);
    }

    fn schedule_reconnect(self: &Arc<Self>, st: &mut State) {
        if !st.should_connect {
            return;
        }
        if st.reconnect_timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let delay = reconnect_delay(self.options.reconnect_delay, st.attempt, self.options.max_reconnect_delay);
        st.attempt = st.attempt.saturating_add(1);
        info!("[connection] Reconnecting in {}ms (attempt {})", delay.as_millis(), st.attempt);

        let this = Arc::clone(self);
        st.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.reconnect_now().await;
        }));
    }

    async fn reconnect_now(self: Arc<Self>) {
        {
            let mut st = self.state.lock();
            st.reconnect_timer = None;
            if !st.should_connect || st.link.is_some() || st.pending.is_some() {
                return;
            }
        }
        if let Err(e) = self.connect().await {
            debug!("[connection] Reconnect attempt failed: {}", e);
        }
    }

    fn disconnect(&self) {
        let link = {
            let mut st = self.state.lock();
            st.should_connect = false;
            st.generation += 1;
            st.pending = None;
            st.attempt = 0;
            if let Some(timer) = st.reconnect_timer.take() {
                timer.abort();
            }
            st.bindings.clear();
            st.reply_handlers.clear();
            st.metadata_handlers.clear();
            st.link.take()
        };
        self.cancelled.notify_waiters();

        if let Some(mut link) = link {
            for (_, id) in link.active.drain() {
                let _ = link.outbound.send(Frame::unsubscribe(&id));
            }
            let _ = link.outbound.send(Frame::disconnect());
            info!("[connection] Disconnected");
        }
    }
}
