// Gisma Link: In-process mock transport for unit tests.
//
// Plays the broker side of one socket at a time: answers CONNECT according to
// a scripted behaviour, records every frame the client sends, and lets a test
// inject MESSAGE frames or kill the socket.

use super::stomp::{Command, Frame};
use super::transport::{Handshake, Transport, TransportEvent, TransportLink};
use crate::atoms::error::{LinkError, LinkResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    /// Reply CONNECTED.
    Accept,
    /// `open()` itself fails.
    Refuse,
    /// Socket opens but CONNECT is never answered.
    Silent,
    /// Reply with a STOMP ERROR frame.
    Reject(String),
}

#[derive(Default)]
pub(crate) struct MockTransport {
    opens: AtomicUsize,
    script: Mutex<VecDeque<Behavior>>,
    default_behavior: Mutex<Option<Behavior>>,
    sent: Arc<Mutex<Vec<Frame>>>,
    socket: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    open_times: Mutex<Vec<Instant>>,
    handshakes: Mutex<Vec<Handshake>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Behaviour for the next `open()`; unscripted opens use the default.
    pub fn push(&self, behavior: Behavior) {
        self.script.lock().push_back(behavior);
    }

    pub fn set_default(&self, behavior: Behavior) {
        *self.default_behavior.lock() = Some(behavior);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.open_times.lock().clone()
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.lock().clone()
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    pub fn sent_with(&self, command: Command) -> Vec<Frame> {
        self.sent().into_iter().filter(|f| f.command == command).collect()
    }

    /// Subscription id of the most recent live SUBSCRIBE to `destination`.
    pub fn subscription_for(&self, destination: &str) -> Option<String> {
        let sent = self.sent();
        let id = sent
            .iter()
            .rev()
            .find(|f| f.command == Command::Subscribe && f.get("destination") == Some(destination))?
            .get("id")?
            .to_string();
        let cancelled = sent
            .iter()
            .any(|f| f.command == Command::Unsubscribe && f.get("id") == Some(id.as_str()));
        (!cancelled).then_some(id)
    }

    /// Inject a raw event on the current socket.
    pub fn inject(&self, event: TransportEvent) -> bool {
        match self.socket.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver `body` as a MESSAGE on the live subscription for `destination`.
    pub fn deliver(&self, destination: &str, body: &str) -> bool {
        match self.subscription_for(destination) {
            Some(id) => self.inject(TransportEvent::Frame(Frame::message(&id, destination, body))),
            None => false,
        }
    }

    /// Deliver on an explicit subscription id, live or not.
    pub fn deliver_raw(&self, subscription: &str, destination: &str, body: &str) -> bool {
        self.inject(TransportEvent::Frame(Frame::message(subscription, destination, body)))
    }

    /// Kill the current socket as the server would.
    pub fn drop_socket(&self, reason: &str) {
        if let Some(tx) = self.socket.lock().take() {
            let _ = tx.send(TransportEvent::Closed(reason.to_string()));
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, handshake: &Handshake) -> LinkResult<TransportLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open_times.lock().push(Instant::now());
        self.handshakes.lock().push(handshake.clone());

        let behavior = self
            .script
            .lock()
            .pop_front()
            .or_else(|| self.default_behavior.lock().clone())
            .unwrap_or(Behavior::Accept);

        if let Behavior::Refuse = behavior {
            return Err(LinkError::transport("connection refused"));
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();
        *self.socket.lock() = Some(in_tx.clone());

        let sent = Arc::clone(&self.sent);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let is_connect = frame.command == Command::Connect;
                sent.lock().push(frame);
                if !is_connect {
                    continue;
                }
                match &behavior {
                    Behavior::Accept => {
                        let _ = in_tx.send(TransportEvent::Frame(Frame::connected((0, 0))));
                    }
                    Behavior::Reject(msg) => {
                        let _ = in_tx.send(TransportEvent::Frame(Frame::error(msg)));
                    }
                    Behavior::Silent | Behavior::Refuse => {}
                }
            }
        });

        Ok(TransportLink { outbound: out_tx, inbound: in_rx })
    }

    fn host(&self) -> String {
        "mock".into()
    }
}

/// Let spawned tasks drain their channels.
pub(crate) async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
}
