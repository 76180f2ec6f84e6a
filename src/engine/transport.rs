// Gisma Link: Transport seam
//
// The connection manager talks STOMP frames; a `Transport` only moves them.
// `open()` yields a `TransportLink`: an outbound frame sender and an inbound
// event receiver. Dropping the sender closes the underlying socket.

use super::stomp::Frame;
use crate::atoms::error::LinkResult;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Something that happened on an open socket.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A decoded STOMP frame (heart-beats are swallowed by the transport).
    Frame(Frame),
    /// The socket is gone; the string says why.
    Closed(String),
}

/// Credentials presented when the socket is opened.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Session cookies forwarded on the upgrade request (`Cookie` header).
    pub cookie: Option<String>,
    /// Optional bearer token; unused by the cookie-based servers.
    pub bearer_token: Option<String>,
}

impl Handshake {
    pub fn is_anonymous(&self) -> bool {
        self.cookie.is_none() && self.bearer_token.is_none()
    }
}

/// Both halves of one open socket.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a fresh socket. Must not perform the STOMP handshake itself.
    async fn open(&self, handshake: &Handshake) -> LinkResult<TransportLink>;

    /// Value for the STOMP `host` header.
    fn host(&self) -> String;
}
