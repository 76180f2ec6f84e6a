// Gisma Link: WebSocket Transport
//
// Opens the raw-WebSocket leg of the server's SockJS endpoint and shuttles
// STOMP frames over it. Session cookies ride on the upgrade request.
//
// Per socket two tasks run:
//   writer: encodes outbound frames, emits heart-beat EOLs when idle,
//           closes the socket once the outbound sender is dropped
//   reader: decodes inbound text into frames, watches incoming heart-beats,
//           reports `Closed` exactly once when the socket ends

use super::stomp::{negotiate_heartbeat, parse_frames, parse_heartbeat, Command, Frame};
use super::transport::{Handshake, Transport, TransportEvent, TransportLink};
use crate::atoms::error::{LinkError, LinkResult};
use crate::config::ClientConfig;
use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

/// Incoming silence tolerated is this multiple of the negotiated interval.
const INCOMING_GRACE_FACTOR: u64 = 2;

pub struct WsTransport {
    url: Url,
    /// Client heart-beat request `(outgoing, incoming)` in milliseconds.
    heartbeat: (u64, u64),
}

impl WsTransport {
    pub fn new(server_url: &str, ws_path: &str, heartbeat: (u64, u64)) -> LinkResult<Self> {
        Ok(WsTransport { url: websocket_url(server_url, ws_path)?, heartbeat })
    }

    pub fn from_config(config: &ClientConfig) -> LinkResult<Self> {
        Self::new(&config.server_url, &config.ws_path, config.heartbeat())
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Map an `http(s)://` server URL onto the `ws(s)://` socket URL.
pub fn websocket_url(server_url: &str, ws_path: &str) -> LinkResult<Url> {
    let mut url = Url::parse(server_url.trim())
        .map_err(|e| LinkError::Config(format!("Invalid server URL '{}': {}", server_url, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(LinkError::Config(format!(
                "Unsupported URL scheme '{}://'. Use http(s):// or ws(s)://",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| LinkError::Config(format!("Cannot use scheme {} for {}", scheme, server_url)))?;

    let base = url.path().trim_end_matches('/').to_string();
    let suffix = if ws_path.starts_with('/') { ws_path.to_string() } else { format!("/{}", ws_path) };
    url.set_path(&format!("{}{}", base, suffix));
    Ok(url)
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, handshake: &Handshake) -> LinkResult<TransportLink> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(cookie) = &handshake.cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|_| LinkError::Config("Session cookie is not a valid header value".into()))?;
            request.headers_mut().insert(header::COOKIE, value);
        }
        if let Some(token) = &handshake.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| LinkError::Config("Bearer token is not a valid header value".into()))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        debug!("[ws] Opening {}", self.url);
        let (stream, _) = connect_async(request).await?;
        info!("[ws] Socket open: {}", self.url);

        let (mut ws_tx, mut ws_rx) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();
        // negotiated (outgoing, incoming) intervals, published once CONNECTED arrives
        let (hb_tx, mut hb_rx) = watch::channel((0u64, 0u64));
        let (writer_done_tx, mut writer_done_rx) = oneshot::channel::<()>();

        // ── Writer task ────────────────────────────────────────────────
        tokio::spawn(async move {
            let mut outgoing_ms = 0u64;
            loop {
                let idle = (outgoing_ms > 0).then(|| Duration::from_millis(outgoing_ms));
                tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = ws_tx.send(WsMessage::Text(frame.encode())).await {
                                warn!("[ws] Write failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                    changed = hb_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        outgoing_ms = hb_rx.borrow().0;
                    }
                    _ = sleep_or_forever(idle) => {
                        if ws_tx.send(WsMessage::Text("\n".into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = ws_tx.send(WsMessage::Close(None)).await;
            let _ = writer_done_tx.send(());
            debug!("[ws] Writer task exiting");
        });

        // ── Reader task ────────────────────────────────────────────────
        let client_heartbeat = self.heartbeat;
        tokio::spawn(async move {
            let mut window: Option<Duration> = None;
            let reason = 'read: loop {
                let next = tokio::select! {
                    _ = &mut writer_done_rx => break 'read "closed locally".to_string(),
                    next = next_within(&mut ws_rx, window) => next,
                };
                let text = match next {
                    Err(_) => break 'read "heart-beat timeout".to_string(),
                    Ok(None) => break 'read "socket closed by server".to_string(),
                    Ok(Some(Err(e))) => break 'read format!("WebSocket error: {}", e),
                    Ok(Some(Ok(WsMessage::Text(t)))) => t,
                    Ok(Some(Ok(WsMessage::Binary(b)))) => match String::from_utf8(b) {
                        Ok(t) => t,
                        Err(_) => break 'read "non-UTF-8 binary frame".to_string(),
                    },
                    Ok(Some(Ok(WsMessage::Close(frame)))) => {
                        break 'read match frame {
                            Some(f) => format!("closed by server ({}: {})", u16::from(f.code), f.reason),
                            None => "closed by server".to_string(),
                        }
                    }
                    // ping/pong are answered by tungstenite; any traffic counts as liveness
                    Ok(Some(Ok(_))) => continue,
                };

                let frames = match parse_frames(&text) {
                    Ok(frames) => frames,
                    Err(e) => break 'read format!("protocol error: {}", e),
                };
                for frame in frames {
                    if frame.command == Command::Connected {
                        let server = frame.get("heart-beat").and_then(parse_heartbeat).unwrap_or((0, 0));
                        let (outgoing, incoming) = negotiate_heartbeat(client_heartbeat, server);
                        debug!("[ws] Heart-beat negotiated: out={}ms in={}ms", outgoing, incoming);
                        let _ = hb_tx.send((outgoing, incoming));
                        window = (incoming > 0)
                            .then(|| Duration::from_millis(incoming * INCOMING_GRACE_FACTOR));
                    }
                    if in_tx.send(TransportEvent::Frame(frame)).is_err() {
                        break 'read "link dropped".to_string();
                    }
                }
            };
            info!("[ws] Socket ended: {}", reason);
            let _ = in_tx.send(TransportEvent::Closed(reason));
        });

        Ok(TransportLink { outbound: out_tx, inbound: in_rx })
    }

    fn host(&self) -> String {
        self.url.host_str().unwrap_or("localhost").to_string()
    }
}

async fn sleep_or_forever(d: Option<Duration>) {
    match d {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// Next stream item, failing with `Err(())` if `window` elapses first.
async fn next_within<S>(stream: &mut S, window: Option<Duration>) -> Result<Option<S::Item>, ()>
where
    S: Stream + Unpin,
{
    match window {
        Some(w) => tokio::time::timeout(w, stream.next()).await.map_err(|_| ()),
        None => Ok(stream.next().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_maps_to_ws_with_sockjs_path() {
        let url = websocket_url("http://localhost:8080", "/ws/websocket").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8080/ws/websocket");
    }

    #[test]
    fn https_maps_to_wss_and_keeps_base_path() {
        let url = websocket_url("https://chat.example.com/api/", "ws/websocket").unwrap();
        assert_eq!(url.as_str(), "wss://chat.example.com/api/ws/websocket");
    }

    #[test]
    fn ws_scheme_is_kept() {
        let url = websocket_url("ws://127.0.0.1:9000", "/ws").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/ws");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(matches!(websocket_url("ftp://host", "/ws"), Err(LinkError::Config(_))));
        assert!(matches!(websocket_url("not a url", "/ws"), Err(LinkError::Config(_))));
    }

    #[test]
    fn host_header_comes_from_url() {
        let t = WsTransport::new("http://chat.local:8080", "/ws/websocket", (4000, 4000)).unwrap();
        assert_eq!(t.host(), "chat.local");
    }
}
