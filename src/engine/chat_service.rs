// Gisma Link: Chat Service
//
// Maps chat intents onto the shared connection:
//   new chat      subscribe metadata → publish /app/chat.start → on metadata,
//                 subscribe /user/queue/chat.<chatId>
//   continue      subscribe /user/queue/chat.<chatId> → publish /app/chat
//
// One exchange is current at a time. `abort_current_stream()` only gates
// delivery; subscriptions stay in place so a later send on the same chat
// reuses them.

use super::connection::{ConnectionManager, MetadataHandler, ReplyHandler};
use super::reply::reply_destination;
use crate::atoms::constants::{START_CHAT_DESTINATION, SEND_DESTINATION, DEFAULT_CALLBACK_KEY};
use crate::atoms::error::{LinkError, LinkResult};
use crate::atoms::types::{ChatMetadata, ChatRequest, ReplyFrame};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub use super::reply::{decode_metadata, decode_reply};

/// Where the current exchange stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    Idle,
    /// New chat published, waiting for the server to assign a chat id.
    AwaitingMetadata,
    Streaming,
    Complete,
    Aborted,
}

/// Receiver of one exchange's reply stream.
pub trait ChatEvents: Send + Sync + 'static {
    fn on_chunk(&self, chunk: &str);
    fn on_complete(&self);
    fn on_error(&self, error: &LinkError);
    fn on_metadata(&self, _metadata: &ChatMetadata) {}
}

struct Exchange {
    stopped: AtomicBool,
    phase: Mutex<ExchangePhase>,
    /// Chat whose reply channel belongs to the current exchange.
    chat_id: Mutex<Option<String>>,
}

impl Exchange {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: ExchangePhase) {
        *self.phase.lock() = phase;
    }
}

pub struct ChatService {
    connection: Arc<ConnectionManager>,
    authenticated: AtomicBool,
    exchange: Arc<Exchange>,
}

impl ChatService {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        ChatService {
            connection,
            authenticated: AtomicBool::new(false),
            exchange: Arc::new(Exchange {
                stopped: AtomicBool::new(false),
                phase: Mutex::new(ExchangePhase::Idle),
                chat_id: Mutex::new(None),
            }),
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Gate for `connect()` and the send operations. Losing the session
    /// drops the connection; the manager itself is kept.
    pub fn set_authenticated(&self, authenticated: bool) {
        let was = self.authenticated.swap(authenticated, Ordering::SeqCst);
        if was == authenticated {
            return;
        }
        info!("[chat] Session {}", if authenticated { "authenticated" } else { "ended" });
        if !authenticated {
            self.connection.disconnect();
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub async fn connect(&self) -> LinkResult<()> {
        if !self.is_authenticated() {
            warn!("[chat] Not authenticated, skipping connect");
            return Ok(());
        }
        self.connection.connect().await.map_err(LinkError::from)
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn phase(&self) -> ExchangePhase {
        *self.exchange.phase.lock()
    }

    /// Publish the first message of a chat that has no id yet.
    pub async fn start_new_chat(&self, request: ChatRequest, events: Arc<dyn ChatEvents>) -> LinkResult<()> {
        self.ensure_authenticated()?;
        self.begin(None, ExchangePhase::AwaitingMetadata);

        self.connection
            .subscribe_to_metadata(self.metadata_handler(events), DEFAULT_CALLBACK_KEY);

        let request = ChatRequest { chat_id: None, ..request };
        debug!("[chat] Starting new chat");
        self.connection.send_message(&request, START_CHAT_DESTINATION).await
    }

    /// Publish a follow-up message to an existing chat.
    pub async fn send_message(
        &self,
        request: ChatRequest,
        chat_id: &str,
        events: Arc<dyn ChatEvents>,
    ) -> LinkResult<()> {
        self.ensure_authenticated()?;
        if chat_id.trim().is_empty() {
            return Err(LinkError::MissingChatId);
        }
        self.begin(Some(chat_id), ExchangePhase::Streaming);

        self.connection.subscribe_to_reply(
            &reply_destination(chat_id),
            reply_handler(Arc::clone(&self.exchange), events),
            chat_id,
        );

        let request = ChatRequest { chat_id: Some(chat_id.to_string()), ..request };
        debug!("[chat] Continuing chat {}", chat_id);
        self.connection.send_message(&request, SEND_DESTINATION).await
    }

    /// Drop every later frame of the current exchange. Subscriptions stay.
    pub fn abort_current_stream(&self) {
        self.exchange.stopped.store(true, Ordering::SeqCst);
        self.exchange.set_phase(ExchangePhase::Aborted);
        info!("[chat] Current stream aborted");
    }

    fn ensure_authenticated(&self) -> LinkResult<()> {
        if self.is_authenticated() {
            Ok(())
        } else {
            warn!("[chat] Not authenticated, refusing to send");
            Err(LinkError::Unauthenticated)
        }
    }

    /// Reset the exchange and release the reply channel of a previous chat.
    fn begin(&self, chat_id: Option<&str>, phase: ExchangePhase) {
        let previous = {
            let mut current = self.exchange.chat_id.lock();
            std::mem::replace(&mut *current, chat_id.map(str::to_string))
        };
        if let Some(prev) = previous.filter(|p| Some(p.as_str()) != chat_id) {
            self.connection.unsubscribe(&reply_destination(&prev));
            self.connection.clear_reply_handler(&prev);
        }
        self.exchange.stopped.store(false, Ordering::SeqCst);
        self.exchange.set_phase(phase);
    }

    fn metadata_handler(&self, events: Arc<dyn ChatEvents>) -> MetadataHandler {
        let exchange = Arc::clone(&self.exchange);
        let connection: Weak<ConnectionManager> = Arc::downgrade(&self.connection);
        Arc::new(move |decoded: LinkResult<ChatMetadata>| {
            if exchange.is_stopped() {
                debug!("[chat] Metadata after abort ignored");
                return;
            }
            match decoded {
                Ok(meta) => {
                    info!("[chat] Server assigned chat {}", meta.chat_id);
                    *exchange.chat_id.lock() = Some(meta.chat_id.clone());
                    exchange.set_phase(ExchangePhase::Streaming);
                    events.on_metadata(&meta);
                    if let Some(connection) = connection.upgrade() {
                        connection.subscribe_to_reply(
                            &reply_destination(&meta.chat_id),
                            reply_handler(Arc::clone(&exchange), Arc::clone(&events)),
                            &meta.chat_id,
                        );
                    }
                }
                Err(e) => {
                    warn!("[chat] {}", e);
                    events.on_error(&e);
                }
            }
        })
    }
}

fn reply_handler(exchange: Arc<Exchange>, events: Arc<dyn ChatEvents>) -> ReplyHandler {
    Arc::new(move |frame: ReplyFrame| {
        if exchange.is_stopped() {
            return;
        }
        match frame {
            ReplyFrame::Chunk(text) => events.on_chunk(&text),
            ReplyFrame::Complete => {
                exchange.set_phase(ExchangePhase::Complete);
                events.on_complete();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::constants::METADATA_DESTINATION;
    use crate::atoms::types::ResponseFormat;
    use crate::engine::connection::ConnectionOptions;
    use crate::engine::stomp::Command;
    use crate::engine::testing::{settle, Behavior, MockTransport};

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl ChatEvents for Recorder {
        fn on_chunk(&self, chunk: &str) {
            self.log.lock().push(format!("chunk:{}", chunk));
        }
        fn on_complete(&self) {
            self.log.lock().push("complete".into());
        }
        fn on_error(&self, error: &LinkError) {
            self.log.lock().push(format!("error:{}", error));
        }
        fn on_metadata(&self, metadata: &ChatMetadata) {
            self.log.lock().push(format!("metadata:{}:{}", metadata.chat_id, metadata.description));
        }
    }

    fn service(mock: &Arc<MockTransport>) -> ChatService {
        let conn = Arc::new(ConnectionManager::new(mock.clone(), ConnectionOptions::default()));
        let svc = ChatService::new(conn);
        svc.set_authenticated(true);
        svc
    }

    #[tokio::test]
    async fn unauthenticated_send_is_refused() {
        let mock = MockTransport::new();
        let svc = service(&mock);
        svc.set_authenticated(false);
        let rec = Arc::new(Recorder::default());

        let err = svc
            .start_new_chat(ChatRequest::new("Hi", ResponseFormat::Simple), rec.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Unauthenticated));
        assert!(matches!(
            svc.send_message(ChatRequest::new("Hi", ResponseFormat::Simple), "abc", rec).await,
            Err(LinkError::Unauthenticated)
        ));
        assert_eq!(mock.open_count(), 0);
    }

    #[tokio::test]
    async fn unauthenticated_connect_is_skipped() {
        let mock = MockTransport::new();
        let svc = service(&mock);
        svc.set_authenticated(false);

        svc.connect().await.unwrap();
        assert_eq!(mock.open_count(), 0);
        assert!(!svc.is_connected());
    }

    #[tokio::test]
    async fn auth_toggle_keeps_the_same_manager() {
        let mock = MockTransport::new();
        let svc = service(&mock);
        let before = Arc::as_ptr(svc.connection());

        svc.connect().await.unwrap();
        svc.set_authenticated(true);
        assert!(svc.is_connected(), "repeated true must not churn the link");

        svc.set_authenticated(false);
        assert!(!svc.is_connected());
        svc.set_authenticated(true);
        svc.connect().await.unwrap();
        assert!(svc.is_connected());
        assert_eq!(Arc::as_ptr(svc.connection()), before);
    }

    #[tokio::test]
    async fn empty_chat_id_is_rejected() {
        let mock = MockTransport::new();
        let svc = service(&mock);
        let err = svc
            .send_message(ChatRequest::new("Hi", ResponseFormat::Simple), "  ", Arc::new(Recorder::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::MissingChatId));
    }

    #[tokio::test]
    async fn new_chat_flow_subscribes_reply_channel_on_metadata() {
        let mock = MockTransport::new();
        let svc = service(&mock);
        let rec = Arc::new(Recorder::default());

        svc.start_new_chat(ChatRequest::new("Hi", ResponseFormat::Simple), rec.clone())
            .await
            .unwrap();
        settle().await;
        assert_eq!(svc.phase(), ExchangePhase::AwaitingMetadata);

        let send = &mock.sent_with(Command::Send)[0];
        assert_eq!(send.get("destination"), Some("/app/chat.start"));
        let body: serde_json::Value = serde_json::from_str(&send.body).unwrap();
        assert_eq!(body["query"], "Hi");
        assert_eq!(body["responseFormat"], "SIMPLE");
        assert!(body["schemaJson"].is_null());
        assert!(body.get("chatId").is_none());

        mock.deliver(METADATA_DESTINATION, r#"{"chatId":"abc","description":"Greeting"}"#);
        settle().await;
        assert!(mock.subscription_for("/user/queue/chat.abc").is_some());
        assert_eq!(svc.phase(), ExchangePhase::Streaming);

        mock.deliver("/user/queue/chat.abc", "Hel");
        mock.deliver("/user/queue/chat.abc", "lo!");
        mock.deliver("/user/queue/chat.abc", "[DONE]");
        settle().await;

        assert_eq!(
            *rec.log.lock(),
            vec!["metadata:abc:Greeting", "chunk:Hel", "chunk:lo!", "complete"]
        );
        assert_eq!(svc.phase(), ExchangePhase::Complete);
    }

    #[tokio::test]
    async fn malformed_metadata_surfaces_protocol_error() {
        let mock = MockTransport::new();
        let svc = service(&mock);
        let rec = Arc::new(Recorder::default());
        svc.start_new_chat(ChatRequest::new("Hi", ResponseFormat::Simple), rec.clone())
            .await
            .unwrap();
        settle().await;

        mock.deliver(METADATA_DESTINATION, r#"{"id":"abc"}"#);
        settle().await;

        let log = rec.log.lock();
        assert_eq!(log.len(), 1);
        assert!(log[0].starts_with("error:Protocol error"));
    }

    #[tokio::test]
    async fn continue_chat_publishes_with_chat_id() {
        let mock = MockTransport::new();
        let svc = service(&mock);
        let rec = Arc::new(Recorder::default());

        let request = ChatRequest::new("More", ResponseFormat::Schema).with_schema(Some("{}".into()));
        svc.send_message(request, "xyz", rec.clone()).await.unwrap();
        settle().await;

        let send = &mock.sent_with(Command::Send)[0];
        assert_eq!(send.get("destination"), Some("/app/chat"));
        let body: serde_json::Value = serde_json::from_str(&send.body).unwrap();
        assert_eq!(body["chatId"], "xyz");
        assert_eq!(body["responseFormat"], "SCHEMA");
        assert_eq!(body["schemaJson"], "{}");

        mock.deliver("/user/queue/chat.xyz", "ok");
        settle().await;
        assert_eq!(*rec.log.lock(), vec!["chunk:ok"]);
    }

    #[tokio::test]
    async fn abort_silences_the_stream_without_unsubscribing() {
        let mock = MockTransport::new();
        let svc = service(&mock);
        let rec = Arc::new(Recorder::default());
        svc.send_message(ChatRequest::new("Q", ResponseFormat::Simple), "xyz", rec.clone())
            .await
            .unwrap();
        settle().await;

        mock.deliver("/user/queue/chat.xyz", "a");
        settle().await;
        svc.abort_current_stream();
        mock.deliver("/user/queue/chat.xyz", "b");
        mock.deliver("/user/queue/chat.xyz", "");
        settle().await;

        assert_eq!(*rec.log.lock(), vec!["chunk:a"]);
        assert_eq!(svc.phase(), ExchangePhase::Aborted);
        assert!(mock.sent_with(Command::Unsubscribe).is_empty());
        assert!(mock.subscription_for("/user/queue/chat.xyz").is_some());
    }

    #[tokio::test]
    async fn switching_chats_releases_previous_reply_channel() {
        let mock = MockTransport::new();
        let svc = service(&mock);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        svc.send_message(ChatRequest::new("1", ResponseFormat::Simple), "one", first.clone())
            .await
            .unwrap();
        svc.send_message(ChatRequest::new("2", ResponseFormat::Simple), "two", second.clone())
            .await
            .unwrap();
        settle().await;

        assert!(mock.subscription_for("/user/queue/chat.one").is_none());
        mock.deliver("/user/queue/chat.two", "hi");
        settle().await;
        assert!(first.log.lock().is_empty());
        assert_eq!(*second.log.lock(), vec!["chunk:hi"]);
    }

    #[tokio::test]
    async fn send_fails_cleanly_when_server_is_down() {
        let mock = MockTransport::new();
        mock.set_default(Behavior::Refuse);
        let svc = service(&mock);

        let err = svc
            .send_message(ChatRequest::new("Q", ResponseFormat::Simple), "xyz", Arc::new(Recorder::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NotConnected(_)));
        // binding is kept for when the link comes back
        assert_eq!(svc.connection().bound_destinations(), vec!["/user/queue/chat.xyz".to_string()]);
    }
}
