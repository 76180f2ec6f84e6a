// Gisma Link: STOMP-over-WebSocket chat client
//
// One `ConnectionManager` per process, owned by the composition root and
// shared by reference:
//
//   let config = ClientConfig::load()?;
//   let api = ApiClient::from_config(&config)?;
//   api.login(user, password).await?;
//
//   let connection = Arc::new(ConnectionManager::from_config(&config)?);
//   connection.set_handshake(api.handshake());
//   let service = Arc::new(ChatService::new(connection));
//   service.set_authenticated(true);
//   let streamer = ChatStreamer::new(service, listener, StreamOptions::from(&config));

pub mod atoms;
pub mod config;
pub mod engine;

pub use atoms::error::{ConnectError, LinkError, LinkResult};
pub use atoms::types::{
    ChatMetadata, ChatRequest, Conversation, Message, ReplyFrame, ResponseFormat, Role, UserInfo,
};
pub use config::ClientConfig;
pub use engine::api::ApiClient;
pub use engine::chat_service::{ChatEvents, ChatService, ExchangePhase};
pub use engine::connection::{ConnectionManager, ConnectionOptions, MetadataHandler, ReplyHandler};
pub use engine::streaming::{ChatStreamer, StreamListener, StreamOptions};
pub use engine::transport::{Handshake, Transport, TransportEvent, TransportLink};
pub use engine::ws::WsTransport;
