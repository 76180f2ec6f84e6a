// Gisma Link Engine: STOMP chat client runtime
// Transport, connection lifecycle, chat intents and reply streaming.
// Leaves first: stomp → transport/ws → connection → chat_service → streaming.

pub mod api;
pub mod backoff;
pub mod chat_service;
pub mod connection;
pub mod reply;
pub mod stomp;
pub mod streaming;
pub mod transport;
pub mod ws;

#[cfg(test)]
pub(crate) mod testing;
