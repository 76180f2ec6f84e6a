// ── Gisma Atoms: Constants ─────────────────────────────────────────────────
// All named constants for the crate live here.
// Destinations and endpoints are server-defined; treat them as stable wire
// identifiers.

// ── Server defaults ────────────────────────────────────────────────────────
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";
// The server registers `/ws` with SockJS; the raw WebSocket transport of a
// SockJS endpoint lives under `/websocket`.
pub const DEFAULT_WS_PATH: &str = "/ws/websocket";

// ── STOMP destinations ─────────────────────────────────────────────────────
pub const START_CHAT_DESTINATION: &str = "/app/chat.start";
pub const SEND_DESTINATION: &str = "/app/chat";
pub const REPLY_DESTINATION_PREFIX: &str = "/user/queue/chat.";
pub const METADATA_DESTINATION: &str = "/user/queue/chat.metadata";

/// Literal marker the server sends to close a reply stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Callback key used by the chat service when only one exchange is active.
pub const DEFAULT_CALLBACK_KEY: &str = "default";

// ── Connection timing ──────────────────────────────────────────────────────
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const RECONNECT_BASE_DELAY_MS: u64 = 3_000;
pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;
pub const HEARTBEAT_INCOMING_MS: u64 = 4_000;
pub const HEARTBEAT_OUTGOING_MS: u64 = 4_000;

// ── Streaming timing ───────────────────────────────────────────────────────
// Liveness fallback for replies that never send a completion sentinel.
pub const STALL_TIMEOUT_MS: u64 = 500;
// After a user stop, later sends are not treated as aborted once this elapses.
pub const STOP_GRACE_MS: u64 = 1_000;

// ── REST endpoints ─────────────────────────────────────────────────────────
pub const AUTH_LOGIN: &str = "/auth/login";
pub const AUTH_ME: &str = "/auth/me";
pub const AUTH_LOGOUT: &str = "/auth/logout";
pub const AUTH_REFRESH: &str = "/auth/refresh-token";
pub const CHAT_MEMORY: &str = "/chat-memory";
pub const API_TIMEOUT_MS: u64 = 10_000;

// ── User-facing notices ────────────────────────────────────────────────────
pub const NOTICE_CONNECTION_ERROR: &str = "Connection error. Please try again.";
pub const NOTICE_SEND_FAILED: &str = "Failed to send message. Please try again.";
pub const NOTICE_MISSING_CHAT_ID: &str = "Chat ID is missing.";
