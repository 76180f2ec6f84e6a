// Gisma Link: Reply Streaming
//
// Turns a chat service reply stream into a growing conversation:
//   • the user message is appended (after trimming `delete_count` messages)
//   • the first chunk creates the assistant message, later chunks extend it
//   • a stall timer, armed at send and re-armed on every chunk or metadata
//     frame, finalizes replies whose completion marker never arrives
//   • `stop()` aborts the exchange and finalizes at once
//
// Finalization happens exactly once per stream and hands the listener the
// final conversation carrying the server-assigned chat id.

use super::chat_service::{ChatEvents, ChatService};
use crate::atoms::constants::*;
use crate::atoms::error::{LinkError, LinkResult};
use crate::atoms::types::{ChatMetadata, ChatRequest, Conversation, Message, Role};
use crate::config::ClientConfig;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// UI-side receiver of streaming progress.
pub trait StreamListener: Send + Sync + 'static {
    /// Conversation snapshot after every change.
    fn on_stream_update(&self, conversation: &Conversation);
    fn on_metadata(&self, _metadata: &ChatMetadata) {}
    /// Called once per stream, after the final `on_stream_update`.
    fn on_stream_complete(&self, _conversation: &Conversation) {}
    /// User-facing notice (toast).
    fn on_notice(&self, _message: &str) {}
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub stall_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            stall_timeout: Duration::from_millis(STALL_TIMEOUT_MS),
            stop_grace: Duration::from_millis(STOP_GRACE_MS),
        }
    }
}

impl From<&ClientConfig> for StreamOptions {
    fn from(config: &ClientConfig) -> Self {
        StreamOptions { stall_timeout: config.stall_timeout(), stop_grace: config.stop_grace() }
    }
}

#[derive(Default)]
struct StreamerShared {
    is_streaming: AtomicBool,
    stop_requested: AtomicBool,
    current: Mutex<Option<Arc<ChatStream>>>,
}

pub struct ChatStreamer {
    service: Arc<ChatService>,
    listener: Arc<dyn StreamListener>,
    options: StreamOptions,
    shared: Arc<StreamerShared>,
}

impl ChatStreamer {
    pub fn new(service: Arc<ChatService>, listener: Arc<dyn StreamListener>, options: StreamOptions) -> Self {
        ChatStreamer { service, listener, options, shared: Arc::new(StreamerShared::default()) }
    }

    pub fn service(&self) -> &Arc<ChatService> {
        &self.service
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.is_streaming.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop_requested.load(Ordering::SeqCst)
    }

    /// Latest snapshot of the conversation being streamed, if any.
    pub fn current_conversation(&self) -> Option<Conversation> {
        self.shared.current.lock().as_ref().map(|s| s.snapshot())
    }

    /// Send `message` in `conversation`, replacing its last `delete_count`
    /// messages (regenerate / edit).
    pub async fn send_message(
        &self,
        conversation: Conversation,
        message: Message,
        delete_count: usize,
    ) -> LinkResult<()> {
        let mut messages = conversation.messages;
        messages.truncate(messages.len().saturating_sub(delete_count));
        messages.push(message.clone());
        let updated = Conversation { messages, ..conversation };

        self.listener.on_stream_update(&updated);
        self.shared.is_streaming.store(true, Ordering::SeqCst);
        self.shared.stop_requested.store(false, Ordering::SeqCst);

        let chat_id = updated.chat_id.clone().filter(|id| !id.trim().is_empty());
        let is_new_chat = chat_id.is_none() && updated.messages.len() == 1;
        if !is_new_chat && chat_id.is_none() {
            warn!("[stream] Continuing a chat without a chat id");
            self.listener.on_notice(NOTICE_MISSING_CHAT_ID);
            self.shared.is_streaming.store(false, Ordering::SeqCst);
            return Err(LinkError::MissingChatId);
        }

        let request = ChatRequest::new(message.content, updated.response_format)
            .with_schema(updated.schema_json.clone());
        let stream = ChatStream::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.listener),
            Arc::downgrade(&self.service),
            self.options.stall_timeout,
            updated,
        );
        let superseded = self.shared.current.lock().replace(Arc::clone(&stream));
        if let Some(old) = superseded {
            old.abandon();
        }

        let events: Arc<dyn ChatEvents> = stream.clone();
        let sent = match chat_id {
            None => self.service.start_new_chat(request, events).await,
            Some(id) => self.service.send_message(request, &id, events).await,
        };
        if let Err(e) = sent {
            error!("[stream] Failed to send message: {}", e);
            self.listener.on_notice(NOTICE_SEND_FAILED);
            stream.abandon();
            return Err(e);
        }
        // The stall window opens once the frame is on the link; a slow
        // connect must not eat into it.
        stream.arm_stall_timer();
        Ok(())
    }

    /// User pressed stop.
    pub fn stop(&self) {
        info!("[stream] Stop requested");
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.service.abort_current_stream();

        let current = self.shared.current.lock().clone();
        match current {
            Some(stream) => stream.finalize(),
            None => self.shared.is_streaming.store(false, Ordering::SeqCst),
        }

        let shared = Arc::clone(&self.shared);
        let grace = self.options.stop_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            shared.stop_requested.store(false, Ordering::SeqCst);
        });
    }
}

// ── One reply stream ───────────────────────────────────────────────────

struct StreamState {
    conversation: Conversation,
    assistant_started: bool,
    chat_id: Option<String>,
    stall_timer: Option<JoinHandle<()>>,
}

struct ChatStream {
    me: Weak<ChatStream>,
    shared: Arc<StreamerShared>,
    listener: Arc<dyn StreamListener>,
    service: Weak<ChatService>,
    stall_timeout: Duration,
    finalized: AtomicBool,
    /// Bumped on every re-arm; a timer only fires for the epoch it was armed with.
    stall_epoch: AtomicU64,
    /// Held across state changes and the listener calls they produce, so no
    /// update can follow the completion. Reentrant: listeners may call `stop()`.
    emit: ReentrantMutex<()>,
    state: Mutex<StreamState>,
}

impl ChatStream {
    fn new(
        shared: Arc<StreamerShared>,
        listener: Arc<dyn StreamListener>,
        service: Weak<ChatService>,
        stall_timeout: Duration,
        conversation: Conversation,
    ) -> Arc<Self> {
        let chat_id = conversation.chat_id.clone();
        Arc::new_cyclic(|me| ChatStream {
            me: me.clone(),
            shared,
            listener,
            service,
            stall_timeout,
            finalized: AtomicBool::new(false),
            stall_epoch: AtomicU64::new(0),
            emit: ReentrantMutex::new(()),
            state: Mutex::new(StreamState {
                conversation,
                assistant_started: false,
                chat_id,
                stall_timer: None,
            }),
        })
    }

    fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Conversation {
        self.state.lock().conversation.clone()
    }

    /// (Re)start the stall countdown.
    fn arm_stall_timer(&self) {
        if self.is_finalized() {
            return;
        }
        let me = self.me.clone();
        let timeout = self.stall_timeout;
        let epoch = self.stall_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(stream) = me.upgrade() {
                stream.stall_expired(epoch);
            }
        });
        if let Some(old) = self.state.lock().stall_timer.replace(timer) {
            old.abort();
        }
    }

    fn stall_expired(&self, epoch: u64) {
        let _emit = self.emit.lock();
        if self.stall_epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        debug!("[stream] No data for {}ms, finalizing", self.stall_timeout.as_millis());
        self.finalize();
    }

    fn cancel_stall_timer(&self) {
        if let Some(timer) = self.state.lock().stall_timer.take() {
            timer.abort();
        }
    }

    fn is_current(&self) -> bool {
        self.shared
            .current
            .lock()
            .as_ref()
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), self))
    }

    fn release(&self) {
        if self.is_current() {
            self.shared.is_streaming.store(false, Ordering::SeqCst);
        }
    }

    fn finalize(&self) {
        let _emit = self.emit.lock();
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_stall_timer();
        self.release();

        let conversation = {
            let mut st = self.state.lock();
            if st.chat_id.is_some() {
                st.conversation.chat_id = st.chat_id.clone();
            }
            st.conversation.clone()
        };
        debug!(
            "[stream] Finalized ({} chars)",
            conversation.last_assistant_content().map(str::len).unwrap_or(0)
        );
        self.listener.on_stream_update(&conversation);
        self.listener.on_stream_complete(&conversation);
    }

    /// End without a final update: the send never went out or a newer
    /// stream took over.
    fn abandon(&self) {
        let _emit = self.emit.lock();
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_stall_timer();
        self.release();
    }
}

impl ChatEvents for ChatStream {
    fn on_chunk(&self, chunk: &str) {
        let _emit = self.emit.lock();
        if self.is_finalized() {
            return;
        }
        if self.shared.stop_requested.load(Ordering::SeqCst) {
            if let Some(service) = self.service.upgrade() {
                service.abort_current_stream();
            }
            self.finalize();
            return;
        }
        self.arm_stall_timer();

        let snapshot = {
            let mut st = self.state.lock();
            if st.assistant_started {
                if let Some(last) = st.conversation.messages.last_mut().filter(|m| m.role == Role::Assistant) {
                    last.content.push_str(chunk);
                }
            } else {
                st.assistant_started = true;
                st.conversation.messages.push(Message::assistant(chunk));
            }
            st.conversation.clone()
        };
        self.listener.on_stream_update(&snapshot);
    }

    fn on_complete(&self) {
        self.finalize();
    }

    fn on_error(&self, error: &LinkError) {
        let _emit = self.emit.lock();
        if self.is_finalized() {
            return;
        }
        warn!("[stream] Reply stream error: {}", error);
        self.listener.on_notice(NOTICE_CONNECTION_ERROR);
        self.finalize();
    }

    fn on_metadata(&self, metadata: &ChatMetadata) {
        let _emit = self.emit.lock();
        if self.is_finalized() {
            return;
        }
        self.state.lock().chat_id = Some(metadata.chat_id.clone());
        self.arm_stall_timer();
        self.listener.on_metadata(metadata);
    }
}
