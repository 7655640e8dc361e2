use crate::assembler::MessageAssembler;
use crate::models::{Conversation, HistoryMetadata, Message, Role, StreamRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Cooperative cancellation flag for one exchange.
///
/// Clones share the flag; aborting any clone aborts them all. Stream reads
/// race against [`AbortHandle::aborted`] so a stop request takes effect at
/// the next suspension point.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    id: Uuid,
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn abort(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            log::warn!("Abort requested for exchange {}", self.id);
        }
        self.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the handle has been aborted.
    pub async fn aborted(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent abort is not missed
            notified.as_mut().enable();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-request state for one question/answer cycle.
///
/// Created when the question is submitted and dropped once the exchange
/// resolves, so nothing accumulated here leaks into the next exchange.
#[derive(Debug)]
pub struct ExchangeContext {
    pub user_message: Message,
    /// Conversation the question continues; `None` starts a new one.
    pub conversation_id: Option<String>,
    /// Display list as it stood before any streamed message arrived.
    pub base: Vec<Message>,
    /// Working copy of an ephemeral conversation (stateless mode).
    pub conversation: Option<Conversation>,
    pub assembler: MessageAssembler,
    /// Latest conversation identity announced by the history backend.
    pub history_metadata: Option<HistoryMetadata>,
    abort: AbortHandle,
}

impl ExchangeContext {
    pub fn new(question: &str, conversation_id: Option<String>, abort: AbortHandle) -> Self {
        Self {
            user_message: Message::user(question),
            conversation_id,
            base: Vec::new(),
            conversation: None,
            assembler: MessageAssembler::new(),
            history_metadata: None,
            abort,
        }
    }

    pub fn abort_handle(&self) -> &AbortHandle {
        &self.abort
    }

    /// Feeds a parsed record through the assembler, returning the display deltas.
    pub fn observe(&mut self, record: StreamRecord) -> Vec<Message> {
        if let Some(metadata) = record.history_metadata.as_ref() {
            self.history_metadata = Some(metadata.clone());
        }
        self.assembler.apply(record)
    }

    /// Base display list followed by the given messages.
    pub fn display_with(&self, extra: &[Message]) -> Vec<Message> {
        self.base.iter().chain(extra.iter()).cloned().collect()
    }

    /// Hands out the `[tool?, assistant?]` pair, leaving a fresh assembler behind.
    pub fn take_answer(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.assembler).finish()
    }
}

/// Messages the backend should see: everything except client-side errors.
pub fn request_messages(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .filter(|m| m.role != Role::Error)
        .cloned()
        .collect()
}
