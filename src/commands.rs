use crate::api::{ByteStream, ChatTransport, ConversationRequest};
use crate::config::ClientConfig;
use crate::decoder::FrameDecoder;
use crate::error::{ReconcileError, StreamError};
use crate::exchange::{AbortHandle, ExchangeContext};
use crate::models::Message;
use crate::parser::{ParseOutcome, RecordParser};
use crate::reconciler::{ConversationReconciler, Opened, PersistedReconciler, StatelessReconciler};
use crate::state::{ChatEvent, ChatStore, ProcessStatus};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

const SAVE_FAILED: &str = "An error occurred. Answers can't be saved at this time. If the problem persists, please contact the site administrator.";
const CLEAR_FAILED_TITLE: &str = "Error clearing current chat";
const CLEAR_FAILED_SUBTITLE: &str =
    "Please try again. If the problem persists, please contact the site administrator.";

/// How an exchange ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Completed,
    /// The stream broke or the backend reported an error.
    Failed,
    /// The backend answered the generate request with a non-2xx status.
    Rejected,
    Cancelled,
}

// Why the drain loop stopped early
enum DrainStop {
    Aborted,
    Failed(StreamError),
}

/// Drives exchanges from submission to settled transcript.
///
/// Owns the set of in-flight abort handles and the shared store; cloning
/// shares both, which is how background tasks get at them.
#[derive(Clone)]
pub struct ChatSession {
    config: Arc<ClientConfig>,
    transport: Arc<dyn ChatTransport>,
    store: Arc<Mutex<ChatStore>>,
    in_flight: Arc<DashMap<Uuid, AbortHandle>>,
    // Conversation id -> exchange currently streaming into it
    busy: Arc<DashMap<String, Uuid>>,
}

impl ChatSession {
    pub fn new(config: ClientConfig, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            store: Arc::new(Mutex::new(ChatStore::new())),
            in_flight: Arc::new(DashMap::new()),
            busy: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> Arc<Mutex<ChatStore>> {
        self.store.clone()
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.store.lock().await.subscribe()
    }

    /// Number of exchanges whose abort handle is still registered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn reconciler(&self) -> Box<dyn ConversationReconciler> {
        if self.config.history_enabled {
            Box::new(PersistedReconciler)
        } else {
            Box::new(StatelessReconciler)
        }
    }

    /// Asks a question, streams the answer into the conversation and settles it.
    ///
    /// `conversation_id` continues an existing conversation; `None` starts a
    /// new one.
    pub async fn submit(
        &self,
        question: &str,
        conversation_id: Option<&str>,
    ) -> Result<ExchangeOutcome, ReconcileError> {
        let reconciler = self.reconciler();
        let abort = AbortHandle::new();

        if let Some(id) = conversation_id {
            match self.busy.entry(id.to_string()) {
                Entry::Occupied(_) => {
                    log::warn!("Rejecting second submit while conversation {} is streaming", id);
                    return Err(ReconcileError::ExchangeInProgress(id.to_string()));
                }
                Entry::Vacant(slot) => {
                    slot.insert(abort.id());
                }
            }
        }
        self.in_flight.insert(abort.id(), abort.clone());
        self.store.lock().await.set_loading(true, true);

        let mut ctx = ExchangeContext::new(question, conversation_id.map(str::to_owned), abort);
        log::info!(
            "Exchange {} started ({} mode, conversation {:?})",
            ctx.abort_handle().id(),
            reconciler.name(),
            ctx.conversation_id
        );

        let begun = {
            let mut store = self.store.lock().await;
            reconciler.begin(&mut store, &mut ctx)
        };
        let request = match begun {
            Ok(request) => request,
            Err(e) => {
                self.release(&ctx).await;
                return Err(e);
            }
        };

        let outcome = self.drive(reconciler.as_ref(), &mut ctx, &request).await;

        // Runs on every exit path once the exchange was under way
        self.release(&ctx).await;
        self.store.lock().await.set_status(ProcessStatus::Done);
        log::info!("Exchange {} finished: {:?}", ctx.abort_handle().id(), outcome);

        self.settle().await;
        outcome
    }

    async fn drive(
        &self,
        reconciler: &dyn ConversationReconciler,
        ctx: &mut ExchangeContext,
        request: &ConversationRequest,
    ) -> Result<ExchangeOutcome, ReconcileError> {
        let abort = ctx.abort_handle().clone();
        let opened = tokio::select! {
            biased;
            _ = abort.aborted() => None,
            opened = reconciler.open(self.transport.as_ref(), request) => Some(opened),
        };

        let body = match opened {
            None => return Ok(self.cancel(reconciler, ctx).await),
            Some(Err(e)) => {
                log::error!("Failed to open stream: {:?}", e);
                let error = StreamError::Transport(format!("{:#}", e));
                return self.fail(reconciler, ctx, error).await;
            }
            Some(Ok(Opened::Rejected(error))) => {
                let mut store = self.store.lock().await;
                reconciler.rejected(&mut store, ctx, error)?;
                return Ok(ExchangeOutcome::Rejected);
            }
            Some(Ok(Opened::Stream(body))) => body,
        };

        match self.drain(reconciler, ctx, body).await {
            Ok(()) => {
                let mut store = self.store.lock().await;
                reconciler.complete(&mut store, ctx)?;
                Ok(ExchangeOutcome::Completed)
            }
            Err(DrainStop::Aborted) => Ok(self.cancel(reconciler, ctx).await),
            Err(DrainStop::Failed(error)) => self.fail(reconciler, ctx, error).await,
        }
    }

    // Reads the body until it closes, feeding records through the pipeline in order
    async fn drain(
        &self,
        reconciler: &dyn ConversationReconciler,
        ctx: &mut ExchangeContext,
        mut body: ByteStream,
    ) -> Result<(), DrainStop> {
        let abort = ctx.abort_handle().clone();
        let mut decoder = FrameDecoder::new();
        let mut parser = RecordParser::new();

        loop {
            self.store.lock().await.set_status(ProcessStatus::Processing);
            let next = tokio::select! {
                biased;
                _ = abort.aborted() => return Err(DrainStop::Aborted),
                next = body.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    let fragments = decoder.feed(&chunk);
                    self.process(reconciler, ctx, &mut parser, fragments).await?;
                }
                Some(Err(e)) => {
                    log::error!("Error reading stream: {:?}", e);
                    return Err(DrainStop::Failed(StreamError::Transport(format!("{:#}", e))));
                }
                None => {
                    let fragments = decoder.finish();
                    self.process(reconciler, ctx, &mut parser, fragments).await?;
                    if !parser.buffered().is_empty() {
                        log::warn!("Stream closed with {} unparsed bytes", parser.buffered().len());
                        if ctx.assembler.assistant().is_none() {
                            let error = StreamError::Transport("stream closed inside a record".to_string());
                            return Err(DrainStop::Failed(error));
                        }
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn process(
        &self,
        reconciler: &dyn ConversationReconciler,
        ctx: &mut ExchangeContext,
        parser: &mut RecordParser,
        fragments: Vec<String>,
    ) -> Result<(), DrainStop> {
        for fragment in fragments {
            match parser.push(&fragment) {
                ParseOutcome::Parsed(record) => {
                    let deltas = ctx.observe(record);
                    if !deltas.is_empty() {
                        let mut store = self.store.lock().await;
                        store.hide_loading_message();
                        reconciler.progress(&mut store, ctx, &deltas);
                    }
                }
                ParseOutcome::Fatal(error) => return Err(DrainStop::Failed(error)),
                ParseOutcome::Skipped | ParseOutcome::Incomplete => {}
            }
        }
        Ok(())
    }

    async fn cancel(&self, reconciler: &dyn ConversationReconciler, ctx: &ExchangeContext) -> ExchangeOutcome {
        let mut store = self.store.lock().await;
        reconciler.cancelled(&mut store, ctx);
        ExchangeOutcome::Cancelled
    }

    async fn fail(
        &self,
        reconciler: &dyn ConversationReconciler,
        ctx: &mut ExchangeContext,
        error: StreamError,
    ) -> Result<ExchangeOutcome, ReconcileError> {
        // A stop request can surface as a read error; that is not a failure
        if ctx.abort_handle().is_aborted() {
            return Ok(self.cancel(reconciler, ctx).await);
        }
        let mut store = self.store.lock().await;
        reconciler.fail(&mut store, ctx, error.display_text())?;
        Ok(ExchangeOutcome::Failed)
    }

    // Drops the exchange's handle and clears loading indicators
    async fn release(&self, ctx: &ExchangeContext) {
        let id = ctx.abort_handle().id();
        self.in_flight.remove(&id);
        if let Some(conversation_id) = ctx.conversation_id.as_deref() {
            self.busy.remove_if(conversation_id, |_, owner| *owner == id);
        }
        self.store.lock().await.set_loading(false, false);
    }

    /// Post-exchange step: persists the transcript (history mode) and files the
    /// current chat into the history list.
    pub async fn settle(&self) {
        let snapshot = {
            let mut store = self.store.lock().await;
            if store.status() != ProcessStatus::Done {
                return;
            }
            match store.current_chat.clone() {
                Some(conversation) => conversation,
                None => {
                    store.set_status(ProcessStatus::NotRunning);
                    return;
                }
            }
        };

        let mut save_rejected = false;
        if self.config.history_enabled {
            match self.transport.history_update(&snapshot.messages, &snapshot.id).await {
                Ok(true) => log::info!("Saved conversation {}", snapshot.id),
                Ok(false) => save_rejected = true,
                Err(e) => log::error!("Failed to save conversation {}: {:?}", snapshot.id, e),
            }
        }

        let mut store = self.store.lock().await;
        if let Some(current) = store.current_chat.as_mut() {
            if save_rejected && current.id == snapshot.id {
                current.messages.push(Message::error(SAVE_FAILED));
            }
            let current = current.clone();
            store.update_chat_history(current.clone());
            store.publish(current.messages);
        }
        store.set_status(ProcessStatus::NotRunning);
    }

    /// Cancels every exchange registered at the time of the call.
    pub async fn stop_generating(&self) {
        let handles: Vec<AbortHandle> = self.in_flight.iter().map(|e| e.value().clone()).collect();
        log::warn!("Stop requested for {} in-flight exchanges", handles.len());
        for handle in handles {
            handle.abort();
        }
        self.store.lock().await.set_loading(false, false);
    }

    /// Starts over without a current conversation.
    pub async fn new_chat(&self) {
        {
            let mut store = self.store.lock().await;
            store.set_status(ProcessStatus::Processing);
            store.publish(Vec::new());
            store.update_current_chat(None);
            store.set_status(ProcessStatus::Done);
        }
        self.settle().await;
    }

    /// Deletes the current conversation's messages from the history backend.
    ///
    /// Returns whether anything was cleared; failures raise an error dialog.
    pub async fn clear_chat(&self) -> bool {
        if !self.config.history_enabled {
            return false;
        }
        let current_id = self.store.lock().await.current_chat.as_ref().map(|c| c.id.clone());
        let Some(id) = current_id else {
            return false;
        };

        let cleared = match self.transport.history_clear(&id).await {
            Ok(ok) => ok,
            Err(e) => {
                log::error!("Failed to clear conversation {}: {:?}", id, e);
                false
            }
        };

        let mut store = self.store.lock().await;
        if !cleared {
            store.raise_dialog(CLEAR_FAILED_TITLE, CLEAR_FAILED_SUBTITLE);
            return false;
        }
        if let Some(current) = store.current_chat.as_mut().filter(|c| c.id == id) {
            current.messages.clear();
            let current = current.clone();
            store.update_chat_history(current);
        }
        store.publish(Vec::new());
        true
    }

    /// Whether the "authentication not configured" banner should be shown.
    pub async fn should_show_auth_banner(&self) -> anyhow::Result<bool> {
        if !self.config.auth_enabled {
            return Ok(false);
        }
        let principals = self.transport.user_info().await?;
        Ok(principals.is_empty() && !self.config.is_loopback_host())
    }
}
