//! Folding finished exchanges into the conversation transcript.
//!
//! Two strategies share one interface and are picked once per exchange:
//! [`StatelessReconciler`] keeps conversations in memory only, while
//! [`PersistedReconciler`] works against the backend-persisted history.

mod persisted;
mod stateless;

pub use persisted::PersistedReconciler;
pub use stateless::StatelessReconciler;

use crate::api::{ByteStream, ChatTransport, ConversationRequest};
use crate::error::ReconcileError;
use crate::exchange::ExchangeContext;
use crate::models::Message;
use crate::state::ChatStore;
use async_trait::async_trait;

/// Outcome of opening the generate stream.
pub enum Opened {
    Stream(ByteStream),
    /// The backend refused the request; carries its error text, if any.
    Rejected(Option<String>),
}

#[async_trait]
pub trait ConversationReconciler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Appends the user message and returns the request to send.
    ///
    /// Fails without touching the store when the referenced conversation is
    /// unknown.
    fn begin(
        &self,
        store: &mut ChatStore,
        ctx: &mut ExchangeContext,
    ) -> Result<ConversationRequest, ReconcileError>;

    async fn open(
        &self,
        transport: &dyn ChatTransport,
        request: &ConversationRequest,
    ) -> anyhow::Result<Opened>;

    /// Shows the in-progress `[tool?, assistant?]` pair after the settled messages.
    fn progress(&self, store: &mut ChatStore, ctx: &ExchangeContext, deltas: &[Message]) {
        store.publish(ctx.display_with(deltas));
    }

    /// Handles a refused generate request.
    fn rejected(
        &self,
        store: &mut ChatStore,
        ctx: &mut ExchangeContext,
        error: Option<String>,
    ) -> Result<(), ReconcileError> {
        let text = error.unwrap_or_else(|| crate::error::GENERIC_ERROR.to_string());
        self.fail(store, ctx, text)
    }

    /// Appends the finished `[tool?, assistant?]` pair.
    fn complete(&self, store: &mut ChatStore, ctx: &mut ExchangeContext) -> Result<(), ReconcileError>;

    /// Appends an `error` message with the given text.
    fn fail(
        &self,
        store: &mut ChatStore,
        ctx: &mut ExchangeContext,
        error_text: String,
    ) -> Result<(), ReconcileError>;

    /// Drops streamed content; only the user's message survives.
    fn cancelled(&self, store: &mut ChatStore, ctx: &ExchangeContext) {
        log::warn!("Exchange cancelled, keeping only the user message");
        store.publish(ctx.base.clone());
    }
}
