use super::{ConversationReconciler, Opened};
use crate::api::{ChatTransport, ConversationRequest};
use crate::error::ReconcileError;
use crate::exchange::{request_messages, ExchangeContext};
use crate::models::{Conversation, Message};
use crate::state::ChatStore;
use async_trait::async_trait;

/// Conversations live only in the client's store for the session.
#[derive(Debug, Default)]
pub struct StatelessReconciler;

impl StatelessReconciler {
    // Appends to the exchange's working copy and makes it the current chat
    fn commit(&self, store: &mut ChatStore, ctx: &mut ExchangeContext, appended: Vec<Message>) {
        let mut conversation = match ctx.conversation.take() {
            Some(conversation) => conversation,
            None => Conversation::start(ctx.user_message.clone()),
        };
        conversation.messages.extend(appended);
        store.update_current_chat(Some(conversation.clone()));
        store.publish(conversation.messages.clone());
        ctx.conversation = Some(conversation);
    }
}

#[async_trait]
impl ConversationReconciler for StatelessReconciler {
    fn name(&self) -> &'static str {
        "stateless"
    }

    fn begin(
        &self,
        store: &mut ChatStore,
        ctx: &mut ExchangeContext,
    ) -> Result<ConversationRequest, ReconcileError> {
        let conversation = match ctx.conversation_id.as_deref() {
            None => Conversation::start(ctx.user_message.clone()),
            Some(id) => {
                let Some(mut conversation) = store.current_chat.clone().filter(|c| c.id == id) else {
                    log::error!("Conversation not found: {}", id);
                    return Err(ReconcileError::ConversationNotFound(id.to_string()));
                };
                conversation.messages.push(ctx.user_message.clone());
                conversation
            }
        };

        store.update_current_chat(Some(conversation.clone()));
        store.publish(conversation.messages.clone());
        ctx.base = conversation.messages.clone();
        let request = ConversationRequest {
            messages: request_messages(&conversation.messages),
            conversation_id: None,
        };
        ctx.conversation = Some(conversation);
        Ok(request)
    }

    async fn open(
        &self,
        transport: &dyn ChatTransport,
        request: &ConversationRequest,
    ) -> anyhow::Result<Opened> {
        let response = transport.conversation(request).await?;
        if response.is_success() {
            return Ok(Opened::Stream(response.body));
        }
        let status = response.status;
        let error = response.error_text().await;
        log::error!("Conversation request rejected with status {}: {:?}", status, error);
        Ok(Opened::Rejected(error))
    }

    fn complete(&self, store: &mut ChatStore, ctx: &mut ExchangeContext) -> Result<(), ReconcileError> {
        let answer = ctx.take_answer();
        log::info!("Exchange complete, appending {} messages", answer.len());
        self.commit(store, ctx, answer);
        Ok(())
    }

    fn fail(
        &self,
        store: &mut ChatStore,
        ctx: &mut ExchangeContext,
        error_text: String,
    ) -> Result<(), ReconcileError> {
        log::error!("Exchange failed: {}", error_text);
        self.commit(store, ctx, vec![Message::error(error_text)]);
        Ok(())
    }
}
