use super::{ConversationReconciler, Opened};
use crate::api::{ChatTransport, ConversationRequest};
use crate::error::{ReconcileError, GENERIC_ERROR};
use crate::exchange::{request_messages, ExchangeContext};
use crate::models::{Conversation, Message};
use crate::state::ChatStore;
use async_trait::async_trait;

const UNSAVED_PREFIX: &str =
    "There was an error generating a response. Chat history can't be saved at this time.";
const RETRY_HINT: &str = "Please try again. If the problem persists, please contact the site administrator.";

/// Conversations are owned by the history backend.
///
/// A new conversation only comes into existence once the backend announces
/// its id through `history_metadata`; until then the exchange is shown from
/// the local display buffer.
#[derive(Debug, Default)]
pub struct PersistedReconciler;

impl PersistedReconciler {
    // Appends to a conversation already in history and makes it current
    fn append_existing(
        &self,
        store: &mut ChatStore,
        conversation_id: &str,
        appended: Vec<Message>,
    ) -> Result<Conversation, ReconcileError> {
        let Some(conversation) = store.find_in_history_mut(conversation_id) else {
            log::error!("Conversation not found: {}", conversation_id);
            return Err(ReconcileError::ConversationNotFound(conversation_id.to_string()));
        };
        conversation.messages.extend(appended);
        let snapshot = conversation.clone();
        store.update_current_chat(Some(snapshot.clone()));
        Ok(snapshot)
    }

    // Builds the announced conversation for a new exchange, if the backend sent one
    fn create_announced(
        &self,
        store: &mut ChatStore,
        ctx: &ExchangeContext,
        appended: Vec<Message>,
    ) -> Option<Conversation> {
        let metadata = ctx.history_metadata.as_ref()?;
        let mut messages = vec![ctx.user_message.clone()];
        messages.extend(appended);
        let conversation = Conversation::from_metadata(metadata, messages);
        log::info!("Backend created conversation {}", conversation.id);
        store.update_current_chat(Some(conversation.clone()));
        Some(conversation)
    }
}

#[async_trait]
impl ConversationReconciler for PersistedReconciler {
    fn name(&self) -> &'static str {
        "persisted"
    }

    fn begin(
        &self,
        store: &mut ChatStore,
        ctx: &mut ExchangeContext,
    ) -> Result<ConversationRequest, ReconcileError> {
        match ctx.conversation_id.clone() {
            Some(id) => {
                let Some(conversation) = store.find_in_history_mut(&id) else {
                    log::error!("Conversation not found: {}", id);
                    return Err(ReconcileError::ConversationNotFound(id));
                };
                conversation.messages.push(ctx.user_message.clone());
                let snapshot = conversation.clone();
                store.sync_current_chat(&snapshot);
                ctx.base = snapshot.messages.clone();
                store.publish(snapshot.messages.clone());
                Ok(ConversationRequest {
                    messages: request_messages(&snapshot.messages),
                    conversation_id: Some(id),
                })
            }
            None => {
                ctx.base = vec![ctx.user_message.clone()];
                store.publish(ctx.base.clone());
                Ok(ConversationRequest {
                    messages: request_messages(&ctx.base),
                    conversation_id: None,
                })
            }
        }
    }

    async fn open(
        &self,
        transport: &dyn ChatTransport,
        request: &ConversationRequest,
    ) -> anyhow::Result<Opened> {
        let response = transport.history_generate(request).await?;
        if response.is_success() {
            return Ok(Opened::Stream(response.body));
        }
        let status = response.status;
        let error = response.error_text().await;
        log::error!("History generate rejected with status {}: {:?}", status, error);
        Ok(Opened::Rejected(error))
    }

    fn rejected(
        &self,
        store: &mut ChatStore,
        ctx: &mut ExchangeContext,
        error: Option<String>,
    ) -> Result<(), ReconcileError> {
        let detail = error.unwrap_or_else(|| RETRY_HINT.to_string());
        let message = Message::error(format!("{} {}", UNSAVED_PREFIX, detail));
        match ctx.conversation_id.clone() {
            Some(id) => {
                let conversation = self.append_existing(store, &id, vec![message])?;
                store.publish(conversation.messages);
            }
            // Nothing was persisted, so no conversation is created
            None => store.publish(ctx.display_with(&[message])),
        }
        Ok(())
    }

    fn complete(&self, store: &mut ChatStore, ctx: &mut ExchangeContext) -> Result<(), ReconcileError> {
        let answer = ctx.take_answer();
        log::info!("Exchange complete, appending {} messages", answer.len());
        match ctx.conversation_id.clone() {
            Some(id) => {
                self.append_existing(store, &id, answer.clone())?;
                store.publish(ctx.display_with(&answer));
            }
            None => match self.create_announced(store, ctx, answer.clone()) {
                Some(_) => store.publish(ctx.display_with(&answer)),
                None => {
                    log::error!("Stream ended without history metadata for the new conversation");
                    return self.fail(store, ctx, GENERIC_ERROR.to_string());
                }
            },
        }
        Ok(())
    }

    fn fail(
        &self,
        store: &mut ChatStore,
        ctx: &mut ExchangeContext,
        error_text: String,
    ) -> Result<(), ReconcileError> {
        log::error!("Exchange failed: {}", error_text);
        let message = Message::error(error_text);
        match ctx.conversation_id.clone() {
            Some(id) => {
                self.append_existing(store, &id, vec![message.clone()])?;
            }
            None => {
                if self.create_announced(store, ctx, vec![message.clone()]).is_none() {
                    log::error!("Error retrieving data: no conversation was announced");
                }
            }
        }
        store.publish(ctx.display_with(&[message]));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::AbortHandle;
    use crate::models::{Choice, HistoryMetadata, Role, StreamRecord};

    fn stored(id: &str) -> Conversation {
        let mut conversation = Conversation::start(Message::user("earlier question"));
        conversation.id = id.to_string();
        conversation.messages.push(Message::new(Role::Assistant, "earlier answer"));
        conversation
    }

    fn roles(messages: &[Message]) -> Vec<Role> {
        messages.iter().map(|m| m.role).collect()
    }

    fn answer(ctx: &mut ExchangeContext, text: &str, metadata: Option<&str>) {
        ctx.observe(StreamRecord {
            id: "r1".to_string(),
            choices: vec![Choice { messages: vec![Message::new(Role::Assistant, text)] }],
            history_metadata: metadata.map(|id| HistoryMetadata {
                conversation_id: id.to_string(),
                title: "Backend title".to_string(),
                date: Some("2024-01-02T03:04:05.000000".to_string()),
            }),
            ..Default::default()
        });
    }

    #[test]
    fn test_begin_existing_appends_user_to_history() {
        let mut store = ChatStore::new();
        store.update_chat_history(stored("c1"));
        let mut ctx = ExchangeContext::new("follow-up", Some("c1".to_string()), AbortHandle::new());

        let request = PersistedReconciler.begin(&mut store, &mut ctx).unwrap();

        assert_eq!(request.conversation_id.as_deref(), Some("c1"));
        assert_eq!(request.messages.len(), 3);
        assert_eq!(store.chat_history[0].messages.len(), 3);
        assert_eq!(store.messages().len(), 3);
    }

    #[test]
    fn test_begin_unknown_conversation_fails() {
        let mut store = ChatStore::new();
        let mut ctx = ExchangeContext::new("q", Some("gone".to_string()), AbortHandle::new());
        assert_eq!(
            PersistedReconciler.begin(&mut store, &mut ctx).unwrap_err(),
            ReconcileError::ConversationNotFound("gone".to_string())
        );
        assert!(store.messages().is_empty());
    }

    #[test]
    fn test_new_conversation_created_from_metadata() {
        let mut store = ChatStore::new();
        let mut ctx = ExchangeContext::new("hello", None, AbortHandle::new());
        PersistedReconciler.begin(&mut store, &mut ctx).unwrap();
        assert!(store.current_chat.is_none());

        answer(&mut ctx, "Hi there", Some("backend-id"));
        PersistedReconciler.complete(&mut store, &mut ctx).unwrap();

        let current = store.current_chat.as_ref().unwrap();
        assert_eq!(current.id, "backend-id");
        assert_eq!(current.title, "Backend title");
        assert_eq!(roles(&current.messages), vec![Role::User, Role::Assistant]);
        assert_eq!(roles(store.messages()), vec![Role::User, Role::Assistant]);
    }

    #[test]
    fn test_new_conversation_without_metadata_reports_error() {
        let mut store = ChatStore::new();
        let mut ctx = ExchangeContext::new("hello", None, AbortHandle::new());
        PersistedReconciler.begin(&mut store, &mut ctx).unwrap();
        answer(&mut ctx, "Hi", None);

        PersistedReconciler.complete(&mut store, &mut ctx).unwrap();

        assert!(store.current_chat.is_none());
        assert_eq!(roles(store.messages()), vec![Role::User, Role::Error]);
    }

    #[test]
    fn test_complete_existing_appends_answer() {
        let mut store = ChatStore::new();
        store.update_chat_history(stored("c1"));
        let mut ctx = ExchangeContext::new("follow-up", Some("c1".to_string()), AbortHandle::new());
        PersistedReconciler.begin(&mut store, &mut ctx).unwrap();
        answer(&mut ctx, "More", None);

        PersistedReconciler.complete(&mut store, &mut ctx).unwrap();

        let expected = vec![Role::User, Role::Assistant, Role::User, Role::Assistant];
        assert_eq!(roles(&store.chat_history[0].messages), expected);
        assert_eq!(roles(&store.current_chat.as_ref().unwrap().messages), expected);
        assert_eq!(roles(store.messages()), expected);
    }

    #[test]
    fn test_rejected_new_conversation_adds_single_error_and_no_history() {
        let mut store = ChatStore::new();
        let mut ctx = ExchangeContext::new("hello", None, AbortHandle::new());
        PersistedReconciler.begin(&mut store, &mut ctx).unwrap();

        PersistedReconciler
            .rejected(&mut store, &mut ctx, Some("Cosmos unavailable".to_string()))
            .unwrap();

        assert!(store.current_chat.is_none());
        assert!(store.chat_history.is_empty());
        let errors: Vec<_> = store.messages().iter().filter(|m| m.role == Role::Error).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].content,
            "There was an error generating a response. Chat history can't be saved at this time. Cosmos unavailable"
        );
    }

    #[test]
    fn test_rejected_without_detail_uses_retry_hint() {
        let mut store = ChatStore::new();
        store.update_chat_history(stored("c1"));
        let mut ctx = ExchangeContext::new("again", Some("c1".to_string()), AbortHandle::new());
        PersistedReconciler.begin(&mut store, &mut ctx).unwrap();

        PersistedReconciler.rejected(&mut store, &mut ctx, None).unwrap();

        let last = store.chat_history[0].messages.last().unwrap();
        assert_eq!(last.role, Role::Error);
        assert!(last.content.ends_with(RETRY_HINT));
        assert_eq!(store.current_chat.as_ref().unwrap().id, "c1");
    }

    #[test]
    fn test_fail_on_new_conversation_with_metadata_creates_it() {
        let mut store = ChatStore::new();
        let mut ctx = ExchangeContext::new("hello", None, AbortHandle::new());
        PersistedReconciler.begin(&mut store, &mut ctx).unwrap();
        answer(&mut ctx, "par", Some("c7"));

        PersistedReconciler.fail(&mut store, &mut ctx, "stream broke".to_string()).unwrap();

        let current = store.current_chat.as_ref().unwrap();
        assert_eq!(current.id, "c7");
        assert_eq!(roles(&current.messages), vec![Role::User, Role::Error]);
        assert_eq!(roles(store.messages()), vec![Role::User, Role::Error]);
    }

    #[test]
    fn test_cancel_new_conversation_keeps_user_only() {
        let mut store = ChatStore::new();
        let mut ctx = ExchangeContext::new("hello", None, AbortHandle::new());
        PersistedReconciler.begin(&mut store, &mut ctx).unwrap();
        answer(&mut ctx, "partial", Some("c8"));

        PersistedReconciler.cancelled(&mut store, &ctx);

        assert!(store.current_chat.is_none());
        assert_eq!(roles(store.messages()), vec![Role::User]);
    }
}
