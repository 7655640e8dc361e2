use crate::models::{Conversation, Message};
use tokio::sync::broadcast;

// Capacity of the UI event channel; slow subscribers skip ahead
const EVENT_CAPACITY: usize = 256;

// Processing status of the exchange pipeline, as seen by the UI
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    NotRunning,
    Processing,
    Done,
}

// Health reported by the history backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HistoryStatus {
    NotConfigured,
    NotWorking,
    InvalidCredentials,
    InvalidDatabase,
    Working,
}

impl std::fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            HistoryStatus::NotConfigured => "Chat history store is not configured",
            HistoryStatus::NotWorking => "Chat history store is not working",
            HistoryStatus::InvalidCredentials => "Chat history store has invalid credentials",
            HistoryStatus::InvalidDatabase => "Chat history database and container are not configured",
            HistoryStatus::Working => "Chat history store is configured and working",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryLoadingState {
    Loading,
    Success,
    Fail,
    NotStarted,
}

// Modal error shown to the user outside the transcript
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorDialog {
    pub title: String,
    pub subtitle: String,
}

// Events emitted to whatever renders the conversation
#[derive(Clone, Debug)]
pub enum ChatEvent {
    MessagesChanged(Vec<Message>),
    LoadingChanged { is_loading: bool, show_loading_message: bool },
    StatusChanged(ProcessStatus),
    Dialog(ErrorDialog),
}

/// Shared conversation and UI state.
///
/// Reconcilers mutate it while an exchange is in flight; renderers read it or
/// follow the [`ChatEvent`] stream.
#[derive(Debug)]
pub struct ChatStore {
    pub current_chat: Option<Conversation>,
    pub chat_history: Vec<Conversation>,
    messages: Vec<Message>,
    is_loading: bool,
    show_loading_message: bool,
    status: ProcessStatus,
    error_dialog: Option<ErrorDialog>,
    history_status: HistoryStatus,
    history_loading: HistoryLoadingState,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            current_chat: None,
            chat_history: Vec::new(),
            messages: Vec::new(),
            is_loading: false,
            show_loading_message: false,
            status: ProcessStatus::NotRunning,
            error_dialog: None,
            history_status: HistoryStatus::NotConfigured,
            history_loading: HistoryLoadingState::NotStarted,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Messages currently on display.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Replaces the displayed message list.
    pub fn publish(&mut self, messages: Vec<Message>) {
        log::debug!("Publishing {} messages", messages.len());
        self.messages = messages;
        self.emit(ChatEvent::MessagesChanged(self.messages.clone()));
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn show_loading_message(&self) -> bool {
        self.show_loading_message
    }

    pub fn set_loading(&mut self, is_loading: bool, show_loading_message: bool) {
        if self.is_loading == is_loading && self.show_loading_message == show_loading_message {
            return;
        }
        self.is_loading = is_loading;
        self.show_loading_message = show_loading_message;
        self.emit(ChatEvent::LoadingChanged { is_loading, show_loading_message });
    }

    /// Hides the "generating answer" placeholder once content starts arriving.
    pub fn hide_loading_message(&mut self) {
        let is_loading = self.is_loading;
        self.set_loading(is_loading, false);
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ProcessStatus) {
        if self.status != status {
            self.status = status;
            self.emit(ChatEvent::StatusChanged(status));
        }
    }

    pub fn error_dialog(&self) -> Option<&ErrorDialog> {
        self.error_dialog.as_ref()
    }

    pub fn raise_dialog(&mut self, title: &str, subtitle: &str) {
        let dialog = ErrorDialog {
            title: title.to_string(),
            subtitle: subtitle.to_string(),
        };
        log::warn!("{}: {}", dialog.title, dialog.subtitle);
        self.error_dialog = Some(dialog.clone());
        self.emit(ChatEvent::Dialog(dialog));
    }

    pub fn dismiss_dialog(&mut self) {
        self.error_dialog = None;
    }

    /// Records the history backend health, raising a dialog when history was
    /// expected but could not be loaded.
    pub fn set_history_availability(&mut self, status: HistoryStatus, loading: HistoryLoadingState) {
        self.history_status = status;
        self.history_loading = loading;
        let unavailable = !matches!(self.history_status, HistoryStatus::Working | HistoryStatus::NotConfigured);
        if unavailable && self.history_loading == HistoryLoadingState::Fail && self.error_dialog.is_none() {
            let subtitle = format!("{}. Please contact the site administrator.", self.history_status);
            self.raise_dialog("Chat history is not enabled", &subtitle);
        }
    }

    pub fn history_status(&self) -> &HistoryStatus {
        &self.history_status
    }

    /// Replaces the active conversation (`None` starts over).
    pub fn update_current_chat(&mut self, conversation: Option<Conversation>) {
        self.current_chat = conversation;
    }

    /// Looks up a conversation in the loaded history.
    pub fn find_in_history_mut(&mut self, conversation_id: &str) -> Option<&mut Conversation> {
        self.chat_history.iter_mut().find(|c| c.id == conversation_id)
    }

    /// Inserts or replaces a conversation in the history list, most recent first.
    pub fn update_chat_history(&mut self, conversation: Conversation) {
        match self.chat_history.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => *existing = conversation,
            None => self.chat_history.push(conversation),
        }
        self.chat_history.sort_by(|a, b| b.date.cmp(&a.date));
    }

    /// Copies a history entry over the current chat when they are the same conversation.
    pub fn sync_current_chat(&mut self, conversation: &Conversation) {
        if let Some(current) = self.current_chat.as_mut().filter(|c| c.id == conversation.id) {
            *current = conversation.clone();
        }
    }
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn conversation(id: &str, age_minutes: i64) -> Conversation {
        Conversation {
            id: id.to_string(),
            title: id.to_string(),
            messages: vec![Message::user(id)],
            date: Utc::now() - Duration::minutes(age_minutes),
        }
    }

    #[test]
    fn test_update_chat_history_upserts_and_sorts() {
        let mut store = ChatStore::new();
        store.update_chat_history(conversation("old", 30));
        store.update_chat_history(conversation("new", 1));

        let mut changed = conversation("old", 30);
        changed.messages.push(Message::user("again"));
        store.update_chat_history(changed);

        assert_eq!(store.chat_history.len(), 2);
        assert_eq!(store.chat_history[0].id, "new");
        assert_eq!(store.chat_history[1].messages.len(), 2);
    }

    #[test]
    fn test_publish_emits_event() {
        let mut store = ChatStore::new();
        let mut events = store.subscribe();
        store.publish(vec![Message::user("hi")]);
        match events.try_recv().unwrap() {
            ChatEvent::MessagesChanged(messages) => assert_eq!(messages.len(), 1),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_history_failure_raises_dialog() {
        let mut store = ChatStore::new();
        store.set_history_availability(HistoryStatus::NotWorking, HistoryLoadingState::Fail);
        let dialog = store.error_dialog().cloned().unwrap();
        assert_eq!(dialog.title, "Chat history is not enabled");
        assert_eq!(
            dialog.subtitle,
            "Chat history store is not working. Please contact the site administrator."
        );
    }

    #[test]
    fn test_unconfigured_history_is_silent() {
        let mut store = ChatStore::new();
        store.set_history_availability(HistoryStatus::NotConfigured, HistoryLoadingState::Fail);
        assert!(store.error_dialog().is_none());
        store.set_history_availability(HistoryStatus::NotWorking, HistoryLoadingState::Success);
        assert!(store.error_dialog().is_none());
    }

    #[test]
    fn test_sync_current_chat_only_for_same_id() {
        let mut store = ChatStore::new();
        store.update_current_chat(Some(conversation("a", 0)));
        let mut other = conversation("b", 0);
        other.title = "changed".to_string();
        store.sync_current_chat(&other);
        assert_eq!(store.current_chat.as_ref().unwrap().title, "a");

        let mut same = conversation("a", 0);
        same.title = "changed".to_string();
        store.sync_current_chat(&same);
        assert_eq!(store.current_chat.as_ref().unwrap().title, "changed");
    }
}
