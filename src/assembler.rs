use crate::models::{Message, Role, StreamRecord};
use chrono::Utc;

/// Folds streamed message deltas into one assistant message plus at most one
/// tool message for the current exchange.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    assistant_text: String,
    assistant: Option<Message>,
    tool: Option<Message>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one record and returns the display-ready `[tool?, assistant?]`
    /// pair, or nothing when the record carried no messages.
    pub fn apply(&mut self, record: StreamRecord) -> Vec<Message> {
        let StreamRecord { id, choices, .. } = record;
        let Some(choice) = choices.into_iter().next() else {
            return Vec::new();
        };
        if choice.messages.is_empty() {
            return Vec::new();
        }

        // The backend leaves ids and dates to the client
        let now = Utc::now();
        for mut message in choice.messages {
            message.id = id.clone();
            message.date = now;
            self.absorb(message);
        }
        self.snapshot()
    }

    fn absorb(&mut self, mut message: Message) {
        match message.role {
            Role::Assistant => {
                self.assistant_text.push_str(&message.content);
                if let Some(context) = message.context.as_deref().filter(|c| !c.is_empty()) {
                    self.tool = Some(Message::new(Role::Tool, context));
                }
                message.content = self.assistant_text.clone();
                self.assistant = Some(message);
            }
            Role::Tool => self.tool = Some(message),
            other => log::debug!("Ignoring streamed {:?} message {}", other, message.id),
        }
    }

    /// Current `[tool?, assistant?]` pair, in display order.
    pub fn snapshot(&self) -> Vec<Message> {
        self.tool.iter().chain(self.assistant.iter()).cloned().collect()
    }

    pub fn assistant(&self) -> Option<&Message> {
        self.assistant.as_ref()
    }

    /// Ends the exchange, yielding `[tool?, assistant?]`.
    pub fn finish(self) -> Vec<Message> {
        self.tool.into_iter().chain(self.assistant).collect()
    }
}
