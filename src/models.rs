use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

// Author of a message in the transcript
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    Error,
}

// User feedback attached to an assistant answer
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Feedback {
    Neutral,
    Positive,
    Negative,
    MissingCitation,
    WrongCitation,
    OutOfScope,
    InaccurateOrIrrelevant,
    OtherUnhelpful,
    HateSpeech,
    Violent,
    Sexual,
    Manipulative,
    OtherHarmful,
}

// Represents a single message in a conversation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    // Streamed messages arrive without an id; the assembler stamps the record id onto them
    #[serde(default, deserialize_with = "null_as_empty")]
    pub id: String,
    pub role: Role,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    #[serde(default = "Utc::now")]
    pub date: DateTime<Utc>,
    // Opaque citation payload carried by assistant messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
}

impl Message {
    /// Creates a message with a fresh id stamped with the current time.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            date: Utc::now(),
            context: None,
            feedback: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(Role::Error, content)
    }
}

// Represents a conversation thread and its ordered transcript
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default = "Utc::now")]
    pub date: DateTime<Utc>,
}

impl Conversation {
    /// Starts an ephemeral conversation titled after the first question.
    pub fn start(first: Message) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: first.content.clone(),
            messages: vec![first],
            date: Utc::now(),
        }
    }

    /// Builds the conversation the history backend announced for a new exchange.
    pub fn from_metadata(metadata: &HistoryMetadata, messages: Vec<Message>) -> Self {
        Self {
            id: metadata.conversation_id.clone(),
            title: metadata.title.clone(),
            messages,
            date: parse_backend_date(metadata.date.as_deref()),
        }
    }
}

/// Parses a date sent by the history backend.
///
/// The backend emits RFC 3339 timestamps as well as naive ones without an
/// offset; naive timestamps are taken as UTC. Anything else maps to now.
pub fn parse_backend_date(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Utc::now();
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.with_timezone(&Utc);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return naive.and_utc();
    }
    log::warn!("Unrecognized backend date '{}', using current time", raw);
    Utc::now()
}

// Role-only deltas carry `"content": null`
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

// Conversation identity announced by the history backend on a new exchange
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HistoryMetadata {
    pub conversation_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Choice {
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Error payload carried by a stream record.
///
/// The backend sends either a bare string or an object with a `message`
/// field; anything else is kept as raw JSON so it can still abort the
/// exchange.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum RecordError {
    Text(String),
    Detail { message: Option<String> },
    Other(serde_json::Value),
}

impl RecordError {
    /// Canonical error text, if the payload carries a usable string.
    pub fn text(&self) -> Option<String> {
        match self {
            RecordError::Text(text) if !text.is_empty() => Some(text.clone()),
            RecordError::Detail { message: Some(message) } if !message.is_empty() => {
                Some(message.clone())
            }
            _ => None,
        }
    }

    /// Whether the payload signals a failure at all (empty strings and falsy JSON do not).
    pub fn is_populated(&self) -> bool {
        match self {
            RecordError::Text(text) => !text.is_empty(),
            RecordError::Detail { .. } => true,
            RecordError::Other(value) => match value {
                serde_json::Value::Null | serde_json::Value::Bool(false) => false,
                serde_json::Value::Number(n) => n.as_f64() != Some(0.0),
                serde_json::Value::String(s) => !s.is_empty(),
                _ => true,
            },
        }
    }
}

// One decoded JSON unit of the completion stream
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct StreamRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordError>,
    #[serde(default, deserialize_with = "announced_metadata", skip_serializing_if = "Option::is_none")]
    pub history_metadata: Option<HistoryMetadata>,
}

// Stateless responses send `"history_metadata": {}`; only an object naming a
// conversation counts as an announcement.
fn announced_metadata<'de, D>(deserializer: D) -> Result<Option<HistoryMetadata>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Announced {
        conversation_id: Option<String>,
        title: Option<String>,
        date: Option<String>,
    }

    let announced = Option::<Announced>::deserialize(deserializer)?;
    Ok(announced.and_then(|raw| {
        let conversation_id = raw.conversation_id.filter(|id| !id.is_empty())?;
        Some(HistoryMetadata {
            conversation_id,
            title: raw.title.unwrap_or_default(),
            date: raw.date,
        })
    }))
}

impl StreamRecord {
    /// Backend error carried by this record, if it is populated.
    pub fn failure(&self) -> Option<&RecordError> {
        self.error.as_ref().filter(|e| e.is_populated())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Citation {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub id: String,
    pub title: Option<String>,
    pub filepath: Option<String>,
    pub url: Option<String>,
    pub metadata: Option<String>,
    pub chunk_id: Option<String>,
    pub reindex_id: Option<String>,
}

// JSON payload stored in the content of a tool message
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ToolMessageContent {
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub intent: Option<String>,
}

/// Extracts the citations of a tool message. Other roles, and tool content that
/// does not parse, yield no citations.
pub fn parse_citations(message: &Message) -> Vec<Citation> {
    if message.role != Role::Tool {
        return Vec::new();
    }
    match serde_json::from_str::<ToolMessageContent>(&message.content) {
        Ok(content) => content.citations,
        Err(e) => {
            log::debug!("Tool message {} has no readable citations: {}", message.id, e);
            Vec::new()
        }
    }
}
