use crate::models::Message;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

// Alias for the raw response body we hand to the decoder
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

// Request body for the generate endpoints
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ConversationRequest {
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

// Identity entry returned by the auth endpoint
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct UserPrincipal {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub id_token: String,
}

/// Streaming response of a generate call.
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: ByteStream,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Drains a rejected body and extracts its `error` field, if any.
    pub async fn error_text(self) -> Option<String> {
        let mut raw = Vec::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => raw.extend_from_slice(&bytes),
                Err(e) => {
                    log::warn!("Failed to read error body: {:?}", e);
                    break;
                }
            }
        }
        let value: serde_json::Value = serde_json::from_slice(&raw).ok()?;
        match value.get("error")? {
            serde_json::Value::String(text) if !text.is_empty() => Some(text.clone()),
            serde_json::Value::Object(detail) => detail
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_owned),
            _ => None,
        }
    }
}

// Backend operations the exchange pipeline depends on
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Stateless generate call.
    async fn conversation(&self, request: &ConversationRequest) -> Result<TransportResponse>;

    /// Generate call that also records the exchange in backend history.
    async fn history_generate(&self, request: &ConversationRequest) -> Result<TransportResponse>;

    /// Saves the full transcript; returns whether the backend accepted it.
    async fn history_update(&self, messages: &[Message], conversation_id: &str) -> Result<bool>;

    /// Deletes the messages of a persisted conversation.
    async fn history_clear(&self, conversation_id: &str) -> Result<bool>;

    async fn user_info(&self) -> Result<Vec<UserPrincipal>>;
}

#[derive(Serialize, Debug)]
struct HistoryUpdateBody<'a> {
    messages: &'a [Message],
    conversation_id: &'a str,
}

#[derive(Serialize, Debug)]
struct HistoryClearBody<'a> {
    conversation_id: &'a str,
}

// --- HTTP implementation ---

pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: &str, api_key: Option<String>, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.url(path));
        match self.api_key.as_deref() {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn open_stream(&self, path: &str, request: &ConversationRequest) -> Result<TransportResponse> {
        log::info!("Sending stream request to {} ({} messages)", path, request.messages.len());
        let response = self
            .post(path)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", path))?;

        let status = response.status();
        if !status.is_success() {
            log::error!("Stream request to {} failed with status {}", path, status);
        }
        let body = response
            .bytes_stream()
            .map_err(|e| anyhow::Error::from(e).context("Error reading response body"));
        Ok(TransportResponse {
            status,
            body: Box::pin(body),
        })
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn conversation(&self, request: &ConversationRequest) -> Result<TransportResponse> {
        self.open_stream("/conversation", request).await
    }

    async fn history_generate(&self, request: &ConversationRequest) -> Result<TransportResponse> {
        self.open_stream("/history/generate", request).await
    }

    async fn history_update(&self, messages: &[Message], conversation_id: &str) -> Result<bool> {
        log::info!("Saving {} messages for conversation {}", messages.len(), conversation_id);
        let response = self
            .post("/history/update")
            .json(&HistoryUpdateBody { messages, conversation_id })
            .send()
            .await
            .context("Failed to send history update")?;
        if !response.status().is_success() {
            log::error!("History update for {} failed with status {}", conversation_id, response.status());
        }
        Ok(response.status().is_success())
    }

    async fn history_clear(&self, conversation_id: &str) -> Result<bool> {
        log::warn!("Clearing messages of conversation {}", conversation_id);
        let response = self
            .post("/history/clear")
            .json(&HistoryClearBody { conversation_id })
            .send()
            .await
            .context("Failed to send history clear")?;
        Ok(response.status().is_success())
    }

    async fn user_info(&self) -> Result<Vec<UserPrincipal>> {
        let response = self
            .client
            .get(self.url("/.auth/me"))
            .send()
            .await
            .context("Failed to fetch user info")?;
        if !response.status().is_success() {
            log::warn!("No identity provider found (status {})", response.status());
            return Ok(Vec::new());
        }
        response
            .json::<Vec<UserPrincipal>>()
            .await
            .context("Failed to parse user info")
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport replaying canned responses.

    use super::*;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub enum Script {
        /// Status plus body chunks; `None` chunks are read errors.
        Respond(StatusCode, Vec<Option<&'static str>>),
        /// Status plus chunks, then the body never finishes.
        Hang(StatusCode, Vec<&'static str>),
        Fail(&'static str),
    }

    #[derive(Default)]
    pub struct ScriptedTransport {
        scripts: Mutex<VecDeque<Script>>,
        pub requests: Mutex<Vec<ConversationRequest>>,
        pub saved: Mutex<Vec<(String, Vec<Message>)>>,
        pub cleared: Mutex<Vec<String>>,
        pub save_ok: Mutex<bool>,
        pub clear_ok: Mutex<bool>,
        pub principals: Mutex<Vec<UserPrincipal>>,
    }

    impl ScriptedTransport {
        pub fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                save_ok: Mutex::new(true),
                clear_ok: Mutex::new(true),
                ..Default::default()
            }
        }

        fn next(&self, request: &ConversationRequest) -> Result<TransportResponse> {
            self.requests.lock().unwrap().push(request.clone());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .expect("no scripted response left");
            match script {
                Script::Respond(status, chunks) => {
                    let items: Vec<Result<Bytes>> = chunks
                        .into_iter()
                        .map(|c| match c {
                            Some(text) => Ok(Bytes::from_static(text.as_bytes())),
                            None => Err(anyhow::anyhow!("connection reset")),
                        })
                        .collect();
                    Ok(TransportResponse { status, body: Box::pin(stream::iter(items)) })
                }
                Script::Hang(status, chunks) => {
                    let head = stream::iter(
                        chunks
                            .into_iter()
                            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                            .collect::<Vec<Result<Bytes>>>(),
                    );
                    Ok(TransportResponse { status, body: Box::pin(head.chain(stream::pending::<Result<Bytes>>())) })
                }
                Script::Fail(reason) => Err(anyhow::anyhow!(reason)),
            }
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn conversation(&self, request: &ConversationRequest) -> Result<TransportResponse> {
            self.next(request)
        }

        async fn history_generate(&self, request: &ConversationRequest) -> Result<TransportResponse> {
            self.next(request)
        }

        async fn history_update(&self, messages: &[Message], conversation_id: &str) -> Result<bool> {
            self.saved
                .lock()
                .unwrap()
                .push((conversation_id.to_string(), messages.to_vec()));
            Ok(*self.save_ok.lock().unwrap())
        }

        async fn history_clear(&self, conversation_id: &str) -> Result<bool> {
            self.cleared.lock().unwrap().push(conversation_id.to_string());
            Ok(*self.clear_ok.lock().unwrap())
        }

        async fn user_info(&self) -> Result<Vec<UserPrincipal>> {
            Ok(self.principals.lock().unwrap().clone())
        }
    }
}
