use crate::api::HttpTransport;
use crate::commands::{ChatSession, ExchangeOutcome};
use crate::config::{get_api_key, set_api_key_in_keyring, ClientConfig};
use crate::models::{parse_citations, Message, Role};
use crate::state::ChatEvent;
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

const AUTH_BANNER: &str = "Authentication not configured: this app does not have authentication configured. \
Add an identity provider to your backend deployment to restrict access.";

#[derive(Debug, Parser)]
#[command(
    name = "streamchat",
    about = "Chat with a streaming NDJSON completion backend from the terminal"
)]
pub struct Args {
    /// Backend root URL (overrides STREAMCHAT_BASE_URL)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Persist conversations in the backend history store
    #[arg(long)]
    pub history: bool,

    /// Check the backend identity provider on start-up
    #[arg(long)]
    pub auth: bool,

    /// Credential reference: `env:VAR_NAME` or `keyring`
    #[arg(long)]
    pub api_key_ref: Option<String>,

    /// Store this API key in the OS keyring for the backend and exit
    #[arg(long, value_name = "KEY")]
    pub store_api_key: Option<String>,

    /// Debug-level logging unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Layers the command-line flags over the environment settings.
    pub fn apply(&self, config: &mut ClientConfig) {
        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        config.history_enabled |= self.history;
        config.auth_enabled |= self.auth;
        if let Some(reference) = &self.api_key_ref {
            config.api_key_ref = Some(reference.clone());
        }
    }
}

pub fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
}

// Turns successive display lists into terminal output
#[derive(Debug, Default)]
struct TranscriptPrinter {
    shown: String,
    last_error: Option<String>,
}

impl TranscriptPrinter {
    fn render(&mut self, messages: &[Message]) -> Option<String> {
        let last = messages.last()?;
        match last.role {
            Role::Assistant => {
                let output = match last.content.strip_prefix(self.shown.as_str()) {
                    Some(suffix) => suffix.to_string(),
                    None => last.content.clone(),
                };
                self.shown = last.content.clone();
                (!output.is_empty()).then_some(output)
            }
            Role::Error if self.last_error.as_deref() != Some(last.id.as_str()) => {
                self.last_error = Some(last.id.clone());
                self.shown.clear();
                Some(format!("\n[error] {}\n", last.content))
            }
            Role::User => {
                self.shown.clear();
                None
            }
            _ => None,
        }
    }
}

async fn print_events(session: ChatSession, mut events: broadcast::Receiver<ChatEvent>) {
    let mut printer = TranscriptPrinter::default();
    loop {
        match events.recv().await {
            Ok(ChatEvent::MessagesChanged(messages)) => {
                if let Some(output) = printer.render(&messages) {
                    print!("{}", output);
                    let _ = std::io::stdout().flush();
                }
            }
            Ok(ChatEvent::Dialog(dialog)) => {
                eprintln!("\n{}: {}", dialog.title, dialog.subtitle);
                session.store().lock().await.dismiss_dialog();
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::debug!("Renderer skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn print_citations(session: &ChatSession) {
    let store = session.store();
    let store = store.lock().await;
    let Some(tool) = store.messages().iter().rev().find(|m| m.role == Role::Tool) else {
        return;
    };
    for (index, citation) in parse_citations(tool).iter().enumerate() {
        let label = citation
            .title
            .as_deref()
            .or(citation.filepath.as_deref())
            .or(citation.url.as_deref())
            .unwrap_or("Untitled");
        println!("  [{}] {}", index + 1, label);
    }
}

async fn ask(session: &ChatSession, question: &str) {
    let conversation_id = {
        let store = session.store();
        let store = store.lock().await;
        store.current_chat.as_ref().map(|c| c.id.clone())
    };

    let running = session.clone();
    let question = question.to_string();
    let mut exchange =
        tokio::spawn(async move { running.submit(&question, conversation_id.as_deref()).await });

    let result = tokio::select! {
        result = &mut exchange => result,
        _ = tokio::signal::ctrl_c() => {
            session.stop_generating().await;
            exchange.await
        }
    };

    match result {
        Ok(Ok(ExchangeOutcome::Cancelled)) => println!("\n(stopped)"),
        Ok(Ok(_)) => {
            println!();
            print_citations(session).await;
        }
        Ok(Err(e)) => eprintln!("\n{}", e),
        Err(e) => log::error!("Exchange task failed: {:?}", e),
    }
}

/// Runs the interactive chat loop until stdin closes or `/quit`.
pub async fn run(args: Args) -> Result<()> {
    let mut config = ClientConfig::from_env().context("Failed to load configuration")?;
    args.apply(&mut config);

    if let Some(key) = args.store_api_key.as_deref() {
        set_api_key_in_keyring(&config, key)?;
        println!("API key stored for {}", config.base_url);
        return Ok(());
    }

    let api_key = get_api_key(&config)?;
    let transport = HttpTransport::new(&config.base_url, api_key, config.connect_timeout)?;
    log::info!(
        "Connecting to {} (history {})",
        config.base_url,
        if config.history_enabled { "enabled" } else { "disabled" }
    );
    let session = ChatSession::new(config, Arc::new(transport));

    match session.should_show_auth_banner().await {
        Ok(true) => eprintln!("{}", AUTH_BANNER),
        Ok(false) => {}
        Err(e) => log::warn!("Could not check identity provider: {:?}", e),
    }

    let renderer = tokio::spawn(print_events(session.clone(), session.subscribe().await));

    println!("Type a question, or /new, /clear, /quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/new" => {
                session.new_chat().await;
                println!("Started a new chat.");
            }
            "/clear" => {
                if session.clear_chat().await {
                    println!("Chat cleared.");
                }
            }
            question => ask(&session, question).await,
        }
    }

    renderer.abort();
    Ok(())
}
