//! Streaming chat client core.
//!
//! A response body flows through [`decoder::FrameDecoder`] (bytes to NDJSON
//! fragments), [`parser::RecordParser`] (fragments to records),
//! [`assembler::MessageAssembler`] (records to growing messages) and finally a
//! [`reconciler::ConversationReconciler`] that folds the exchange into the
//! shared [`state::ChatStore`]. [`commands::ChatSession`] drives one exchange
//! at a time per conversation and owns cancellation.

// Declare the modules
pub mod api;
pub mod assembler;
pub mod cli;
pub mod commands;
pub mod config;
pub mod decoder;
pub mod error;
pub mod exchange;
pub mod models;
pub mod parser;
pub mod reconciler;
pub mod state;

pub use cli::run;
pub use commands::{ChatSession, ExchangeOutcome};
pub use config::ClientConfig;
