//! QAFlow Common Library
//!
//! Shared types, remote service interfaces, and storage for the QAFlow
//! orchestrator.

pub mod clients;
pub mod db;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use clients::{
    AuthSession, Authenticator, DesignSource, DocumentParser, ExecutionReport, LlmClient,
    LlmRequest, LlmResponse, ParsedDocument, SiteAnalyzer, TestExecutor,
};
pub use db::{CounterSpec, Database};
pub use error::{Error, Result};
pub use types::*;

/// QAFlow version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".qaflow")
}

/// Default config path
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
