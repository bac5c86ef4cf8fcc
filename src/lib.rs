//! llm-tracelab - Recording/Replay Proxy for LLM APIs
//!
//! A transparent proxy for OpenAI-compatible HTTP APIs (chat completions,
//! embeddings, rerank) that:
//!
//! - **Records** every request/response pair into one self-describing
//!   `.http` file, back-patching a fixed header slot with token accounting
//!   and layout data, without ever buffering response bodies
//! - **Sniffs** token `usage` out of both response shapes (single JSON
//!   document and SSE streams) while the bytes are proxied
//! - **Replays** recorded files as deterministic offline fixtures
//! - **Injects chaos** (delays, errors) per model, probabilistically
//!
//! # Quick Start
//!
//! ```no_run
//! use llm_tracelab::{config, proxy::ProxyServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> llm_tracelab::Result<()> {
//!     let config = Arc::new(config::load_config("tracelab.yaml")?);
//!     let server = ProxyServer::new(config)?;
//!     server.run().await
//! }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! server:
//!   port: 8080
//! upstream:
//!   base_url: "https://api.example.com"
//!   api_key: "sk-..."
//! debug:
//!   output_dir: "records"
//!   mask_key: true
//! chaos:
//!   enabled: false
//! ```

pub mod chaos;
pub mod config;
pub mod error;
pub mod monitor;
pub mod proxy;
pub mod record;
pub mod replay;
pub mod upstream;

pub use config::Config;
pub use error::{Result, TraceLabError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
