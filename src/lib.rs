//! Sikt - Local-first Video Analysis Agent
//!
//! Sikt ingests a local video file and produces derived artifacts on demand —
//! a speech transcript, a time-windowed vector index, a hierarchical summary,
//! and keyframe images — then serves interactive retrieval and
//! retrieval-augmented chat over them.
//!
//! The name "Sikt" comes from the Norwegian word for "sight."
//!
//! # Architecture
//!
//! The core is a persistent, recoverable job orchestration engine:
//!
//! - `store` - durable SQLite state: videos, jobs, artifact records, chunks
//! - `transcript_store` - append-only per-video segment log
//! - `runtime` - resizable concurrency limiters and the runtime profile
//! - `worker` - the long-lived job loop and its four pipelines
//!   (transcribe, index, summarize, keyframes)
//! - `server` - axum HTTP surface with SSE/WebSocket progress streaming
//! - `vector_store` - local vector collections for semantic retrieval
//! - `chunking` - time-window chunker with natural-boundary cuts
//! - `asr` / `llm` / `embeddings` / `media` - the external-capability seams
//!
//! # Example
//!
//! ```rust,no_run
//! use sikt::app::AppContext;
//! use sikt::config::Settings;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = AppContext::new(Settings::from_env())?;
//!     sikt::server::serve(ctx).await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod asr;
pub mod chunking;
pub mod cloud_summary;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod hashing;
pub mod llm;
pub mod manifest;
pub mod media;
pub mod runtime;
pub mod server;
pub mod store;
pub mod subtitle;
pub mod transcript_store;
pub mod vector_store;
pub mod worker;

pub use error::{Result, SiktError};
