//! All backend logic independent of how the app is run.
//!
//! A product catalog (CSV) is chunked, embedded and published as a versioned
//! vector index in the app data directory (see [app_data]). A [answer::Session]
//! answers gift questions from that index, keeping per-session memory.

pub mod answer;
pub mod app_data;
pub mod catalog;
pub mod chunks;
pub mod config;
pub mod index;
pub mod memory;
pub mod ollama;
pub mod openai;
pub mod prompt;
pub mod provider;
pub mod retry;
pub mod store;
pub mod watcher;

pub use answer::{Answer, AnswerError, AnswerState, Session};
pub use app_data::{app_data_dir, default_index_dir};
pub use catalog::{load_catalog, CatalogError, CatalogLoad, ProductRecord, RecordError};
pub use chunks::{ingest, DocumentChunk, TextSplitter, DEFAULT_MAX_CHARS};
pub use config::{load_config, load_config_from, save_config, Config, ConfigError};
pub use index::{build_index, rebuild_from_catalog, IndexError, RebuildReport};
pub use memory::{ConversationMemory, Role, Turn};
pub use prompt::{PromptTemplate, WELCOME_MESSAGE};
pub use provider::{embedder_from_config, generator_from_config, Embedder, Generator};
pub use store::{IndexHandle, IndexLocation, SearchMode, SearchParams, StoreError, VectorStore};
pub use watcher::{watch_catalog, WatchError};

/// Returns a short status string. Used to verify the backend is wired up.
pub fn status() -> &'static str {
    "giftbot-core ready"
}
