//! quill-core - multi-provider streaming chat over a notes repository
//!
//! This crate provides:
//! - Streaming adapters for Anthropic, OpenAI and Gemini behind one callback contract
//! - The `load_file` tool and its continuation loop, shared by every adapter
//! - A static model catalog with pricing and per-turn cost accounting
//! - The chat orchestrator, system prompt builder and relevant-file discovery
//! - Persisted preferences (keys, models, active provider, tool toggles)

pub mod catalog;
pub mod chat;
pub mod content;
pub mod context;
pub mod error;
pub mod files;
pub mod prefs;
pub mod providers;
pub mod relevance;
pub mod usage;

// Re-export main types for convenience
pub use catalog::{ModelDefinition, ModelTier, Provider, ProviderConfig};
pub use chat::{ChatConfig, ChatOrchestrator, ChatSession, TurnOutcome, TurnRequest};
pub use content::{ContentSource, LocalContentSource};
pub use error::{ProviderError, is_auth_error};
pub use files::{LoadedFile, LoadedFiles};
pub use prefs::{JsonFileStore, KeyValueStore, MemoryStore, Preferences};
pub use providers::{
    ChatCallbacks, ChatMessage, ChatProvider, KeyValidation, Role, SendOptions, ToolOptions,
    provider_for,
};
pub use relevance::find_relevant_files;
pub use usage::{UsageData, calculate_cost};
