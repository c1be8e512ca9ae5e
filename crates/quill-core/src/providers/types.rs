//! Provider-agnostic types shared by every chat adapter

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::catalog::{self, ModelDefinition, Provider};
use crate::usage::UsageData;

/// Default cap on tool-call continuations within one turn
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

/// Message role. System text travels separately as the system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One conversation turn. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Capability toggles requested by the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOptions {
    pub enable_web_search: bool,
    pub enable_web_fetch: bool,
    pub enable_code_execution: bool,
}

impl ToolOptions {
    /// Drop any toggle the provider cannot honour
    pub fn gated_for(&self, provider: Provider) -> Self {
        let config = provider.config();
        Self {
            enable_web_search: self.enable_web_search && config.supports_web_search,
            enable_web_fetch: self.enable_web_fetch && config.supports_web_fetch,
            enable_code_execution: self.enable_code_execution && config.supports_code_execution,
        }
    }

    pub fn any_enabled(&self) -> bool {
        self.enable_web_search || self.enable_web_fetch || self.enable_code_execution
    }
}

/// Content returned by a file loader for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub path: String,
    pub content: String,
}

/// Prefix a file loader uses to report a per-path failure in-band
pub const LOAD_ERROR_PREFIX: &str = "Error:";

/// Injected collaborator that fetches file contents for the `load_file` tool
#[async_trait]
pub trait FileLoader: Send + Sync {
    /// May return [`LOAD_ERROR_PREFIX`]-prefixed content for individual
    /// paths without failing the whole batch
    async fn load_files(&self, paths: &[String]) -> Result<Vec<FileContent>>;
}

/// A single search hit from a native web search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSearchResult {
    pub title: String,
    pub url: String,
}

/// Output of a native code execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i64,
}

/// Callback bundle through which adapters report a streaming turn.
///
/// Only the terminal callbacks are required; every tool-related hook
/// defaults to a no-op.
pub trait ChatCallbacks: Send + Sync {
    fn on_start(&self) {}
    fn on_token(&self, token: &str);
    fn on_usage(&self, _usage: &UsageData) {}
    fn on_complete(&self, full_response: &str);
    fn on_error(&self, message: &str);

    fn on_web_search_start(&self, _query: &str) {}
    fn on_web_search_results(&self, _results: &[WebSearchResult]) {}
    fn on_web_fetch_start(&self, _url: &str) {}
    fn on_web_fetch_result(&self, _url: &str, _title: Option<&str>) {}
    fn on_code_execution_start(&self, _code: &str) {}
    fn on_code_execution_result(&self, _result: &CodeExecutionResult) {}
    fn on_tool_error(&self, _tool: &str, _message: &str) {}

    fn on_file_load(&self, _path: &str) {}
    fn on_file_loaded(&self, _path: &str, _success: bool) {}
}

/// Everything an adapter needs for one turn
#[derive(Clone)]
pub struct SendOptions {
    pub messages: Vec<ChatMessage>,
    pub system_prompt: String,
    pub api_key: String,
    pub model: String,
    pub tools: ToolOptions,
    pub cancel: CancellationToken,
    pub file_loader: Option<Arc<dyn FileLoader>>,
    pub max_tool_rounds: usize,
    pub max_tokens: u32,
}

impl SendOptions {
    pub fn new(
        messages: Vec<ChatMessage>,
        system_prompt: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            messages,
            system_prompt: system_prompt.into(),
            api_key: api_key.into(),
            model: model.into(),
            tools: ToolOptions::default(),
            cancel: CancellationToken::new(),
            file_loader: None,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            max_tokens: 8192,
        }
    }

    pub fn with_tools(mut self, tools: ToolOptions) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_file_loader(mut self, loader: Arc<dyn FileLoader>) -> Self {
        self.file_loader = Some(loader);
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

impl std::fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendOptions")
            .field("messages", &self.messages.len())
            .field("system_prompt", &self.system_prompt.len())
            .field("model", &self.model)
            .field("tools", &self.tools)
            .field("file_loader", &self.file_loader.is_some())
            .field("max_tool_rounds", &self.max_tool_rounds)
            .finish()
    }
}

/// Result of probing a key against the vendor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValidation {
    pub valid: bool,
    pub error: Option<String>,
}

impl KeyValidation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

/// Contract every vendor adapter satisfies
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn provider(&self) -> Provider;

    /// Catalog entries for this provider
    fn models(&self) -> Vec<&'static ModelDefinition> {
        catalog::models_for(self.provider())
    }

    /// Issue one cheap request to check the key
    async fn validate_key(&self, api_key: &str) -> KeyValidation;

    /// Stream one turn. Never fails; every outcome goes through `callbacks`.
    async fn send_message(&self, options: SendOptions, callbacks: &dyn ChatCallbacks);
}
