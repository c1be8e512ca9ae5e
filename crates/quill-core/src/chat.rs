//! Chat orchestration: provider selection, prompt assembly, and the
//! conversation session the front end drives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{self, Provider};
use crate::content::{ContentLoader, ContentSource, load_file_contents};
use crate::context::build_system_prompt;
use crate::files::{LoadedFile, LoadedFiles};
use crate::prefs::Preferences;
use crate::providers::types::{
    ChatCallbacks, ChatMessage, ChatProvider, CodeExecutionResult, DEFAULT_MAX_TOOL_ROUNDS,
    FileContent, FileLoader, LOAD_ERROR_PREFIX, SendOptions, ToolOptions, WebSearchResult,
};
use crate::providers::provider_for;
use crate::relevance;
use crate::usage::UsageData;

/// Tunables for the orchestrator and sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatConfig {
    pub max_tool_rounds: usize,
    pub max_tokens: u32,
    /// Relevant files auto-loaded per turn; 0 disables auto-loading
    pub auto_load_limit: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            max_tokens: 8192,
            auto_load_limit: 5,
        }
    }
}

/// One provider-agnostic chat request
pub struct TurnRequest {
    pub messages: Vec<ChatMessage>,
    pub system_prompt: String,
    /// Falls back to the stored key for the active provider
    pub api_key: Option<String>,
    /// Falls back to the provider's selected, then default, model
    pub model_id: Option<String>,
    pub tools: ToolOptions,
    pub cancel: CancellationToken,
    /// Set that files loaded by the model are recorded into
    pub loaded_files: Option<Arc<Mutex<LoadedFiles>>>,
}

impl TurnRequest {
    pub fn new(messages: Vec<ChatMessage>, system_prompt: impl Into<String>) -> Self {
        Self {
            messages,
            system_prompt: system_prompt.into(),
            api_key: None,
            model_id: None,
            tools: ToolOptions::default(),
            cancel: CancellationToken::new(),
            loaded_files: None,
        }
    }
}

pub struct ChatOrchestrator {
    prefs: Preferences,
    adapters: HashMap<Provider, Arc<dyn ChatProvider>>,
    content: Option<Arc<dyn ContentSource>>,
    config: ChatConfig,
}

impl ChatOrchestrator {
    pub fn new(
        prefs: Preferences,
        content: Option<Arc<dyn ContentSource>>,
        config: ChatConfig,
    ) -> Self {
        let adapters = Provider::ALL
            .into_iter()
            .map(|p| (p, provider_for(p, None)))
            .collect();
        Self {
            prefs,
            adapters,
            content,
            config,
        }
    }

    /// Replace the adapter for its provider (custom endpoints, tests)
    pub fn with_adapter(mut self, adapter: Arc<dyn ChatProvider>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    pub fn prefs(&self) -> &Preferences {
        &self.prefs
    }

    pub fn config(&self) -> ChatConfig {
        self.config
    }

    pub fn has_content_source(&self) -> bool {
        self.content.is_some()
    }

    pub fn active_provider(&self) -> Provider {
        self.prefs.active_provider()
    }

    pub fn adapter(&self, provider: Provider) -> Arc<dyn ChatProvider> {
        self.adapters
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| provider_for(provider, None))
    }

    /// Explicit id wins, then the provider's last selection, then its default
    pub fn resolve_model(&self, provider: Provider, explicit: Option<&str>) -> String {
        explicit
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| self.prefs.selected_model(provider))
            .unwrap_or_else(|| catalog::default_model(provider).id.to_string())
    }

    /// Run one turn against the active provider
    pub async fn send_message(&self, request: TurnRequest, callbacks: &dyn ChatCallbacks) {
        let provider = self.active_provider();
        let Some(api_key) = request
            .api_key
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.prefs.api_key(provider))
        else {
            callbacks.on_start();
            callbacks.on_error(&format!("No API key configured for {}", provider));
            return;
        };

        let model = self.resolve_model(provider, request.model_id.as_deref());
        let tools = request.tools.gated_for(provider);
        info!("Sending turn to {} ({})", provider, model);
        debug!("Tools requested {:?}, forwarded {:?}", request.tools, tools);

        let mut options = SendOptions::new(request.messages, request.system_prompt, api_key, model)
            .with_tools(tools)
            .with_cancel(request.cancel)
            .with_max_tool_rounds(self.config.max_tool_rounds)
            .with_max_tokens(self.config.max_tokens);

        if let Some(source) = &self.content {
            let loaded = request
                .loaded_files
                .unwrap_or_else(|| Arc::new(Mutex::new(LoadedFiles::new())));
            let loader: Arc<dyn FileLoader> = Arc::new(ContentLoader::new(source.clone(), loaded));
            options = options.with_file_loader(loader);
        }

        self.adapter(provider).send_message(options, callbacks).await;
    }

    fn source(&self) -> Result<&Arc<dyn ContentSource>> {
        self.content
            .as_ref()
            .ok_or_else(|| anyhow!("No notes directory configured"))
    }

    pub async fn file_tree(&self) -> Result<Vec<String>> {
        self.source()?.file_tree().await
    }

    /// Per-path results; failures carry error-marker content
    pub async fn load_files(&self, paths: &[String]) -> Result<Vec<FileContent>> {
        Ok(load_file_contents(self.source()?.as_ref(), paths).await)
    }

    pub async fn find_relevant_files(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let tree = self.file_tree().await?;
        Ok(relevance::find_relevant_files(query, &tree, limit))
    }

    /// System prompt for the active provider, describing only the tools it
    /// will actually receive
    pub fn build_system_prompt(
        &self,
        loaded: &[LoadedFile],
        tree: &[String],
        tools: &ToolOptions,
    ) -> String {
        let tools = tools.gated_for(self.active_provider());
        build_system_prompt(loaded, tree, &tools, self.content.is_some())
    }
}

/// How a session turn ended
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed(String),
    Failed(String),
    Cancelled,
}

/// Forwards every callback and remembers the terminal one
struct CapturingCallbacks<'a> {
    inner: &'a dyn ChatCallbacks,
    outcome: Mutex<Option<TurnOutcome>>,
}

impl<'a> CapturingCallbacks<'a> {
    fn new(inner: &'a dyn ChatCallbacks) -> Self {
        Self {
            inner,
            outcome: Mutex::new(None),
        }
    }

    fn record(&self, outcome: TurnOutcome) {
        if let Ok(mut slot) = self.outcome.lock() {
            *slot = Some(outcome);
        }
    }

    fn outcome(&self) -> TurnOutcome {
        self.outcome
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .unwrap_or(TurnOutcome::Cancelled)
    }
}

impl ChatCallbacks for CapturingCallbacks<'_> {
    fn on_start(&self) {
        self.inner.on_start();
    }
    fn on_token(&self, token: &str) {
        self.inner.on_token(token);
    }
    fn on_usage(&self, usage: &UsageData) {
        self.inner.on_usage(usage);
    }
    fn on_complete(&self, full_response: &str) {
        self.record(TurnOutcome::Completed(full_response.to_string()));
        self.inner.on_complete(full_response);
    }
    fn on_error(&self, message: &str) {
        self.record(TurnOutcome::Failed(message.to_string()));
        self.inner.on_error(message);
    }
    fn on_web_search_start(&self, query: &str) {
        self.inner.on_web_search_start(query);
    }
    fn on_web_search_results(&self, results: &[WebSearchResult]) {
        self.inner.on_web_search_results(results);
    }
    fn on_web_fetch_start(&self, url: &str) {
        self.inner.on_web_fetch_start(url);
    }
    fn on_web_fetch_result(&self, url: &str, title: Option<&str>) {
        self.inner.on_web_fetch_result(url, title);
    }
    fn on_code_execution_start(&self, code: &str) {
        self.inner.on_code_execution_start(code);
    }
    fn on_code_execution_result(&self, result: &CodeExecutionResult) {
        self.inner.on_code_execution_result(result);
    }
    fn on_tool_error(&self, tool: &str, message: &str) {
        self.inner.on_tool_error(tool, message);
    }
    fn on_file_load(&self, path: &str) {
        self.inner.on_file_load(path);
    }
    fn on_file_loaded(&self, path: &str, success: bool) {
        self.inner.on_file_loaded(path, success);
    }
}

/// A conversation: history, loaded files, and the cached file tree
pub struct ChatSession {
    orchestrator: Arc<ChatOrchestrator>,
    messages: Vec<ChatMessage>,
    loaded: Arc<Mutex<LoadedFiles>>,
    tree: Option<Vec<String>>,
    model_id: Option<String>,
}

impl ChatSession {
    pub fn new(orchestrator: Arc<ChatOrchestrator>) -> Self {
        Self {
            orchestrator,
            messages: Vec::new(),
            loaded: Arc::new(Mutex::new(LoadedFiles::new())),
            tree: None,
            model_id: None,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn loaded_files(&self) -> Vec<LoadedFile> {
        self.loaded
            .lock()
            .map(|files| files.to_vec())
            .unwrap_or_default()
    }

    /// Override the model for this session only
    pub fn set_model(&mut self, model_id: Option<String>) {
        self.model_id = model_id;
    }

    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    /// Clear history and loaded files; the file tree stays cached
    pub fn new_chat(&mut self) {
        self.messages.clear();
        if let Ok(mut files) = self.loaded.lock() {
            files.clear();
        }
        info!("Started new chat");
    }

    /// File tree, fetched once per session. Failures yield an empty tree.
    pub async fn file_tree(&mut self) -> Vec<String> {
        if self.tree.is_none() && self.orchestrator.has_content_source() {
            match self.orchestrator.file_tree().await {
                Ok(tree) => self.tree = Some(tree),
                Err(e) => warn!("Failed to list notes: {:#}", e),
            }
        }
        self.tree.clone().unwrap_or_default()
    }

    /// Drop the cached tree so the next turn rescans
    pub fn refresh_tree(&mut self) {
        self.tree = None;
    }

    /// Load a file by hand into context
    pub async fn load_file(&mut self, path: &str) -> Result<LoadedFile> {
        let contents = self.orchestrator.load_files(&[path.to_string()]).await?;
        let file = contents
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No content returned for {}", path))?;
        if file.content.starts_with(LOAD_ERROR_PREFIX) {
            return Err(anyhow!("{}", file.content));
        }
        let loaded = LoadedFile::new(file.path, file.content);
        self.with_loaded(|files| {
            files.insert(loaded.clone());
        })?;
        Ok(loaded)
    }

    pub fn drop_file(&mut self, path: &str) -> bool {
        self.with_loaded(|files| files.remove(path).is_some())
            .unwrap_or(false)
    }

    fn with_loaded<T>(&self, f: impl FnOnce(&mut LoadedFiles) -> T) -> Result<T> {
        let mut files = self
            .loaded
            .lock()
            .map_err(|_| anyhow!("loaded file set poisoned"))?;
        Ok(f(&mut files))
    }

    /// Add `file` to the loaded set; false when the set is unusable
    fn record_loaded(&self, file: LoadedFile) -> bool {
        let path = file.path.clone();
        match self.with_loaded(|files| {
            files.insert(file);
        }) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not record {}: {:#}", path, e);
                false
            }
        }
    }

    async fn auto_load(&mut self, query: &str, tree: &[String], callbacks: &dyn ChatCallbacks) {
        let limit = self.orchestrator.config().auto_load_limit;
        if limit == 0 || tree.is_empty() {
            return;
        }
        let candidates: Vec<String> = relevance::find_relevant_files(query, tree, limit)
            .into_iter()
            .filter(|p| !self.with_loaded(|files| files.contains(p)).unwrap_or(true))
            .collect();
        if candidates.is_empty() {
            return;
        }

        info!("Auto-loading {} relevant files", candidates.len());
        for path in &candidates {
            callbacks.on_file_load(path);
        }
        let contents = match self.orchestrator.load_files(&candidates).await {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Auto-load failed: {:#}", e);
                return;
            }
        };
        for file in contents {
            let ok = !file.content.starts_with(LOAD_ERROR_PREFIX)
                && self.record_loaded(LoadedFile::new(&file.path, &file.content));
            callbacks.on_file_loaded(&file.path, ok);
        }
    }

    /// Send `text` as the next user message and stream the reply.
    ///
    /// The assistant message is appended only when the turn completes.
    pub async fn send(
        &mut self,
        text: &str,
        callbacks: &dyn ChatCallbacks,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        self.messages.push(ChatMessage::user(text));

        let tree = self.file_tree().await;
        self.auto_load(text, &tree, callbacks).await;

        let tools = self.orchestrator.prefs().tool_options();
        let system_prompt = self
            .orchestrator
            .build_system_prompt(&self.loaded_files(), &tree, &tools);

        let mut request = TurnRequest::new(self.messages.clone(), system_prompt);
        request.model_id = self.model_id.clone();
        request.tools = tools;
        request.cancel = cancel;
        request.loaded_files = Some(self.loaded.clone());

        let capture = CapturingCallbacks::new(callbacks);
        self.orchestrator.send_message(request, &capture).await;
        let outcome = capture.outcome();

        if let TurnOutcome::Completed(response) = &outcome {
            self.messages.push(ChatMessage::assistant(response.clone()));
        }
        outcome
    }
}
