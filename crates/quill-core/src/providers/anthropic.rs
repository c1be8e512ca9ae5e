//! Anthropic Messages API streaming adapter

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::sse::{SseStream, cancellable};
use super::tools::{
    LOAD_FILE_DESCRIPTION, LOAD_FILE_TOOL, PendingToolCall, ToolResult, load_file_schema,
    resolve_tool_calls,
};
use super::turn::{TurnState, finish_turn};
use super::types::{
    ChatCallbacks, ChatMessage, ChatProvider, CodeExecutionResult, KeyValidation, SendOptions,
    WebSearchResult,
};
use super::validation_from_status;
use crate::catalog::{self, Provider};
use crate::error::ProviderError;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const CODE_EXECUTION_BETA: &str = "code-execution-2025-05-22";
const WEB_FETCH_BETA: &str = "web-fetch-2025-09-10";
const WEB_SEARCH_MAX_USES: u32 = 3;
const WEB_FETCH_MAX_USES: u32 = 5;

/// Anthropic Claude adapter
#[derive(Clone)]
pub struct AnthropicProvider {
    client: Client,
    base_url: String,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AnthropicProvider {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point at a proxy or mock server
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Convert conversation history to Anthropic wire format
    fn to_anthropic_messages(messages: &[ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| json!({ "role": m.role.to_string(), "content": m.content }))
            .collect()
    }

    fn build_tools(options: &SendOptions) -> Vec<Value> {
        let mut tools = Vec::new();
        if options.file_loader.is_some() {
            tools.push(json!({
                "name": LOAD_FILE_TOOL,
                "description": LOAD_FILE_DESCRIPTION,
                "input_schema": load_file_schema(),
            }));
        }
        if options.tools.enable_web_search {
            tools.push(json!({
                "type": "web_search_20250305",
                "name": "web_search",
                "max_uses": WEB_SEARCH_MAX_USES,
            }));
        }
        if options.tools.enable_web_fetch {
            tools.push(json!({
                "type": "web_fetch_20250910",
                "name": "web_fetch",
                "max_uses": WEB_FETCH_MAX_USES,
            }));
        }
        if options.tools.enable_code_execution {
            tools.push(json!({
                "type": "code_execution_20250522",
                "name": "code_execution",
            }));
        }
        tools
    }

    fn build_body(options: &SendOptions, conversation: &[Value]) -> Value {
        let mut body = json!({
            "model": options.model,
            "max_tokens": options.max_tokens,
            "system": options.system_prompt,
            "messages": conversation,
            "stream": true,
        });
        let tools = Self::build_tools(options);
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        body
    }

    fn request(&self, api_key: &str, betas: &[&str]) -> RequestBuilder {
        let mut request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json");
        if !betas.is_empty() {
            request = request.header("anthropic-beta", betas.join(","));
        }
        request
    }

    fn betas(options: &SendOptions) -> Vec<&'static str> {
        let mut betas = Vec::new();
        if options.tools.enable_code_execution {
            betas.push(CODE_EXECUTION_BETA);
        }
        if options.tools.enable_web_fetch {
            betas.push(WEB_FETCH_BETA);
        }
        betas
    }

    /// Stream → detect tool use → resolve → re-stream, until a terminal stop
    async fn run(
        &self,
        options: &SendOptions,
        callbacks: &dyn ChatCallbacks,
    ) -> Result<TurnState, ProviderError> {
        let mut state = TurnState::new();
        let mut conversation = Self::to_anthropic_messages(&options.messages);
        let betas = Self::betas(options);

        loop {
            let body = Self::build_body(options, &conversation);
            debug!(
                "Anthropic request: model={}, messages={}",
                options.model,
                conversation.len()
            );

            let request = self.request(&options.api_key, &betas).json(&body);
            let mut stream = SseStream::open(request, &options.cancel).await?;
            let mut round = StreamRound::default();
            while let Some(data) = stream.next_data(&options.cancel).await? {
                let event: Value = match serde_json::from_str(&data) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Skipping unparseable Anthropic event: {}", e);
                        continue;
                    }
                };
                round.handle_event(&event, &mut state, callbacks)?;
            }

            state
                .usage
                .add_round(round.input_tokens, round.output_tokens, round.web_searches());
            let stop_reason = round.stop_reason.clone();
            debug!("Anthropic round finished: stop_reason={:?}", stop_reason);
            let (content, tool_calls) = round.into_content();

            match stop_reason.as_deref() {
                Some("tool_use") if tool_calls.iter().any(|c| c.name == LOAD_FILE_TOOL) => {
                    let Some(loader) = options.file_loader.as_deref() else {
                        break;
                    };
                    state.begin_continuation(options.max_tool_rounds)?;
                    let results =
                        resolve_tool_calls(&tool_calls, loader, &options.cancel, callbacks).await?;
                    conversation.push(json!({ "role": "assistant", "content": content }));
                    conversation.push(json!({
                        "role": "user",
                        "content": results.iter().map(tool_result_block).collect::<Vec<_>>(),
                    }));
                }
                Some("pause_turn") if !content.is_empty() => {
                    state.begin_continuation(options.max_tool_rounds)?;
                    conversation.push(json!({ "role": "assistant", "content": content }));
                }
                _ => break,
            }
        }

        Ok(state)
    }
}

fn tool_result_block(result: &ToolResult) -> Value {
    let mut block = json!({
        "type": "tool_result",
        "tool_use_id": result.call_id,
        "content": result.content,
    });
    if result.is_error {
        block["is_error"] = Value::Bool(true);
    }
    block
}

/// One content block as it is assembled from deltas
#[derive(Debug)]
enum Block {
    Text(String),
    ToolUse { id: String, name: String, json: String },
    ServerToolUse { id: String, name: String, json: String },
    /// Native tool results are echoed back untouched
    Verbatim(Value),
    Ignored,
}

/// Accumulated state of a single streamed response
#[derive(Debug, Default)]
struct StreamRound {
    blocks: BTreeMap<u64, Block>,
    stop_reason: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
    search_blocks: u32,
    reported_searches: Option<u32>,
}

impl StreamRound {
    fn handle_event(
        &mut self,
        event: &Value,
        state: &mut TurnState,
        callbacks: &dyn ChatCallbacks,
    ) -> Result<(), ProviderError> {
        let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);

        match event["type"].as_str().unwrap_or_default() {
            "message_start" => {
                let usage = &event["message"]["usage"];
                self.input_tokens = usage["input_tokens"].as_u64().unwrap_or(0);
                self.output_tokens = usage["output_tokens"].as_u64().unwrap_or(0);
            }
            "content_block_start" => {
                let block = &event["content_block"];
                let parsed = self.start_block(block, state, callbacks);
                self.blocks.insert(index, parsed);
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match (delta["type"].as_str(), self.blocks.get_mut(&index)) {
                    (Some("text_delta"), Some(Block::Text(text))) => {
                        let piece = delta["text"].as_str().unwrap_or_default();
                        text.push_str(piece);
                        state.push_text(piece, callbacks);
                    }
                    (
                        Some("input_json_delta"),
                        Some(Block::ToolUse { json, .. } | Block::ServerToolUse { json, .. }),
                    ) => {
                        json.push_str(delta["partial_json"].as_str().unwrap_or_default());
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(Block::ServerToolUse { name, json, .. }) = self.blocks.get(&index) {
                    announce_server_tool(name, &parse_input(json), callbacks);
                }
            }
            "message_delta" => {
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                let usage = &event["usage"];
                if let Some(output) = usage["output_tokens"].as_u64() {
                    self.output_tokens = output;
                }
                if let Some(input) = usage["input_tokens"].as_u64().filter(|n| *n > 0) {
                    self.input_tokens = input;
                }
                if let Some(searches) = usage["server_tool_use"]["web_search_requests"].as_u64() {
                    self.reported_searches = Some(searches as u32);
                }
            }
            "error" => {
                let message = event["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown stream error");
                return Err(ProviderError::Stream(message.to_string()));
            }
            _ => {}
        }
        Ok(())
    }

    fn start_block(
        &mut self,
        block: &Value,
        state: &mut TurnState,
        callbacks: &dyn ChatCallbacks,
    ) -> Block {
        let id = block["id"].as_str().unwrap_or_default().to_string();
        let name = block["name"].as_str().unwrap_or_default().to_string();

        match block["type"].as_str().unwrap_or_default() {
            "text" => {
                let text = block["text"].as_str().unwrap_or_default().to_string();
                state.push_text(&text, callbacks);
                Block::Text(text)
            }
            "tool_use" => Block::ToolUse {
                id,
                name,
                json: String::new(),
            },
            "server_tool_use" => {
                if name == "web_search" {
                    self.search_blocks += 1;
                }
                Block::ServerToolUse {
                    id,
                    name,
                    json: String::new(),
                }
            }
            "web_search_tool_result" => {
                report_web_search_result(&block["content"], callbacks);
                Block::Verbatim(block.clone())
            }
            "code_execution_tool_result" => {
                report_code_execution_result(&block["content"], callbacks);
                Block::Verbatim(block.clone())
            }
            "web_fetch_tool_result" => {
                report_web_fetch_result(&block["content"], callbacks);
                Block::Verbatim(block.clone())
            }
            other => {
                debug!("Ignoring Anthropic content block type: {}", other);
                Block::Ignored
            }
        }
    }

    fn web_searches(&self) -> u32 {
        self.reported_searches.unwrap_or(self.search_blocks)
    }

    /// Assistant content blocks (for the continuation request) and the
    /// pending custom tool calls, both in block order
    fn into_content(self) -> (Vec<Value>, Vec<PendingToolCall>) {
        let mut content = Vec::new();
        let mut calls = Vec::new();

        for block in self.blocks.into_values() {
            match block {
                Block::Text(text) => {
                    if !text.is_empty() {
                        content.push(json!({ "type": "text", "text": text }));
                    }
                }
                Block::ToolUse { id, name, json } => {
                    content.push(json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": parse_input(&json),
                    }));
                    calls.push(PendingToolCall {
                        id,
                        name,
                        arguments: if json.trim().is_empty() { "{}".to_string() } else { json },
                    });
                }
                Block::ServerToolUse { id, name, json } => {
                    content.push(json!({
                        "type": "server_tool_use",
                        "id": id,
                        "name": name,
                        "input": parse_input(&json),
                    }));
                }
                Block::Verbatim(value) => content.push(value),
                Block::Ignored => {}
            }
        }

        (content, calls)
    }
}

fn parse_input(json: &str) -> Value {
    if json.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(json).unwrap_or_else(|_| json!({}))
}

fn announce_server_tool(name: &str, input: &Value, callbacks: &dyn ChatCallbacks) {
    match name {
        "web_search" => callbacks.on_web_search_start(input["query"].as_str().unwrap_or_default()),
        "web_fetch" => callbacks.on_web_fetch_start(input["url"].as_str().unwrap_or_default()),
        "code_execution" => {
            callbacks.on_code_execution_start(input["code"].as_str().unwrap_or_default())
        }
        other => debug!("Unhandled server tool: {}", other),
    }
}

fn error_code(content: &Value) -> String {
    content["error_code"]
        .as_str()
        .unwrap_or("unknown_error")
        .to_string()
}

fn report_web_search_result(content: &Value, callbacks: &dyn ChatCallbacks) {
    match content {
        Value::Array(items) => {
            let results: Vec<WebSearchResult> = items
                .iter()
                .filter(|item| item["type"] == "web_search_result")
                .map(|item| WebSearchResult {
                    title: item["title"].as_str().unwrap_or_default().to_string(),
                    url: item["url"].as_str().unwrap_or_default().to_string(),
                })
                .collect();
            callbacks.on_web_search_results(&results);
        }
        other => callbacks.on_tool_error("web_search", &error_code(other)),
    }
}

fn report_code_execution_result(content: &Value, callbacks: &dyn ChatCallbacks) {
    if content["type"] == "code_execution_result" {
        callbacks.on_code_execution_result(&CodeExecutionResult {
            stdout: content["stdout"].as_str().unwrap_or_default().to_string(),
            stderr: content["stderr"].as_str().unwrap_or_default().to_string(),
            return_code: content["return_code"].as_i64().unwrap_or(0),
        });
    } else {
        callbacks.on_tool_error("code_execution", &error_code(content));
    }
}

fn report_web_fetch_result(content: &Value, callbacks: &dyn ChatCallbacks) {
    if content["type"] == "web_fetch_result" {
        callbacks.on_web_fetch_result(
            content["url"].as_str().unwrap_or_default(),
            content["content"]["title"].as_str(),
        );
    } else {
        callbacks.on_tool_error("web_fetch", &error_code(content));
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn validate_key(&self, api_key: &str) -> KeyValidation {
        let body = json!({
            "model": catalog::default_model(Provider::Anthropic).id,
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "Hi" }],
        });
        match self.request(api_key, &[]).json(&body).send().await {
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                validation_from_status(status, &text)
            }
            Err(e) => KeyValidation::invalid(format!("Failed to validate key: {}", e)),
        }
    }

    async fn send_message(&self, options: SendOptions, callbacks: &dyn ChatCallbacks) {
        callbacks.on_start();
        let outcome = cancellable(&options.cancel, self.run(&options, callbacks))
            .await
            .and_then(|result| result);
        finish_turn(&options.model, outcome, &options.cancel, callbacks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::tools::test_support::{MapLoader, RecordingCallbacks};
    use crate::providers::types::ToolOptions;
    use crate::error::is_auth_error;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODEL: &str = "claude-haiku-4-5-20251001";

    fn sse(events: &[Value]) -> String {
        events
            .iter()
            .map(|e| format!("event: {}\ndata: {}\n\n", e["type"].as_str().unwrap(), e))
            .collect()
    }

    fn message_start(input_tokens: u64) -> Value {
        json!({"type": "message_start", "message": {"id": "msg_1", "usage": {"input_tokens": input_tokens, "output_tokens": 1}}})
    }

    fn text_block(index: u64, chunks: &[&str]) -> Vec<Value> {
        let mut events = vec![json!({"type": "content_block_start", "index": index, "content_block": {"type": "text", "text": ""}})];
        for chunk in chunks {
            events.push(json!({"type": "content_block_delta", "index": index, "delta": {"type": "text_delta", "text": chunk}}));
        }
        events.push(json!({"type": "content_block_stop", "index": index}));
        events
    }

    fn message_end(stop_reason: &str, output_tokens: u64) -> Vec<Value> {
        vec![
            json!({"type": "message_delta", "delta": {"stop_reason": stop_reason}, "usage": {"output_tokens": output_tokens}}),
            json!({"type": "message_stop"}),
        ]
    }

    fn tool_use_round(path: &str) -> String {
        let mut events = vec![message_start(10)];
        events.extend(text_block(0, &["Let me check. "]));
        events.push(json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "load_file", "input": {}}}));
        events.push(json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"path\": \""}}));
        events.push(json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": format!("{}\"}}", path)}}));
        events.push(json!({"type": "content_block_stop", "index": 1}));
        events.extend(message_end("tool_use", 20));
        sse(&events)
    }

    fn final_round(text: &str) -> String {
        let mut events = vec![message_start(30)];
        events.extend(text_block(0, &[text]));
        events.extend(message_end("end_turn", 5));
        sse(&events)
    }

    fn stream_response(body: String) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
    }

    fn options(messages: Vec<ChatMessage>) -> SendOptions {
        SendOptions::new(messages, "You are helpful.", "sk-ant-test", MODEL)
    }

    async fn request_bodies(server: &MockServer) -> Vec<Value> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_plain_stream_callback_order() {
        let server = MockServer::start().await;
        let mut events = vec![message_start(12)];
        events.push(json!({"type": "ping"}));
        events.extend(text_block(0, &["Hello", ", world"]));
        events.extend(message_end("end_turn", 7));
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(stream_response(sse(&events)))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new().with_base_url(server.uri());
        let callbacks = RecordingCallbacks::default();
        provider
            .send_message(options(vec![ChatMessage::user("hi")]), &callbacks)
            .await;

        assert_eq!(
            callbacks.events(),
            vec!["start", "token:Hello", "token:, world", "usage", "complete:Hello, world"]
        );
        let usage = callbacks.usage.lock().unwrap().unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 7);

        let bodies = request_bodies(&server).await;
        assert_eq!(bodies[0]["stream"], true);
        assert_eq!(bodies[0]["system"], "You are helpful.");
        assert!(bodies[0].get("tools").is_none());
    }

    #[tokio::test]
    async fn test_load_file_continuation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(stream_response(tool_use_round("notes/a.md")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(stream_response(final_round("Found it.")))
            .mount(&server)
            .await;

        let loader = Arc::new(MapLoader::with(&[("notes/a.md", "alpha")]));
        let provider = AnthropicProvider::new().with_base_url(server.uri());
        let callbacks = RecordingCallbacks::default();
        provider
            .send_message(
                options(vec![ChatMessage::user("what is in a?")]).with_file_loader(loader.clone()),
                &callbacks,
            )
            .await;

        let events = callbacks.events();
        assert_eq!(events.last().unwrap(), "complete:Let me check. Found it.");
        assert_eq!(callbacks.count("error"), 0);
        assert_eq!(callbacks.count("file_load:notes/a.md"), 1);
        assert_eq!(callbacks.count("file_loaded:notes/a.md:true"), 1);

        let usage = callbacks.usage.lock().unwrap().unwrap();
        assert_eq!(usage.input_tokens, 40);
        assert_eq!(usage.output_tokens, 25);

        let bodies = request_bodies(&server).await;
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0]["tools"][0]["name"], "load_file");
        let messages = bodies[1]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"][0]["text"], "Let me check. ");
        assert_eq!(messages[1]["content"][1]["type"], "tool_use");
        assert_eq!(messages[1]["content"][1]["input"]["path"], "notes/a.md");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "toolu_1");
        assert_eq!(messages[2]["content"][0]["content"], "File: notes/a.md\n\nalpha");
    }

    #[tokio::test]
    async fn test_missing_file_still_completes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(stream_response(tool_use_round("ghost.md")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(stream_response(final_round("No such file.")))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new().with_base_url(server.uri());
        let callbacks = RecordingCallbacks::default();
        provider
            .send_message(
                options(vec![ChatMessage::user("open ghost")])
                    .with_file_loader(Arc::new(MapLoader::with(&[]))),
                &callbacks,
            )
            .await;

        assert_eq!(callbacks.count("error"), 0);
        assert_eq!(callbacks.count("complete:"), 1);
        assert_eq!(callbacks.count("file_loaded:ghost.md:false"), 1);
        let bodies = request_bodies(&server).await;
        let result = &bodies[1]["messages"][2]["content"][0];
        assert_eq!(result["is_error"], true);
        assert!(result["content"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_tool_use_without_loader_finishes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(stream_response(tool_use_round("notes/a.md")))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new().with_base_url(server.uri());
        let callbacks = RecordingCallbacks::default();
        provider
            .send_message(options(vec![ChatMessage::user("hi")]), &callbacks)
            .await;

        assert_eq!(callbacks.events().last().unwrap(), "complete:Let me check. ");
        assert_eq!(request_bodies(&server).await.len(), 1);
    }

    #[tokio::test]
    async fn test_round_limit_surfaces_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(stream_response(tool_use_round("notes/a.md")))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new().with_base_url(server.uri());
        let callbacks = RecordingCallbacks::default();
        provider
            .send_message(
                options(vec![ChatMessage::user("loop")])
                    .with_file_loader(Arc::new(MapLoader::with(&[("notes/a.md", "a")])))
                    .with_max_tool_rounds(2),
                &callbacks,
            )
            .await;

        assert_eq!(callbacks.count("complete"), 0);
        assert_eq!(callbacks.count("error:Tool loop exceeded"), 1);
        assert_eq!(request_bodies(&server).await.len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_mid_request_is_silent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(stream_response(final_round("late")).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new().with_base_url(server.uri());
        let callbacks = RecordingCallbacks::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        provider
            .send_message(
                options(vec![ChatMessage::user("hi")]).with_cancel(cancel),
                &callbacks,
            )
            .await;

        assert_eq!(callbacks.events(), vec!["start"]);
    }

    #[tokio::test]
    async fn test_unauthorized_reports_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string(
                r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#,
            ))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new().with_base_url(server.uri());
        let callbacks = RecordingCallbacks::default();
        provider
            .send_message(options(vec![ChatMessage::user("hi")]), &callbacks)
            .await;

        let events = callbacks.events();
        assert_eq!(events.len(), 2);
        let message = events[1].strip_prefix("error:").unwrap();
        assert!(is_auth_error(message));
    }

    #[tokio::test]
    async fn test_stream_error_event_keeps_partial_tokens() {
        let server = MockServer::start().await;
        let mut events = vec![message_start(5)];
        events.push(json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}));
        events.push(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Par"}}));
        events.push(json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}));
        Mock::given(method("POST"))
            .respond_with(stream_response(sse(&events)))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new().with_base_url(server.uri());
        let callbacks = RecordingCallbacks::default();
        provider
            .send_message(options(vec![ChatMessage::user("hi")]), &callbacks)
            .await;

        assert_eq!(
            callbacks.events(),
            vec!["start", "token:Par", "error:Stream error: Overloaded"]
        );
    }

    #[tokio::test]
    async fn test_native_web_search_events() {
        let server = MockServer::start().await;
        let mut events = vec![message_start(100)];
        events.push(json!({"type": "content_block_start", "index": 0, "content_block": {"type": "server_tool_use", "id": "srvtoolu_1", "name": "web_search", "input": {}}}));
        events.push(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"query\": \"rust 2024\"}"}}));
        events.push(json!({"type": "content_block_stop", "index": 0}));
        events.push(json!({"type": "content_block_start", "index": 1, "content_block": {"type": "web_search_tool_result", "tool_use_id": "srvtoolu_1", "content": [
            {"type": "web_search_result", "title": "Rust 2024", "url": "https://blog.rust-lang.org"},
            {"type": "web_search_result", "title": "Edition guide", "url": "https://doc.rust-lang.org"}
        ]}}));
        events.push(json!({"type": "content_block_stop", "index": 1}));
        events.extend(text_block(2, &["Rust 2024 shipped."]));
        events.push(json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 40, "server_tool_use": {"web_search_requests": 1}}}));
        Mock::given(method("POST"))
            .respond_with(stream_response(sse(&events)))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new().with_base_url(server.uri());
        let callbacks = RecordingCallbacks::default();
        provider
            .send_message(
                options(vec![ChatMessage::user("news?")]).with_tools(ToolOptions {
                    enable_web_search: true,
                    ..Default::default()
                }),
                &callbacks,
            )
            .await;

        let recorded = callbacks.events();
        assert!(recorded.contains(&"search:rust 2024".to_string()));
        assert!(recorded.contains(&"search_results:2".to_string()));
        let usage = callbacks.usage.lock().unwrap().unwrap();
        assert_eq!(usage.web_searches, 1);

        let bodies = request_bodies(&server).await;
        let tools = bodies[0]["tools"].as_array().unwrap();
        assert_eq!(tools[0]["type"], "web_search_20250305");
        assert_eq!(tools[0]["max_uses"], 3);
    }

    #[tokio::test]
    async fn test_code_execution_sends_beta_header() {
        let server = MockServer::start().await;
        let mut events = vec![message_start(10)];
        events.push(json!({"type": "content_block_start", "index": 0, "content_block": {"type": "server_tool_use", "id": "srvtoolu_2", "name": "code_execution", "input": {}}}));
        events.push(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"code\": \"print(2+2)\"}"}}));
        events.push(json!({"type": "content_block_stop", "index": 0}));
        events.push(json!({"type": "content_block_start", "index": 1, "content_block": {"type": "code_execution_tool_result", "tool_use_id": "srvtoolu_2", "content": {"type": "code_execution_result", "stdout": "4\n", "stderr": "", "return_code": 0}}}));
        events.push(json!({"type": "content_block_stop", "index": 1}));
        events.extend(message_end("end_turn", 3));
        Mock::given(method("POST"))
            .and(header("anthropic-beta", CODE_EXECUTION_BETA))
            .respond_with(stream_response(sse(&events)))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new().with_base_url(server.uri());
        let callbacks = RecordingCallbacks::default();
        provider
            .send_message(
                options(vec![ChatMessage::user("compute")]).with_tools(ToolOptions {
                    enable_code_execution: true,
                    ..Default::default()
                }),
                &callbacks,
            )
            .await;

        let recorded = callbacks.events();
        assert!(recorded.contains(&"code:print(2+2)".to_string()));
        assert!(recorded.contains(&"code_result:4".to_string()));
        assert_eq!(callbacks.count("complete"), 1);
    }

    #[test]
    fn test_native_tools_carry_their_own_limits() {
        let opts = options(vec![ChatMessage::user("x")]).with_tools(ToolOptions {
            enable_web_search: true,
            enable_web_fetch: true,
            enable_code_execution: false,
        });
        let tools = AnthropicProvider::build_tools(&opts);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["max_uses"], WEB_SEARCH_MAX_USES);
        assert_eq!(tools[1]["type"], "web_fetch_20250910");
        assert_eq!(tools[1]["max_uses"], WEB_FETCH_MAX_USES);
    }

    #[tokio::test]
    async fn test_validate_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-api-key", "sk-ant-good"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"id":"msg"}"#))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string(
                r#"{"error":{"message":"invalid x-api-key"}}"#,
            ))
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new().with_base_url(server.uri());
        assert!(provider.validate_key("sk-ant-good").await.valid);
        let bad = provider.validate_key("sk-ant-bad").await;
        assert!(!bad.valid);
        assert_eq!(bad.error.as_deref(), Some("Invalid API key"));
    }

    #[test]
    fn test_to_anthropic_messages_skips_empty() {
        let msgs = vec![
            ChatMessage::user("hello"),
            ChatMessage::assistant("  "),
            ChatMessage::assistant("hi"),
        ];
        let result = AnthropicProvider::to_anthropic_messages(&msgs);
        assert_eq!(result.len(), 2);
        assert_eq!(result[1]["role"], "assistant");
    }

    #[test]
    fn test_debug_has_no_secrets() {
        let provider = AnthropicProvider::new();
        let debug = format!("{:?}", provider);
        assert!(debug.contains(DEFAULT_BASE_URL));
    }
}
