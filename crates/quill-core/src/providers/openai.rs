//! OpenAI Chat Completions streaming adapter

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::sse::{SseStream, cancellable};
use super::tools::{
    LOAD_FILE_DESCRIPTION, LOAD_FILE_TOOL, PendingToolCall, load_file_schema, resolve_tool_calls,
};
use super::turn::{TurnState, finish_turn};
use super::types::{ChatCallbacks, ChatMessage, ChatProvider, KeyValidation, SendOptions};
use super::validation_from_status;
use crate::catalog::Provider;
use crate::error::ProviderError;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI adapter
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiProvider {
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

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// System prompt first (as `developer`), then history
    fn to_openai_messages(system_prompt: &str, messages: &[ChatMessage]) -> Vec<Value> {
        let mut result = Vec::with_capacity(messages.len() + 1);
        if !system_prompt.is_empty() {
            result.push(json!({ "role": "developer", "content": system_prompt }));
        }
        result.extend(
            messages
                .iter()
                .filter(|m| !m.content.trim().is_empty())
                .map(|m| json!({ "role": m.role.to_string(), "content": m.content })),
        );
        result
    }

    fn build_body(options: &SendOptions, conversation: &[Value]) -> Value {
        let mut body = json!({
            "model": options.model,
            "messages": conversation,
            "max_completion_tokens": options.max_tokens,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if options.file_loader.is_some() {
            body["tools"] = json!([{
                "type": "function",
                "function": {
                    "name": LOAD_FILE_TOOL,
                    "description": LOAD_FILE_DESCRIPTION,
                    "parameters": load_file_schema(),
                }
            }]);
        }
        body
    }

    async fn run(
        &self,
        options: &SendOptions,
        callbacks: &dyn ChatCallbacks,
    ) -> Result<TurnState, ProviderError> {
        let mut state = TurnState::new();
        let mut conversation = Self::to_openai_messages(&options.system_prompt, &options.messages);

        loop {
            let body = Self::build_body(options, &conversation);
            debug!(
                "OpenAI request: model={}, messages={}",
                options.model,
                conversation.len()
            );

            let request = self
                .client
                .post(format!("{}/v1/chat/completions", self.base_url))
                .bearer_auth(&options.api_key)
                .json(&body);
            let mut stream = SseStream::open(request, &options.cancel).await?;
            let mut round = StreamRound::default();
            while let Some(data) = stream.next_data(&options.cancel).await? {
                let chunk: Value = match serde_json::from_str(&data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("Skipping unparseable OpenAI chunk: {}", e);
                        continue;
                    }
                };
                round.handle_chunk(&chunk, &mut state, callbacks)?;
            }

            state
                .usage
                .add_round(round.input_tokens, round.output_tokens, 0);
            debug!("OpenAI round finished: finish_reason={:?}", round.finish_reason);

            let wants_file = round.tool_calls.iter().any(|c| c.name == LOAD_FILE_TOOL);
            let Some(loader) = options.file_loader.as_deref() else {
                break;
            };
            if round.finish_reason.as_deref() != Some("tool_calls") || !wants_file {
                break;
            }

            state.begin_continuation(options.max_tool_rounds)?;
            let results =
                resolve_tool_calls(&round.tool_calls, loader, &options.cancel, callbacks).await?;

            let assistant_content = if round.text.is_empty() {
                Value::Null
            } else {
                Value::String(round.text)
            };
            conversation.push(json!({
                "role": "assistant",
                "content": assistant_content,
                "tool_calls": round.tool_calls.iter().map(|c| json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments },
                })).collect::<Vec<_>>(),
            }));
            for result in results {
                conversation.push(json!({
                    "role": "tool",
                    "tool_call_id": result.call_id,
                    "content": result.content,
                }));
            }
        }

        Ok(state)
    }
}

/// Accumulated state of a single streamed completion
#[derive(Debug, Default)]
struct StreamRound {
    text: String,
    /// Indexed by the `index` field of each tool call delta
    tool_calls: Vec<PendingToolCall>,
    finish_reason: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
}

impl StreamRound {
    fn handle_chunk(
        &mut self,
        chunk: &Value,
        state: &mut TurnState,
        callbacks: &dyn ChatCallbacks,
    ) -> Result<(), ProviderError> {
        if let Some(error) = chunk.get("error") {
            let message = error["message"].as_str().unwrap_or("unknown stream error");
            return Err(ProviderError::Stream(message.to_string()));
        }

        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0);
            self.output_tokens = usage["completion_tokens"].as_u64().unwrap_or(0);
        }

        let Some(choice) = chunk["choices"].as_array().and_then(|c| c.first()) else {
            return Ok(());
        };

        let delta = &choice["delta"];
        if let Some(content) = delta["content"].as_str() {
            self.text.push_str(content);
            state.push_text(content, callbacks);
        }

        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0) as usize;
                while self.tool_calls.len() <= index {
                    self.tool_calls.push(PendingToolCall::default());
                }
                let pending = &mut self.tool_calls[index];
                if let Some(id) = call["id"].as_str() {
                    pending.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    pending.name.push_str(name);
                }
                if let Some(arguments) = call["function"]["arguments"].as_str() {
                    pending.arguments.push_str(arguments);
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn validate_key(&self, api_key: &str) -> KeyValidation {
        let response = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .bearer_auth(api_key)
            .send()
            .await;
        match response {
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
