//! Google Gemini `streamGenerateContent` adapter

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
use super::types::{ChatCallbacks, ChatMessage, ChatProvider, KeyValidation, Role, SendOptions};
use super::validation_from_status;
use crate::catalog::Provider;
use crate::error::{ProviderError, is_auth_error};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Google Gemini adapter
#[derive(Clone)]
pub struct GeminiProvider {
    client: Client,
    base_url: String,
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiProvider {
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

    fn to_gemini_contents(messages: &[ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect()
    }

    fn build_body(options: &SendOptions, contents: &[Value]) -> Value {
        let mut body = json!({
            "contents": contents,
            "generationConfig": { "maxOutputTokens": options.max_tokens },
        });
        if !options.system_prompt.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": options.system_prompt }] });
        }
        if options.file_loader.is_some() {
            body["tools"] = json!([{
                "functionDeclarations": [{
                    "name": LOAD_FILE_TOOL,
                    "description": LOAD_FILE_DESCRIPTION,
                    "parameters": load_file_schema(),
                }]
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
        let mut contents = Self::to_gemini_contents(&options.messages);
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, options.model
        );

        loop {
            let body = Self::build_body(options, &contents);
            debug!(
                "Gemini request: model={}, contents={}",
                options.model,
                contents.len()
            );

            let request = self
                .client
                .post(&url)
                .header("x-goog-api-key", &options.api_key)
                .json(&body);
            let mut stream = SseStream::open(request, &options.cancel)
                .await
                .map_err(promote_key_error)?;
            let mut round = StreamRound::default();
            while let Some(data) = stream.next_data(&options.cancel).await? {
                let chunk: Value = match serde_json::from_str(&data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("Skipping unparseable Gemini chunk: {}", e);
                        continue;
                    }
                };
                round.handle_chunk(&chunk, &mut state, callbacks)?;
            }

            state
                .usage
                .add_round(round.input_tokens, round.output_tokens, 0);
            debug!(
                "Gemini round finished: function_calls={}",
                round.tool_calls.len()
            );

            let Some(loader) = options.file_loader.as_deref() else {
                break;
            };
            if !round.tool_calls.iter().any(|c| c.name == LOAD_FILE_TOOL) {
                break;
            }

            state.begin_continuation(options.max_tool_rounds)?;
            let results =
                resolve_tool_calls(&round.tool_calls, loader, &options.cancel, callbacks).await?;

            // Model parts go back untouched so thought signatures survive
            contents.push(json!({ "role": "model", "parts": round.model_parts }));
            let responses: Vec<Value> = round
                .tool_calls
                .iter()
                .zip(results)
                .map(|(call, result)| {
                    let mut response = json!({
                        "name": result.name,
                        "response": { "content": result.content },
                    });
                    if let Some(id) = call.id.strip_prefix(NATIVE_ID_MARKER) {
                        response["id"] = Value::String(id.to_string());
                    }
                    json!({ "functionResponse": response })
                })
                .collect();
            contents.push(json!({ "role": "user", "parts": responses }));
        }

        Ok(state)
    }
}

/// Marks call ids that came from the vendor rather than being synthesized
const NATIVE_ID_MARKER: &str = "gemini:";

/// Gemini rejects bad keys with 400 rather than 401
fn promote_key_error(error: ProviderError) -> ProviderError {
    match error {
        ProviderError::Api { status: 400, message } if is_auth_error(&message) => {
            ProviderError::Unauthorized(message)
        }
        other => other,
    }
}

#[derive(Debug, Default)]
struct StreamRound {
    model_parts: Vec<Value>,
    tool_calls: Vec<PendingToolCall>,
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

        // Each chunk carries cumulative counts; the last one wins
        if let Some(usage) = chunk.get("usageMetadata") {
            self.input_tokens = usage["promptTokenCount"].as_u64().unwrap_or(self.input_tokens);
            let candidates = usage["candidatesTokenCount"].as_u64().unwrap_or(0);
            let thoughts = usage["thoughtsTokenCount"].as_u64().unwrap_or(0);
            if candidates + thoughts > 0 {
                self.output_tokens = candidates + thoughts;
            }
        }

        let parts = chunk["candidates"][0]["content"]["parts"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        for part in parts {
            if let Some(call) = part.get("functionCall") {
                let name = call["name"].as_str().unwrap_or_default();
                let id = match call["id"].as_str() {
                    Some(id) => format!("{}{}", NATIVE_ID_MARKER, id),
                    None => format!("call_{}", self.tool_calls.len()),
                };
                let arguments = serde_json::to_string(&call["args"]).unwrap_or_default();
                self.tool_calls.push(PendingToolCall {
                    id,
                    name: name.to_string(),
                    arguments: if call["args"].is_null() { "{}".to_string() } else { arguments },
                });
            } else if part["thought"].as_bool() == Some(true) {
                // Thought summaries are echoed but never shown
            } else if let Some(text) = part["text"].as_str() {
                state.push_text(text, callbacks);
            }
            self.model_parts.push(part);
        }
        Ok(())
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    async fn validate_key(&self, api_key: &str) -> KeyValidation {
        let response = self
            .client
            .get(format!("{}/v1beta/models", self.base_url))
            .header("x-goog-api-key", api_key)
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
