//! Streaming chat adapters and the contract they share

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod sse;
pub mod tools;
pub mod turn;
pub mod types;

use std::sync::Arc;

use reqwest::StatusCode;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use types::{
    ChatCallbacks, ChatMessage, ChatProvider, CodeExecutionResult, DEFAULT_MAX_TOOL_ROUNDS,
    FileContent, FileLoader, KeyValidation, LOAD_ERROR_PREFIX, Role, SendOptions, ToolOptions,
    WebSearchResult,
};

use crate::catalog::Provider;
use crate::error::{is_auth_error, vendor_error_message};

/// Build the adapter for `provider`, optionally against a different endpoint
pub fn provider_for(provider: Provider, base_url: Option<&str>) -> Arc<dyn ChatProvider> {
    match (provider, base_url) {
        (Provider::Anthropic, Some(url)) => Arc::new(AnthropicProvider::new().with_base_url(url)),
        (Provider::Anthropic, None) => Arc::new(AnthropicProvider::new()),
        (Provider::OpenAi, Some(url)) => Arc::new(OpenAiProvider::new().with_base_url(url)),
        (Provider::OpenAi, None) => Arc::new(OpenAiProvider::new()),
        (Provider::Gemini, Some(url)) => Arc::new(GeminiProvider::new().with_base_url(url)),
        (Provider::Gemini, None) => Arc::new(GeminiProvider::new()),
    }
}

/// Interpret the response to a key validation request
pub(crate) fn validation_from_status(status: StatusCode, body: &str) -> KeyValidation {
    if status.is_success() {
        return KeyValidation::ok();
    }
    let message = vendor_error_message(body);
    let rejected = status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || message.as_deref().is_some_and(is_auth_error);
    if rejected {
        return KeyValidation::invalid("Invalid API key");
    }
    KeyValidation::invalid(message.unwrap_or_else(|| format!("API error: {}", status.as_u16())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_for_matches_identity() {
        for provider in Provider::ALL {
            assert_eq!(provider_for(provider, None).provider(), provider);
            assert_eq!(
                provider_for(provider, Some("http://localhost:9")).provider(),
                provider
            );
        }
    }

    #[test]
    fn test_adapter_models_come_from_catalog() {
        let adapter = provider_for(Provider::Gemini, None);
        let models = adapter.models();
        assert_eq!(models.len(), 2);
        assert!(models.iter().all(|m| m.provider == Provider::Gemini));
    }

    #[test]
    fn test_validation_from_status() {
        assert!(validation_from_status(StatusCode::OK, "").valid);
        assert_eq!(
            validation_from_status(StatusCode::UNAUTHORIZED, "").error.as_deref(),
            Some("Invalid API key")
        );
        assert_eq!(
            validation_from_status(
                StatusCode::BAD_REQUEST,
                r#"{"error":{"message":"API key not valid. Please pass a valid API key."}}"#
            )
            .error
            .as_deref(),
            Some("Invalid API key")
        );
        assert_eq!(
            validation_from_status(StatusCode::INTERNAL_SERVER_ERROR, "")
                .error
                .as_deref(),
            Some("API error: 500")
        );
    }
}
