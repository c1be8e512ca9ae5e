use thiserror::Error;

/// Errors produced while talking to a vendor endpoint
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Key rejected by the vendor (HTTP 401/403)
    #[error("Invalid API key (401): {0}")]
    Unauthorized(String),

    /// Any other non-2xx response
    #[error("{message}")]
    Api { status: u16, message: String },

    /// Transport failure
    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed stream or an error event inside the stream
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Invalid JSON from provider: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tool loop exceeded maximum of {0} rounds")]
    ToolLoopExceeded(usize),

    /// The caller's cancellation token fired
    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Build an error from a failed HTTP response body
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = vendor_error_message(body);
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Self::Unauthorized(
                message.unwrap_or_else(|| format!("API error: {}", status.as_u16())),
            );
        }
        Self::Api {
            status: status.as_u16(),
            message: message.unwrap_or_else(|| format!("API error: {}", status.as_u16())),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Extract `error.message` from a vendor error payload.
///
/// All three vendors wrap errors as `{"error": {"message": "..."}}`; Gemini
/// sometimes returns a top-level array of such objects.
pub fn vendor_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let value = match value {
        serde_json::Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

/// Whether an error message reported through `on_error` means the key
/// must be re-entered
pub fn is_auth_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("401")
        || lower.contains("invalid api key")
        || lower.contains("invalid x-api-key")
        || lower.contains("api key not valid")
        || lower.contains("incorrect api key")
}
