//! The `load_file` tool and the shared tool-call resolution step

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sse::cancellable;
use super::types::{ChatCallbacks, FileLoader, LOAD_ERROR_PREFIX};
use crate::error::ProviderError;

pub const LOAD_FILE_TOOL: &str = "load_file";

pub const LOAD_FILE_DESCRIPTION: &str = "Load the full contents of a file from the user's notes \
repository. Use this when the directory listing shows a file that is relevant to the question \
but its contents are not already in context. The path must be exactly as shown in the listing.";

/// JSON schema for the `load_file` input
pub fn load_file_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "path": {
                "type": "string",
                "description": "Repository-relative path of the file, e.g. research/notes/20250101-topic.md"
            }
        },
        "required": ["path"]
    })
}

/// A tool invocation accumulated from the stream, not yet executed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl PendingToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: String::new(),
        }
    }

    /// Parsed arguments; empty argument text means `{}`
    pub fn input(&self) -> Value {
        if self.arguments.trim().is_empty() {
            return Value::Object(serde_json::Map::new());
        }
        serde_json::from_str(&self.arguments).unwrap_or(Value::Object(serde_json::Map::new()))
    }
}

/// Result fed back to the model for one pending call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

/// Execute every pending call in order and build the matching results.
///
/// File failures become error strings the model can read; only
/// cancellation aborts the resolution.
pub async fn resolve_tool_calls(
    calls: &[PendingToolCall],
    loader: &dyn FileLoader,
    cancel: &CancellationToken,
    callbacks: &dyn ChatCallbacks,
) -> Result<Vec<ToolResult>, ProviderError> {
    let mut results = Vec::with_capacity(calls.len());

    for call in calls {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        if call.name != LOAD_FILE_TOOL {
            warn!("Model requested unknown tool: {}", call.name);
            let message = format!("Error: unknown tool '{}'", call.name);
            callbacks.on_tool_error(&call.name, &message);
            results.push(error_result(call, message));
            continue;
        }

        let path = match parse_path(&call.arguments) {
            Ok(path) => path,
            Err(message) => {
                warn!("Invalid load_file arguments: {}", message);
                callbacks.on_tool_error(LOAD_FILE_TOOL, &message);
                callbacks.on_file_loaded("", false);
                results.push(error_result(call, message));
                continue;
            }
        };

        callbacks.on_file_load(&path);
        info!("Loading file for model: {}", path);

        let loaded = cancellable(cancel, loader.load_files(std::slice::from_ref(&path))).await?;
        let outcome = match loaded {
            Ok(files) => match files.into_iter().find(|f| f.path == path) {
                Some(file) if !file.content.starts_with(LOAD_ERROR_PREFIX) => Ok(file.content),
                Some(file) => Err(file.content),
                None => Err(format!("Error: file not found: {}", path)),
            },
            Err(e) => Err(format!("Error loading {}: {}", path, e)),
        };

        match outcome {
            Ok(content) => {
                debug!("Loaded {} ({} chars)", path, content.len());
                callbacks.on_file_loaded(&path, true);
                results.push(ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    content: format!("File: {}\n\n{}", path, content),
                    is_error: false,
                });
            }
            Err(message) => {
                warn!("load_file failed for {}: {}", path, message);
                callbacks.on_file_loaded(&path, false);
                results.push(error_result(call, message));
            }
        }
    }

    Ok(results)
}

fn error_result(call: &PendingToolCall, content: String) -> ToolResult {
    ToolResult {
        call_id: call.id.clone(),
        name: call.name.clone(),
        content,
        is_error: true,
    }
}

fn parse_path(arguments: &str) -> Result<String, String> {
    let value: Value = serde_json::from_str(arguments)
        .map_err(|e| format!("Error: could not parse load_file arguments: {}", e))?;
    value
        .get("path")
        .and_then(|p| p.as_str())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .ok_or_else(|| "Error: load_file requires a 'path' string".to_string())
}


#[cfg(test)]
mod tests {
    use super::test_support::{FailingLoader, MapLoader, RecordingCallbacks};
    use super::*;

    fn call(id: &str, args: &str) -> PendingToolCall {
        PendingToolCall {
            id: id.to_string(),
            name: LOAD_FILE_TOOL.to_string(),
            arguments: args.to_string(),
        }
    }

    #[tokio::test]
    async fn test_resolve_existing_file() {
        let loader = MapLoader::with(&[("notes/a.md", "alpha")]);
        let callbacks = RecordingCallbacks::default();
        let results = resolve_tool_calls(
            &[call("t1", r#"{"path":"notes/a.md"}"#)],
            &loader,
            &CancellationToken::new(),
            &callbacks,
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].call_id, "t1");
        assert_eq!(results[0].content, "File: notes/a.md\n\nalpha");
        assert!(!results[0].is_error);
        assert_eq!(
            callbacks.events(),
            vec!["file_load:notes/a.md", "file_loaded:notes/a.md:true"]
        );
    }

    #[tokio::test]
    async fn test_resolve_missing_file_is_recovered() {
        let loader = MapLoader::with(&[]);
        let callbacks = RecordingCallbacks::default();
        let results = resolve_tool_calls(
            &[call("t1", r#"{"path":"nope.md"}"#)],
            &loader,
            &CancellationToken::new(),
            &callbacks,
        )
        .await
        .unwrap();

        assert!(results[0].is_error);
        assert!(results[0].content.contains("not found"));
        assert_eq!(callbacks.count("file_loaded:nope.md:false"), 1);
    }

    #[tokio::test]
    async fn test_resolve_bad_arguments_and_loader_failure() {
        let callbacks = RecordingCallbacks::default();
        let results = resolve_tool_calls(
            &[call("t1", "{not json"), call("t2", r#"{"path":"a.md"}"#)],
            &FailingLoader,
            &CancellationToken::new(),
            &callbacks,
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_error));
        assert!(results[1].content.contains("repository unavailable"));
        assert_eq!(callbacks.count("tool_error:load_file"), 1);
        assert_eq!(callbacks.count("file_loaded:a.md:false"), 1);
        // unparsable arguments never surface as a path
        assert_eq!(callbacks.count("file_loaded::false"), 1);
        assert!(!callbacks.events().iter().any(|e| e.contains("not json")));
    }

    #[tokio::test]
    async fn test_resolve_keeps_call_order() {
        let loader = MapLoader::with(&[("a.md", "A"), ("b.md", "B")]);
        let callbacks = RecordingCallbacks::default();
        let results = resolve_tool_calls(
            &[call("t2", r#"{"path":"b.md"}"#), call("t1", r#"{"path":"a.md"}"#)],
            &loader,
            &CancellationToken::new(),
            &callbacks,
        )
        .await
        .unwrap();

        let ids: Vec<&str> = results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t1"]);
        assert_eq!(*loader.requested.lock().unwrap(), vec!["b.md", "a.md"]);
    }

    #[tokio::test]
    async fn test_unknown_tool_gets_error_result() {
        let loader = MapLoader::with(&[]);
        let callbacks = RecordingCallbacks::default();
        let results = resolve_tool_calls(
            &[PendingToolCall {
                id: "x".to_string(),
                name: "delete_everything".to_string(),
                arguments: "{}".to_string(),
            }],
            &loader,
            &CancellationToken::new(),
            &callbacks,
        )
        .await
        .unwrap();
        assert!(results[0].is_error);
        assert!(loader.requested.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = resolve_tool_calls(
            &[call("t1", r#"{"path":"a.md"}"#)],
            &MapLoader::with(&[]),
            &cancel,
            &RecordingCallbacks::default(),
        )
        .await;
        assert!(matches!(result, Err(ProviderError::Cancelled)));
    }

    #[test]
    fn test_pending_call_input() {
        assert_eq!(call("t", "").input(), serde_json::json!({}));
        assert_eq!(
            call("t", r#"{"path":"x"}"#).input(),
            serde_json::json!({"path": "x"})
        );
    }
}
