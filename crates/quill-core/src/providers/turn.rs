//! Per-turn accumulator shared by the adapters' tool loops

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::ChatCallbacks;
use crate::error::ProviderError;
use crate::usage::TurnUsage;

/// State carried across every round of one turn
#[derive(Debug, Default)]
pub struct TurnState {
    pub full_response: String,
    pub usage: TurnUsage,
    continuations: usize,
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward a text delta and append it to the running response
    pub fn push_text(&mut self, text: &str, callbacks: &dyn ChatCallbacks) {
        if text.is_empty() {
            return;
        }
        self.full_response.push_str(text);
        callbacks.on_token(text);
    }

    /// Account for one more continuation request, failing past the cap
    pub fn begin_continuation(&mut self, max_rounds: usize) -> Result<(), ProviderError> {
        self.continuations += 1;
        if self.continuations > max_rounds {
            warn!("Tool loop exceeded maximum rounds ({})", max_rounds);
            return Err(ProviderError::ToolLoopExceeded(max_rounds));
        }
        info!("Tool continuation round {}", self.continuations);
        Ok(())
    }

    pub fn continuations(&self) -> usize {
        self.continuations
    }
}

/// Emit the terminal callbacks for a finished turn.
///
/// Success reports usage (when any tokens were seen) then completion;
/// cancellation is silent; anything else becomes one `on_error`.
pub fn finish_turn(
    model: &str,
    outcome: Result<TurnState, ProviderError>,
    cancel: &CancellationToken,
    callbacks: &dyn ChatCallbacks,
) {
    match outcome {
        Ok(_) if cancel.is_cancelled() => {
            debug!("Turn finished after cancellation; suppressing completion");
        }
        Ok(state) => {
            debug!(
                "Turn complete (continuations: {}, tokens: in={} out={})",
                state.continuations, state.usage.input_tokens, state.usage.output_tokens
            );
            if state.usage.has_tokens() {
                callbacks.on_usage(&state.usage.finalize(model));
            }
            callbacks.on_complete(&state.full_response);
        }
        Err(ProviderError::Cancelled) => {
            debug!("Turn cancelled");
        }
        Err(e) => {
            warn!("Turn failed: {}", e);
            callbacks.on_error(&e.to_string());
        }
    }
}
