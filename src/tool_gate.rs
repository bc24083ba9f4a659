//! Confirmation gate for side-effecting tool calls
//!
//! ```text
//! proposed -> confirmed -> executing -> completed
//!                                   \-> failed
//! proposed -> denied
//! ```
//!
//! One gate per conversation. Only one call may be unresolved at a time, so
//! two tool actions never run concurrently. Once executing, a call runs to
//! completion even if the caller stops waiting.

#[cfg(test)]
mod proptests;

use crate::error::DeliveryError;
use crate::transport::{ToolCallRequest, ToolExecutor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    Proposed,
    Confirmed,
    Denied,
    Executing,
    Completed,
    Failed,
}

impl ToolCallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ToolCallState::Denied | ToolCallState::Completed | ToolCallState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    Confirm,
    Deny,
    Start,
    Succeed,
    Fail,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GateError {
    #[error("Tool call {0} is still awaiting resolution")]
    Busy(String),
    #[error("No tool call is pending")]
    NoPendingCall,
    #[error("Invalid transition: {action:?} from {from:?}")]
    InvalidTransition {
        from: ToolCallState,
        action: GateAction,
    },
}

/// Pure transition function. Nothing transitions into `Proposed`; a
/// repeated deny on a denied call is accepted and changes nothing.
pub fn transition(state: ToolCallState, action: GateAction) -> Result<ToolCallState, GateError> {
    use GateAction as A;
    use ToolCallState as S;

    match (state, action) {
        (S::Proposed, A::Confirm) => Ok(S::Confirmed),
        (S::Proposed | S::Denied, A::Deny) => Ok(S::Denied),
        (S::Confirmed, A::Start) => Ok(S::Executing),
        (S::Executing, A::Succeed) => Ok(S::Completed),
        (S::Executing, A::Fail) => Ok(S::Failed),
        (from, action) => Err(GateError::InvalidTransition { from, action }),
    }
}

/// An action requested by the model
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub args: Value,
    pub state: ToolCallState,
    pub result: Option<Value>,
    /// Execution failure, scoped to this call
    pub error: Option<String>,
}

impl ToolCall {
    fn proposed(request: ToolCallRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: request.tool_name,
            args: request.args,
            state: ToolCallState::Proposed,
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Default)]
struct GateState {
    current: Option<ToolCall>,
    /// Resolved calls, oldest first
    history: Vec<ToolCall>,
}

impl GateState {
    fn resolve(&mut self) -> Option<ToolCall> {
        let call = self.current.take()?;
        self.history.push(call.clone());
        Some(call)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolCallGate {
    state: Arc<Mutex<GateState>>,
}

impl ToolCallGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        lock_state(&self.state)
    }

    /// The unresolved call, if any
    pub fn current(&self) -> Option<ToolCall> {
        self.lock().current.clone()
    }

    pub fn history(&self) -> Vec<ToolCall> {
        self.lock().history.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.lock().current.is_some()
    }

    /// Accept a proposal. Rejected while another call is unresolved.
    pub fn propose(&self, request: ToolCallRequest) -> Result<ToolCall, GateError> {
        let mut state = self.lock();
        if let Some(current) = &state.current {
            tracing::warn!(
                pending = %current.tool_name,
                proposed = %request.tool_name,
                "Rejecting tool proposal while another is unresolved"
            );
            return Err(GateError::Busy(current.tool_name.clone()));
        }

        let call = ToolCall::proposed(request);
        tracing::info!(call_id = %call.id, tool = %call.tool_name, "Tool call proposed");
        state.current = Some(call.clone());
        Ok(call)
    }

    pub fn confirm(&self) -> Result<ToolCall, GateError> {
        let mut state = self.lock();
        let call = state.current.as_mut().ok_or(GateError::NoPendingCall)?;
        call.state = transition(call.state, GateAction::Confirm)?;
        tracing::info!(call_id = %call.id, tool = %call.tool_name, "Tool call confirmed");
        Ok(call.clone())
    }

    /// Deny the proposal. Returns `None` when the last call was already
    /// denied, in which case nothing changes.
    pub fn deny(&self) -> Result<Option<ToolCall>, GateError> {
        let mut state = self.lock();
        let Some(call) = state.current.as_mut() else {
            return match state.history.last() {
                Some(last) if last.state == ToolCallState::Denied => Ok(None),
                _ => Err(GateError::NoPendingCall),
            };
        };

        call.state = transition(call.state, GateAction::Deny)?;
        tracing::info!(call_id = %call.id, tool = %call.tool_name, "Tool call denied");
        Ok(state.resolve())
    }

    /// Run the confirmed call through `executor`.
    ///
    /// Executor failures are recorded on the returned call (`Failed`), not
    /// returned as errors. The execution is detached from the caller: if
    /// this future is dropped the action still finishes and is recorded.
    pub async fn execute(&self, executor: Arc<dyn ToolExecutor>) -> Result<ToolCall, GateError> {
        let (call_id, tool_name, args) = {
            let mut state = self.lock();
            let call = state.current.as_mut().ok_or(GateError::NoPendingCall)?;
            call.state = transition(call.state, GateAction::Start)?;
            (call.id.clone(), call.tool_name.clone(), call.args.clone())
        };
        tracing::info!(call_id = %call_id, tool = %tool_name, "Executing tool call");

        let shared = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            let outcome = executor.execute(&tool_name, &args).await;
            finish(&shared, outcome)
        });

        match task.await {
            Ok(result) => result,
            Err(e) => finish(
                &self.state,
                Err(DeliveryError::tool_execution(format!("Tool task aborted: {e}"))),
            ),
        }
    }
}

fn lock_state(state: &Mutex<GateState>) -> MutexGuard<'_, GateState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn finish(
    state: &Mutex<GateState>,
    outcome: Result<Value, DeliveryError>,
) -> Result<ToolCall, GateError> {
    let mut state = lock_state(state);
    let call = state.current.as_mut().ok_or(GateError::NoPendingCall)?;

    match outcome {
        Ok(value) => {
            call.state = transition(call.state, GateAction::Succeed)?;
            call.result = Some(value);
            tracing::info!(call_id = %call.id, tool = %call.tool_name, "Tool call completed");
        }
        Err(e) => {
            call.state = transition(call.state, GateAction::Fail)?;
            tracing::warn!(call_id = %call.id, tool = %call.tool_name, error = %e, "Tool call failed");
            call.error = Some(e.message);
        }
    }

    state.resolve().ok_or(GateError::NoPendingCall)
}
