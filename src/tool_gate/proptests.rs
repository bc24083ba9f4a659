//! Property-based tests for the tool call gate
//!
//! - No action ever leads back to `Proposed`
//! - At most one call is executing or unresolved at any time
//! - Resolved calls are terminal and never reopened

use super::*;
use crate::testing::MockToolExecutor;
use proptest::prelude::*;
use std::collections::HashSet;

fn arb_state() -> impl Strategy<Value = ToolCallState> {
    prop_oneof![
        Just(ToolCallState::Proposed),
        Just(ToolCallState::Confirmed),
        Just(ToolCallState::Denied),
        Just(ToolCallState::Executing),
        Just(ToolCallState::Completed),
        Just(ToolCallState::Failed),
    ]
}

fn arb_action() -> impl Strategy<Value = GateAction> {
    prop_oneof![
        Just(GateAction::Confirm),
        Just(GateAction::Deny),
        Just(GateAction::Start),
        Just(GateAction::Succeed),
        Just(GateAction::Fail),
    ]
}

#[derive(Debug, Clone)]
enum Op {
    Propose,
    Confirm,
    Deny,
    Execute { succeed: bool },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Propose),
        Just(Op::Confirm),
        Just(Op::Deny),
        any::<bool>().prop_map(|succeed| Op::Execute { succeed }),
    ]
}

proptest! {
    #[test]
    fn nothing_reenters_proposed(state in arb_state(), action in arb_action()) {
        if let Ok(next) = transition(state, action) {
            prop_assert_ne!(next, ToolCallState::Proposed);
        }
    }

    #[test]
    fn terminal_states_only_accept_idempotent_deny(state in arb_state(), action in arb_action()) {
        if state.is_terminal() {
            match transition(state, action) {
                Ok(next) => {
                    prop_assert_eq!(state, ToolCallState::Denied);
                    prop_assert_eq!(next, ToolCallState::Denied);
                }
                Err(e) => {
                    prop_assert!(matches!(e, GateError::InvalidTransition { .. }), "unexpected error: {:?}", e);
                }
            }
        }
    }

    #[test]
    fn gate_serializes_calls(ops in prop::collection::vec(arb_op(), 1..30)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let gate = ToolCallGate::new();
        let executor = Arc::new(MockToolExecutor::new());

        for (i, op) in ops.iter().enumerate() {
            let busy_before = gate.is_busy();
            match op {
                Op::Propose => {
                    let result = gate.propose(ToolCallRequest {
                        tool_name: format!("tool_{i}"),
                        args: Value::Null,
                    });
                    prop_assert_eq!(result.is_err(), busy_before);
                }
                Op::Confirm => {
                    let _ = gate.confirm();
                }
                Op::Deny => {
                    let history_before = gate.history();
                    let denied = gate.deny();
                    if let Ok(None) = denied {
                        prop_assert_eq!(gate.history(), history_before);
                    }
                }
                Op::Execute { succeed } => {
                    let outcome = if *succeed {
                        Ok(Value::Bool(true))
                    } else {
                        Err(DeliveryError::tool_execution("failed"))
                    };
                    executor.queue_result(outcome);
                    if let Ok(call) = runtime.block_on(gate.execute(executor.clone())) {
                        let expected = if *succeed { ToolCallState::Completed } else { ToolCallState::Failed };
                        prop_assert_eq!(call.state, expected);
                    } else {
                        // Unused scripted result
                        executor.clear_results();
                    }
                }
            }

            let current = gate.current();
            let unresolved = current.as_ref().map_or(true, |c| {
                matches!(c.state, ToolCallState::Proposed | ToolCallState::Confirmed)
            });
            prop_assert!(unresolved, "current call must be unresolved: {:?}", current);

            let history = gate.history();
            prop_assert!(history.iter().all(|c| c.state.is_terminal()));
            let ids: HashSet<_> = history.iter().map(|c| c.id.as_str()).collect();
            prop_assert_eq!(ids.len(), history.len());
            if let Some(current) = &current {
                prop_assert!(!ids.contains(current.id.as_str()));
            }
        }
    }
}
