//! Call activity and embedded sub-process executors.
//!
//! Both run a child instance and suspend the calling token on
//! `call_activity:<childId>`. Re-entry is flagged in the token's execution
//! context: the resumed step sees the flag and advances instead of
//! spawning a second child.

use super::{ExecutionContext, ElementExecutor, StepResult};
use crate::error::EngineError;

pub struct CallActivityExecutor;

impl ElementExecutor for CallActivityExecutor {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StepResult, EngineError> {
        let flag = executed_flag(ctx.element.id);
        if ctx.token.context_flag(&flag) {
            // Child completed; its variables were merged on resume.
            return Ok(StepResult::Advance {
                flows: ctx.element.outgoing(),
                variables: None,
            });
        }

        let called = ctx.element.require_ext_string("called_process_id")?;
        Ok(StepResult::SpawnChild {
            process_key: called.to_string(),
            variables: ctx.scope.clone(),
            context_flag: flag,
        })
    }
}

/// Embedded sub-processes were lifted into `<processKey>#<elementId>`
/// definitions at registration; execution reuses the call-activity path.
pub struct SubProcessExecutor;

impl ElementExecutor for SubProcessExecutor {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StepResult, EngineError> {
        let flag = executed_flag(ctx.element.id);
        if ctx.token.context_flag(&flag) {
            return Ok(StepResult::Advance {
                flows: ctx.element.outgoing(),
                variables: None,
            });
        }

        Ok(StepResult::SpawnChild {
            process_key: format!("{}#{}", ctx.definition.process_key(), ctx.element.id),
            variables: ctx.scope.clone(),
            context_flag: flag,
        })
    }
}

fn executed_flag(element_id: &str) -> String {
    format!("call_activity_executed:{element_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::ConnectorRegistry;
    use crate::expression::SimpleEvaluator;
    use crate::process::{CompiledDefinition, ProcessDefinition};
    use crate::types::{Token, Variables};
    use serde_json::json;
    use uuid::Uuid;

    fn compiled() -> CompiledDefinition {
        let elements = json!({
            "start": {"type": "startEvent", "outgoing": ["f1"]},
            "call": {"type": "callActivity", "incoming": ["f1"], "outgoing": ["f2"],
                     "extension_elements": {"called_process_id": "child_proc"}},
            "end": {"type": "endEvent", "incoming": ["f2"]},
            "f1": {"type": "sequenceFlow", "source": "start", "target": "call"},
            "f2": {"type": "sequenceFlow", "source": "call", "target": "end"}
        })
        .as_object()
        .cloned()
        .unwrap();
        CompiledDefinition::compile(ProcessDefinition::new("p", elements)).unwrap()
    }

    #[test]
    fn first_entry_spawns_child_with_current_scope() {
        let def = compiled();
        let token = Token::new(Uuid::now_v7(), "p", "call");
        let scope = json!({"a": 1}).as_object().cloned().unwrap();
        let connectors = ConnectorRegistry::new();
        let evaluator = SimpleEvaluator;
        let ctx = ExecutionContext {
            token: &token,
            element: def.element("call").unwrap(),
            definition: &def,
            scope: &scope,
            evaluator: &evaluator,
            connectors: &connectors,
        };

        match CallActivityExecutor.execute(&ctx).unwrap() {
            StepResult::SpawnChild {
                process_key,
                variables,
                context_flag,
            } => {
                assert_eq!(process_key, "child_proc");
                assert_eq!(variables["a"], json!(1));
                assert_eq!(context_flag, "call_activity_executed:call");
            }
            other => panic!("expected SpawnChild, got {other:?}"),
        }
    }

    #[test]
    fn re_entry_advances_instead_of_respawning() {
        let def = compiled();
        let mut token = Token::new(Uuid::now_v7(), "p", "call");
        token.set_context_flag("call_activity_executed:call");
        let scope = Variables::new();
        let connectors = ConnectorRegistry::new();
        let evaluator = SimpleEvaluator;
        let ctx = ExecutionContext {
            token: &token,
            element: def.element("call").unwrap(),
            definition: &def,
            scope: &scope,
            evaluator: &evaluator,
            connectors: &connectors,
        };

        match CallActivityExecutor.execute(&ctx).unwrap() {
            StepResult::Advance { flows, .. } => assert_eq!(flows, vec!["f2"]),
            other => panic!("expected Advance, got {other:?}"),
        }
    }

    #[test]
    fn missing_called_process_id_is_a_validation_error() {
        let elements = json!({
            "start": {"type": "startEvent", "outgoing": ["f1"]},
            "call": {"type": "callActivity", "incoming": ["f1"], "outgoing": ["f2"]},
            "end": {"type": "endEvent", "incoming": ["f2"]},
            "f1": {"type": "sequenceFlow", "source": "start", "target": "call"},
            "f2": {"type": "sequenceFlow", "source": "call", "target": "end"}
        })
        .as_object()
        .cloned()
        .unwrap();
        let def = CompiledDefinition::compile(ProcessDefinition::new("p", elements)).unwrap();
        let token = Token::new(Uuid::now_v7(), "p", "call");
        let scope = Variables::new();
        let connectors = ConnectorRegistry::new();
        let evaluator = SimpleEvaluator;
        let ctx = ExecutionContext {
            token: &token,
            element: def.element("call").unwrap(),
            definition: &def,
            scope: &scope,
            evaluator: &evaluator,
            connectors: &connectors,
        };

        let err = CallActivityExecutor.execute(&ctx).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }
}
