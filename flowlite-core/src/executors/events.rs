//! Event executors: start, end, intermediate catch/throw, boundary.

use super::{ExecutionContext, ElementExecutor, StepResult};
use crate::error::EngineError;
use crate::expression::{resolve_source, value_to_key};
use crate::timer::parse_timer_expression;

pub struct StartEventExecutor;

impl ElementExecutor for StartEventExecutor {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StepResult, EngineError> {
        Ok(StepResult::Advance {
            flows: ctx.element.outgoing(),
            variables: None,
        })
    }
}

pub struct EndEventExecutor;

impl ElementExecutor for EndEventExecutor {
    fn execute(&self, _ctx: &ExecutionContext<'_>) -> Result<StepResult, EngineError> {
        Ok(StepResult::Complete)
    }
}

/// Timer or message catch. The element declares exactly one of
/// `timer_expression` / `message_name` in its extension elements.
pub struct IntermediateCatchEventExecutor;

impl ElementExecutor for IntermediateCatchEventExecutor {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StepResult, EngineError> {
        if let Some(expression) = ctx.element.ext_string("timer_expression") {
            let schedule = parse_timer_expression(expression)?;
            return Ok(StepResult::ScheduleTimer {
                schedule,
                expression: expression.to_string(),
            });
        }

        if let Some(name) = ctx.element.ext_string("message_name") {
            let correlation_key = correlation_key(ctx)?;
            return Ok(StepResult::Subscribe {
                message_name: name.to_string(),
                correlation_key,
            });
        }

        Err(EngineError::validation(
            format!("{}/extension_elements", ctx.element.id),
            "catch event needs timer_expression or message_name",
        ))
    }
}

/// Message throw publishes and moves on; a throw without a message is a
/// pass-through.
pub struct IntermediateThrowEventExecutor;

impl ElementExecutor for IntermediateThrowEventExecutor {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StepResult, EngineError> {
        let flows = ctx.element.outgoing();
        let Some(name) = ctx.element.ext_string("message_name") else {
            return Ok(StepResult::Advance {
                flows,
                variables: None,
            });
        };
        Ok(StepResult::ThrowMessage {
            name: name.to_string(),
            correlation_key: correlation_key(ctx)?,
            variables: ctx.scope.clone(),
            flows,
        })
    }
}

/// Tokens only land on a boundary event when the scheduler diverts them
/// there; the step itself just follows the outgoing flows.
pub struct BoundaryEventExecutor;

impl ElementExecutor for BoundaryEventExecutor {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StepResult, EngineError> {
        Ok(StepResult::Advance {
            flows: ctx.element.outgoing(),
            variables: None,
        })
    }
}

/// Evaluate the element's `correlation_key` extension (defaults to empty —
/// messages then correlate on name alone).
pub(super) fn correlation_key(ctx: &ExecutionContext<'_>) -> Result<String, EngineError> {
    match ctx.element.ext_string("correlation_key") {
        Some(raw) => {
            let value = resolve_source(ctx.evaluator, raw, ctx.scope)?;
            Ok(value_to_key(&value))
        }
        None => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::ConnectorRegistry;
    use crate::expression::SimpleEvaluator;
    use crate::process::{CompiledDefinition, ProcessDefinition};
    use crate::timer::TimerSchedule;
    use crate::types::{Token, Variables};
    use serde_json::json;
    use uuid::Uuid;

    fn compiled() -> CompiledDefinition {
        let elements = json!({
            "start": {"type": "startEvent", "outgoing": ["f1"]},
            "wait_timer": {"type": "intermediateCatchEvent", "incoming": ["f1"], "outgoing": ["f2"],
                           "extension_elements": {"timer_expression": "PT5S"}},
            "wait_msg": {"type": "intermediateCatchEvent", "incoming": ["f2"], "outgoing": ["f3"],
                         "extension_elements": {"message_name": "paid", "correlation_key": "=orderId"}},
            "end": {"type": "endEvent", "incoming": ["f3"]},
            "f1": {"type": "sequenceFlow", "source": "start", "target": "wait_timer"},
            "f2": {"type": "sequenceFlow", "source": "wait_timer", "target": "wait_msg"},
            "f3": {"type": "sequenceFlow", "source": "wait_msg", "target": "end"}
        })
        .as_object()
        .cloned()
        .unwrap();
        CompiledDefinition::compile(ProcessDefinition::new("p", elements)).unwrap()
    }

    fn ctx_for<'a>(
        def: &'a CompiledDefinition,
        element_id: &'a str,
        token: &'a Token,
        scope: &'a Variables,
        connectors: &'a ConnectorRegistry,
        evaluator: &'a SimpleEvaluator,
    ) -> ExecutionContext<'a> {
        ExecutionContext {
            token,
            element: def.element(element_id).unwrap(),
            definition: def,
            scope,
            evaluator,
            connectors,
        }
    }

    #[test]
    fn timer_catch_schedules() {
        let def = compiled();
        let token = Token::new(Uuid::now_v7(), "p", "wait_timer");
        let scope = Variables::new();
        let connectors = ConnectorRegistry::new();
        let evaluator = SimpleEvaluator;
        let ctx = ctx_for(&def, "wait_timer", &token, &scope, &connectors, &evaluator);

        match IntermediateCatchEventExecutor.execute(&ctx).unwrap() {
            StepResult::ScheduleTimer { schedule, .. } => {
                assert_eq!(
                    schedule,
                    TimerSchedule::Duration(chrono::Duration::seconds(5))
                );
            }
            other => panic!("expected ScheduleTimer, got {other:?}"),
        }
    }

    #[test]
    fn message_catch_evaluates_correlation_key_once() {
        let def = compiled();
        let token = Token::new(Uuid::now_v7(), "p", "wait_msg");
        let scope = json!({"orderId": "o-42"}).as_object().cloned().unwrap();
        let connectors = ConnectorRegistry::new();
        let evaluator = SimpleEvaluator;
        let ctx = ctx_for(&def, "wait_msg", &token, &scope, &connectors, &evaluator);

        match IntermediateCatchEventExecutor.execute(&ctx).unwrap() {
            StepResult::Subscribe {
                message_name,
                correlation_key,
            } => {
                assert_eq!(message_name, "paid");
                assert_eq!(correlation_key, "o-42");
            }
            other => panic!("expected Subscribe, got {other:?}"),
        }
    }

    #[test]
    fn catch_without_config_is_a_validation_error() {
        let elements = json!({
            "start": {"type": "startEvent", "outgoing": ["f1"]},
            "bare": {"type": "intermediateCatchEvent", "incoming": ["f1"]},
            "f1": {"type": "sequenceFlow", "source": "start", "target": "bare"}
        })
        .as_object()
        .cloned()
        .unwrap();
        let def = CompiledDefinition::compile(ProcessDefinition::new("p", elements)).unwrap();
        let token = Token::new(Uuid::now_v7(), "p", "bare");
        let scope = Variables::new();
        let connectors = ConnectorRegistry::new();
        let evaluator = SimpleEvaluator;
        let ctx = ctx_for(&def, "bare", &token, &scope, &connectors, &evaluator);

        let err = IntermediateCatchEventExecutor.execute(&ctx).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }
}
