//! Gateway executors: exclusive, parallel, inclusive, event-based.
//!
//! Split decisions are made here; join barriers (`Park`) and the token
//! mechanics of splitting are the scheduler's business.

use super::{
    events::correlation_key, ExecutionContext, ElementExecutor, EventArm, EventArmKind, StepResult,
};
use crate::error::EngineError;
use crate::expression::is_truthy;
use crate::process::element_type;
use crate::timer::parse_timer_expression;

/// XOR: first truthy condition in declared order wins; otherwise the
/// default flow; otherwise the step fails.
pub struct ExclusiveGatewayExecutor;

impl ElementExecutor for ExclusiveGatewayExecutor {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StepResult, EngineError> {
        let mut default_flow = None;
        for flow_id in ctx.element.outgoing() {
            let flow = ctx.definition.flow(&flow_id)?;
            if flow.is_default {
                default_flow = Some(flow_id);
                continue;
            }
            match &flow.condition {
                Some(condition) => {
                    let value = ctx.evaluator.evaluate(condition, ctx.scope)?;
                    if is_truthy(&value) {
                        return Ok(StepResult::Advance {
                            flows: vec![flow_id],
                            variables: None,
                        });
                    }
                }
                // An unconditional non-default flow is always truthy.
                None => {
                    return Ok(StepResult::Advance {
                        flows: vec![flow_id],
                        variables: None,
                    });
                }
            }
        }

        match default_flow {
            Some(flow_id) => Ok(StepResult::Advance {
                flows: vec![flow_id],
                variables: None,
            }),
            None => Ok(StepResult::Fail {
                error: EngineError::NoDefaultFlow(ctx.element.id.to_string()),
            }),
        }
    }
}

/// AND: joins park, splits emit every outgoing flow.
pub struct ParallelGatewayExecutor;

impl ElementExecutor for ParallelGatewayExecutor {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StepResult, EngineError> {
        if ctx.element.incoming().len() > 1 {
            return Ok(StepResult::Park);
        }
        Ok(StepResult::Advance {
            flows: ctx.element.outgoing(),
            variables: None,
        })
    }
}

/// OR: joins park (the scheduler decides when no more tokens can arrive);
/// splits take every truthy branch, falling back to the default flow.
pub struct InclusiveGatewayExecutor;

impl ElementExecutor for InclusiveGatewayExecutor {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StepResult, EngineError> {
        if ctx.element.incoming().len() > 1 {
            return Ok(StepResult::Park);
        }

        let mut taken = Vec::new();
        let mut default_flow = None;
        for flow_id in ctx.element.outgoing() {
            let flow = ctx.definition.flow(&flow_id)?;
            if flow.is_default {
                default_flow = Some(flow_id);
                continue;
            }
            let truthy = match &flow.condition {
                Some(condition) => is_truthy(&ctx.evaluator.evaluate(condition, ctx.scope)?),
                None => true,
            };
            if truthy {
                taken.push(flow_id);
            }
        }

        if taken.is_empty() {
            match default_flow {
                Some(flow_id) => taken.push(flow_id),
                None => {
                    return Ok(StepResult::Fail {
                        error: EngineError::NoDefaultFlow(ctx.element.id.to_string()),
                    })
                }
            }
        }

        Ok(StepResult::Advance {
            flows: taken,
            variables: None,
        })
    }
}

/// Arm every outgoing catch event simultaneously; the first to fire cancels
/// the rest and advances along its flow.
pub struct EventBasedGatewayExecutor;

impl ElementExecutor for EventBasedGatewayExecutor {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StepResult, EngineError> {
        let mut arms = Vec::new();
        for flow_id in ctx.element.outgoing() {
            let flow = ctx.definition.flow(&flow_id)?;
            let target = ctx.definition.element(&flow.target)?;
            if target.element_type()? != element_type::INTERMEDIATE_CATCH_EVENT {
                return Err(EngineError::validation(
                    format!("{}/outgoing/{flow_id}", ctx.element.id),
                    "event-based gateway must target catch events",
                ));
            }

            let kind = if let Some(expression) = target.ext_string("timer_expression") {
                EventArmKind::Timer {
                    schedule: parse_timer_expression(expression)?,
                    expression: expression.to_string(),
                }
            } else if let Some(name) = target.ext_string("message_name") {
                let target_ctx = ExecutionContext {
                    token: ctx.token,
                    element: target,
                    definition: ctx.definition,
                    scope: ctx.scope,
                    evaluator: ctx.evaluator,
                    connectors: ctx.connectors,
                };
                EventArmKind::Message {
                    name: name.to_string(),
                    correlation_key: correlation_key(&target_ctx)?,
                }
            } else {
                return Err(EngineError::validation(
                    format!("{}/extension_elements", target.id),
                    "catch event needs timer_expression or message_name",
                ));
            };

            arms.push(EventArm {
                catch_element_id: flow.target.clone(),
                kind,
            });
        }

        if arms.is_empty() {
            return Err(EngineError::validation(
                format!("{}/outgoing", ctx.element.id),
                "event-based gateway has no outgoing catch events",
            ));
        }
        Ok(StepResult::ArmEvents { arms })
    }
}
