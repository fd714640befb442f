//! Task executors: service, user, and script tasks.

use super::{resolve_inputs, resolve_outputs, ExecutionContext, ElementExecutor, StepResult};
use crate::error::EngineError;

/// Service task: an in-process connector runs synchronously inside the
/// step; anything else becomes a job for an external worker.
pub struct ServiceTaskExecutor;

impl ElementExecutor for ServiceTaskExecutor {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StepResult, EngineError> {
        let inputs = resolve_inputs(&ctx.element, ctx.scope, ctx.evaluator)?;

        if let Some(connector) = ctx.element.ext_string("connector") {
            let result = ctx.connectors.invoke(connector, &inputs)?;
            let outputs = resolve_outputs(&ctx.element, &result, ctx.evaluator)?;
            return Ok(StepResult::Advance {
                flows: ctx.element.outgoing(),
                variables: Some(outputs),
            });
        }

        Ok(StepResult::CreateJob {
            job_type: job_type(ctx, "service_task"),
            variables: inputs,
        })
    }
}

/// User tasks are jobs for a human-facing worker.
pub struct UserTaskExecutor;

impl ElementExecutor for UserTaskExecutor {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StepResult, EngineError> {
        let inputs = resolve_inputs(&ctx.element, ctx.scope, ctx.evaluator)?;
        Ok(StepResult::CreateJob {
            job_type: job_type(ctx, "user_task"),
            variables: inputs,
        })
    }
}

/// Script tasks run on script workers; the engine never evaluates scripts
/// in-process.
pub struct ScriptTaskExecutor;

impl ElementExecutor for ScriptTaskExecutor {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StepResult, EngineError> {
        let inputs = resolve_inputs(&ctx.element, ctx.scope, ctx.evaluator)?;
        Ok(StepResult::CreateJob {
            job_type: job_type(ctx, "script_task"),
            variables: inputs,
        })
    }
}

fn job_type(ctx: &ExecutionContext<'_>, fallback: &str) -> String {
    ctx.element
        .ext_string("task_type")
        .or_else(|| ctx.element.name())
        .unwrap_or(fallback)
        .to_string()
}
