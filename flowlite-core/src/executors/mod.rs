//! Element executor registry.
//!
//! One executor per element type, dispatched by a map lookup on
//! `element.type`. Executors are pure decision functions: they read the
//! token, the element map, and the variable scope, and return a
//! `StepResult`; the scheduler owns every store write and collaborator
//! registration so that suspension is always durable before control
//! returns.

use crate::error::EngineError;
use crate::expression::ExpressionEvaluator;
use crate::process::{element_type, CompiledDefinition, ElementRef};
use crate::timer::TimerSchedule;
use crate::types::{Token, Variables};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

mod call_activity;
mod events;
mod gateways;
mod tasks;

pub use call_activity::{CallActivityExecutor, SubProcessExecutor};
pub use events::{
    BoundaryEventExecutor, EndEventExecutor, IntermediateCatchEventExecutor,
    IntermediateThrowEventExecutor, StartEventExecutor,
};
pub use gateways::{
    EventBasedGatewayExecutor, ExclusiveGatewayExecutor, InclusiveGatewayExecutor,
    ParallelGatewayExecutor,
};
pub use tasks::{ScriptTaskExecutor, ServiceTaskExecutor, UserTaskExecutor};

// ─── Step results ─────────────────────────────────────────────

/// One armed wait of an event-based gateway.
#[derive(Clone, Debug)]
pub struct EventArm {
    pub catch_element_id: String,
    pub kind: EventArmKind,
}

#[derive(Clone, Debug)]
pub enum EventArmKind {
    Timer {
        schedule: TimerSchedule,
        expression: String,
    },
    Message {
        name: String,
        correlation_key: String,
    },
}

/// Verdict of a single executor step. The scheduler materializes these into
/// token movement, durable suspensions, and collaborator commands.
#[derive(Clone, Debug)]
pub enum StepResult {
    /// Follow these sequence flows, optionally updating the token overlay
    /// first. More than one flow means a parallel split.
    Advance {
        flows: Vec<String>,
        variables: Option<Variables>,
    },
    /// Hand the work to an external worker and suspend on `job:<key>`.
    CreateJob {
        job_type: String,
        variables: Variables,
    },
    /// Schedule a timer catch and suspend on `timer:<id>`.
    ScheduleTimer {
        schedule: TimerSchedule,
        expression: String,
    },
    /// Subscribe for a message and suspend on `message:<name>:<key>`.
    Subscribe {
        message_name: String,
        correlation_key: String,
    },
    /// Start a child instance and suspend on `call_activity:<childId>`.
    SpawnChild {
        process_key: String,
        variables: Variables,
        /// Execution-context flag marking the element as already executed,
        /// so the resumed step advances instead of spawning again.
        context_flag: String,
    },
    /// Publish a message, then follow `flows`.
    ThrowMessage {
        name: String,
        correlation_key: String,
        variables: Variables,
        flows: Vec<String>,
    },
    /// Arm every outgoing catch event of an event-based gateway; the first
    /// to fire wins.
    ArmEvents { arms: Vec<EventArm> },
    /// Park at a joining gateway; the scheduler owns the barrier.
    Park,
    /// The token reached an end event.
    Complete,
    /// Step-level failure; becomes an incident unless a boundary error
    /// event catches it.
    Fail { error: EngineError },
}

// ─── Execution context ────────────────────────────────────────

/// Everything an executor may read during one step.
pub struct ExecutionContext<'a> {
    pub token: &'a Token,
    pub element: ElementRef<'a>,
    pub definition: &'a CompiledDefinition,
    /// Merged view: instance variables overlaid with the token's.
    pub scope: &'a Variables,
    pub evaluator: &'a dyn ExpressionEvaluator,
    pub connectors: &'a ConnectorRegistry,
}

pub trait ElementExecutor: Send + Sync {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StepResult, EngineError>;
}

// ─── Connectors ───────────────────────────────────────────────

/// An in-process service-task implementation (e.g. an email sender) that
/// runs synchronously inside the step instead of going through a job.
pub trait Connector: Send + Sync {
    fn invoke(&self, variables: &Variables) -> Result<Variables, EngineError>;
}

impl<F> Connector for F
where
    F: Fn(&Variables) -> Result<Variables, EngineError> + Send + Sync,
{
    fn invoke(&self, variables: &Variables) -> Result<Variables, EngineError> {
        self(variables)
    }
}

#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: RwLock<HashMap<String, Arc<dyn Connector>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, connector: Arc<dyn Connector>) {
        if let Ok(mut map) = self.connectors.write() {
            map.insert(name.to_string(), connector);
        }
    }

    pub fn invoke(&self, name: &str, variables: &Variables) -> Result<Variables, EngineError> {
        let connector = self
            .connectors
            .read()
            .ok()
            .and_then(|map| map.get(name).cloned())
            .ok_or_else(|| EngineError::ConnectorError {
                connector: name.to_string(),
                reason: "no such connector registered".into(),
            })?;
        connector.invoke(variables)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connectors
            .read()
            .map(|map| map.contains_key(name))
            .unwrap_or(false)
    }
}

// ─── Registry ─────────────────────────────────────────────────

/// element type → executor. Dispatch is a plain dictionary lookup; adding a
/// type is registering an implementation.
pub struct ExecutorRegistry {
    executors: HashMap<&'static str, Arc<dyn ElementExecutor>>,
}

impl ExecutorRegistry {
    /// The standard executor set covering every element type the engine
    /// understands.
    pub fn standard() -> Self {
        let mut executors: HashMap<&'static str, Arc<dyn ElementExecutor>> = HashMap::new();
        executors.insert(
            element_type::START_EVENT,
            Arc::new(StartEventExecutor) as Arc<dyn ElementExecutor>,
        );
        executors.insert(element_type::END_EVENT, Arc::new(EndEventExecutor));
        executors.insert(element_type::SERVICE_TASK, Arc::new(ServiceTaskExecutor));
        executors.insert(element_type::USER_TASK, Arc::new(UserTaskExecutor));
        executors.insert(element_type::SCRIPT_TASK, Arc::new(ScriptTaskExecutor));
        executors.insert(element_type::CALL_ACTIVITY, Arc::new(CallActivityExecutor));
        executors.insert(element_type::SUB_PROCESS, Arc::new(SubProcessExecutor));
        executors.insert(
            element_type::EXCLUSIVE_GATEWAY,
            Arc::new(ExclusiveGatewayExecutor),
        );
        executors.insert(
            element_type::PARALLEL_GATEWAY,
            Arc::new(ParallelGatewayExecutor),
        );
        executors.insert(
            element_type::INCLUSIVE_GATEWAY,
            Arc::new(InclusiveGatewayExecutor),
        );
        executors.insert(
            element_type::EVENT_BASED_GATEWAY,
            Arc::new(EventBasedGatewayExecutor),
        );
        executors.insert(
            element_type::INTERMEDIATE_CATCH_EVENT,
            Arc::new(IntermediateCatchEventExecutor),
        );
        executors.insert(
            element_type::INTERMEDIATE_THROW_EVENT,
            Arc::new(IntermediateThrowEventExecutor),
        );
        executors.insert(element_type::BOUNDARY_EVENT, Arc::new(BoundaryEventExecutor));
        Self { executors }
    }

    pub fn get(&self, el_type: &str) -> Option<Arc<dyn ElementExecutor>> {
        self.executors.get(el_type).cloned()
    }
}

// ─── Shared extraction helpers ────────────────────────────────

/// Resolve the element's input mappings against the scope. Without
/// mappings the whole scope flows through.
pub(crate) fn resolve_inputs(
    element: &ElementRef<'_>,
    scope: &Variables,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<Variables, EngineError> {
    apply_mappings(element, "inputs", scope, evaluator)
}

/// Resolve the element's output mappings against a callback/connector
/// result. Without mappings the result flows through untouched.
pub(crate) fn resolve_outputs(
    element: &ElementRef<'_>,
    result: &Variables,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<Variables, EngineError> {
    apply_mappings(element, "outputs", result, evaluator)
}

fn apply_mappings(
    element: &ElementRef<'_>,
    direction: &str,
    scope: &Variables,
    evaluator: &dyn ExpressionEvaluator,
) -> Result<Variables, EngineError> {
    let Some(mappings) = element
        .ext_value("io_mappings")
        .and_then(|v| v.as_object())
        .and_then(|m| m.get(direction))
        .and_then(|v| v.as_array())
    else {
        return Ok(scope.clone());
    };

    let mut out = Variables::new();
    for (idx, mapping) in mappings.iter().enumerate() {
        let path = format!(
            "{}/extension_elements/io_mappings/{direction}/{idx}",
            element.id
        );
        let mapping = mapping
            .as_object()
            .ok_or_else(|| EngineError::validation(&path, "mapping is not a map"))?;
        let source = mapping
            .get("source")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::validation(format!("{path}/source"), "missing"))?;
        let target = mapping
            .get("target")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::validation(format!("{path}/target"), "missing"))?;
        let value = crate::expression::resolve_source(evaluator, source, scope)?;
        out.insert(target.to_string(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::SimpleEvaluator;
    use crate::process::ProcessDefinition;
    use serde_json::json;

    #[test]
    fn registry_covers_all_element_types() {
        let registry = ExecutorRegistry::standard();
        for el_type in [
            element_type::START_EVENT,
            element_type::END_EVENT,
            element_type::SERVICE_TASK,
            element_type::USER_TASK,
            element_type::SCRIPT_TASK,
            element_type::CALL_ACTIVITY,
            element_type::SUB_PROCESS,
            element_type::EXCLUSIVE_GATEWAY,
            element_type::PARALLEL_GATEWAY,
            element_type::INCLUSIVE_GATEWAY,
            element_type::EVENT_BASED_GATEWAY,
            element_type::INTERMEDIATE_CATCH_EVENT,
            element_type::INTERMEDIATE_THROW_EVENT,
            element_type::BOUNDARY_EVENT,
        ] {
            assert!(registry.get(el_type).is_some(), "missing executor: {el_type}");
        }
        assert!(registry.get(element_type::SEQUENCE_FLOW).is_none());
    }

    #[test]
    fn connector_registry_round_trip() {
        let registry = ConnectorRegistry::new();
        registry.register(
            "noop",
            Arc::new(|_: &Variables| -> Result<Variables, EngineError> {
                let mut out = Variables::new();
                out.insert("x".into(), json!(1));
                Ok(out)
            }),
        );
        assert!(registry.contains("noop"));
        let out = registry.invoke("noop", &Variables::new()).unwrap();
        assert_eq!(out["x"], json!(1));

        let err = registry.invoke("ghost", &Variables::new()).unwrap_err();
        assert_eq!(err.code(), "CONNECTOR_ERROR");
    }

    #[test]
    fn io_mappings_resolve_sources_against_scope() {
        let elements = json!({
            "start": {"type": "startEvent", "outgoing": ["f1"]},
            "task": {"type": "serviceTask", "incoming": ["f1"], "outgoing": ["f2"],
                     "extension_elements": {"io_mappings": {
                        "inputs": [
                            {"source": "=orderId", "target": "id"},
                            {"source": "ref-${orderId}", "target": "reference"}
                        ]}}},
            "end": {"type": "endEvent", "incoming": ["f2"]},
            "f1": {"type": "sequenceFlow", "source": "start", "target": "task"},
            "f2": {"type": "sequenceFlow", "source": "task", "target": "end"}
        })
        .as_object()
        .cloned()
        .unwrap();
        let compiled =
            CompiledDefinition::compile(ProcessDefinition::new("p", elements)).unwrap();
        let element = compiled.element("task").unwrap();

        let scope = json!({"orderId": "o-1", "noise": true})
            .as_object()
            .cloned()
            .unwrap();
        let inputs = resolve_inputs(&element, &scope, &SimpleEvaluator).unwrap();
        assert_eq!(inputs["id"], json!("o-1"));
        assert_eq!(inputs["reference"], json!("ref-o-1"));
        assert!(!inputs.contains_key("noise"));

        // No mappings → scope flows through.
        let start = compiled.element("start").unwrap();
        let inputs = resolve_inputs(&start, &scope, &SimpleEvaluator).unwrap();
        assert_eq!(inputs, scope);
    }
}
