use crate::types::Variables;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime events — the durable audit trail for every process instance.
///
/// Appended by the scheduler on each state transition; the per-instance
/// sequence of events is the replay log: re-applying it reproduces the
/// instance's final state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    InstanceStarted {
        instance_id: Uuid,
        process_key: String,
        parent_instance_id: Option<Uuid>,
    },
    TokenSpawned {
        token_id: Uuid,
        element_id: String,
        parent_token_id: Option<Uuid>,
    },
    TokenMoved {
        token_id: Uuid,
        from_element_id: String,
        to_element_id: String,
        flow_id: String,
    },
    TokenSuspended {
        token_id: Uuid,
        element_id: String,
        waiting_for: String,
    },
    TokenResumed {
        token_id: Uuid,
        waiting_for: String,
    },
    TokenCompleted {
        token_id: Uuid,
        element_id: String,
    },
    GatewayTaken {
        gateway_id: String,
        token_id: Uuid,
        flows_taken: Vec<String>,
    },
    JoinArrived {
        join_id: String,
        token_id: Uuid,
        arrived: usize,
        expected: usize,
    },
    JoinReleased {
        join_id: String,
        surviving_token_id: Uuid,
        merged_token_ids: Vec<Uuid>,
    },
    TimerScheduled {
        timer_id: Uuid,
        element_id: String,
        token_id: Option<Uuid>,
        due_at: DateTime<Utc>,
    },
    TimerFired {
        timer_id: Uuid,
        element_id: String,
    },
    TimerCancelled {
        timer_id: Uuid,
    },
    /// Non-interrupting boundary timer fired — spawned a parallel token.
    BoundaryFired {
        timer_id: Uuid,
        boundary_element_id: String,
        token_id: Uuid,
        interrupting: bool,
    },
    MessageSubscribed {
        subscription_id: Uuid,
        token_id: Uuid,
        message_name: String,
        correlation_key: String,
    },
    MessageBuffered {
        message_id: Uuid,
        name: String,
        correlation_key: String,
    },
    MessageCorrelated {
        message_id: Uuid,
        subscription_id: Uuid,
        token_id: Uuid,
    },
    JobCreated {
        job_key: Uuid,
        job_type: String,
        token_id: Uuid,
        element_id: String,
    },
    JobCompleted {
        job_key: Uuid,
        variables: Variables,
    },
    JobFailed {
        job_key: Uuid,
        retries_left: u32,
        error: String,
    },
    ChildInstanceSpawned {
        child_instance_id: Uuid,
        child_process_key: String,
        parent_token_id: Uuid,
    },
    ChildInstanceCompleted {
        child_instance_id: Uuid,
        parent_token_id: Uuid,
    },
    IncidentCreated {
        incident_id: Uuid,
        token_id: Uuid,
        element_id: String,
        kind: String,
    },
    IncidentResolved {
        incident_id: Uuid,
        resolution: String,
    },
    /// A callback arrived for a token no longer waiting on that key.
    StaleCallbackDropped {
        token_id: Uuid,
        expected: Option<String>,
        got: String,
    },
    InstanceCompleted {
        instance_id: Uuid,
    },
    InstanceCancelled {
        instance_id: Uuid,
        reason: String,
    },
    InstanceFailed {
        instance_id: Uuid,
        incident_id: Uuid,
    },
}

impl RuntimeEvent {
    /// Short tag for log lines and event-tail consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeEvent::InstanceStarted { .. } => "InstanceStarted",
            RuntimeEvent::TokenSpawned { .. } => "TokenSpawned",
            RuntimeEvent::TokenMoved { .. } => "TokenMoved",
            RuntimeEvent::TokenSuspended { .. } => "TokenSuspended",
            RuntimeEvent::TokenResumed { .. } => "TokenResumed",
            RuntimeEvent::TokenCompleted { .. } => "TokenCompleted",
            RuntimeEvent::GatewayTaken { .. } => "GatewayTaken",
            RuntimeEvent::JoinArrived { .. } => "JoinArrived",
            RuntimeEvent::JoinReleased { .. } => "JoinReleased",
            RuntimeEvent::TimerScheduled { .. } => "TimerScheduled",
            RuntimeEvent::TimerFired { .. } => "TimerFired",
            RuntimeEvent::TimerCancelled { .. } => "TimerCancelled",
            RuntimeEvent::BoundaryFired { .. } => "BoundaryFired",
            RuntimeEvent::MessageSubscribed { .. } => "MessageSubscribed",
            RuntimeEvent::MessageBuffered { .. } => "MessageBuffered",
            RuntimeEvent::MessageCorrelated { .. } => "MessageCorrelated",
            RuntimeEvent::JobCreated { .. } => "JobCreated",
            RuntimeEvent::JobCompleted { .. } => "JobCompleted",
            RuntimeEvent::JobFailed { .. } => "JobFailed",
            RuntimeEvent::ChildInstanceSpawned { .. } => "ChildInstanceSpawned",
            RuntimeEvent::ChildInstanceCompleted { .. } => "ChildInstanceCompleted",
            RuntimeEvent::IncidentCreated { .. } => "IncidentCreated",
            RuntimeEvent::IncidentResolved { .. } => "IncidentResolved",
            RuntimeEvent::StaleCallbackDropped { .. } => "StaleCallbackDropped",
            RuntimeEvent::InstanceCompleted { .. } => "InstanceCompleted",
            RuntimeEvent::InstanceCancelled { .. } => "InstanceCancelled",
            RuntimeEvent::InstanceFailed { .. } => "InstanceFailed",
        }
    }
}
