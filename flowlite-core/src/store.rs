use crate::events::RuntimeEvent;
use crate::process::ProcessDefinition;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Persistence seam for all engine state.
///
/// The scheduler and collaborators operate exclusively through this trait,
/// enabling pluggable backends (MemoryStore here, an embedded KV store in
/// production). Key layout per entity: `proc:<key>`, `inst:<id>`,
/// `tok:<id>` (+ `inst_toks:<id>:<tokenId>` secondary), `timer:<id>`,
/// `sub:<id>`, `msg:<id>`, `job:<key>`. Values are self-describing
/// structured blobs.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    // ── Definitions ──

    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<()>;
    async fn load_definition(&self, process_key: &str) -> Result<Option<ProcessDefinition>>;

    // ── Instances ──

    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()>;
    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>>;
    async fn list_instances(
        &self,
        state: Option<InstanceState>,
        process_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ProcessInstance>>;

    // ── Tokens ──

    async fn save_token(&self, token: &Token) -> Result<()>;
    async fn load_token(&self, id: Uuid) -> Result<Option<Token>>;
    async fn load_tokens_by_instance(&self, instance_id: Uuid) -> Result<Vec<Token>>;
    /// All tokens in the given state across instances — recovery scan.
    async fn load_tokens_by_state(&self, state: TokenState) -> Result<Vec<Token>>;

    // ── Timers ──

    async fn save_timer(&self, timer: &TimerRecord) -> Result<()>;
    async fn load_timer(&self, id: Uuid) -> Result<Option<TimerRecord>>;
    async fn load_timers_by_instance(&self, instance_id: Uuid) -> Result<Vec<TimerRecord>>;
    async fn load_pending_timers(&self) -> Result<Vec<TimerRecord>>;

    // ── Subscriptions ──

    async fn save_subscription(&self, subscription: &Subscription) -> Result<()>;
    async fn load_subscription(&self, id: Uuid) -> Result<Option<Subscription>>;
    async fn load_subscriptions_by_instance(&self, instance_id: Uuid) -> Result<Vec<Subscription>>;
    /// PENDING subscriptions matching `(name, correlation_key)`, oldest first.
    async fn find_pending_subscriptions(
        &self,
        name: &str,
        correlation_key: &str,
    ) -> Result<Vec<Subscription>>;

    // ── Buffered messages ──

    async fn save_message(&self, message: &BufferedMessage) -> Result<()>;
    /// Unconsumed messages matching `(name, correlation_key)`, oldest first.
    /// TTL filtering is the caller's concern (it knows "now").
    async fn find_buffered_messages(
        &self,
        name: &str,
        correlation_key: &str,
    ) -> Result<Vec<BufferedMessage>>;
    /// Drop expired unconsumed messages; returns how many were removed.
    async fn purge_expired_messages(&self, now: DateTime<Utc>) -> Result<usize>;

    // ── Jobs ──

    async fn save_job(&self, job: &Job) -> Result<()>;
    async fn load_job(&self, key: Uuid) -> Result<Option<Job>>;
    async fn load_jobs_by_instance(&self, instance_id: Uuid) -> Result<Vec<Job>>;
    /// Up to `max` ACTIVATABLE jobs of `job_type`, creation order.
    async fn load_activatable_jobs(&self, job_type: &str, max: usize) -> Result<Vec<Job>>;
    async fn load_activated_jobs(&self) -> Result<Vec<Job>>;

    // ── Incidents ──

    async fn save_incident(&self, incident: &Incident) -> Result<()>;
    async fn load_incident(&self, id: Uuid) -> Result<Option<Incident>>;
    async fn load_incidents_by_instance(&self, instance_id: Uuid) -> Result<Vec<Incident>>;

    // ── Event log (append-only) ──

    /// Append an event and return its per-instance sequence number.
    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<u64>;
    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>>;

    // ── Retention ──

    /// Delete every record owned by the instance, but only once the
    /// instance is terminal AND every referenced timer/subscription/job is
    /// in terminal status. Returns whether anything was purged.
    async fn purge_instance(&self, instance_id: Uuid) -> Result<bool>;
}
