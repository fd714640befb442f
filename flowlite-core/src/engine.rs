//! Engine facade: the transport-agnostic surface a server or CLI would
//! wrap. Owns the collaborators and hands coordination to the scheduler.

use crate::config::EngineConfig;
use crate::correlator::MessageCorrelator;
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::executors::ConnectorRegistry;
use crate::expression::{ExpressionEvaluator, SimpleEvaluator};
use crate::jobs::JobDispatcher;
use crate::process::{build_definitions, CompiledDefinition};
use crate::scheduler::{DriveItem, TokenScheduler};
use crate::store::ProcessStore;
use crate::types::*;
use crate::wheel::TimingWheel;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

pub struct Engine {
    store: Arc<dyn ProcessStore>,
    scheduler: TokenScheduler,
    wheel: Arc<TimingWheel>,
    correlator: Arc<MessageCorrelator>,
    jobs: Arc<JobDispatcher>,
    connectors: Arc<ConnectorRegistry>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<dyn ProcessStore>) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: Arc<dyn ProcessStore>, config: EngineConfig) -> Self {
        Self::with_evaluator(store, config, Arc::new(SimpleEvaluator))
    }

    /// Plug in a different expression evaluator (the grammar is an
    /// external edge).
    pub fn with_evaluator(
        store: Arc<dyn ProcessStore>,
        mut config: EngineConfig,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        // Tick resolution is bounded at 100 ms; coarser wheels would break
        // the monotonic-ordering guarantee timers are specified against.
        if config.tick_resolution > Duration::from_millis(100) {
            warn!(
                requested_ms = config.tick_resolution.as_millis() as u64,
                "tick resolution clamped to 100ms"
            );
            config.tick_resolution = Duration::from_millis(100);
        }
        let wheel = Arc::new(TimingWheel::new(Utc::now(), config.tick_resolution));
        let correlator = Arc::new(MessageCorrelator::new(store.clone()));
        let jobs = Arc::new(JobDispatcher::new(
            store.clone(),
            config.default_job_timeout,
        ));
        let connectors = Arc::new(ConnectorRegistry::new());
        let scheduler = TokenScheduler::new(
            store.clone(),
            wheel.clone(),
            correlator.clone(),
            jobs.clone(),
            connectors.clone(),
            evaluator,
            config.clone(),
        );
        Self {
            store,
            scheduler,
            wheel,
            correlator,
            jobs,
            connectors,
            config,
        }
    }

    /// In-process service-task connectors, registered by name.
    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.connectors
    }

    // ── Definitions ──

    /// Register (or re-register) a parsed process definition. Embedded
    /// sub-processes are lifted into internal definitions. Running
    /// instances keep executing against the version they started with
    /// structurally — the returned fingerprint identifies this revision.
    pub async fn register_process(
        &self,
        process_key: &str,
        elements: Variables,
    ) -> Result<DefinitionVersion> {
        let definitions = build_definitions(process_key, elements)?;
        // Validate the whole set before persisting any of it.
        for def in &definitions {
            CompiledDefinition::compile(def.clone())?;
        }
        let version = definitions[0].version;
        for def in definitions {
            self.scheduler.invalidate_definition(&def.process_key).await;
            self.store.save_definition(&def).await?;
        }
        Ok(version)
    }

    // ── Instance control ──

    pub async fn start_instance(
        &self,
        process_key: &str,
        variables: Variables,
    ) -> Result<InstanceStatus> {
        self.start_instance_at(process_key, variables, None).await
    }

    /// Start at a specific start event (required for multi-start
    /// definitions).
    pub async fn start_instance_at(
        &self,
        process_key: &str,
        variables: Variables,
        start_event_id: Option<&str>,
    ) -> Result<InstanceStatus> {
        let instance = self
            .scheduler
            .create_instance(process_key, variables, start_event_id, None)
            .await?;
        let id = instance.instance_id;
        self.scheduler
            .process_items(vec![DriveItem::Run(id)])
            .await?;
        self.get_instance(id).await
    }

    pub async fn get_instance(&self, instance_id: Uuid) -> Result<InstanceStatus> {
        let instance = self
            .store
            .load_instance(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        self.status_of(instance).await
    }

    pub async fn cancel_instance(&self, instance_id: Uuid, reason: &str) -> Result<()> {
        self.store
            .load_instance(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        self.scheduler.cancel_instance(instance_id, reason).await
    }

    pub async fn list_instances(
        &self,
        state: Option<InstanceState>,
        process_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<InstanceStatus>> {
        let mut out = Vec::new();
        for instance in self.store.list_instances(state, process_key, limit).await? {
            out.push(self.status_of(instance).await?);
        }
        Ok(out)
    }

    async fn status_of(&self, instance: ProcessInstance) -> Result<InstanceStatus> {
        let tokens = self
            .store
            .load_tokens_by_instance(instance.instance_id)
            .await?;
        let current_activity = tokens
            .iter()
            .filter(|t| !t.state.is_terminal())
            .max_by_key(|t| (t.updated_at, t.token_id))
            .map(|t| t.current_element_id.clone());
        Ok(InstanceStatus {
            instance_id: instance.instance_id,
            process_key: instance.process_key,
            state: instance.state,
            current_activity,
            variables: instance.variables,
            started_at: instance.started_at,
            updated_at: instance.updated_at,
            completed_at: instance.completed_at,
        })
    }

    // ── Messages ──

    /// Publish a message. Matches a waiting subscription immediately or
    /// buffers until the TTL elapses.
    pub async fn publish_message(
        &self,
        name: &str,
        correlation_key: &str,
        variables: Variables,
        ttl_seconds: Option<u64>,
    ) -> Result<Uuid> {
        let message = BufferedMessage {
            message_id: Uuid::now_v7(),
            name: name.to_string(),
            correlation_key: correlation_key.to_string(),
            variables,
            published_at: Utc::now(),
            ttl_seconds: ttl_seconds.unwrap_or(self.config.default_message_ttl_seconds),
            consumed_by: None,
        };
        let message_id = message.message_id;
        if let Some(delivery) = self.correlator.publish(message).await? {
            self.scheduler.handle_delivery(delivery).await?;
        }
        Ok(message_id)
    }

    // ── Jobs ──

    pub async fn activate_jobs(
        &self,
        job_type: &str,
        worker: &str,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<Job>> {
        self.jobs.activate(job_type, worker, max, timeout).await
    }

    pub async fn complete_job(&self, job_key: Uuid, variables: Variables) -> Result<()> {
        self.complete_job_scoped(job_key, variables, VariableScope::Token)
            .await
    }

    /// Complete a job whose callback addresses a specific variable scope —
    /// `Instance` writes the returned variables straight onto the instance
    /// map instead of the token overlay.
    pub async fn complete_job_scoped(
        &self,
        job_key: Uuid,
        variables: Variables,
        scope: VariableScope,
    ) -> Result<()> {
        let job = self.jobs.complete(job_key, variables).await?;
        self.scheduler.handle_job_completed(job, scope).await
    }

    /// `error_code` doubles as the boundary-error routing key.
    pub async fn fail_job(&self, job_key: Uuid, retries: u32, error_code: &str) -> Result<()> {
        let job = self.jobs.fail(job_key, retries, error_code).await?;
        self.scheduler.handle_job_failed(job, error_code).await
    }

    // ── Incidents ──

    pub async fn incidents(&self, instance_id: Uuid) -> Result<Vec<Incident>> {
        self.store.load_incidents_by_instance(instance_id).await
    }

    /// Resume the step the incident pinned.
    pub async fn resolve_incident(&self, incident_id: Uuid, resolution: &str) -> Result<()> {
        self.scheduler.resolve_incident(incident_id, resolution).await
    }

    /// Give up on the incident and fail the whole instance.
    pub async fn escalate_incident(&self, incident_id: Uuid) -> Result<()> {
        self.scheduler.escalate_incident(incident_id).await
    }

    // ── Audit ──

    pub async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>> {
        self.store.read_events(instance_id, from_seq).await
    }

    // ── Clock ──

    /// One engine tick: fire due timers (timers beat messages landing on
    /// the same instant), reclaim expired job leases, purge expired
    /// messages. Tests drive this directly with a synthetic `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        for fired in self.wheel.advance(now).await {
            self.scheduler.handle_timer_fired(fired).await?;
        }
        let reclaimed = self.jobs.reclaim_expired(now).await?;
        for job in reclaimed.exhausted {
            self.scheduler.handle_job_failed(job, "TIMEOUT").await?;
        }
        self.correlator.purge_expired(now).await?;
        Ok(())
    }

    /// Background ticker at the configured resolution.
    pub fn spawn_clock(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.tick_resolution);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(err) = engine.tick(Utc::now()).await {
                    warn!(error = %err, "engine tick failed");
                }
            }
        })
    }

    // ── Recovery & retention ──

    /// After a restart: re-arm durable timers with the wheel and re-drive
    /// instances that still hold ACTIVE tokens. WAITING tokens resume from
    /// their durable `waiting_for` rows as callbacks arrive.
    pub async fn recover(&self) -> Result<()> {
        self.scheduler.recover().await
    }

    /// Drop all records of a terminal instance whose external references
    /// are themselves terminal.
    pub async fn purge_instance(&self, instance_id: Uuid) -> Result<bool> {
        self.store.purge_instance(instance_id).await
    }
}
