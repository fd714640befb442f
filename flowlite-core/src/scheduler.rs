//! Token scheduler: drives every token's lifecycle.
//!
//! For each ACTIVE token the scheduler repeatedly executes one step until
//! the token suspends, completes, or is cancelled, persisting every
//! transition. For each WAITING token it accepts collaborator callbacks
//! keyed by `waiting_for` and resumes — a callback that does not match the
//! token's current wait key is dropped as stale, which is what makes
//! at-least-once delivery from collaborators safe.
//!
//! All mutation of one instance happens under that instance's lock: at most
//! one step of any token of a given instance executes at a time. That lock
//! is the serialization point for gateway joins and variable merges.

use crate::config::{EngineConfig, InclusiveJoinMode};
use crate::correlator::{CorrelatedDelivery, MessageCorrelator};
use crate::error::EngineError;
use crate::events::RuntimeEvent;
use crate::executors::{
    resolve_outputs, ConnectorRegistry, EventArmKind, ExecutionContext, ExecutorRegistry,
    StepResult,
};
use crate::expression::ExpressionEvaluator;
use crate::jobs::JobDispatcher;
use crate::process::{element_type, CompiledDefinition, ElementRef};
use crate::store::ProcessStore;
use crate::timer::TimerSchedule;
use crate::types::*;
use crate::wheel::{TimerFired, TimingWheel};
use anyhow::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fires an unbounded cycle would otherwise produce.
const CYCLE_FIRE_CAP: u32 = 1000;

/// Default retry budget for jobs whose element declares none.
const DEFAULT_JOB_RETRIES: u32 = 3;

/// Unit of work for the drive loop. Items are processed strictly one at a
/// time, each under its own instance lock, so cross-instance effects
/// (child completion, message throw) never nest locks.
#[derive(Debug)]
pub(crate) enum DriveItem {
    /// Run every ACTIVE token of the instance until quiescent.
    Run(Uuid),
    /// Apply a correlated message to its waiting token.
    Deliver(Box<CorrelatedDelivery>),
    /// A child instance completed; resume the parent token.
    ChildCompleted {
        parent: Uuid,
        child: Uuid,
        variables: Variables,
    },
    /// Cancel an instance (boundary interrupt on a call activity, or
    /// parent cancellation propagating down).
    Cancel { instance_id: Uuid, reason: String },
}

pub struct TokenScheduler {
    store: Arc<dyn ProcessStore>,
    executors: ExecutorRegistry,
    connectors: Arc<ConnectorRegistry>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    wheel: Arc<TimingWheel>,
    correlator: Arc<MessageCorrelator>,
    jobs: Arc<JobDispatcher>,
    config: EngineConfig,
    /// Per-instance serialization point.
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    /// Compiled-definition cache, keyed by process key.
    definitions: RwLock<HashMap<String, Arc<CompiledDefinition>>>,
    /// Cancellation flags checked at step boundaries.
    cancel_requests: RwLock<HashSet<Uuid>>,
}

impl TokenScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ProcessStore>,
        wheel: Arc<TimingWheel>,
        correlator: Arc<MessageCorrelator>,
        jobs: Arc<JobDispatcher>,
        connectors: Arc<ConnectorRegistry>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            executors: ExecutorRegistry::standard(),
            connectors,
            evaluator,
            wheel,
            correlator,
            jobs,
            config,
            locks: Mutex::new(HashMap::new()),
            definitions: RwLock::new(HashMap::new()),
            cancel_requests: RwLock::new(HashSet::new()),
        }
    }

    // ── Definition cache ──

    pub(crate) async fn definition(
        &self,
        process_key: &str,
    ) -> Result<Arc<CompiledDefinition>> {
        if let Some(def) = self.definitions.read().await.get(process_key) {
            return Ok(def.clone());
        }
        let raw = self
            .store
            .load_definition(process_key)
            .await?
            .ok_or_else(|| EngineError::ProcessNotFound(process_key.to_string()))?;
        let compiled = Arc::new(CompiledDefinition::compile(raw)?);
        self.definitions
            .write()
            .await
            .insert(process_key.to_string(), compiled.clone());
        Ok(compiled)
    }

    pub(crate) async fn invalidate_definition(&self, process_key: &str) {
        self.definitions.write().await.remove(process_key);
    }

    // ── Instance creation ──

    /// Create the instance record and its initial token at the start event.
    /// The caller drives it afterwards.
    pub(crate) async fn create_instance(
        &self,
        process_key: &str,
        variables: Variables,
        start_event_id: Option<&str>,
        parent: Option<Uuid>,
    ) -> Result<ProcessInstance> {
        let def = self.definition(process_key).await?;
        let start = def.resolve_start_event(start_event_id)?.to_string();

        let instance =
            ProcessInstance::new(process_key, def.definition.version, variables, parent);
        let token = Token::new(instance.instance_id, process_key, &start);

        self.store.save_instance(&instance).await?;
        self.store.save_token(&token).await?;
        self.append(
            instance.instance_id,
            &RuntimeEvent::InstanceStarted {
                instance_id: instance.instance_id,
                process_key: process_key.to_string(),
                parent_instance_id: parent,
            },
        )
        .await?;
        self.append(
            instance.instance_id,
            &RuntimeEvent::TokenSpawned {
                token_id: token.token_id,
                element_id: start,
                parent_token_id: None,
            },
        )
        .await?;
        info!(instance_id = %instance.instance_id, process_key, "instance started");
        Ok(instance)
    }

    // ── Drive loop ──

    pub(crate) async fn process_items(&self, items: Vec<DriveItem>) -> Result<()> {
        let mut queue: VecDeque<DriveItem> = items.into();
        while let Some(item) = queue.pop_front() {
            let produced = match item {
                DriveItem::Run(id) => self.drive(id).await?,
                DriveItem::Deliver(delivery) => self.apply_delivery(*delivery).await?,
                DriveItem::ChildCompleted {
                    parent,
                    child,
                    variables,
                } => self.apply_child_completion(parent, child, variables).await?,
                DriveItem::Cancel {
                    instance_id,
                    reason,
                } => {
                    self.cancel_instance(instance_id, &reason).await?;
                    Vec::new()
                }
            };
            queue.extend(produced);
        }
        Ok(())
    }

    /// Run every ACTIVE token of the instance until none remain, picking
    /// the smallest `(updated_at, token_id)` each round for deterministic
    /// replay.
    async fn drive(&self, instance_id: Uuid) -> Result<Vec<DriveItem>> {
        let lock = self.instance_lock(instance_id).await;
        let _guard = lock.lock().await;

        let mut items = Vec::new();
        let Some(mut instance) = self.store.load_instance(instance_id).await? else {
            return Ok(items);
        };
        if instance.state.is_terminal() {
            return Ok(items);
        }
        let def = self.definition(&instance.process_key).await?;

        loop {
            if self.cancel_requested(instance_id).await {
                return Ok(items);
            }
            let tokens = self.store.load_tokens_by_instance(instance_id).await?;
            let next = tokens
                .iter()
                .filter(|t| t.state == TokenState::Active)
                .min_by_key(|t| (t.updated_at, t.token_id));
            let Some(next) = next else {
                break;
            };
            let mut token = next.clone();
            let produced = self
                .run_token_burst(&def, &mut instance, &mut token)
                .await?;
            items.extend(produced);
        }

        // Completion check: COMPLETED iff no live token remains and at
        // least one token reached an end event.
        let tokens = self.store.load_tokens_by_instance(instance_id).await?;
        let live = tokens
            .iter()
            .any(|t| matches!(t.state, TokenState::Active | TokenState::Waiting));
        let reached_end = tokens.iter().any(|t| t.state == TokenState::Completed);
        if !live && reached_end && !instance.state.is_terminal() {
            instance.state = InstanceState::Completed;
            instance.completed_at = Some(Utc::now());
            instance.updated_at = Utc::now();
            self.store.save_instance(&instance).await?;
            self.append(instance_id, &RuntimeEvent::InstanceCompleted { instance_id })
                .await?;
            info!(instance_id = %instance_id, "instance completed");
            if let Some(parent) = instance.parent_instance_id {
                items.push(DriveItem::ChildCompleted {
                    parent,
                    child: instance_id,
                    variables: instance.variables.clone(),
                });
            }
        }
        Ok(items)
    }

    /// Execute steps for one token until it suspends, completes, fails, or
    /// exhausts the burst cap.
    async fn run_token_burst(
        &self,
        def: &CompiledDefinition,
        instance: &mut ProcessInstance,
        token: &mut Token,
    ) -> Result<Vec<DriveItem>> {
        let mut items = Vec::new();

        for _ in 0..self.config.max_burst_steps {
            if self.cancel_requested(instance.instance_id).await {
                return Ok(items);
            }

            let element_id = token.current_element_id.clone();
            let element = match def.element(&element_id) {
                Ok(el) => el,
                Err(err) => {
                    self.fail_step(def, instance, token, err).await?;
                    return Ok(items);
                }
            };
            let el_type = match element.element_type() {
                Ok(t) => t,
                Err(err) => {
                    self.fail_step(def, instance, token, err).await?;
                    return Ok(items);
                }
            };
            let Some(executor) = self.executors.get(el_type) else {
                let err = EngineError::validation(
                    format!("{element_id}/type"),
                    format!("no executor registered for `{el_type}`"),
                );
                self.fail_step(def, instance, token, err).await?;
                return Ok(items);
            };

            let scope = scope_of(instance, token);
            let ctx = ExecutionContext {
                token,
                element,
                definition: def,
                scope: &scope,
                evaluator: self.evaluator.as_ref(),
                connectors: self.connectors.as_ref(),
            };
            let result = match executor.execute(&ctx) {
                Ok(result) => result,
                Err(err) => StepResult::Fail { error: err },
            };
            debug!(
                token_id = %token.token_id,
                element_id = %element_id,
                result = ?std::mem::discriminant(&result),
                "step"
            );

            match result {
                StepResult::Advance { flows, variables } => {
                    if let Some(vars) = variables {
                        token.merge_variables(&vars);
                    }
                    if is_gateway(el_type) {
                        self.append(
                            instance.instance_id,
                            &RuntimeEvent::GatewayTaken {
                                gateway_id: element_id.clone(),
                                token_id: token.token_id,
                                flows_taken: flows.clone(),
                            },
                        )
                        .await?;
                    }
                    self.advance_token(def, instance, token, &flows).await?;
                    if token.state.is_terminal() {
                        return Ok(items);
                    }
                }

                StepResult::CreateJob {
                    job_type,
                    variables,
                } => {
                    self.suspend_on_job(def, instance, token, &element_id, job_type, variables)
                        .await?;
                    return Ok(items);
                }

                StepResult::ScheduleTimer {
                    schedule,
                    expression,
                } => {
                    self.suspend_on_timer(instance, token, &element_id, schedule, &expression)
                        .await?;
                    return Ok(items);
                }

                StepResult::Subscribe {
                    message_name,
                    correlation_key,
                } => {
                    let resumed = self
                        .subscribe_token(
                            def,
                            instance,
                            token,
                            &element_id,
                            &message_name,
                            &correlation_key,
                        )
                        .await?;
                    if !resumed {
                        return Ok(items);
                    }
                }

                StepResult::SpawnChild {
                    process_key,
                    variables,
                    context_flag,
                } => {
                    match self
                        .spawn_child(def, instance, token, &element_id, &process_key, variables, &context_flag)
                        .await?
                    {
                        Some(child_id) => {
                            items.push(DriveItem::Run(child_id));
                            return Ok(items);
                        }
                        // Spawn failed; the token is parked on an incident.
                        None => return Ok(items),
                    }
                }

                StepResult::ThrowMessage {
                    name,
                    correlation_key,
                    variables,
                    flows,
                } => {
                    let message = BufferedMessage {
                        message_id: Uuid::now_v7(),
                        name: name.clone(),
                        correlation_key: correlation_key.clone(),
                        variables,
                        published_at: Utc::now(),
                        ttl_seconds: self.config.default_message_ttl_seconds,
                        consumed_by: None,
                    };
                    let message_id = message.message_id;
                    match self.correlator.publish(message).await? {
                        Some(delivery) => {
                            self.append(
                                instance.instance_id,
                                &RuntimeEvent::MessageCorrelated {
                                    message_id,
                                    subscription_id: delivery.subscription.subscription_id,
                                    token_id: delivery.subscription.token_id,
                                },
                            )
                            .await?;
                            items.push(DriveItem::Deliver(Box::new(delivery)));
                        }
                        None => {
                            self.append(
                                instance.instance_id,
                                &RuntimeEvent::MessageBuffered {
                                    message_id,
                                    name,
                                    correlation_key,
                                },
                            )
                            .await?;
                        }
                    }
                    self.advance_token(def, instance, token, &flows).await?;
                    if token.state.is_terminal() {
                        return Ok(items);
                    }
                }

                StepResult::ArmEvents { arms } => {
                    let resumed = self
                        .arm_event_gateway(def, instance, token, &element_id, arms)
                        .await?;
                    if !resumed {
                        return Ok(items);
                    }
                }

                StepResult::Park => {
                    self.park_at_join(def, instance, token, &element_id).await?;
                    return Ok(items);
                }

                StepResult::Complete => {
                    token.state = TokenState::Completed;
                    token.waiting_for = None;
                    token.touch();
                    self.store.save_token(token).await?;
                    instance.merge_variables(&token.variables);
                    self.store.save_instance(instance).await?;
                    self.append(
                        instance.instance_id,
                        &RuntimeEvent::TokenCompleted {
                            token_id: token.token_id,
                            element_id,
                        },
                    )
                    .await?;
                    return Ok(items);
                }

                StepResult::Fail { error } => {
                    self.fail_step(def, instance, token, error).await?;
                    return Ok(items);
                }
            }
        }

        let err = EngineError::Timeout(std::time::Duration::from_secs(0));
        warn!(token_id = %token.token_id, "step burst cap exceeded without a suspend");
        self.raise_incident(
            instance,
            token,
            err.code(),
            &format!(
                "token exceeded {} steps without suspending (runaway loop?)",
                self.config.max_burst_steps
            ),
        )
        .await?;
        Ok(items)
    }

    // ── Movement ──

    /// Move the token along `flows`: the first flow carries the original
    /// token, every further flow gets a fresh sibling with a copy of the
    /// overlay (parallel split). Leaving an activity cancels its boundary
    /// timers first.
    async fn advance_token(
        &self,
        def: &CompiledDefinition,
        instance: &mut ProcessInstance,
        token: &mut Token,
        flows: &[String],
    ) -> Result<()> {
        self.cancel_boundary_timers(instance.instance_id, token)
            .await;

        if flows.is_empty() {
            // Dead end without an end event: the token simply finishes.
            token.state = TokenState::Completed;
            token.waiting_for = None;
            token.touch();
            self.store.save_token(token).await?;
            self.append(
                instance.instance_id,
                &RuntimeEvent::TokenCompleted {
                    token_id: token.token_id,
                    element_id: token.current_element_id.clone(),
                },
            )
            .await?;
            return Ok(());
        }

        let from = token.current_element_id.clone();
        for (idx, flow_id) in flows.iter().enumerate() {
            let flow = def.flow(flow_id)?;
            if idx == 0 {
                token.move_to(&flow.target);
                self.store.save_token(token).await?;
            } else {
                let sibling = token.fork(&flow.target);
                self.store.save_token(&sibling).await?;
                self.append(
                    instance.instance_id,
                    &RuntimeEvent::TokenSpawned {
                        token_id: sibling.token_id,
                        element_id: flow.target.clone(),
                        parent_token_id: Some(token.token_id),
                    },
                )
                .await?;
            }
            self.append(
                instance.instance_id,
                &RuntimeEvent::TokenMoved {
                    token_id: token.token_id,
                    from_element_id: from.clone(),
                    to_element_id: flow.target.clone(),
                    flow_id: flow_id.clone(),
                },
            )
            .await?;
        }
        Ok(())
    }

    // ── Suspensions ──

    async fn suspend_on_job(
        &self,
        def: &CompiledDefinition,
        instance: &mut ProcessInstance,
        token: &mut Token,
        element_id: &str,
        job_type: String,
        variables: Variables,
    ) -> Result<()> {
        let element = def.element(element_id)?;
        let retries = element
            .fields
            .get("retries")
            .and_then(serde_json::Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(DEFAULT_JOB_RETRIES);
        let now = Utc::now();
        let job = Job {
            job_key: Uuid::now_v7(),
            job_type: job_type.clone(),
            process_instance_id: instance.instance_id,
            element_id: element_id.to_string(),
            token_id: token.token_id,
            variables,
            retries,
            deadline: None,
            state: JobState::Activatable,
            worker: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.create(&job).await?;
        self.arm_boundary_timers(def, instance, token, element_id)
            .await?;
        token.set_waiting(WaitKey::Job(job.job_key));
        self.store.save_token(token).await?;
        self.append(
            instance.instance_id,
            &RuntimeEvent::JobCreated {
                job_key: job.job_key,
                job_type,
                token_id: token.token_id,
                element_id: element_id.to_string(),
            },
        )
        .await?;
        self.suspended_event(instance.instance_id, token).await
    }

    async fn suspend_on_timer(
        &self,
        instance: &mut ProcessInstance,
        token: &mut Token,
        element_id: &str,
        schedule: TimerSchedule,
        expression: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let record = TimerRecord {
            timer_id: Uuid::now_v7(),
            element_id: element_id.to_string(),
            process_instance_id: instance.instance_id,
            token_id: Some(token.token_id),
            kind: schedule.kind(),
            expression: expression.to_string(),
            scheduled_at: now,
            due_at: schedule.first_due(now),
            status: TimerStatus::Pending,
            interrupting: true,
            cycle_remaining: cycle_budget(&schedule),
        };
        self.store.save_timer(&record).await?;
        self.wheel
            .schedule(fired_payload(&record), record.due_at)
            .await;
        token.set_waiting(WaitKey::Timer(record.timer_id));
        self.store.save_token(token).await?;
        self.append(
            instance.instance_id,
            &RuntimeEvent::TimerScheduled {
                timer_id: record.timer_id,
                element_id: element_id.to_string(),
                token_id: Some(token.token_id),
                due_at: record.due_at,
            },
        )
        .await?;
        self.suspended_event(instance.instance_id, token).await
    }

    /// Returns true when a buffered message matched immediately and the
    /// token advanced instead of suspending.
    async fn subscribe_token(
        &self,
        def: &CompiledDefinition,
        instance: &mut ProcessInstance,
        token: &mut Token,
        element_id: &str,
        message_name: &str,
        correlation_key: &str,
    ) -> Result<bool> {
        let now = Utc::now();
        let subscription = Subscription {
            subscription_id: Uuid::now_v7(),
            process_instance_id: instance.instance_id,
            token_id: token.token_id,
            message_name: message_name.to_string(),
            correlation_key: correlation_key.to_string(),
            created_at: now,
            status: SubscriptionStatus::Pending,
        };
        let subscription_id = subscription.subscription_id;
        self.append(
            instance.instance_id,
            &RuntimeEvent::MessageSubscribed {
                subscription_id,
                token_id: token.token_id,
                message_name: message_name.to_string(),
                correlation_key: correlation_key.to_string(),
            },
        )
        .await?;

        if let Some(delivery) = self.correlator.subscribe(subscription, now).await? {
            self.append(
                instance.instance_id,
                &RuntimeEvent::MessageCorrelated {
                    message_id: delivery.message.message_id,
                    subscription_id,
                    token_id: token.token_id,
                },
            )
            .await?;
            token.merge_variables(&delivery.message.variables);
            let flows = def.element(element_id)?.outgoing();
            self.advance_token(def, instance, token, &flows).await?;
            return Ok(true);
        }

        token.set_waiting(WaitKey::Message {
            name: message_name.to_string(),
            correlation_key: correlation_key.to_string(),
        });
        self.store.save_token(token).await?;
        self.suspended_event(instance.instance_id, token).await?;
        Ok(false)
    }

    /// Returns the child instance id, or None when the spawn failed and an
    /// incident was raised instead.
    #[allow(clippy::too_many_arguments)]
    async fn spawn_child(
        &self,
        def: &CompiledDefinition,
        instance: &mut ProcessInstance,
        token: &mut Token,
        element_id: &str,
        process_key: &str,
        variables: Variables,
        context_flag: &str,
    ) -> Result<Option<Uuid>> {
        let child = match self
            .create_instance(process_key, variables, None, Some(instance.instance_id))
            .await
        {
            Ok(child) => child,
            Err(err) => {
                let reason = err.to_string();
                let code = err
                    .downcast_ref::<EngineError>()
                    .map(EngineError::code)
                    .unwrap_or("STORE_ERROR");
                self.raise_incident(instance, token, code, &reason).await?;
                return Ok(None);
            }
        };

        token.set_context_flag(context_flag);
        self.arm_boundary_timers(def, instance, token, element_id)
            .await?;
        token.set_waiting(WaitKey::CallActivity(child.instance_id));
        self.store.save_token(token).await?;
        self.append(
            instance.instance_id,
            &RuntimeEvent::ChildInstanceSpawned {
                child_instance_id: child.instance_id,
                child_process_key: process_key.to_string(),
                parent_token_id: token.token_id,
            },
        )
        .await?;
        self.suspended_event(instance.instance_id, token).await?;
        Ok(Some(child.instance_id))
    }

    /// Arm every outgoing catch event of an event-based gateway. Returns
    /// true when a buffered message won immediately and the token advanced.
    async fn arm_event_gateway(
        &self,
        def: &CompiledDefinition,
        instance: &mut ProcessInstance,
        token: &mut Token,
        gateway_id: &str,
        arms: Vec<crate::executors::EventArm>,
    ) -> Result<bool> {
        let now = Utc::now();
        for arm in &arms {
            match &arm.kind {
                EventArmKind::Timer {
                    schedule,
                    expression,
                } => {
                    let record = TimerRecord {
                        timer_id: Uuid::now_v7(),
                        element_id: arm.catch_element_id.clone(),
                        process_instance_id: instance.instance_id,
                        token_id: Some(token.token_id),
                        kind: TimerKind::Event,
                        expression: expression.clone(),
                        scheduled_at: now,
                        due_at: schedule.first_due(now),
                        status: TimerStatus::Pending,
                        interrupting: true,
                        cycle_remaining: None,
                    };
                    self.store.save_timer(&record).await?;
                    self.wheel
                        .schedule(fired_payload(&record), record.due_at)
                        .await;
                    token.event_timer_ids.insert(record.timer_id);
                    self.append(
                        instance.instance_id,
                        &RuntimeEvent::TimerScheduled {
                            timer_id: record.timer_id,
                            element_id: arm.catch_element_id.clone(),
                            token_id: Some(token.token_id),
                            due_at: record.due_at,
                        },
                    )
                    .await?;
                }
                EventArmKind::Message {
                    name,
                    correlation_key,
                } => {
                    let subscription = Subscription {
                        subscription_id: Uuid::now_v7(),
                        process_instance_id: instance.instance_id,
                        token_id: token.token_id,
                        message_name: name.clone(),
                        correlation_key: correlation_key.clone(),
                        created_at: now,
                        status: SubscriptionStatus::Pending,
                    };
                    let subscription_id = subscription.subscription_id;
                    token.execution_context.insert(
                        format!("event_arm:{subscription_id}"),
                        serde_json::Value::String(arm.catch_element_id.clone()),
                    );
                    self.append(
                        instance.instance_id,
                        &RuntimeEvent::MessageSubscribed {
                            subscription_id,
                            token_id: token.token_id,
                            message_name: name.clone(),
                            correlation_key: correlation_key.clone(),
                        },
                    )
                    .await?;

                    if let Some(delivery) = self.correlator.subscribe(subscription, now).await? {
                        // A buffered message wins the race outright.
                        self.append(
                            instance.instance_id,
                            &RuntimeEvent::MessageCorrelated {
                                message_id: delivery.message.message_id,
                                subscription_id,
                                token_id: token.token_id,
                            },
                        )
                        .await?;
                        self.cancel_event_arms(instance.instance_id, token).await;
                        token.merge_variables(&delivery.message.variables);
                        token.move_to(&arm.catch_element_id);
                        let flows = def.element(&arm.catch_element_id)?.outgoing();
                        self.advance_token(def, instance, token, &flows).await?;
                        return Ok(true);
                    }
                }
            }
        }

        token.set_waiting(WaitKey::EventGateway {
            element_id: gateway_id.to_string(),
        });
        self.store.save_token(token).await?;
        self.suspended_event(instance.instance_id, token).await?;
        Ok(false)
    }

    // ── Joins ──

    /// Park the token at a joining gateway and release the barrier once
    /// every expected sibling has arrived. The instance lock makes the
    /// count-and-merge atomic.
    async fn park_at_join(
        &self,
        def: &CompiledDefinition,
        instance: &mut ProcessInstance,
        token: &mut Token,
        join_id: &str,
    ) -> Result<()> {
        let join_key = WaitKey::Join {
            element_id: join_id.to_string(),
        };
        token.set_waiting(join_key.clone());
        self.store.save_token(token).await?;

        let element = def.element(join_id)?;
        let incoming = element.incoming().len();
        let tokens = self
            .store
            .load_tokens_by_instance(instance.instance_id)
            .await?;
        let parked: Vec<&Token> = tokens
            .iter()
            .filter(|t| t.state == TokenState::Waiting && t.waiting_for.as_ref() == Some(&join_key))
            .collect();

        self.append(
            instance.instance_id,
            &RuntimeEvent::JoinArrived {
                join_id: join_id.to_string(),
                token_id: token.token_id,
                arrived: parked.len(),
                expected: incoming,
            },
        )
        .await?;

        let el_type = element.element_type()?;
        let release = match (el_type, self.config.inclusive_join) {
            (element_type::INCLUSIVE_GATEWAY, InclusiveJoinMode::Static) => {
                // Fire once no live sibling outside the barrier can still
                // reach the join.
                !tokens.iter().any(|t| {
                    !t.state.is_terminal()
                        && t.waiting_for.as_ref() != Some(&join_key)
                        && (t.current_element_id == join_id
                            || def.reach.can_reach(&t.current_element_id, join_id))
                })
            }
            _ => parked.len() >= incoming,
        };
        if !release {
            debug!(join_id, arrived = parked.len(), expected = incoming, "join waiting");
            return Ok(());
        }

        // Merge overlays last-writer-wins by (updated_at, token_id); the
        // earliest arriver survives.
        let mut ordered: Vec<Token> = parked.into_iter().cloned().collect();
        ordered.sort_by_key(|t| (t.updated_at, t.token_id));
        let mut merged = Variables::new();
        for t in &ordered {
            for (k, v) in &t.variables {
                merged.insert(k.clone(), v.clone());
            }
        }

        let mut survivor = ordered[0].clone();
        let consumed: Vec<Uuid> = ordered.iter().skip(1).map(|t| t.token_id).collect();
        for t in ordered.iter().skip(1) {
            let mut dead = t.clone();
            dead.state = TokenState::Cancelled;
            dead.waiting_for = None;
            dead.touch();
            self.store.save_token(&dead).await?;
        }
        survivor.variables = merged;
        survivor.clear_waiting();
        self.store.save_token(&survivor).await?;
        self.append(
            instance.instance_id,
            &RuntimeEvent::JoinReleased {
                join_id: join_id.to_string(),
                surviving_token_id: survivor.token_id,
                merged_token_ids: consumed,
            },
        )
        .await?;

        self.advance_token(def, instance, &mut survivor, &element.outgoing())
            .await?;
        Ok(())
    }

    // ── Boundary timers ──

    async fn arm_boundary_timers(
        &self,
        def: &CompiledDefinition,
        instance: &mut ProcessInstance,
        token: &mut Token,
        activity_id: &str,
    ) -> Result<()> {
        let now = Utc::now();
        for boundary_id in def.boundary_events(activity_id) {
            let boundary = def.element(boundary_id)?;
            let Some(expression) = boundary.ext_string("timer_expression") else {
                // Error boundaries are routed on failure, not timed.
                continue;
            };
            let schedule = crate::timer::parse_timer_expression(expression)?;
            let record = TimerRecord {
                timer_id: Uuid::now_v7(),
                element_id: boundary_id.clone(),
                process_instance_id: instance.instance_id,
                token_id: Some(token.token_id),
                kind: TimerKind::Boundary,
                expression: expression.to_string(),
                scheduled_at: now,
                due_at: schedule.first_due(now),
                status: TimerStatus::Pending,
                interrupting: boundary.bool_field("interrupting", true),
                cycle_remaining: cycle_budget(&schedule),
            };
            self.store.save_timer(&record).await?;
            self.wheel
                .schedule(fired_payload(&record), record.due_at)
                .await;
            token.boundary_timer_ids.insert(record.timer_id);
            self.append(
                instance.instance_id,
                &RuntimeEvent::TimerScheduled {
                    timer_id: record.timer_id,
                    element_id: boundary_id.clone(),
                    token_id: Some(token.token_id),
                    due_at: record.due_at,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Best-effort: a timer that escapes cancellation fires against a token
    /// that is no longer waiting on it and is dropped there.
    async fn cancel_boundary_timers(&self, instance_id: Uuid, token: &mut Token) {
        if token.boundary_timer_ids.is_empty() {
            return;
        }
        for timer_id in std::mem::take(&mut token.boundary_timer_ids) {
            if let Err(err) = self.cancel_timer(instance_id, timer_id).await {
                warn!(%timer_id, error = %err, "boundary timer cancellation failed");
            }
        }
    }

    async fn cancel_event_arms(&self, instance_id: Uuid, token: &mut Token) {
        for timer_id in std::mem::take(&mut token.event_timer_ids) {
            if let Err(err) = self.cancel_timer(instance_id, timer_id).await {
                warn!(%timer_id, error = %err, "event timer cancellation failed");
            }
        }
        // Pending subscriptions of this token lose the race.
        if let Ok(subs) = self.store.load_subscriptions_by_instance(instance_id).await {
            for sub in subs {
                if sub.token_id == token.token_id && sub.status == SubscriptionStatus::Pending {
                    if let Err(err) = self
                        .correlator
                        .cancel_subscription(sub.subscription_id)
                        .await
                    {
                        warn!(subscription_id = %sub.subscription_id, error = %err,
                              "subscription cancellation failed");
                    }
                }
                token
                    .execution_context
                    .remove(&format!("event_arm:{}", sub.subscription_id));
            }
        }
    }

    async fn cancel_timer(&self, instance_id: Uuid, timer_id: Uuid) -> Result<()> {
        if let Some(mut record) = self.store.load_timer(timer_id).await? {
            if record.status == TimerStatus::Pending {
                record.status = TimerStatus::Cancelled;
                self.store.save_timer(&record).await?;
                self.append(instance_id, &RuntimeEvent::TimerCancelled { timer_id })
                    .await?;
            }
        }
        self.wheel.cancel(timer_id).await;
        Ok(())
    }

    // ── Failure path ──

    /// Boundary error events divert the token; otherwise an incident pins
    /// it in place.
    async fn fail_step(
        &self,
        def: &CompiledDefinition,
        instance: &mut ProcessInstance,
        token: &mut Token,
        error: EngineError,
    ) -> Result<()> {
        let element_id = token.current_element_id.clone();
        if let Some(boundary_id) = find_error_boundary(def, &element_id, error.code()) {
            info!(token_id = %token.token_id, boundary_id = %boundary_id, code = error.code(),
                  "error routed to boundary event");
            self.cancel_boundary_timers(instance.instance_id, token)
                .await;
            token.move_to(&boundary_id);
            self.store.save_token(token).await?;
            return Ok(());
        }
        self.raise_incident(instance, token, error.code(), &error.to_string())
            .await
    }

    async fn raise_incident(
        &self,
        instance: &mut ProcessInstance,
        token: &mut Token,
        kind: &str,
        message: &str,
    ) -> Result<()> {
        let incident = Incident {
            incident_id: Uuid::now_v7(),
            process_instance_id: instance.instance_id,
            token_id: token.token_id,
            element_id: token.current_element_id.clone(),
            kind: kind.to_string(),
            message: message.to_string(),
            retry_count: 0,
            created_at: Utc::now(),
            resolved_at: None,
            resolution: None,
        };
        self.store.save_incident(&incident).await?;
        token.set_waiting(WaitKey::Incident(incident.incident_id));
        self.store.save_token(token).await?;
        self.append(
            instance.instance_id,
            &RuntimeEvent::IncidentCreated {
                incident_id: incident.incident_id,
                token_id: token.token_id,
                element_id: incident.element_id.clone(),
                kind: kind.to_string(),
            },
        )
        .await?;
        warn!(
            incident_id = %incident.incident_id,
            token_id = %token.token_id,
            kind,
            message,
            "incident created"
        );
        Ok(())
    }

    // ── Collaborator callbacks ──

    /// Timer callback. Validates the token still waits on this exact timer
    /// (or holds it as a boundary/event arm); anything else is a stale
    /// no-op.
    pub(crate) async fn handle_timer_fired(&self, fired: TimerFired) -> Result<()> {
        let items = self.apply_timer(fired).await?;
        self.process_items(items).await
    }

    async fn apply_timer(&self, fired: TimerFired) -> Result<Vec<DriveItem>> {
        let instance_id = fired.process_instance_id;
        let lock = self.instance_lock(instance_id).await;
        let _guard = lock.lock().await;

        let Some(mut record) = self.store.load_timer(fired.timer_id).await? else {
            warn!(timer_id = %fired.timer_id, "timer fired without a record");
            return Ok(Vec::new());
        };
        // Cancelled after fire but before consume: drop.
        if record.status != TimerStatus::Pending {
            debug!(timer_id = %fired.timer_id, status = ?record.status, "timer fire dropped");
            return Ok(Vec::new());
        }

        let Some(token_id) = record.token_id else {
            warn!(timer_id = %fired.timer_id, "timer record has no token");
            return Ok(Vec::new());
        };
        let Some(mut token) = self.store.load_token(token_id).await? else {
            return Ok(Vec::new());
        };
        let Some(instance) = self.store.load_instance(instance_id).await? else {
            return Ok(Vec::new());
        };
        let mut instance = instance;
        if instance.state.is_terminal() {
            return Ok(Vec::new());
        }
        let def = self.definition(&instance.process_key).await?;

        record.status = TimerStatus::Fired;
        self.store.save_timer(&record).await?;
        self.append(
            instance_id,
            &RuntimeEvent::TimerFired {
                timer_id: record.timer_id,
                element_id: record.element_id.clone(),
            },
        )
        .await?;

        match record.kind {
            TimerKind::Boundary => {
                self.apply_boundary_timer(&mut instance, &mut token, record)
                    .await
            }
            TimerKind::Event => {
                // Event-gateway arm.
                if !token.is_waiting()
                    || !matches!(token.waiting_for, Some(WaitKey::EventGateway { .. }))
                    || !token.event_timer_ids.contains(&record.timer_id)
                {
                    return self.stale_callback(instance_id, &token, &record).await;
                }
                token.event_timer_ids.remove(&record.timer_id);
                self.cancel_event_arms(instance_id, &mut token).await;
                token.clear_waiting();
                token.move_to(&record.element_id);
                self.append(
                    instance_id,
                    &RuntimeEvent::TokenResumed {
                        token_id: token.token_id,
                        waiting_for: WaitKey::Timer(record.timer_id).to_string(),
                    },
                )
                .await?;
                let flows = def.element(&record.element_id)?.outgoing();
                self.advance_token(&def, &mut instance, &mut token, &flows)
                    .await?;
                Ok(vec![DriveItem::Run(instance_id)])
            }
            _ => {
                // Plain timer catch.
                let expected = WaitKey::Timer(record.timer_id);
                if token.waiting_for.as_ref() != Some(&expected) {
                    return self.stale_callback(instance_id, &token, &record).await;
                }
                token.clear_waiting();
                self.append(
                    instance_id,
                    &RuntimeEvent::TokenResumed {
                        token_id: token.token_id,
                        waiting_for: expected.to_string(),
                    },
                )
                .await?;
                let flows = def.element(&record.element_id)?.outgoing();
                self.advance_token(&def, &mut instance, &mut token, &flows)
                    .await?;
                Ok(vec![DriveItem::Run(instance_id)])
            }
        }
    }

    async fn apply_boundary_timer(
        &self,
        instance: &mut ProcessInstance,
        token: &mut Token,
        mut record: TimerRecord,
    ) -> Result<Vec<DriveItem>> {
        if !token.is_waiting() || !token.boundary_timer_ids.contains(&record.timer_id) {
            return self
                .stale_callback(instance.instance_id, token, &record)
                .await;
        }

        self.append(
            instance.instance_id,
            &RuntimeEvent::BoundaryFired {
                timer_id: record.timer_id,
                boundary_element_id: record.element_id.clone(),
                token_id: token.token_id,
                interrupting: record.interrupting,
            },
        )
        .await?;

        if record.interrupting {
            let mut items = Vec::new();
            // Cancel the primary wait before diverting.
            match token.waiting_for.clone() {
                Some(WaitKey::Job(job_key)) => {
                    self.jobs.cancel_job(job_key).await?;
                }
                Some(WaitKey::CallActivity(child)) => {
                    items.push(DriveItem::Cancel {
                        instance_id: child,
                        reason: "interrupting boundary timer on call activity".into(),
                    });
                }
                Some(WaitKey::Message { .. }) => {
                    self.cancel_token_subscriptions(instance.instance_id, token.token_id)
                        .await;
                }
                _ => {}
            }
            token.boundary_timer_ids.remove(&record.timer_id);
            self.cancel_boundary_timers(instance.instance_id, token)
                .await;
            token.clear_waiting();
            token.move_to(&record.element_id);
            self.store.save_token(token).await?;
            items.push(DriveItem::Run(instance.instance_id));
            return Ok(items);
        }

        // Non-interrupting: a parallel token takes the boundary path while
        // the activity keeps waiting.
        let sibling = token.fork(&record.element_id);
        self.store.save_token(&sibling).await?;
        self.append(
            instance.instance_id,
            &RuntimeEvent::TokenSpawned {
                token_id: sibling.token_id,
                element_id: record.element_id.clone(),
                parent_token_id: Some(token.token_id),
            },
        )
        .await?;

        // Cycle timers re-arm until their budget runs out.
        token.boundary_timer_ids.remove(&record.timer_id);
        let remaining = record.cycle_remaining.unwrap_or(1).saturating_sub(1);
        if remaining > 0 {
            if let Ok(TimerSchedule::Cycle { interval, .. }) =
                crate::timer::parse_timer_expression(&record.expression)
            {
                record.cycle_remaining = Some(remaining);
                record.status = TimerStatus::Pending;
                record.due_at = Utc::now() + interval;
                self.store.save_timer(&record).await?;
                self.wheel
                    .schedule(fired_payload(&record), record.due_at)
                    .await;
                token.boundary_timer_ids.insert(record.timer_id);
            }
        }
        self.store.save_token(token).await?;
        Ok(vec![DriveItem::Run(instance.instance_id)])
    }

    /// Correlated-message callback.
    pub(crate) async fn handle_delivery(&self, delivery: CorrelatedDelivery) -> Result<()> {
        self.process_items(vec![DriveItem::Deliver(Box::new(delivery))])
            .await
    }

    async fn apply_delivery(&self, delivery: CorrelatedDelivery) -> Result<Vec<DriveItem>> {
        let instance_id = delivery.subscription.process_instance_id;
        let lock = self.instance_lock(instance_id).await;
        let _guard = lock.lock().await;

        let Some(mut instance) = self.store.load_instance(instance_id).await? else {
            return Ok(Vec::new());
        };
        if instance.state.is_terminal() {
            return self.requeue_message(delivery).await;
        }
        let Some(mut token) = self.store.load_token(delivery.subscription.token_id).await? else {
            return self.requeue_message(delivery).await;
        };
        let def = self.definition(&instance.process_key).await?;

        let expected = WaitKey::Message {
            name: delivery.subscription.message_name.clone(),
            correlation_key: delivery.subscription.correlation_key.clone(),
        };

        if token.waiting_for.as_ref() == Some(&expected) {
            self.append(
                instance_id,
                &RuntimeEvent::MessageCorrelated {
                    message_id: delivery.message.message_id,
                    subscription_id: delivery.subscription.subscription_id,
                    token_id: token.token_id,
                },
            )
            .await?;
            token.clear_waiting();
            token.merge_variables(&delivery.message.variables);
            let flows = def.element(&token.current_element_id)?.outgoing();
            self.advance_token(&def, &mut instance, &mut token, &flows)
                .await?;
            return Ok(vec![DriveItem::Run(instance_id)]);
        }

        // Event-gateway arm?
        let arm_key = format!("event_arm:{}", delivery.subscription.subscription_id);
        if matches!(token.waiting_for, Some(WaitKey::EventGateway { .. })) {
            if let Some(catch_element) = token
                .execution_context
                .get(&arm_key)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
            {
                self.append(
                    instance_id,
                    &RuntimeEvent::MessageCorrelated {
                        message_id: delivery.message.message_id,
                        subscription_id: delivery.subscription.subscription_id,
                        token_id: token.token_id,
                    },
                )
                .await?;
                self.cancel_event_arms(instance_id, &mut token).await;
                token.clear_waiting();
                token.merge_variables(&delivery.message.variables);
                token.move_to(&catch_element);
                let flows = def.element(&catch_element)?.outgoing();
                self.advance_token(&def, &mut instance, &mut token, &flows)
                    .await?;
                return Ok(vec![DriveItem::Run(instance_id)]);
            }
        }

        self.append(
            instance_id,
            &RuntimeEvent::StaleCallbackDropped {
                token_id: token.token_id,
                expected: token.waiting_for.as_ref().map(WaitKey::to_string),
                got: expected.to_string(),
            },
        )
        .await?;
        self.requeue_message(delivery).await
    }

    /// The consuming subscription turned out stale — put the message back
    /// into the buffer so a healthy subscription can still take it.
    async fn requeue_message(&self, delivery: CorrelatedDelivery) -> Result<Vec<DriveItem>> {
        warn!(
            message_id = %delivery.message.message_id,
            subscription_id = %delivery.subscription.subscription_id,
            "stale message delivery; re-buffering"
        );
        let mut message = delivery.message;
        message.consumed_by = None;
        self.store.save_message(&message).await?;
        self.correlator
            .cancel_subscription(delivery.subscription.subscription_id)
            .await?;
        Ok(Vec::new())
    }

    /// Job completion callback. `scope` decides whether the returned
    /// variables land on the token overlay or directly on the instance map.
    pub(crate) async fn handle_job_completed(&self, job: Job, scope: VariableScope) -> Result<()> {
        let instance_id = job.process_instance_id;
        let items = {
            let lock = self.instance_lock(instance_id).await;
            let _guard = lock.lock().await;

            let Some(mut instance) = self.store.load_instance(instance_id).await? else {
                return Ok(());
            };
            let Some(mut token) = self.store.load_token(job.token_id).await? else {
                return Ok(());
            };
            let expected = WaitKey::Job(job.job_key);
            if instance.state.is_terminal() || token.waiting_for.as_ref() != Some(&expected) {
                self.append(
                    instance_id,
                    &RuntimeEvent::StaleCallbackDropped {
                        token_id: job.token_id,
                        expected: token.waiting_for.as_ref().map(WaitKey::to_string),
                        got: expected.to_string(),
                    },
                )
                .await?;
                warn!(job_key = %job.job_key, "stale job completion dropped");
                return Ok(());
            }
            let def = self.definition(&instance.process_key).await?;

            self.append(
                instance_id,
                &RuntimeEvent::JobCompleted {
                    job_key: job.job_key,
                    variables: job.variables.clone(),
                },
            )
            .await?;

            let element_id = token.current_element_id.clone();
            let element = def.element(&element_id)?;
            let outputs = resolve_outputs(&element, &job.variables, self.evaluator.as_ref())?;
            let flows = element.outgoing();
            token.clear_waiting();
            match scope {
                VariableScope::Token => token.merge_variables(&outputs),
                VariableScope::Instance => {
                    instance.merge_variables(&outputs);
                    self.store.save_instance(&instance).await?;
                }
            }
            self.append(
                instance_id,
                &RuntimeEvent::TokenResumed {
                    token_id: token.token_id,
                    waiting_for: expected.to_string(),
                },
            )
            .await?;
            self.advance_token(&def, &mut instance, &mut token, &flows)
                .await?;
            vec![DriveItem::Run(instance_id)]
        };
        self.process_items(items).await
    }

    /// Job failure with an exhausted retry budget: boundary error event or
    /// incident. Failures with retries left are a queue-side concern.
    pub(crate) async fn handle_job_failed(&self, job: Job, error: &str) -> Result<()> {
        if job.state == JobState::Activatable {
            return Ok(());
        }
        let instance_id = job.process_instance_id;
        let items = {
            let lock = self.instance_lock(instance_id).await;
            let _guard = lock.lock().await;

            let Some(mut instance) = self.store.load_instance(instance_id).await? else {
                return Ok(());
            };
            let Some(mut token) = self.store.load_token(job.token_id).await? else {
                return Ok(());
            };
            let expected = WaitKey::Job(job.job_key);
            if instance.state.is_terminal() || token.waiting_for.as_ref() != Some(&expected) {
                warn!(job_key = %job.job_key, "stale job failure dropped");
                return Ok(());
            }
            let def = self.definition(&instance.process_key).await?;

            self.append(
                instance_id,
                &RuntimeEvent::JobFailed {
                    job_key: job.job_key,
                    retries_left: job.retries,
                    error: error.to_string(),
                },
            )
            .await?;

            if let Some(boundary_id) =
                find_error_boundary(&def, &token.current_element_id, error)
            {
                info!(job_key = %job.job_key, boundary_id = %boundary_id,
                      "job failure routed to boundary error event");
                self.cancel_boundary_timers(instance_id, &mut token).await;
                token.clear_waiting();
                token.move_to(&boundary_id);
                self.store.save_token(&token).await?;
                vec![DriveItem::Run(instance_id)]
            } else {
                let kind = if error == "TIMEOUT" {
                    "TIMEOUT"
                } else {
                    "CONNECTOR_ERROR"
                };
                self.raise_incident(&mut instance, &mut token, kind, error)
                    .await?;
                Vec::new()
            }
        };
        self.process_items(items).await
    }

    /// Child-instance completion: the parent token re-enters its call
    /// activity step, which sees the execution-context flag and advances.
    async fn apply_child_completion(
        &self,
        parent: Uuid,
        child: Uuid,
        variables: Variables,
    ) -> Result<Vec<DriveItem>> {
        let lock = self.instance_lock(parent).await;
        let _guard = lock.lock().await;

        let Some(instance) = self.store.load_instance(parent).await? else {
            return Ok(Vec::new());
        };
        if instance.state.is_terminal() {
            return Ok(Vec::new());
        }
        let tokens = self.store.load_tokens_by_instance(parent).await?;
        let expected = WaitKey::CallActivity(child);
        let Some(waiting) = tokens
            .iter()
            .find(|t| t.waiting_for.as_ref() == Some(&expected))
        else {
            self.append(
                parent,
                &RuntimeEvent::StaleCallbackDropped {
                    token_id: child,
                    expected: None,
                    got: expected.to_string(),
                },
            )
            .await?;
            return Ok(Vec::new());
        };

        let mut token = waiting.clone();
        token.clear_waiting();
        token.merge_variables(&variables);
        self.store.save_token(&token).await?;
        self.append(
            parent,
            &RuntimeEvent::ChildInstanceCompleted {
                child_instance_id: child,
                parent_token_id: token.token_id,
            },
        )
        .await?;
        self.append(
            parent,
            &RuntimeEvent::TokenResumed {
                token_id: token.token_id,
                waiting_for: expected.to_string(),
            },
        )
        .await?;
        Ok(vec![DriveItem::Run(parent)])
    }

    async fn cancel_token_subscriptions(&self, instance_id: Uuid, token_id: Uuid) {
        if let Ok(subs) = self.store.load_subscriptions_by_instance(instance_id).await {
            for sub in subs {
                if sub.token_id == token_id && sub.status == SubscriptionStatus::Pending {
                    let _ = self.correlator.cancel_subscription(sub.subscription_id).await;
                }
            }
        }
    }

    async fn stale_callback(
        &self,
        instance_id: Uuid,
        token: &Token,
        record: &TimerRecord,
    ) -> Result<Vec<DriveItem>> {
        self.append(
            instance_id,
            &RuntimeEvent::StaleCallbackDropped {
                token_id: token.token_id,
                expected: token.waiting_for.as_ref().map(WaitKey::to_string),
                got: WaitKey::Timer(record.timer_id).to_string(),
            },
        )
        .await?;
        debug!(timer_id = %record.timer_id, token_id = %token.token_id, "stale timer dropped");
        Ok(Vec::new())
    }

    // ── Incidents ──

    pub(crate) async fn resolve_incident(
        &self,
        incident_id: Uuid,
        resolution: &str,
    ) -> Result<()> {
        let Some(mut incident) = self.store.load_incident(incident_id).await? else {
            anyhow::bail!("incident not found: {incident_id}");
        };
        if incident.resolved_at.is_some() {
            return Ok(());
        }
        let instance_id = incident.process_instance_id;
        let items = {
            let lock = self.instance_lock(instance_id).await;
            let _guard = lock.lock().await;

            incident.resolved_at = Some(Utc::now());
            incident.resolution = Some(resolution.to_string());
            incident.retry_count += 1;
            self.store.save_incident(&incident).await?;
            self.append(
                instance_id,
                &RuntimeEvent::IncidentResolved {
                    incident_id,
                    resolution: resolution.to_string(),
                },
            )
            .await?;

            let expected = WaitKey::Incident(incident_id);
            let Some(mut token) = self.store.load_token(incident.token_id).await? else {
                return Ok(());
            };
            if token.waiting_for.as_ref() != Some(&expected) {
                return Ok(());
            }
            // Resuming re-enters the failed step at the same element.
            token.clear_waiting();
            self.store.save_token(&token).await?;
            self.append(
                instance_id,
                &RuntimeEvent::TokenResumed {
                    token_id: token.token_id,
                    waiting_for: expected.to_string(),
                },
            )
            .await?;
            vec![DriveItem::Run(instance_id)]
        };
        self.process_items(items).await
    }

    /// Escalating an unresolved incident fails the whole instance.
    pub(crate) async fn escalate_incident(&self, incident_id: Uuid) -> Result<()> {
        let Some(incident) = self.store.load_incident(incident_id).await? else {
            anyhow::bail!("incident not found: {incident_id}");
        };
        let instance_id = incident.process_instance_id;
        let lock = self.instance_lock(instance_id).await;
        let guard = lock.lock().await;

        let Some(mut instance) = self.store.load_instance(instance_id).await? else {
            return Ok(());
        };
        if instance.state.is_terminal() {
            return Ok(());
        }
        let children = self.teardown_tokens(instance_id).await?;
        instance.state = InstanceState::Failed;
        instance.completed_at = Some(Utc::now());
        instance.updated_at = Utc::now();
        self.store.save_instance(&instance).await?;
        self.append(
            instance_id,
            &RuntimeEvent::InstanceFailed {
                instance_id,
                incident_id,
            },
        )
        .await?;
        warn!(instance_id = %instance_id, incident_id = %incident_id, "instance failed");
        drop(guard);
        for child in children {
            self.cancel_instance(child, "parent instance failed").await?;
        }
        Ok(())
    }

    // ── Cancellation ──

    /// Cancel the instance and, transitively, every child it is waiting
    /// on. Idempotent: cancelling a terminal instance is a no-op.
    pub(crate) async fn cancel_instance(&self, instance_id: Uuid, reason: &str) -> Result<()> {
        let mut queue = vec![(instance_id, reason.to_string())];
        while let Some((id, reason)) = queue.pop() {
            self.cancel_requests.write().await.insert(id);
            let lock = self.instance_lock(id).await;
            let guard = lock.lock().await;

            let children = match self.store.load_instance(id).await? {
                Some(instance) if !instance.state.is_terminal() => {
                    let mut instance = instance;
                    let children = self.teardown_tokens(id).await?;
                    instance.state = InstanceState::Cancelled;
                    instance.completed_at = Some(Utc::now());
                    instance.updated_at = Utc::now();
                    self.store.save_instance(&instance).await?;
                    self.append(
                        id,
                        &RuntimeEvent::InstanceCancelled {
                            instance_id: id,
                            reason: reason.clone(),
                        },
                    )
                    .await?;
                    info!(instance_id = %id, reason = %reason, "instance cancelled");
                    children
                }
                _ => Vec::new(),
            };
            drop(guard);
            self.cancel_requests.write().await.remove(&id);
            queue.extend(
                children
                    .into_iter()
                    .map(|child| (child, format!("parent cancelled: {reason}"))),
            );
        }
        Ok(())
    }

    /// Cancel all live tokens and their collaborator registrations.
    /// Returns the child instances the tokens were waiting on.
    async fn teardown_tokens(&self, instance_id: Uuid) -> Result<Vec<Uuid>> {
        let mut children = Vec::new();
        for token in self.store.load_tokens_by_instance(instance_id).await? {
            if token.state.is_terminal() {
                continue;
            }
            if let Some(WaitKey::CallActivity(child)) = &token.waiting_for {
                children.push(*child);
            }
            let mut token = token;
            token.state = TokenState::Cancelled;
            token.waiting_for = None;
            token.touch();
            self.store.save_token(&token).await?;
        }
        for timer in self.store.load_timers_by_instance(instance_id).await? {
            if timer.status == TimerStatus::Pending {
                self.cancel_timer(instance_id, timer.timer_id).await?;
            }
        }
        self.correlator.cancel_for_instance(instance_id).await?;
        self.jobs.cancel_for_instance(instance_id).await?;
        Ok(children)
    }

    // ── Recovery ──

    /// After a restart: re-arm the wheel from durable timer records and
    /// re-enqueue every ACTIVE token. WAITING tokens need nothing else —
    /// their wait keys, subscriptions, and jobs are already durable rows.
    pub(crate) async fn recover(&self) -> Result<()> {
        for record in self.store.load_pending_timers().await? {
            self.wheel
                .schedule(fired_payload(&record), record.due_at)
                .await;
        }
        let mut instances: Vec<Uuid> = self
            .store
            .load_tokens_by_state(TokenState::Active)
            .await?
            .into_iter()
            .map(|t| t.process_instance_id)
            .collect();
        instances.sort();
        instances.dedup();
        info!(instances = instances.len(), "recovery: re-driving active instances");
        self.process_items(instances.into_iter().map(DriveItem::Run).collect())
            .await
    }

    // ── Small helpers ──

    async fn instance_lock(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn cancel_requested(&self, instance_id: Uuid) -> bool {
        self.cancel_requests.read().await.contains(&instance_id)
    }

    async fn append(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<()> {
        self.store.append_event(instance_id, event).await?;
        Ok(())
    }

    async fn suspended_event(&self, instance_id: Uuid, token: &Token) -> Result<()> {
        if let Some(key) = &token.waiting_for {
            self.append(
                instance_id,
                &RuntimeEvent::TokenSuspended {
                    token_id: token.token_id,
                    element_id: token.current_element_id.clone(),
                    waiting_for: key.to_string(),
                },
            )
            .await?;
        }
        Ok(())
    }
}

// ─── Free helpers ─────────────────────────────────────────────

/// Overlay-first variable resolution.
fn scope_of(instance: &ProcessInstance, token: &Token) -> Variables {
    let mut scope = instance.variables.clone();
    for (k, v) in &token.variables {
        scope.insert(k.clone(), v.clone());
    }
    scope
}

fn is_gateway(el_type: &str) -> bool {
    matches!(
        el_type,
        element_type::EXCLUSIVE_GATEWAY
            | element_type::PARALLEL_GATEWAY
            | element_type::INCLUSIVE_GATEWAY
            | element_type::EVENT_BASED_GATEWAY
    )
}

fn fired_payload(record: &TimerRecord) -> TimerFired {
    TimerFired {
        timer_id: record.timer_id,
        element_id: record.element_id.clone(),
        token_id: record.token_id,
        process_instance_id: record.process_instance_id,
        kind: record.kind,
    }
}

fn cycle_budget(schedule: &TimerSchedule) -> Option<u32> {
    match schedule {
        TimerSchedule::Cycle { repeats, .. } => Some(repeats.unwrap_or(CYCLE_FIRE_CAP)),
        _ => None,
    }
}

/// Boundary error event attached to `activity_id` whose `error_code`
/// matches (empty or missing code catches everything).
fn find_error_boundary(
    def: &CompiledDefinition,
    activity_id: &str,
    code: &str,
) -> Option<String> {
    let mut catch_all = None;
    for boundary_id in def.boundary_events(activity_id) {
        let Ok(boundary) = def.element(boundary_id) else {
            continue;
        };
        if boundary.ext_string("timer_expression").is_some() {
            continue;
        }
        match boundary.ext_string("error_code") {
            Some(expected) if expected == code => return Some(boundary_id.clone()),
            Some("") | None if is_error_boundary(&boundary) => {
                catch_all.get_or_insert_with(|| boundary_id.clone());
            }
            _ => {}
        }
    }
    catch_all
}

/// A boundary event with no timer is an error boundary; `error_code`
/// narrows it to one code.
fn is_error_boundary(boundary: &ElementRef<'_>) -> bool {
    boundary.ext_string("timer_expression").is_none()
}
