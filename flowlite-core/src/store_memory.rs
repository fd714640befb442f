use crate::events::RuntimeEvent;
use crate::process::ProcessDefinition;
use crate::store::ProcessStore;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

struct Inner {
    definitions: HashMap<String, ProcessDefinition>,
    instances: HashMap<Uuid, ProcessInstance>,
    tokens: HashMap<Uuid, Token>,
    /// Secondary index: instance → token ids, in creation order.
    instance_tokens: HashMap<Uuid, Vec<Uuid>>,
    timers: HashMap<Uuid, TimerRecord>,
    subscriptions: HashMap<Uuid, Subscription>,
    messages: HashMap<Uuid, BufferedMessage>,
    jobs: HashMap<Uuid, Job>,
    /// Jobs in creation order, for FIFO activation.
    job_order: Vec<Uuid>,
    incidents: HashMap<Uuid, Incident>,
    events: HashMap<Uuid, Vec<(u64, RuntimeEvent)>>,
    event_seq: HashMap<Uuid, u64>,
}

/// In-memory implementation of `ProcessStore` for tests and single-node use.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                definitions: HashMap::new(),
                instances: HashMap::new(),
                tokens: HashMap::new(),
                instance_tokens: HashMap::new(),
                timers: HashMap::new(),
                subscriptions: HashMap::new(),
                messages: HashMap::new(),
                jobs: HashMap::new(),
                job_order: Vec::new(),
                incidents: HashMap::new(),
                events: HashMap::new(),
                event_seq: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    // ── Definitions ──

    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<()> {
        let mut w = self.inner.write().await;
        w.definitions
            .insert(definition.process_key.clone(), definition.clone());
        Ok(())
    }

    async fn load_definition(&self, process_key: &str) -> Result<Option<ProcessDefinition>> {
        let r = self.inner.read().await;
        Ok(r.definitions.get(process_key).cloned())
    }

    // ── Instances ──

    async fn save_instance(&self, instance: &ProcessInstance) -> Result<()> {
        let mut w = self.inner.write().await;
        w.instances.insert(instance.instance_id, instance.clone());
        Ok(())
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>> {
        let r = self.inner.read().await;
        Ok(r.instances.get(&id).cloned())
    }

    async fn list_instances(
        &self,
        state: Option<InstanceState>,
        process_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ProcessInstance>> {
        let r = self.inner.read().await;
        let mut out: Vec<ProcessInstance> = r
            .instances
            .values()
            .filter(|i| state.map_or(true, |s| i.state == s))
            .filter(|i| process_key.map_or(true, |k| i.process_key == k))
            .cloned()
            .collect();
        out.sort_by_key(|i| (i.started_at, i.instance_id));
        out.truncate(limit);
        Ok(out)
    }

    // ── Tokens ──

    async fn save_token(&self, token: &Token) -> Result<()> {
        let mut w = self.inner.write().await;
        let known = w.tokens.contains_key(&token.token_id);
        w.tokens.insert(token.token_id, token.clone());
        if !known {
            w.instance_tokens
                .entry(token.process_instance_id)
                .or_default()
                .push(token.token_id);
        }
        Ok(())
    }

    async fn load_token(&self, id: Uuid) -> Result<Option<Token>> {
        let r = self.inner.read().await;
        Ok(r.tokens.get(&id).cloned())
    }

    async fn load_tokens_by_instance(&self, instance_id: Uuid) -> Result<Vec<Token>> {
        let r = self.inner.read().await;
        Ok(r.instance_tokens
            .get(&instance_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| r.tokens.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn load_tokens_by_state(&self, state: TokenState) -> Result<Vec<Token>> {
        let r = self.inner.read().await;
        Ok(r.tokens
            .values()
            .filter(|t| t.state == state)
            .cloned()
            .collect())
    }

    // ── Timers ──

    async fn save_timer(&self, timer: &TimerRecord) -> Result<()> {
        let mut w = self.inner.write().await;
        w.timers.insert(timer.timer_id, timer.clone());
        Ok(())
    }

    async fn load_timer(&self, id: Uuid) -> Result<Option<TimerRecord>> {
        let r = self.inner.read().await;
        Ok(r.timers.get(&id).cloned())
    }

    async fn load_timers_by_instance(&self, instance_id: Uuid) -> Result<Vec<TimerRecord>> {
        let r = self.inner.read().await;
        Ok(r.timers
            .values()
            .filter(|t| t.process_instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn load_pending_timers(&self) -> Result<Vec<TimerRecord>> {
        let r = self.inner.read().await;
        Ok(r.timers
            .values()
            .filter(|t| t.status == TimerStatus::Pending)
            .cloned()
            .collect())
    }

    // ── Subscriptions ──

    async fn save_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut w = self.inner.write().await;
        w.subscriptions
            .insert(subscription.subscription_id, subscription.clone());
        Ok(())
    }

    async fn load_subscription(&self, id: Uuid) -> Result<Option<Subscription>> {
        let r = self.inner.read().await;
        Ok(r.subscriptions.get(&id).cloned())
    }

    async fn load_subscriptions_by_instance(&self, instance_id: Uuid) -> Result<Vec<Subscription>> {
        let r = self.inner.read().await;
        Ok(r.subscriptions
            .values()
            .filter(|s| s.process_instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn find_pending_subscriptions(
        &self,
        name: &str,
        correlation_key: &str,
    ) -> Result<Vec<Subscription>> {
        let r = self.inner.read().await;
        let mut out: Vec<Subscription> = r
            .subscriptions
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Pending
                    && s.message_name == name
                    && s.correlation_key == correlation_key
            })
            .cloned()
            .collect();
        out.sort_by_key(|s| (s.created_at, s.subscription_id));
        Ok(out)
    }

    // ── Buffered messages ──

    async fn save_message(&self, message: &BufferedMessage) -> Result<()> {
        let mut w = self.inner.write().await;
        w.messages.insert(message.message_id, message.clone());
        Ok(())
    }

    async fn find_buffered_messages(
        &self,
        name: &str,
        correlation_key: &str,
    ) -> Result<Vec<BufferedMessage>> {
        let r = self.inner.read().await;
        let mut out: Vec<BufferedMessage> = r
            .messages
            .values()
            .filter(|m| {
                m.consumed_by.is_none() && m.name == name && m.correlation_key == correlation_key
            })
            .cloned()
            .collect();
        out.sort_by_key(|m| (m.published_at, m.message_id));
        Ok(out)
    }

    async fn purge_expired_messages(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut w = self.inner.write().await;
        let before = w.messages.len();
        w.messages
            .retain(|_, m| m.consumed_by.is_some() || !m.expired_at(now));
        Ok(before - w.messages.len())
    }

    // ── Jobs ──

    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut w = self.inner.write().await;
        if !w.jobs.contains_key(&job.job_key) {
            w.job_order.push(job.job_key);
        }
        w.jobs.insert(job.job_key, job.clone());
        Ok(())
    }

    async fn load_job(&self, key: Uuid) -> Result<Option<Job>> {
        let r = self.inner.read().await;
        Ok(r.jobs.get(&key).cloned())
    }

    async fn load_jobs_by_instance(&self, instance_id: Uuid) -> Result<Vec<Job>> {
        let r = self.inner.read().await;
        Ok(r.jobs
            .values()
            .filter(|j| j.process_instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn load_activatable_jobs(&self, job_type: &str, max: usize) -> Result<Vec<Job>> {
        let r = self.inner.read().await;
        Ok(r.job_order
            .iter()
            .filter_map(|key| r.jobs.get(key))
            .filter(|j| j.state == JobState::Activatable && j.job_type == job_type)
            .take(max)
            .cloned()
            .collect())
    }

    async fn load_activated_jobs(&self) -> Result<Vec<Job>> {
        let r = self.inner.read().await;
        Ok(r.jobs
            .values()
            .filter(|j| j.state == JobState::Activated)
            .cloned()
            .collect())
    }

    // ── Incidents ──

    async fn save_incident(&self, incident: &Incident) -> Result<()> {
        let mut w = self.inner.write().await;
        w.incidents.insert(incident.incident_id, incident.clone());
        Ok(())
    }

    async fn load_incident(&self, id: Uuid) -> Result<Option<Incident>> {
        let r = self.inner.read().await;
        Ok(r.incidents.get(&id).cloned())
    }

    async fn load_incidents_by_instance(&self, instance_id: Uuid) -> Result<Vec<Incident>> {
        let r = self.inner.read().await;
        Ok(r.incidents
            .values()
            .filter(|i| i.process_instance_id == instance_id)
            .cloned()
            .collect())
    }

    // ── Event log ──

    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<u64> {
        let mut w = self.inner.write().await;
        let seq = w.event_seq.entry(instance_id).or_insert(0);
        *seq += 1;
        let current = *seq;
        w.events
            .entry(instance_id)
            .or_default()
            .push((current, event.clone()));
        Ok(current)
    }

    async fn read_events(
        &self,
        instance_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>> {
        let r = self.inner.read().await;
        Ok(r.events
            .get(&instance_id)
            .map(|evts| {
                evts.iter()
                    .filter(|(seq, _)| *seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    // ── Retention ──

    async fn purge_instance(&self, instance_id: Uuid) -> Result<bool> {
        let mut w = self.inner.write().await;

        let terminal = w
            .instances
            .get(&instance_id)
            .map(|i| i.state.is_terminal())
            .unwrap_or(false);
        if !terminal {
            return Ok(false);
        }

        let token_ids: Vec<Uuid> = w
            .instance_tokens
            .get(&instance_id)
            .cloned()
            .unwrap_or_default();
        let tokens_done = token_ids
            .iter()
            .filter_map(|id| w.tokens.get(id))
            .all(|t| t.state.is_terminal());
        let timers_done = w
            .timers
            .values()
            .filter(|t| t.process_instance_id == instance_id)
            .all(|t| t.status != TimerStatus::Pending);
        let subs_done = w
            .subscriptions
            .values()
            .filter(|s| s.process_instance_id == instance_id)
            .all(|s| s.status != SubscriptionStatus::Pending);
        let jobs_done = w
            .jobs
            .values()
            .filter(|j| j.process_instance_id == instance_id)
            .all(|j| j.state.is_terminal());

        if !(tokens_done && timers_done && subs_done && jobs_done) {
            return Ok(false);
        }

        for id in token_ids {
            w.tokens.remove(&id);
        }
        w.instance_tokens.remove(&instance_id);
        w.timers.retain(|_, t| t.process_instance_id != instance_id);
        w.subscriptions
            .retain(|_, s| s.process_instance_id != instance_id);
        let removed_jobs: Vec<Uuid> = w
            .jobs
            .values()
            .filter(|j| j.process_instance_id == instance_id)
            .map(|j| j.job_key)
            .collect();
        for key in &removed_jobs {
            w.jobs.remove(key);
        }
        w.job_order.retain(|key| !removed_jobs.contains(key));
        w.incidents
            .retain(|_, i| i.process_instance_id != instance_id);
        w.events.remove(&instance_id);
        w.event_seq.remove(&instance_id);
        w.instances.remove(&instance_id);
        Ok(true)
    }
}
