use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Variable scope: string → JSON value, exactly as the parser emits it.
pub type Variables = serde_json::Map<String, Value>;

/// SHA-256 fingerprint of a registered process definition.
pub type DefinitionVersion = [u8; 32];

// ─── Wait keys ────────────────────────────────────────────────

/// What a WAITING token is blocked on. Persisted as its canonical string
/// form (`timer:<id>`, `job:<key>`, `message:<name>:<corr>`,
/// `call_activity:<childId>`, `join:<elementId>`, `event_gateway:<elementId>`,
/// `incident:<id>`) so the row is self-describing after a restart.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WaitKey {
    Timer(Uuid),
    Job(Uuid),
    Message { name: String, correlation_key: String },
    CallActivity(Uuid),
    Join { element_id: String },
    EventGateway { element_id: String },
    Incident(Uuid),
}

impl fmt::Display for WaitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitKey::Timer(id) => write!(f, "timer:{id}"),
            WaitKey::Job(key) => write!(f, "job:{key}"),
            WaitKey::Message {
                name,
                correlation_key,
            } => write!(f, "message:{name}:{correlation_key}"),
            WaitKey::CallActivity(id) => write!(f, "call_activity:{id}"),
            WaitKey::Join { element_id } => write!(f, "join:{element_id}"),
            WaitKey::EventGateway { element_id } => write!(f, "event_gateway:{element_id}"),
            WaitKey::Incident(id) => write!(f, "incident:{id}"),
        }
    }
}

impl From<WaitKey> for String {
    fn from(key: WaitKey) -> String {
        key.to_string()
    }
}

impl TryFrom<String> for WaitKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let (prefix, rest) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed wait key: {s}"))?;
        let parse_uuid = |v: &str| Uuid::parse_str(v).map_err(|e| format!("wait key {s}: {e}"));
        match prefix {
            "timer" => Ok(WaitKey::Timer(parse_uuid(rest)?)),
            "job" => Ok(WaitKey::Job(parse_uuid(rest)?)),
            "message" => {
                let (name, corr) = rest
                    .split_once(':')
                    .ok_or_else(|| format!("malformed message wait key: {s}"))?;
                Ok(WaitKey::Message {
                    name: name.to_string(),
                    correlation_key: corr.to_string(),
                })
            }
            "call_activity" => Ok(WaitKey::CallActivity(parse_uuid(rest)?)),
            "join" => Ok(WaitKey::Join {
                element_id: rest.to_string(),
            }),
            "event_gateway" => Ok(WaitKey::EventGateway {
                element_id: rest.to_string(),
            }),
            "incident" => Ok(WaitKey::Incident(parse_uuid(rest)?)),
            other => Err(format!("unknown wait key prefix: {other}")),
        }
    }
}

// ─── Tokens ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenState {
    Active,
    Waiting,
    Completed,
    Cancelled,
}

impl TokenState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TokenState::Completed | TokenState::Cancelled)
    }
}

/// The unit of execution: a marker positioned on exactly one element of a
/// process instance. Suspension is explicit data — a WAITING token always
/// carries the `waiting_for` key its resume callback must match.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub token_id: Uuid,
    pub process_instance_id: Uuid,
    pub process_key: String,
    pub current_element_id: String,
    pub state: TokenState,
    pub waiting_for: Option<WaitKey>,
    /// Per-token variable overlay; reads resolve overlay-first, then instance.
    pub variables: Variables,
    /// Scratchpad for re-entrant executors (e.g. `call_activity_executed:<id>`).
    pub execution_context: Variables,
    /// Boundary timers armed while this token occupies an activity.
    pub boundary_timer_ids: HashSet<Uuid>,
    /// Timers armed by an event-based gateway race.
    pub event_timer_ids: HashSet<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Token {
    pub fn new(instance_id: Uuid, process_key: &str, element_id: &str) -> Self {
        let now = Utc::now();
        Self {
            token_id: Uuid::now_v7(),
            process_instance_id: instance_id,
            process_key: process_key.to_string(),
            current_element_id: element_id.to_string(),
            state: TokenState::Active,
            waiting_for: None,
            variables: Variables::new(),
            execution_context: Variables::new(),
            boundary_timer_ids: HashSet::new(),
            event_timer_ids: HashSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sibling with the same instance and a copy of this token's overlay —
    /// used by parallel splits.
    pub fn fork(&self, element_id: &str) -> Self {
        let mut child = Token::new(self.process_instance_id, &self.process_key, element_id);
        child.variables = self.variables.clone();
        child
    }

    pub fn is_waiting(&self) -> bool {
        self.state == TokenState::Waiting
    }

    /// I1: WAITING ⇔ waiting_for present.
    pub fn set_waiting(&mut self, key: WaitKey) {
        self.state = TokenState::Waiting;
        self.waiting_for = Some(key);
        self.touch();
    }

    pub fn clear_waiting(&mut self) {
        self.state = TokenState::Active;
        self.waiting_for = None;
        self.touch();
    }

    pub fn move_to(&mut self, element_id: &str) {
        self.current_element_id = element_id.to_string();
        self.touch();
    }

    pub fn merge_variables(&mut self, vars: &Variables) {
        for (k, v) in vars {
            self.variables.insert(k.clone(), v.clone());
        }
        self.touch();
    }

    pub fn context_flag(&self, key: &str) -> bool {
        matches!(self.execution_context.get(key), Some(Value::Bool(true)))
    }

    pub fn set_context_flag(&mut self, key: &str) {
        self.execution_context
            .insert(key.to_string(), Value::Bool(true));
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ─── Process instances ────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceState::Active)
    }
}

/// One running execution of a process definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub instance_id: Uuid,
    pub process_key: String,
    /// Fingerprint of the definition this instance started against;
    /// re-registration never affects in-flight instances.
    pub definition_version: DefinitionVersion,
    pub state: InstanceState,
    pub variables: Variables,
    pub parent_instance_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessInstance {
    pub fn new(
        process_key: &str,
        version: DefinitionVersion,
        variables: Variables,
        parent: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: Uuid::now_v7(),
            process_key: process_key.to_string(),
            definition_version: version,
            state: InstanceState::Active,
            variables,
            parent_instance_id: parent,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn merge_variables(&mut self, vars: &Variables) {
        for (k, v) in vars {
            self.variables.insert(k.clone(), v.clone());
        }
        self.updated_at = Utc::now();
    }
}

// ─── Timers ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerKind {
    Duration,
    Cycle,
    Date,
    Boundary,
    Event,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerStatus {
    Pending,
    Fired,
    Cancelled,
}

/// Durable record backing a scheduled wheel entry. The wheel itself is
/// volatile; recovery re-arms every PENDING record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerRecord {
    pub timer_id: Uuid,
    pub element_id: String,
    pub process_instance_id: Uuid,
    pub token_id: Option<Uuid>,
    pub kind: TimerKind,
    pub expression: String,
    pub scheduled_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub status: TimerStatus,
    /// Boundary timers only: whether firing cancels the enclosing activity.
    pub interrupting: bool,
    /// Cycle timers only: fires left before exhaustion.
    pub cycle_remaining: Option<u32>,
}

// ─── Message correlation ──────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Pending,
    Matched,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub process_instance_id: Uuid,
    pub token_id: Uuid,
    pub message_name: String,
    /// Evaluated once, at subscription time.
    pub correlation_key: String,
    pub created_at: DateTime<Utc>,
    pub status: SubscriptionStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub message_id: Uuid,
    pub name: String,
    pub correlation_key: String,
    pub variables: Variables,
    pub published_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub consumed_by: Option<Uuid>,
}

impl BufferedMessage {
    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.published_at + chrono::Duration::seconds(self.ttl_seconds as i64)
    }
}

// ─── Jobs ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Activatable,
    Activated,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// A work item handed to an external worker, pull-style.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub job_key: Uuid,
    pub job_type: String,
    pub process_instance_id: Uuid,
    pub element_id: String,
    pub token_id: Uuid,
    pub variables: Variables,
    pub retries: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub state: JobState,
    pub worker: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Incidents ────────────────────────────────────────────────

/// A pinned error state that pauses a token until external resolution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: Uuid,
    pub process_instance_id: Uuid,
    pub token_id: Uuid,
    pub element_id: String,
    /// Stable error code (`NO_DEFAULT_FLOW`, `CONNECTOR_ERROR`, ...).
    pub kind: String,
    pub message: String,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
}

/// Which variable map a job-completion callback targets. Defaults to the
/// token overlay; workers may address the instance map explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableScope {
    Token,
    Instance,
}

// ─── Status reporting ─────────────────────────────────────────

/// Transport-agnostic instance status snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance_id: Uuid,
    pub process_key: String,
    pub state: InstanceState,
    /// Element id of the most recently updated non-terminal token, if any.
    pub current_activity: Option<String>,
    pub variables: Variables,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
