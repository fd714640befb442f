//! flowlite-core: a token-scheduling workflow engine.
//!
//! Executes business processes parsed from a BPMN-style notation by
//! advancing tokens through the element graph. The moving parts:
//!
//! - [`store::ProcessStore`] — durable key/value persistence of every
//!   record (pluggable; [`store_memory::MemoryStore`] ships in-crate)
//! - [`wheel::TimingWheel`] — hierarchical wheel for relative-time firing
//! - [`correlator::MessageCorrelator`] — routes published messages to
//!   subscriptions by `(name, correlationKey)`, buffering with TTL
//! - [`jobs::JobDispatcher`] — pull-style work hand-off to external workers
//! - [`executors`] — one executor per element type behind a registry
//! - [`scheduler::TokenScheduler`] — the step loop: move, split, join,
//!   suspend, resume, all durable and serialized per instance
//! - [`engine::Engine`] — instance manager and public facade
//!
//! Suspension is explicit data: a waiting token persists the exact
//! `waiting_for` key its resume callback must present, which makes crash
//! recovery a re-registration pass and stale callbacks safe no-ops.

pub mod config;
pub mod correlator;
pub mod engine;
pub mod error;
pub mod events;
pub mod executors;
pub mod expression;
pub mod graph;
pub mod jobs;
pub mod process;
pub mod scheduler;
pub mod store;
pub mod store_memory;
pub mod timer;
pub mod types;
pub mod wheel;

pub use config::{EngineConfig, InclusiveJoinMode};
pub use engine::Engine;
pub use error::EngineError;
pub use store::ProcessStore;
pub use store_memory::MemoryStore;
pub use types::{
    InstanceState, InstanceStatus, Job, JobState, ProcessInstance, Token, TokenState, VariableScope,
    Variables, WaitKey,
};
