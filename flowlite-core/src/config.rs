use std::time::Duration;

/// How an inclusive (OR) join decides that no further token can arrive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InclusiveJoinMode {
    /// Use reachability precomputed from the graph at registration: the join
    /// fires once no live sibling token can still reach it.
    Static,
    /// Conservative: behave like a parallel join and wait for every
    /// incoming flow.
    WaitAll,
}

/// Engine tuning knobs. `Default` matches production settings.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Timing-wheel tick resolution. Must be ≤ 100 ms.
    pub tick_resolution: Duration,
    /// Steps a single token may take without suspending before the
    /// scheduler raises a runaway-loop incident.
    pub max_burst_steps: u32,
    pub inclusive_join: InclusiveJoinMode,
    /// Activation lease granted to workers when none is requested.
    pub default_job_timeout: Duration,
    /// TTL applied to published messages that carry none.
    pub default_message_ttl_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_resolution: Duration::from_millis(100),
            max_burst_steps: 10_000,
            inclusive_join: InclusiveJoinMode::Static,
            default_job_timeout: Duration::from_secs(300),
            default_message_ttl_seconds: 3600,
        }
    }
}
