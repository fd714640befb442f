//! Hierarchical timing wheel.
//!
//! Four levels of slots indexed by discrete ticks. Scheduling and
//! cancellation are O(1); `advance` walks the elapsed ticks, cascading
//! entries from coarser levels as their spans are entered, and fires
//! everything due in deadline order. The wheel is volatile — durable
//! `TimerRecord`s are the source of truth and recovery re-arms them.

use crate::types::TimerKind;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Callback payload delivered when a timer comes due.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimerFired {
    pub timer_id: Uuid,
    pub element_id: String,
    pub token_id: Option<Uuid>,
    pub process_instance_id: Uuid,
    pub kind: TimerKind,
}

const LEVELS: usize = 4;
const SLOTS: [u64; LEVELS] = [256, 64, 64, 64];

struct Entry {
    deadline_tick: u64,
    generation: u64,
    payload: TimerFired,
}

struct WheelInner {
    /// slots[level][slot] → pending entries.
    slots: Vec<Vec<Vec<Entry>>>,
    /// Live generation per timer id; entries carrying an older generation
    /// are tombstones and are dropped when encountered.
    generations: HashMap<Uuid, u64>,
    current_tick: u64,
    generation_counter: u64,
}

pub struct TimingWheel {
    inner: Mutex<WheelInner>,
    origin: DateTime<Utc>,
    tick: Duration,
}

impl TimingWheel {
    pub fn new(origin: DateTime<Utc>, tick: Duration) -> Self {
        let slots = SLOTS
            .iter()
            .map(|&n| (0..n).map(|_| Vec::new()).collect())
            .collect();
        Self {
            inner: Mutex::new(WheelInner {
                slots,
                generations: HashMap::new(),
                current_tick: 0,
                generation_counter: 0,
            }),
            origin,
            tick,
        }
    }

    fn tick_of(&self, at: DateTime<Utc>) -> u64 {
        let elapsed = (at - self.origin).num_milliseconds().max(0) as u64;
        elapsed / self.tick.as_millis().max(1) as u64
    }

    /// Arm (or re-arm — scheduling is idempotent per timer id) an entry.
    pub async fn schedule(&self, payload: TimerFired, due_at: DateTime<Utc>) {
        let mut w = self.inner.lock().await;
        let deadline_tick = self.tick_of(due_at).max(w.current_tick + 1);
        w.generation_counter += 1;
        let generation = w.generation_counter;
        w.generations.insert(payload.timer_id, generation);
        debug!(timer_id = %payload.timer_id, deadline_tick, "wheel: schedule");
        insert(&mut w, Entry {
            deadline_tick,
            generation,
            payload,
        });
    }

    /// Tombstone the timer; a pending entry for it will never fire.
    pub async fn cancel(&self, timer_id: Uuid) {
        let mut w = self.inner.lock().await;
        w.generations.remove(&timer_id);
    }

    /// Fire everything due at or before `now`, in deadline order.
    pub async fn advance(&self, now: DateTime<Utc>) -> Vec<TimerFired> {
        let target = self.tick_of(now);
        let mut w = self.inner.lock().await;
        let mut due: Vec<(u64, Entry)> = Vec::new();

        while w.current_tick < target {
            w.current_tick += 1;
            let tick = w.current_tick;

            // Entering a coarser slot boundary: pull its entries down.
            for level in 1..LEVELS {
                if tick % span(level - 1) == 0 {
                    let slot = ((tick / span(level - 1)) % SLOTS[level]) as usize;
                    let entries = std::mem::take(&mut w.slots[level][slot]);
                    for entry in entries {
                        if live(&w, &entry) {
                            insert(&mut w, entry);
                        }
                    }
                }
            }

            let slot = (tick % SLOTS[0]) as usize;
            let entries = std::mem::take(&mut w.slots[0][slot]);
            for entry in entries {
                if !live(&w, &entry) {
                    continue;
                }
                if entry.deadline_tick <= tick {
                    w.generations.remove(&entry.payload.timer_id);
                    due.push((entry.deadline_tick, entry));
                } else {
                    // Same slot, a later lap of the wheel.
                    insert(&mut w, entry);
                }
            }
        }

        due.sort_by(|a, b| {
            (a.0, a.1.payload.timer_id).cmp(&(b.0, b.1.payload.timer_id))
        });
        due.into_iter().map(|(_, e)| e.payload).collect()
    }

    /// Live (non-tombstoned) entries — diagnostics only.
    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.generations.len()
    }
}

fn live(w: &WheelInner, entry: &Entry) -> bool {
    w.generations.get(&entry.payload.timer_id) == Some(&entry.generation)
}

/// Ticks covered by one slot of the given level's *parent* granularity:
/// level 0 slots are 1 tick, level 1 slots are 256, level 2 slots 256·64, …
fn span(level: usize) -> u64 {
    SLOTS[..=level].iter().product()
}

fn insert(w: &mut WheelInner, entry: Entry) {
    let delta = entry.deadline_tick.saturating_sub(w.current_tick);
    let (level, slot) = if delta < span(0) {
        (0, (entry.deadline_tick % SLOTS[0]) as usize)
    } else {
        let mut chosen = LEVELS - 1;
        for level in 1..LEVELS {
            if delta < span(level) {
                chosen = level;
                break;
            }
        }
        (
            chosen,
            ((entry.deadline_tick / span(chosen - 1)) % SLOTS[chosen]) as usize,
        )
    };
    w.slots[level][slot].push(entry);
}
