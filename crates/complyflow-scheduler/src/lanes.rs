//! Per-queue bookkeeping of waiting, running and finished runs.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::tasks::{ScheduledTask, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStats {
    pub queue: String,
    /// Pending tasks whose slot has arrived or will arrive.
    pub queued: usize,
    /// Runs in flight (running or retrying).
    pub active: usize,
    pub total_processed: u64,
}

#[derive(Debug, Default)]
struct LaneState {
    active: usize,
    total_processed: u64,
}

#[derive(Debug, Default)]
pub struct Lanes {
    lanes: Mutex<BTreeMap<String, LaneState>>,
}

impl Lanes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, queue: &str) {
        if let Ok(mut lanes) = self.lanes.lock() {
            let lane = lanes.entry(queue.to_string()).or_default();
            lane.active += 1;
            tracing::debug!("📥 Lane[{queue}] start (active: {})", lane.active);
        }
    }

    pub fn complete(&self, queue: &str) {
        if let Ok(mut lanes) = self.lanes.lock() {
            let lane = lanes.entry(queue.to_string()).or_default();
            lane.active = lane.active.saturating_sub(1);
            lane.total_processed += 1;
        }
    }

    /// Stats for every queue that has tasks or has processed runs.
    pub fn stats<'a>(&self, tasks: impl IntoIterator<Item = &'a ScheduledTask>) -> Vec<LaneStats> {
        let mut out: BTreeMap<String, LaneStats> = BTreeMap::new();
        for task in tasks {
            let stats = lane_entry(&mut out, &task.queue);
            if task.status == TaskStatus::Pending && task.next_run.is_some() {
                stats.queued += 1;
            }
        }
        if let Ok(lanes) = self.lanes.lock() {
            for (queue, lane) in lanes.iter() {
                let stats = lane_entry(&mut out, queue);
                stats.active = lane.active;
                stats.total_processed = lane.total_processed;
            }
        }
        out.into_values().collect()
    }
}

fn lane_entry<'m>(out: &'m mut BTreeMap<String, LaneStats>, queue: &str) -> &'m mut LaneStats {
    out.entry(queue.to_string()).or_insert_with(|| LaneStats {
        queue: queue.to_string(),
        queued: 0,
        active: 0,
        total_processed: 0,
    })
}
