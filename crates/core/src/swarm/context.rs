//! # Run Context
//!
//! Cancellation state for the single active pipeline run: a flag checked at
//! every stage and agent start, plus the kill handles of every live worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::worker::KillHandle;

#[derive(Debug, Default)]
pub struct RunContext {
    cancelled: AtomicBool,
    live: Mutex<HashMap<String, KillHandle>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Set the flag, kill every tracked worker and forget them.
    /// Returns how many workers were signalled.
    pub fn cancel(&self) -> usize {
        self.cancelled.store(true, Ordering::SeqCst);

        let handles = self.drain_live();

        for (agent_id, handle) in &handles {
            tracing::debug!(agent_id = %agent_id, "Sending kill to worker");
            handle.kill();
        }
        handles.len()
    }

    /// Clear the flag for a new run. Workers still tracked from an abandoned
    /// run are killed rather than forgotten. Returns how many were signalled.
    pub fn reset(&self) -> usize {
        let stale = self.drain_live();
        for (agent_id, handle) in &stale {
            tracing::warn!(agent_id = %agent_id, "Killing worker left over from a previous run");
            handle.kill();
        }
        self.cancelled.store(false, Ordering::SeqCst);
        stale.len()
    }

    fn drain_live(&self) -> Vec<(String, KillHandle)> {
        match self.live.lock() {
            Ok(mut live) => live.drain().collect(),
            Err(poisoned) => poisoned.into_inner().drain().collect(),
        }
    }

    pub fn track(&self, agent_id: &str, handle: KillHandle) {
        if let Ok(mut live) = self.live.lock() {
            live.insert(agent_id.to_string(), handle);
        }
    }

    pub fn untrack(&self, agent_id: &str) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(agent_id);
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }
}
