// Session registry: at most one active workflow run per user session

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::{RelayError, Result};

/// Maps a session id to the run currently active for it
///
/// Claims go through the DashMap entry API, so two concurrent triggers for
/// the same session race on one shard lock and exactly one of them wins.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    active: DashMap<String, Uuid>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `run_id` as the active run for `session_id`
    pub fn try_claim(&self, session_id: &str, run_id: Uuid) -> Result<()> {
        match self.active.entry(session_id.to_string()) {
            Entry::Occupied(existing) => Err(RelayError::ConcurrentTrigger {
                session_id: session_id.to_string(),
                active_run_id: *existing.get(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(run_id);
                Ok(())
            }
        }
    }

    /// Clears the marker, but only if it still points at `run_id`
    pub fn release(&self, session_id: &str, run_id: Uuid) -> bool {
        self.active
            .remove_if(session_id, |_, active| *active == run_id)
            .is_some()
    }

    pub fn active_run(&self, session_id: &str) -> Option<Uuid> {
        self.active.get(session_id).map(|entry| *entry.value())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
