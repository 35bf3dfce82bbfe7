use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Barrier that latches open once enough distinct participants joined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedBarrier {
    pub id: String,
    pub required_participants: u32,
    pub current_participants: IndexSet<String>,
    /// Never reverts to `false` once set
    pub released: bool,
    pub released_at: Option<DateTime<Utc>>,
}

impl DistributedBarrier {
    #[must_use]
    pub fn new(id: impl Into<String>, required_participants: u32) -> Self {
        Self {
            id: id.into(),
            required_participants,
            current_participants: IndexSet::new(),
            released: false,
            released_at: None,
        }
    }

    /// Add a participant; rejoining is a no-op.
    ///
    /// Returns true only for the join that released the barrier.
    pub fn join(&mut self, participant: &str, now: DateTime<Utc>) -> bool {
        self.current_participants.insert(participant.to_string());

        if self.released || self.current_participants.len() < self.required_participants as usize {
            return false;
        }
        self.released = true;
        self.released_at = Some(now);
        true
    }

    #[must_use]
    pub fn waiting_for(&self) -> usize {
        (self.required_participants as usize).saturating_sub(self.current_participants.len())
    }
}
