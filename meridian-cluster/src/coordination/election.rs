use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionCandidate {
    pub id: String,
    pub registered_at: DateTime<Utc>,
    pub priority: i64,
}

/// Priority-ranked leader election among registered candidates.
///
/// The leader is the highest-priority candidate; ties go to the earliest
/// registration. `term` grows by one every time a new leader takes over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderElection {
    pub id: String,
    pub candidates: Vec<ElectionCandidate>,
    pub current_leader: Option<String>,
    pub term: u64,
}

impl LeaderElection {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            candidates: Vec::new(),
            current_leader: None,
            term: 0,
        }
    }

    /// Insert or update a candidate; returns true if leadership changed.
    ///
    /// Re-registering keeps the original registration time.
    pub fn register(&mut self, candidate: &str, priority: i64, now: DateTime<Utc>) -> bool {
        match self.candidates.iter_mut().find(|c| c.id == candidate) {
            Some(existing) => existing.priority = priority,
            None => self.candidates.push(ElectionCandidate {
                id: candidate.to_string(),
                registered_at: now,
                priority,
            }),
        }
        self.recompute()
    }

    /// Remove a candidate; `None` if it was not registered, otherwise
    /// whether leadership changed
    pub fn withdraw(&mut self, candidate: &str) -> Option<bool> {
        let index = self.candidates.iter().position(|c| c.id == candidate)?;
        self.candidates.remove(index);
        Some(self.recompute())
    }

    #[must_use]
    pub fn leader(&self) -> Option<(&str, u64)> {
        self.current_leader.as_deref().map(|id| (id, self.term))
    }

    fn recompute(&mut self) -> bool {
        let mut best: Option<&ElectionCandidate> = None;
        for candidate in &self.candidates {
            let better = best.is_none_or(|b| {
                candidate.priority > b.priority
                    || (candidate.priority == b.priority && candidate.registered_at < b.registered_at)
            });
            if better {
                best = Some(candidate);
            }
        }

        let winner = best.map(|c| c.id.clone());
        if winner == self.current_leader {
            return false;
        }
        if winner.is_some() {
            self.term += 1;
        }
        self.current_leader = winner;
        true
    }
}
