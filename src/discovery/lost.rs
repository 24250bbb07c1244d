//! Two-phase tracking of entities that stop being sighted.
//!
//! Sightings are noisy: a device can miss a whole scan round without being
//! gone. The tracker therefore keeps two rounds of "seen" sets and only
//! reports an entity lost when it was absent for a full round, so entities go
//! quiet for one sweep (the grace period) before being reported on the next.

use std::collections::HashSet;
use std::hash::Hash;

/// Tracks found entities across sweep rounds for one service.
pub struct LostEntityTracker<E> {
    current_round: HashSet<E>,
    previous_round: HashSet<E>,
}

impl<E: Eq + Hash + Clone> LostEntityTracker<E> {
    pub fn new() -> Self {
        Self {
            current_round: HashSet::new(),
            previous_round: HashSet::new(),
        }
    }

    /// Records that `entity` was sighted this round.
    pub fn record_found(&mut self, entity: E) {
        self.current_round.insert(entity);
    }

    /// Removes `entity` from both rounds without reporting it lost.
    pub fn forget(&mut self, entity: &E) {
        self.current_round.remove(entity);
        self.previous_round.remove(entity);
    }

    /// Whether `entity` has been sighted in either live round.
    pub fn contains(&self, entity: &E) -> bool {
        self.current_round.contains(entity) || self.previous_round.contains(entity)
    }

    /// Closes the round: returns everything seen last round but not this one,
    /// then shifts the rounds.
    pub fn compute_lost_entities(&mut self) -> HashSet<E> {
        let lost = self
            .previous_round
            .difference(&self.current_round)
            .cloned()
            .collect();

        self.previous_round = std::mem::replace(&mut self.current_round, HashSet::new());
        lost
    }
}

impl<E: Eq + Hash + Clone> Default for LostEntityTracker<E> {
    fn default() -> Self {
        Self::new()
    }
}
