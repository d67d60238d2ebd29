//! Roster convergence.
//!
//! Each round a member sends its roster to every reachable peer. A peer
//! answers with whether the rosters matched and with the entries the sender
//! was missing. Once every peer asked in the current round has reported a
//! match, the member is stable and gossip stops for good.

use crate::message::{Roster, RosterAdd, RosterSync};

/// Bookkeeping for the gossip round in flight.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GossipRound {
    attempt: u64,
    request_count: usize,
    match_count: usize,
}

impl GossipRound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the next round, expecting replies from `request_count` peers.
    /// Returns the new attempt number.
    pub fn begin(&mut self, request_count: usize) -> u64 {
        self.attempt += 1;
        self.request_count = request_count;
        self.match_count = 0;
        self.attempt
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    pub fn match_count(&self) -> usize {
        self.match_count
    }

    /// Counts a reply toward the current round.
    ///
    /// Replies echoing an older attempt are ignored so a slow answer can
    /// never complete a newer round. Returns true when the reply counted.
    pub fn record_reply(&mut self, attempt: u64, is_match: bool) -> bool {
        if !is_match || attempt != self.attempt || self.attempt == 0 {
            return false;
        }
        self.match_count += 1;
        true
    }

    /// Every peer asked this round agreed; trivially true with no peers.
    pub fn is_complete(&self) -> bool {
        self.attempt > 0 && self.match_count >= self.request_count
    }
}

/// Entries of `ours` that `theirs` does not know about.
pub fn missing_from(ours: &Roster, theirs: &Roster) -> Roster {
    ours.iter()
        .filter(|(name, _)| !theirs.contains_key(*name))
        .map(|(name, status)| (name.clone(), *status))
        .collect()
}

/// Builds the answer to a peer's `roster:sync`.
///
/// The match is decided against `ours` as it was before merging anything
/// from the sender.
pub fn answer_sync(local_name: &str, ours: &Roster, sync: &RosterSync) -> RosterAdd {
    RosterAdd {
        name: local_name.to_string(),
        attempt: sync.attempt,
        is_match: ours == &sync.roster,
        add: missing_from(ours, &sync.roster),
    }
}

/// Names in `incoming` that are not yet part of `known`.
pub fn unknown_names<'a>(known: &Roster, incoming: &'a Roster) -> Vec<&'a str> {
    incoming
        .keys()
        .filter(|name| !known.contains_key(*name))
        .map(String::as_str)
        .collect()
}
