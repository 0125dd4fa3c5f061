//! Randomized election timeouts and the vote-grant predicate.
//!
//! The predicate in [`would_grant_vote`] is deliberately side-effect free so
//! it can back both the real `RequestVote` handler and an optional pre-vote
//! phase that precedes real candidacy: pre-vote asks the same
//! question without bumping the term or touching persistent state, so a
//! partitioned server that can't win never disrupts the cluster's term
//! sequence.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::RaftConfig;
use crate::types::{LogIndex, ServerId, Term};

/// Draws a timeout uniformly from `[election_timeout, 2 * election_timeout)`.
pub fn random_election_timeout(cfg: &RaftConfig) -> Duration {
    let base = cfg.election_timeout.as_millis() as u64;
    let extra = rand::thread_rng().gen_range(0..base.max(1));
    Duration::from_millis(base + extra)
}

/// The predicate behind both pre-vote and real `RequestVote` handling.
///
/// Grants iff the candidate's term is at least ours, we have not already
/// voted for someone else in that term, and the candidate's log is at least
/// as up to date as ours (higher last-log-term, or an equal term with an
/// index at least as large).
#[allow(clippy::too_many_arguments)]
pub fn would_grant_vote(
    our_current_term: Term,
    our_voted_for: Option<ServerId>,
    our_last_log_term: Term,
    our_last_log_index: LogIndex,
    candidate_term: Term,
    candidate_id: ServerId,
    candidate_last_log_term: Term,
    candidate_last_log_index: LogIndex,
) -> bool {
    if candidate_term < our_current_term {
        return false;
    }

    let up_to_date = candidate_last_log_term > our_last_log_term
        || (candidate_last_log_term == our_last_log_term && candidate_last_log_index >= our_last_log_index);
    if !up_to_date {
        return false;
    }

    // A strictly higher term implies we have no recorded vote for it yet.
    if candidate_term > our_current_term {
        return true;
    }

    match our_voted_for {
        Some(id) => id == candidate_id,
        None => true,
    }
}

/// Tracks an in-progress campaign, real or pre-vote.
#[derive(Debug, Clone)]
pub struct CandidateState {
    pub is_pre_vote: bool,
    pub election_start: Instant,
    pub election_timeout: Duration,
    pub votes_received: HashSet<ServerId>,
    pub some_rejected: bool,
}

impl CandidateState {
    pub fn new(now: Instant, election_timeout: Duration, is_pre_vote: bool) -> Self {
        CandidateState {
            is_pre_vote,
            election_start: now,
            election_timeout,
            votes_received: HashSet::new(),
            some_rejected: false,
        }
    }

    /// Votes received so far, including our own self-vote.
    pub fn vote_count(&self) -> usize {
        1 + self.votes_received.len()
    }

    pub fn record_reply(&mut self, from: ServerId, granted: bool) {
        if granted {
            self.votes_received.insert(from);
        } else {
            self.some_rejected = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_when_log_is_more_up_to_date() {
        assert!(would_grant_vote(1, None, 1, 5, 2, 9, 2, 5));
        assert!(would_grant_vote(1, None, 1, 5, 1, 9, 1, 5));
        assert!(!would_grant_vote(1, None, 1, 5, 1, 9, 1, 4));
    }

    #[test]
    fn refuses_stale_term() {
        assert!(!would_grant_vote(5, None, 1, 1, 4, 9, 1, 1));
    }

    #[test]
    fn refuses_to_change_vote_within_same_term() {
        assert!(!would_grant_vote(3, Some(2), 1, 1, 3, 9, 1, 1));
        assert!(would_grant_vote(3, Some(9), 1, 1, 3, 9, 1, 1));
    }

    #[test]
    fn higher_term_always_eligible_for_a_fresh_vote() {
        assert!(would_grant_vote(3, Some(2), 1, 1, 4, 9, 1, 1));
    }

    #[test]
    fn timeout_is_within_configured_bounds() {
        let cfg = RaftConfig::default();
        for _ in 0..100 {
            let t = random_election_timeout(&cfg);
            assert!(t >= cfg.election_timeout);
            assert!(t < cfg.election_timeout * 2);
        }
    }
}
