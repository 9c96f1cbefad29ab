//! # election
//!
//! why: decide which node may run the stream processor of a partition
//! relations: uses quorum.rs to count votes; vote outcomes arrive from a network layer
//! what: NodeRole enum, ElectionCoordinator owning term, role and known leader

use serde::{Deserialize, Serialize};

use crate::quorum::Quorum;

/// The three roles a node can have for a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Passive, follows the current leader
    Follower,
    /// Collecting votes to become leader
    Candidate,
    /// Owns the partition and runs its stream processor
    Leader,
}

impl Default for NodeRole {
    fn default() -> Self {
        Self::Follower
    }
}

/// Result of feeding a vote into a running election
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// Not enough votes either way yet
    Pending,
    Elected,
    /// Majority rejected, or the election was abandoned
    Lost,
}

/// Owns the leadership state of one partition on one node
///
/// This is the only place the known leader id is mutated; everything else
/// reads it through the accessors.
#[derive(Debug)]
pub struct ElectionCoordinator {
    node_id: u64,
    members: Vec<u64>,
    term: u64,
    role: NodeRole,
    leader: Option<u64>,
    quorum: Quorum,
}

impl ElectionCoordinator {
    /// Create a coordinator for `node_id` within `members` (including itself)
    pub fn new(node_id: u64, members: Vec<u64>) -> Self {
        Self {
            node_id,
            members,
            term: 0,
            role: NodeRole::Follower,
            leader: None,
            quorum: Quorum::new(),
        }
    }

    /// Majority among the full membership
    pub fn required_votes(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Begin a new election in the next term and return that term
    pub fn start_election(&mut self) -> u64 {
        self.term += 1;
        self.role = NodeRole::Candidate;
        self.leader = None;
        self.quorum.open(self.required_votes());
        // a single-member partition is decided by the self-vote alone
        self.settle();
        self.term
    }

    /// Record the answer of one voter for the election in `term`
    ///
    /// Responses for other terms are ignored; a response carrying a higher
    /// term makes this node step down and follow that term.
    pub fn on_vote(&mut self, term: u64, granted: bool) -> ElectionOutcome {
        if term > self.term {
            self.observe_term(term, None);
            return ElectionOutcome::Lost;
        }
        if self.role != NodeRole::Candidate || term != self.term {
            return self.outcome();
        }

        if granted {
            self.quorum.succeed();
        } else {
            self.quorum.fail();
        }
        self.settle().unwrap_or(ElectionOutcome::Pending)
    }

    /// A leader (or a higher term) was observed on the network
    pub fn observe_leader(&mut self, term: u64, leader_id: u64) {
        if term < self.term {
            return;
        }
        self.observe_term(term, Some(leader_id));
    }

    fn observe_term(&mut self, term: u64, leader: Option<u64>) {
        if self.role == NodeRole::Candidate {
            self.quorum.stepdown();
        }
        self.term = term;
        self.role = if leader == Some(self.node_id) {
            NodeRole::Leader
        } else {
            NodeRole::Follower
        };
        self.leader = leader;
    }

    /// Apply a completed quorum to the role, if the election is decided
    fn settle(&mut self) -> Option<ElectionOutcome> {
        if !self.quorum.is_completed() {
            return None;
        }
        let outcome = if self.quorum.is_elected() {
            self.role = NodeRole::Leader;
            self.leader = Some(self.node_id);
            ElectionOutcome::Elected
        } else {
            self.role = NodeRole::Follower;
            ElectionOutcome::Lost
        };
        self.quorum.close();
        Some(outcome)
    }

    fn outcome(&self) -> ElectionOutcome {
        match self.role {
            NodeRole::Leader => ElectionOutcome::Elected,
            NodeRole::Candidate => ElectionOutcome::Pending,
            NodeRole::Follower => ElectionOutcome::Lost,
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn members(&self) -> &[u64] {
        &self.members
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn leader(&self) -> Option<u64> {
        self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_coordinator_starts_as_follower() {
        let coordinator = ElectionCoordinator::new(1, vec![1, 2, 3]);
        assert_eq!(coordinator.role(), NodeRole::Follower);
        assert_eq!(coordinator.term(), 0);
        assert_eq!(coordinator.leader(), None);
    }

    #[test]
    fn single_member_elects_itself() {
        let mut coordinator = ElectionCoordinator::new(1, vec![1]);
        coordinator.start_election();

        assert!(coordinator.is_leader());
        assert_eq!(coordinator.leader(), Some(1));
    }
}
