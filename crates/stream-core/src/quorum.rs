//! # quorum
//!
//! why: decide whether an election attempt won a majority of votes
//! relations: owned by election.rs for the duration of one election
//! what: Quorum vote counter with sticky completion and forced stepdown

/// Counts vote outcomes of one election against a required threshold
///
/// The candidate's own vote is always pre-counted. The tracker neither
/// deduplicates voters nor derives the threshold from the membership; callers
/// supply `floor(n / 2) + 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Quorum {
    required_votes: usize,
    succeeded: usize,
    failed: usize,
    complete: bool,
    stepdown: bool,
}

impl Quorum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new election, counting the self-vote as a success
    pub fn open(&mut self, required_votes: usize) {
        self.required_votes = required_votes;
        self.succeeded = 1;
        self.failed = 0;
        self.complete = false;
        self.stepdown = false;
        self.check_complete();
    }

    /// Clear completion so the tracker can be reused
    pub fn close(&mut self) {
        self.complete = false;
    }

    fn check_complete(&mut self) {
        if !self.complete
            && (self.succeeded >= self.required_votes || self.failed >= self.required_votes)
        {
            self.complete = true;
        }
    }

    pub fn succeed(&mut self) -> &mut Self {
        self.succeeded += 1;
        self.check_complete();
        self
    }

    pub fn fail(&mut self) -> &mut Self {
        self.failed += 1;
        self.check_complete();
        self
    }

    /// Abandon the election, e.g. after observing a higher-term leader
    pub fn stepdown(&mut self) -> &mut Self {
        self.stepdown = true;
        self.complete = true;
        self
    }

    pub fn is_completed(&self) -> bool {
        self.complete
    }

    pub fn is_elected(&self) -> bool {
        !self.stepdown && self.succeeded >= self.required_votes
    }

    pub fn required_votes(&self) -> usize {
        self.required_votes
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub fn failed(&self) -> usize {
        self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_counts_self_vote() {
        let mut quorum = Quorum::new();
        quorum.open(2);

        assert_eq!(quorum.succeeded(), 1);
        assert_eq!(quorum.failed(), 0);
        assert!(!quorum.is_completed());
    }

    #[test]
    fn majority_of_successes_elects() {
        let mut quorum = Quorum::new();
        quorum.open(3);
        quorum.succeed().succeed();

        assert!(quorum.is_completed());
        assert!(quorum.is_elected());
    }

    #[test]
    fn stepdown_overrides_votes() {
        let mut quorum = Quorum::new();
        quorum.open(2);
        quorum.succeed();
        quorum.stepdown();

        assert!(quorum.is_completed());
        assert!(!quorum.is_elected());
    }
}
