use std::collections::HashMap;

/// The ballots of a single leader election round. The set of voters is fixed when the
/// election is created; votes from anyone else are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Election {
    votes: HashMap<u32, bool>,
}

impl Election {
    pub fn new<I: IntoIterator<Item = u32>>(peers: I) -> Self {
        Self {
            votes: peers.into_iter().map(|pid| (pid, false)).collect(),
        }
    }

    /// Records the ballot of `pid`. Ballots from peers outside the election are dropped.
    pub fn vote(&mut self, pid: u32, granted: bool) {
        if let Some(vote) = self.votes.get_mut(&pid) {
            *vote = granted;
        }
    }

    pub fn majority(&self) -> usize {
        self.votes.len() / 2 + 1
    }

    pub fn votes(&self) -> usize {
        self.votes.values().filter(|&&granted| granted).count()
    }

    pub fn passed(&self) -> bool {
        self.votes() >= self.majority()
    }
}
