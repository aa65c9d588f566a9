use std::fmt;

/// Lifecycle of a replica. Stopped is the zero value; a replica moves through
/// Initialized and Running once before settling into one of the three Raft roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum State {
    #[default]
    Stopped,
    Initialized,
    Running,
    Follower,
    Candidate,
    Leader,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Stopped => "stopped",
            State::Initialized => "initialized",
            State::Running => "running",
            State::Follower => "follower",
            State::Candidate => "candidate",
            State::Leader => "leader",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_state_strings() {
        assert_eq!(State::default(), State::Stopped);
        let names = [
            (State::Stopped, "stopped"),
            (State::Initialized, "initialized"),
            (State::Running, "running"),
            (State::Follower, "follower"),
            (State::Candidate, "candidate"),
            (State::Leader, "leader"),
        ];
        for (state, name) in names {
            assert_eq!(state.to_string(), name);
        }
    }
}
