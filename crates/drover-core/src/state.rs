//! The lifecycle state shared by builds and jobs.

use serde::{Deserialize, Serialize};

/// State of a build or a job.
///
/// Jobs move forward through `Created -> Queued -> Started` and end in one of
/// the four terminal states. A build's state is derived from its jobs, see
/// [`crate::build::aggregate_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Created with its build, not yet handed to the work queue.
    #[default]
    Created,
    /// Handed to the work queue, waiting for a worker.
    Queued,
    /// A worker picked it up.
    Started,
    Passed,
    Failed,
    Errored,
    Canceled,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            State::Passed | State::Failed | State::Errored | State::Canceled
        )
    }

    /// Position in the lifecycle. All terminal states share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            State::Created => 0,
            State::Queued => 1,
            State::Started => 2,
            State::Passed | State::Failed | State::Errored | State::Canceled => 3,
        }
    }

    /// Whether a job may move from `self` to `next`.
    ///
    /// Jobs take every step in order: `Created -> Queued -> Started`, then
    /// `Passed` or `Failed`. `Errored` and `Canceled` may end any unfinished
    /// job, which covers explicit cancellation and workers that error out
    /// before reporting a start. Terminal states never change.
    pub fn can_transition_to(&self, next: State) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, State::Errored | State::Canceled) => true,
            (State::Created, State::Queued)
            | (State::Queued, State::Started)
            | (State::Started, State::Passed | State::Failed) => true,
            _ => false,
        }
    }

    /// Whether a derived state such as a build's may move from `self` to
    /// `next`. Aggregates only move forward but may skip ranks.
    pub fn advances_to(&self, next: State) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Created => "created",
            State::Queued => "queued",
            State::Started => "started",
            State::Passed => "passed",
            State::Failed => "failed",
            State::Errored => "errored",
            State::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(State::Created),
            "queued" => Ok(State::Queued),
            "started" => Ok(State::Started),
            "passed" => Ok(State::Passed),
            "failed" => Ok(State::Failed),
            "errored" => Ok(State::Errored),
            // Both spellings show up in worker payloads.
            "canceled" | "cancelled" => Ok(State::Canceled),
            _ => Err(format!("Unknown state: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!State::Created.is_terminal());
        assert!(!State::Queued.is_terminal());
        assert!(!State::Started.is_terminal());
        assert!(State::Passed.is_terminal());
        assert!(State::Failed.is_terminal());
        assert!(State::Errored.is_terminal());
        assert!(State::Canceled.is_terminal());
    }

    #[test]
    fn test_transitions_are_monotonic() {
        assert!(State::Created.can_transition_to(State::Queued));
        assert!(State::Queued.can_transition_to(State::Started));
        assert!(State::Started.can_transition_to(State::Passed));
        assert!(State::Created.can_transition_to(State::Canceled));

        assert!(!State::Started.can_transition_to(State::Queued));
        assert!(!State::Started.can_transition_to(State::Started));
        assert!(!State::Passed.can_transition_to(State::Failed));
        assert!(!State::Canceled.can_transition_to(State::Started));
    }

    #[test]
    fn test_job_transitions_do_not_skip_steps() {
        assert!(!State::Created.can_transition_to(State::Started));
        assert!(!State::Created.can_transition_to(State::Passed));
        assert!(!State::Queued.can_transition_to(State::Failed));
        assert!(!State::Queued.can_transition_to(State::Passed));

        assert!(State::Queued.can_transition_to(State::Errored));
        assert!(State::Created.can_transition_to(State::Errored));
        assert!(State::Queued.can_transition_to(State::Canceled));
        assert!(State::Started.can_transition_to(State::Canceled));
    }

    #[test]
    fn test_aggregates_may_skip_ranks() {
        assert!(State::Created.advances_to(State::Started));
        assert!(State::Created.advances_to(State::Passed));
        assert!(State::Queued.advances_to(State::Failed));

        assert!(!State::Started.advances_to(State::Queued));
        assert!(!State::Started.advances_to(State::Started));
        assert!(!State::Failed.advances_to(State::Passed));
    }

    #[test]
    fn test_parse_state() {
        assert_eq!("passed".parse::<State>().unwrap(), State::Passed);
        assert_eq!("FAILED".parse::<State>().unwrap(), State::Failed);
        assert_eq!("cancelled".parse::<State>().unwrap(), State::Canceled);
        assert!("finished".parse::<State>().is_err());
    }

    #[test]
    fn test_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&State::Errored).unwrap();
        assert_eq!(json, "\"errored\"");
        let state: State = serde_json::from_str("\"started\"").unwrap();
        assert_eq!(state, State::Started);
    }
}
