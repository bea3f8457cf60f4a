//! Worker lifecycle events.
//!
//! Workers report progress as loosely typed payloads. [`WorkerPayload::normalize`]
//! turns one into a [`WorkerEvent`] before anything is mutated, translating
//! the legacy numeric `result` field into a state along the way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, ResourceId, Result, State};

/// Kind of lifecycle event a worker reports for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Finish,
    Cancel,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Start, EventKind::Finish, EventKind::Cancel];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Finish => "finish",
            EventKind::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" | "started" | "job:started" | "job:test:started" => Ok(EventKind::Start),
            "finish" | "finished" | "job:finished" | "job:test:finished" => Ok(EventKind::Finish),
            "cancel" | "canceled" | "job:canceled" | "job:test:canceled" => Ok(EventKind::Cancel),
            _ => Err(Error::InvalidInput(format!("unknown event: {}", s))),
        }
    }
}

/// Raw event payload as delivered by a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerPayload {
    pub id: Option<ResourceId>,
    pub state: Option<String>,
    /// Legacy exit status: 0 means passed, anything else failed.
    pub result: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker: Option<String>,
}

/// A validated event, ready to be applied to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub kind: EventKind,
    pub job_id: ResourceId,
    /// Target state. `Started` for starts, a terminal state otherwise.
    pub state: State,
    /// When the reported transition happened on the worker.
    pub timestamp: DateTime<Utc>,
    pub worker: Option<String>,
}

impl WorkerPayload {
    /// State the payload reports, with `result` translated when `state` is absent.
    pub fn reported_state(&self) -> Result<Option<State>> {
        if let Some(state) = &self.state {
            return state.parse().map(Some).map_err(Error::InvalidInput);
        }
        Ok(self.result.map(|code| {
            if code == 0 {
                State::Passed
            } else {
                State::Failed
            }
        }))
    }

    /// Validate the payload for `kind`.
    ///
    /// `received_at` stands in for a missing timestamp.
    pub fn normalize(&self, kind: EventKind, received_at: DateTime<Utc>) -> Result<WorkerEvent> {
        let job_id = self
            .id
            .ok_or_else(|| Error::InvalidInput("event payload without job id".to_string()))?;

        let (state, timestamp) = match kind {
            EventKind::Start => (State::Started, self.started_at),
            EventKind::Finish => {
                let state = self.reported_state()?.ok_or_else(|| {
                    Error::InvalidInput(format!("finish event for job {} without state", job_id))
                })?;
                if !state.is_terminal() {
                    return Err(Error::InvalidInput(format!(
                        "finish event for job {} with non-terminal state {}",
                        job_id, state
                    )));
                }
                (state, self.finished_at)
            }
            EventKind::Cancel => (State::Canceled, self.finished_at),
        };

        Ok(WorkerEvent {
            kind,
            job_id,
            state,
            timestamp: timestamp.unwrap_or(received_at),
            worker: self.worker.clone(),
        })
    }
}
