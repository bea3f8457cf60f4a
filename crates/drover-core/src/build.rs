//! Builds, jobs and the rules that derive a build's state from its matrix.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ResourceId, State};

/// A single CI run for a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: ResourceId,
    pub repository_id: ResourceId,
    /// Per-repository build number.
    pub number: i64,
    pub state: State,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Sum of the run time of all jobs, in seconds. Set once the build finishes.
    pub duration: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create a build.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub repository_id: ResourceId,
    pub number: i64,
}

impl NewBuild {
    pub fn into_build(self, now: DateTime<Utc>) -> Build {
        Build {
            id: ResourceId::new(),
            repository_id: self.repository_id,
            number: self.number,
            state: State::Created,
            started_at: None,
            finished_at: None,
            duration: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One executable unit of a build's matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    pub build_id: ResourceId,
    pub repository_id: ResourceId,
    /// Build number and matrix position, e.g. "42.1".
    pub number: String,
    /// Position in the build's matrix, starting at 1.
    pub position: u32,
    /// Build stage. Jobs of a lower stage must finish before later ones run.
    pub stage: u32,
    /// Failures of this job do not fail the build.
    pub allow_failure: bool,
    pub state: State,
    /// Commands and environment handed to the worker.
    pub config: serde_json::Value,
    pub worker: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Seconds between start and finish, if the job ran.
    pub fn run_time(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) if finished >= started => {
                Some((finished - started).num_seconds())
            }
            _ => None,
        }
    }
}

/// Fields needed to create a job within a build.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub position: u32,
    pub stage: u32,
    pub allow_failure: bool,
    pub config: serde_json::Value,
}

impl NewJob {
    pub fn into_job(self, build: &Build, now: DateTime<Utc>) -> Job {
        Job {
            id: ResourceId::new(),
            build_id: build.id,
            repository_id: build.repository_id,
            number: format!("{}.{}", build.number, self.position),
            position: self.position,
            stage: self.stage,
            allow_failure: self.allow_failure,
            state: State::Created,
            config: self.config,
            worker: None,
            queued_at: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Derive a build's state from the states of its jobs.
///
/// While any job is unfinished the build is `Started` once some job has
/// started (or finished), otherwise `Queued` or `Created`. When every job is
/// terminal only the required jobs count (all jobs if every job allows
/// failure): any errored job errors the build, then failed, then canceled,
/// and the build passes only when none of those apply. Failures outrank
/// cancellations so a stage failure that cancels later stages still fails
/// the build.
pub fn aggregate_state(jobs: &[Job]) -> State {
    if jobs.is_empty() {
        return State::Created;
    }

    if !jobs.iter().all(|j| j.state.is_terminal()) {
        let progress = jobs.iter().map(|j| j.state.rank()).max().unwrap_or(0);
        return match progress {
            0 => State::Created,
            1 => State::Queued,
            _ => State::Started,
        };
    }

    let required: Vec<&Job> = jobs.iter().filter(|j| !j.allow_failure).collect();
    let considered: Vec<&Job> = if required.is_empty() {
        jobs.iter().collect()
    } else {
        required
    };

    let any = |state: State| considered.iter().any(|j| j.state == state);
    if any(State::Errored) {
        State::Errored
    } else if any(State::Failed) {
        State::Failed
    } else if any(State::Canceled) {
        State::Canceled
    } else {
        State::Passed
    }
}

/// Total run time of a finished matrix, in seconds.
pub fn matrix_duration(jobs: &[Job]) -> i64 {
    jobs.iter().filter_map(Job::run_time).sum()
}

/// Whether `job` still waits on unfinished jobs of an earlier stage.
pub fn blocked_by_earlier_stage(job: &Job, siblings: &[Job]) -> bool {
    siblings
        .iter()
        .any(|s| s.id != job.id && s.stage < job.stage && !s.state.is_terminal())
}

/// Jobs that can no longer run because an earlier stage has a required job
/// that did not pass.
///
/// Returns the ids of `Created` jobs in any stage after the first stage
/// holding such a failure.
pub fn jobs_blocked_by_failed_stage(jobs: &[Job]) -> Vec<ResourceId> {
    let failed_stage = jobs
        .iter()
        .filter(|j| !j.allow_failure && j.state.is_terminal() && j.state != State::Passed)
        .map(|j| j.stage)
        .min();

    match failed_stage {
        Some(stage) => jobs
            .iter()
            .filter(|j| j.stage > stage && j.state == State::Created)
            .map(|j| j.id)
            .collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_build() -> Build {
        NewBuild {
            repository_id: ResourceId::new(),
            number: 1,
        }
        .into_build(Utc::now())
    }

    fn make_job(build: &Build, stage: u32, state: State) -> Job {
        let mut job = NewJob {
            position: stage,
            stage,
            allow_failure: false,
            config: serde_json::json!({}),
        }
        .into_job(build, Utc::now());
        job.state = state;
        job
    }

    fn matrix(states: &[State]) -> Vec<Job> {
        let build = make_build();
        states.iter().map(|s| make_job(&build, 1, *s)).collect()
    }

    #[test]
    fn test_new_build_starts_empty() {
        let build = make_build();
        assert_eq!(build.state, State::Created);
        assert!(build.started_at.is_none());
        assert!(build.finished_at.is_none());
        assert!(build.duration.is_none());
    }

    #[test]
    fn test_job_number_includes_position() {
        let build = make_build();
        let job = make_job(&build, 3, State::Created);
        assert_eq!(job.number, "1.3");
        assert_eq!(job.position, 3);
        assert_eq!(job.build_id, build.id);
        assert_eq!(job.repository_id, build.repository_id);
    }

    #[test]
    fn test_aggregate_unfinished_matrix() {
        assert_eq!(aggregate_state(&[]), State::Created);
        assert_eq!(
            aggregate_state(&matrix(&[State::Created, State::Created])),
            State::Created
        );
        assert_eq!(
            aggregate_state(&matrix(&[State::Queued, State::Created])),
            State::Queued
        );
        assert_eq!(
            aggregate_state(&matrix(&[State::Started, State::Queued])),
            State::Started
        );
        assert_eq!(
            aggregate_state(&matrix(&[State::Passed, State::Queued])),
            State::Started
        );
    }

    #[test]
    fn test_aggregate_finished_matrix() {
        assert_eq!(
            aggregate_state(&matrix(&[State::Passed, State::Passed])),
            State::Passed
        );
        assert_eq!(
            aggregate_state(&matrix(&[State::Passed, State::Failed])),
            State::Failed
        );
        assert_eq!(
            aggregate_state(&matrix(&[State::Failed, State::Errored])),
            State::Errored
        );
        assert_eq!(
            aggregate_state(&matrix(&[State::Errored, State::Canceled])),
            State::Errored
        );
        assert_eq!(
            aggregate_state(&matrix(&[State::Passed, State::Canceled])),
            State::Canceled
        );
    }

    #[test]
    fn test_failed_stage_outranks_canceled_later_stages() {
        let build = make_build();
        let test = make_job(&build, 1, State::Failed);
        let deploy = make_job(&build, 2, State::Canceled);
        assert_eq!(aggregate_state(&[test, deploy]), State::Failed);
    }

    #[test]
    fn test_allowed_failures_do_not_fail_the_build() {
        let mut jobs = matrix(&[State::Passed, State::Failed]);
        jobs[1].allow_failure = true;
        assert_eq!(aggregate_state(&jobs), State::Passed);

        jobs[0].allow_failure = true;
        assert_eq!(aggregate_state(&jobs), State::Failed);
    }

    #[test]
    fn test_run_time_and_duration() {
        let mut jobs = matrix(&[State::Passed, State::Passed, State::Canceled]);
        let t0 = Utc.with_ymd_and_hms(2011, 1, 1, 0, 0, 0).unwrap();
        jobs[0].started_at = Some(t0);
        jobs[0].finished_at = Some(t0 + chrono::Duration::seconds(60));
        jobs[1].started_at = Some(t0);
        jobs[1].finished_at = Some(t0 + chrono::Duration::seconds(30));

        assert_eq!(jobs[0].run_time(), Some(60));
        assert_eq!(jobs[2].run_time(), None);
        assert_eq!(matrix_duration(&jobs), 90);
    }

    #[test]
    fn test_stage_blocking() {
        let build = make_build();
        let first = make_job(&build, 1, State::Started);
        let second = make_job(&build, 2, State::Created);
        let jobs = vec![first.clone(), second.clone()];

        assert!(blocked_by_earlier_stage(&second, &jobs));
        assert!(!blocked_by_earlier_stage(&first, &jobs));

        let mut finished = first;
        finished.state = State::Passed;
        assert!(!blocked_by_earlier_stage(&second, &[finished, second.clone()]));
    }

    #[test]
    fn test_failed_stage_blocks_later_stages() {
        let build = make_build();
        let lint = make_job(&build, 1, State::Failed);
        let test = make_job(&build, 1, State::Started);
        let deploy = make_job(&build, 2, State::Created);
        let jobs = vec![lint, test, deploy.clone()];

        assert_eq!(jobs_blocked_by_failed_stage(&jobs), vec![deploy.id]);
    }

    #[test]
    fn test_allowed_failure_does_not_block_later_stages() {
        let build = make_build();
        let mut lint = make_job(&build, 1, State::Failed);
        lint.allow_failure = true;
        let deploy = make_job(&build, 2, State::Created);

        assert!(jobs_blocked_by_failed_stage(&[lint, deploy]).is_empty());
    }
}
