//! Event handlers and the job -> build -> repository cascade.
//!
//! Handlers are plain functions over an already loaded [`Cascade`]. They
//! never touch the store, which keeps the state rules testable without one.
//! [`handler_for`] looks a handler up in a fixed table keyed by event kind.

use chrono::{DateTime, Utc};
use drover_core::build::{
    Build, Job, aggregate_state, jobs_blocked_by_failed_stage, matrix_duration,
};
use drover_core::event::{EventKind, WorkerEvent};
use drover_core::repository::Repository;
use drover_core::{Error, ResourceId, Result, State};

/// A job together with everything its state change can reach.
#[derive(Debug, Clone)]
pub struct Cascade {
    pub job: Job,
    pub build: Build,
    /// All jobs of the build in matrix order, including `job`.
    pub siblings: Vec<Job>,
    pub repository: Repository,
}

/// What applying an event changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub job_state: State,
    pub build_state: State,
    pub build_changed: bool,
    pub repository_changed: bool,
    /// Siblings canceled because an earlier stage failed.
    pub canceled_jobs: Vec<ResourceId>,
}

pub type Handler = fn(&mut Cascade, &WorkerEvent) -> Result<Transition>;

/// Handler for each event kind.
pub const HANDLERS: &[(EventKind, Handler)] = &[
    (EventKind::Start, start as Handler),
    (EventKind::Finish, finish as Handler),
    (EventKind::Cancel, cancel as Handler),
];

pub fn handler_for(kind: EventKind) -> Option<Handler> {
    HANDLERS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, handler)| *handler)
}

impl Cascade {
    pub fn new(job: Job, build: Build, siblings: Vec<Job>, repository: Repository) -> Self {
        Self {
            job,
            build,
            siblings,
            repository,
        }
    }

    /// Copy the target job's current fields into the sibling list.
    fn store_job(&mut self) {
        if let Some(slot) = self.siblings.iter_mut().find(|j| j.id == self.job.id) {
            *slot = self.job.clone();
        } else {
            self.siblings.push(self.job.clone());
        }
    }

    fn transition(&self) -> Transition {
        Transition {
            job_state: self.job.state,
            build_state: self.build.state,
            build_changed: false,
            repository_changed: false,
            canceled_jobs: Vec::new(),
        }
    }

    /// Cancel jobs that can no longer run after a failed stage.
    fn cancel_blocked(&mut self, at: DateTime<Utc>, transition: &mut Transition) {
        let blocked = jobs_blocked_by_failed_stage(&self.siblings);
        for job in self.siblings.iter_mut().filter(|j| blocked.contains(&j.id)) {
            job.state = State::Canceled;
            job.finished_at = Some(at);
        }
        transition.canceled_jobs = blocked;
    }

    /// Recompute the build from its jobs and carry the result to the repository.
    fn roll_up(&mut self, at: DateTime<Utc>, transition: &mut Transition) {
        let next = aggregate_state(&self.siblings);
        if next == self.build.state || !self.build.state.advances_to(next) {
            transition.build_state = self.build.state;
            return;
        }

        let was_started = self.build.started_at.is_some();
        self.build.state = next;
        transition.build_changed = true;
        transition.build_state = next;

        if !was_started && next.rank() >= State::Started.rank() {
            self.build.started_at = self.siblings.iter().filter_map(|j| j.started_at).min();
            if let Some(started_at) = self.build.started_at {
                transition.repository_changed |= self
                    .repository
                    .record_build_started(self.build.id, started_at);
            }
        }

        if next.is_terminal() {
            // The latest job finish, whatever order the events arrived in.
            self.build.finished_at = self
                .siblings
                .iter()
                .filter_map(|j| j.finished_at)
                .max()
                .or(Some(at));
            self.build.duration = Some(matrix_duration(&self.siblings));
            transition.repository_changed |= self.repository.record_build_finished(&self.build);
        }
    }
}

fn stale(job: &Job, event: &WorkerEvent, why: &str) -> Error {
    Error::StaleEvent(format!(
        "{} for job {} ({}): {}",
        event.kind, job.id, job.state, why
    ))
}

/// A worker picked the job up.
pub fn start(cascade: &mut Cascade, event: &WorkerEvent) -> Result<Transition> {
    if !cascade.job.state.can_transition_to(State::Started) {
        let why = match cascade.job.state {
            State::Created => "job was never queued",
            _ => "job already started",
        };
        return Err(stale(&cascade.job, event, why));
    }

    cascade.job.state = State::Started;
    cascade.job.started_at = Some(event.timestamp);
    if event.worker.is_some() {
        cascade.job.worker = event.worker.clone();
    }
    cascade.store_job();

    let mut transition = cascade.transition();
    cascade.roll_up(event.timestamp, &mut transition);
    Ok(transition)
}

/// The worker reported a terminal state.
pub fn finish(cascade: &mut Cascade, event: &WorkerEvent) -> Result<Transition> {
    if cascade.job.state.is_terminal() {
        return Err(stale(&cascade.job, event, "job already finished"));
    }
    // A job that never started may only end as errored or canceled.
    if !cascade.job.state.can_transition_to(event.state) {
        return Err(stale(&cascade.job, event, "job has not started"));
    }
    if let Some(started_at) = cascade.job.started_at {
        if event.timestamp < started_at {
            return Err(stale(&cascade.job, event, "finished before it started"));
        }
    }

    cascade.job.state = event.state;
    cascade.job.finished_at = Some(event.timestamp);
    if cascade.job.worker.is_none() {
        cascade.job.worker = event.worker.clone();
    }
    cascade.store_job();

    let mut transition = cascade.transition();
    cascade.cancel_blocked(event.timestamp, &mut transition);
    cascade.roll_up(event.timestamp, &mut transition);
    Ok(transition)
}

/// The job was canceled before it could finish.
pub fn cancel(cascade: &mut Cascade, event: &WorkerEvent) -> Result<Transition> {
    if cascade.job.state.is_terminal() {
        return Err(stale(&cascade.job, event, "job already finished"));
    }

    cascade.job.state = State::Canceled;
    cascade.job.finished_at = Some(event.timestamp);
    cascade.store_job();

    let mut transition = cascade.transition();
    cascade.cancel_blocked(event.timestamp, &mut transition);
    cascade.roll_up(event.timestamp, &mut transition);
    Ok(transition)
}
