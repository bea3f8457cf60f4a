//! The message a worker receives for an enqueued job.

use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::build::Job;
use crate::repository::Repository;

/// What a worker receives for one job.
///
/// Written to the work queue in the same transaction that marks the job
/// `queued`, so a job is queued exactly when its message exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub job_id: ResourceId,
    pub build_id: ResourceId,
    pub repository_slug: String,
    pub number: String,
    pub config: serde_json::Value,
}

impl DispatchMessage {
    pub fn new(job: &Job, repository: &Repository) -> Self {
        Self {
            job_id: job.id,
            build_id: job.build_id,
            repository_slug: repository.slug(),
            number: job.number.clone(),
            config: job.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{NewBuild, NewJob};
    use crate::repository::NewRepository;
    use chrono::Utc;

    #[test]
    fn test_message_carries_job_and_slug() {
        let repository = NewRepository {
            owner_name: "svenfuchs".to_string(),
            name: "minimal".to_string(),
            owner: None,
        }
        .into_repository(Utc::now());
        let build = NewBuild {
            repository_id: repository.id,
            number: 7,
        }
        .into_build(Utc::now());
        let job = NewJob {
            position: 2,
            stage: 1,
            allow_failure: false,
            config: serde_json::json!({ "script": ["rake"] }),
        }
        .into_job(&build, Utc::now());

        let message = DispatchMessage::new(&job, &repository);
        assert_eq!(message.job_id, job.id);
        assert_eq!(message.build_id, build.id);
        assert_eq!(message.repository_slug, "svenfuchs/minimal");
        assert_eq!(message.number, "7.2");
        assert_eq!(message.config["script"][0], "rake");
    }
}
