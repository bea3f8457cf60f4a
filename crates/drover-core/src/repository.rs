//! Repositories, permissions and the remote descriptors they are synced from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::build::Build;
use crate::{ResourceId, State};

/// Who owns a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id")]
pub enum Owner {
    User(ResourceId),
    Organization(ResourceId),
}

impl Owner {
    pub fn kind(&self) -> &'static str {
        match self {
            Owner::User(_) => "user",
            Owner::Organization(_) => "organization",
        }
    }

    pub fn id(&self) -> ResourceId {
        match self {
            Owner::User(id) | Owner::Organization(id) => *id,
        }
    }

    /// Rebuild an owner from its persisted kind and id.
    pub fn from_parts(kind: &str, id: ResourceId) -> Result<Self, String> {
        match kind {
            "user" => Ok(Owner::User(id)),
            "organization" => Ok(Owner::Organization(id)),
            _ => Err(format!("Unknown owner type: {}", kind)),
        }
    }
}

/// A repository known to the CI system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: ResourceId,
    pub owner_name: String,
    pub name: String,
    pub owner: Option<Owner>,
    pub active: bool,
    /// Cap on queued and running jobs for this repository.
    pub max_concurrent_jobs: Option<u32>,
    /// SSH key pair, generated elsewhere.
    pub key_id: Option<ResourceId>,
    pub last_build_id: Option<ResourceId>,
    pub last_build_state: Option<State>,
    pub last_build_started_at: Option<DateTime<Utc>>,
    pub last_build_finished_at: Option<DateTime<Utc>>,
    pub last_build_duration: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    /// `owner_name/name`.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner_name, self.name)
    }

    /// Point the summary at a build that just started.
    ///
    /// Returns `false` without touching anything when the repository already
    /// shows a build that started later than `started_at`.
    pub fn record_build_started(&mut self, build_id: ResourceId, started_at: DateTime<Utc>) -> bool {
        if let Some(current) = self.last_build_started_at {
            if started_at < current {
                return false;
            }
        }

        self.last_build_id = Some(build_id);
        self.last_build_state = Some(State::Started);
        self.last_build_started_at = Some(started_at);
        self.last_build_finished_at = None;
        self.last_build_duration = None;
        true
    }

    /// Copy a finished build's outcome into the summary.
    ///
    /// Only applies when the summary shows this build, shows nothing yet, or
    /// shows a build that started no later than this one. Returns whether
    /// the summary changed.
    pub fn record_build_finished(&mut self, build: &Build) -> bool {
        let Some(finished_at) = build.finished_at else {
            return false;
        };
        if !build.state.is_terminal() {
            return false;
        }

        let applies = match self.last_build_id {
            None => true,
            Some(id) if id == build.id => true,
            Some(_) => match (self.last_build_started_at, build.started_at) {
                (Some(current), Some(started)) => started >= current,
                (None, _) => true,
                (Some(_), None) => false,
            },
        };
        if !applies {
            return false;
        }

        self.last_build_id = Some(build.id);
        self.last_build_state = Some(build.state);
        if build.started_at.is_some() {
            self.last_build_started_at = build.started_at;
        }
        self.last_build_finished_at = Some(finished_at);
        self.last_build_duration = build.duration;
        true
    }
}

/// Fields needed to create a repository.
#[derive(Debug, Clone)]
pub struct NewRepository {
    pub owner_name: String,
    pub name: String,
    pub owner: Option<Owner>,
}

impl NewRepository {
    /// A fresh, inactive repository with an empty build summary.
    pub fn into_repository(self, now: DateTime<Utc>) -> Repository {
        Repository {
            id: ResourceId::new(),
            owner_name: self.owner_name,
            name: self.name,
            owner: self.owner,
            active: false,
            max_concurrent_jobs: None,
            key_id: None,
            last_build_id: None,
            last_build_state: None,
            last_build_started_at: None,
            last_build_finished_at: None,
            last_build_duration: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Capability flags a user holds on a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub push: bool,
    #[serde(default = "default_pull")]
    pub pull: bool,
}

fn default_pull() -> bool {
    true
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            admin: false,
            push: false,
            pull: true,
        }
    }
}

/// A capability grant linking a user to a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub id: ResourceId,
    pub user_id: ResourceId,
    pub repository_id: ResourceId,
    pub admin: bool,
    pub push: bool,
    pub pull: bool,
}

impl Permission {
    pub fn new(user_id: ResourceId, repository_id: ResourceId, caps: Capabilities) -> Self {
        Self {
            id: ResourceId::new(),
            user_id,
            repository_id,
            admin: caps.admin,
            push: caps.push,
            pull: caps.pull,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            admin: self.admin,
            push: self.push,
            pull: self.pull,
        }
    }

    pub fn set_capabilities(&mut self, caps: Capabilities) {
        self.admin = caps.admin;
        self.push = caps.push;
        self.pull = caps.pull;
    }
}

/// The user a sync runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: ResourceId,
    pub login: String,
}

/// Owner of a remote repository as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOwner {
    pub login: String,
}

/// A repository as listed by the source-control provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRepository {
    pub name: String,
    pub owner: RemoteOwner,
    #[serde(default)]
    pub permissions: Capabilities,
}

impl RemoteRepository {
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner.login, self.name)
    }
}
