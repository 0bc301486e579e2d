//! Persistent entities shared between the engine and the queue store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::State;

/// One key/value parameter attached to a job definition or instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameter {
    pub key: String,
    pub value: String,
}

impl JobParameter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Catalog entry describing a runnable job: entry point, target queue,
/// singleton-execution policy, parameter defaults and declared artifact
/// dependencies. Immutable after deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: Uuid,
    pub name: String,
    pub entry_point: String,
    pub queue_id: Uuid,
    /// At most one non-terminal instance of this definition system-wide.
    pub highlander: bool,
    pub parameters: Vec<JobParameter>,
    pub dependencies: Vec<String>,
}

/// Named, ordered waiting line with a staleness time-to-live (seconds).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Queue {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub default_queue: bool,
    pub time_to_live: i64,
}

/// One polling worker process identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub port: i32,
    /// Local storage for deployed job payloads.
    pub repo_directory: String,
    /// Where running jobs drop their deliverable files.
    pub deliverable_directory: String,
    pub export_directory: String,
}

/// Binds a node to a queue with a worker pool size and a poll interval.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentParameter {
    pub id: Uuid,
    pub node_id: Uuid,
    pub queue_id: Uuid,
    pub nb_thread: usize,
    pub polling_interval_ms: u64,
}

/// Flat key/value engine configuration, read-mostly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlobalParameter {
    pub key: String,
    pub value: String,
}

/// Registered connection record for a named store, created at bootstrap
/// from the live connection properties when absent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionAlias {
    pub name: String,
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// One submission request, tracked from `Submitted` until it reaches a
/// terminal state and is converted into a [`History`] record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: Uuid,
    pub job_def_id: Uuid,
    pub queue_id: Uuid,
    pub state: State,
    /// Insertion order within the queue; the FIFO tie-break.
    pub position: i64,
    pub creation_date: DateTime<Utc>,
    pub attribution_date: Option<DateTime<Utc>>,
    pub execution_date: Option<DateTime<Utc>>,
    /// Owning node once attributed.
    pub node_id: Option<Uuid>,
    pub user_name: Option<String>,
    pub email: Option<String>,
    pub session_id: Option<String>,
    pub application: Option<String>,
    /// Supports job-triggers-job chains.
    pub parent_id: Option<Uuid>,
    pub progress: i32,
    pub kill_requested: bool,
    pub parameters: Vec<JobParameter>,
}

/// Short free-text progress note, ordered by creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// File artifact produced by a running job. Retrieval is delegated to the
/// external client API; the engine only registers the record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deliverable {
    pub id: Uuid,
    /// Opaque download identifier handed to clients.
    pub random_id: Uuid,
    pub file_path: String,
    pub original_file_name: String,
    pub file_family: Option<String>,
    pub job_instance_id: Uuid,
}

/// Terminal, immutable snapshot of a job instance. Keeps the instance id so
/// deliverable back-references stay valid after archival.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct History {
    pub id: Uuid,
    pub job_def_id: Uuid,
    pub queue_id: Uuid,
    pub node_id: Option<Uuid>,
    pub final_state: State,
    pub enqueue_date: DateTime<Utc>,
    pub attribution_date: Option<DateTime<Utc>>,
    pub execution_date: Option<DateTime<Utc>>,
    pub end_date: DateTime<Utc>,
    pub user_name: Option<String>,
    pub email: Option<String>,
    pub session_id: Option<String>,
    pub application: Option<String>,
    pub parent_id: Option<Uuid>,
    pub progress: i32,
    pub parameters: Vec<JobParameter>,
    pub messages: Vec<Message>,
}

/// Client submission payload: a job definition name plus parameter
/// overrides merged over the definition's declared defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub job_definition: String,
    pub parameters: Vec<JobParameter>,
    pub user_name: Option<String>,
    pub email: Option<String>,
    pub session_id: Option<String>,
    pub application: Option<String>,
    pub parent_id: Option<Uuid>,
}

impl SubmissionRequest {
    pub fn new(job_definition: impl Into<String>) -> Self {
        Self {
            job_definition: job_definition.into(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(JobParameter::new(key, value));
        self
    }
}
