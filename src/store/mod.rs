//! Queue store interfaces: the single arbiter of attribution correctness.
//!
//! All cross-node coordination goes through store transactions. Operations
//! that the engine needs to be atomic (attribution plus Highlander
//! cancellation, archival) are composite methods so each implementation can
//! wrap them in one transaction.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::model::{
    ConnectionAlias, Deliverable, DeploymentParameter, History, JobDefinition, JobInstance,
    Message, Node, Queue, SubmissionRequest,
};
use crate::state::State;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("no such {kind}: {name}")]
    NotFound { kind: &'static str, name: String },
    #[error("illegal state transition {from} -> {to}")]
    IllegalTransition { from: State, to: State },
}

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, name: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            name: name.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Transactional CRUD over the scheduling tables, with row-level locking
/// sufficient to make attribution exactly-once across competing pollers.
#[async_trait]
pub trait Store: Send + Sync {
    // Nodes.
    async fn find_node(&self, name: &str) -> StoreResult<Option<Node>>;
    async fn insert_node(&self, node: Node) -> StoreResult<()>;

    // Queues.
    async fn list_queues(&self) -> StoreResult<Vec<Queue>>;
    async fn find_queue(&self, id: Uuid) -> StoreResult<Queue>;
    async fn insert_queue(&self, queue: Queue) -> StoreResult<()>;
    async fn set_default_queue(&self, queue_id: Uuid, default_queue: bool) -> StoreResult<()>;

    // Global parameters. Inserts never overwrite an existing key.
    async fn get_global_parameter(&self, key: &str) -> StoreResult<Option<String>>;
    async fn insert_global_parameter(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn count_global_parameters(&self) -> StoreResult<i64>;

    // Connection aliases.
    async fn find_connection_alias(&self, name: &str) -> StoreResult<Option<ConnectionAlias>>;
    async fn insert_connection_alias(&self, alias: ConnectionAlias) -> StoreResult<()>;
    /// Live connection properties of this store, used to self-register the
    /// engine's own alias at bootstrap.
    fn connection_description(&self) -> ConnectionAlias;

    // Deployment parameters.
    async fn deployment_parameters_for_node(
        &self,
        node_id: Uuid,
    ) -> StoreResult<Vec<DeploymentParameter>>;
    async fn insert_deployment_parameter(&self, binding: DeploymentParameter) -> StoreResult<()>;

    // Job definitions.
    /// Insert or update a definition by name. A redeployed definition
    /// keeps its original id so existing instances stay attached.
    async fn insert_job_definition(&self, definition: JobDefinition) -> StoreResult<()>;
    async fn find_job_definition(&self, id: Uuid) -> StoreResult<JobDefinition>;
    async fn find_job_definition_by_name(&self, name: &str)
    -> StoreResult<Option<JobDefinition>>;

    /// Create a `Submitted` instance with the next position in its queue.
    /// Request parameters override the definition's declared defaults.
    async fn submit_instance(&self, request: SubmissionRequest) -> StoreResult<JobInstance>;

    // Polling and attribution.
    async fn count_active_instances(&self, node_id: Uuid, queue_id: Uuid) -> StoreResult<usize>;
    /// Oldest `Submitted` instance in the queue, by (position, creation).
    async fn next_submitted(&self, queue_id: Uuid) -> StoreResult<Option<JobInstance>>;
    async fn non_terminal_instances_of(
        &self,
        job_def_id: Uuid,
        excluding: Uuid,
    ) -> StoreResult<Vec<JobInstance>>;
    /// Atomically transition `Submitted -> Attributed`, stamp the owning
    /// node and attribution time, and cancel the given Highlander siblings,
    /// all in one transaction. Returns `false` when a concurrent poller won
    /// the row first.
    async fn attribute_instance(
        &self,
        instance_id: Uuid,
        node_id: Uuid,
        cancel: &[Uuid],
    ) -> StoreResult<bool>;
    /// Roll an `Attributed` instance back to `Submitted` after the worker
    /// pool rejected it.
    async fn release_attribution(&self, instance_id: Uuid) -> StoreResult<()>;

    // Execution-time mutations.
    async fn mark_running(&self, instance_id: Uuid) -> StoreResult<()>;
    async fn request_kill(&self, instance_id: Uuid) -> StoreResult<()>;
    async fn kill_requested(&self, instance_id: Uuid) -> StoreResult<bool>;
    /// External cancel of a not-yet-running instance.
    async fn cancel_instance(&self, instance_id: Uuid) -> StoreResult<()>;
    async fn append_message(&self, instance_id: Uuid, text: &str) -> StoreResult<()>;
    async fn update_progress(&self, instance_id: Uuid, progress: i32) -> StoreResult<()>;
    async fn register_deliverable(&self, deliverable: Deliverable) -> StoreResult<()>;

    // Reads.
    async fn find_instance(&self, instance_id: Uuid) -> StoreResult<Option<JobInstance>>;
    async fn instance_messages(&self, instance_id: Uuid) -> StoreResult<Vec<Message>>;
    async fn deliverables_for(&self, instance_id: Uuid) -> StoreResult<Vec<Deliverable>>;

    /// Atomically snapshot the instance (scalars, parameters, messages)
    /// into an immutable history record and delete the live row, freeing
    /// its queue slot. One transaction: a crash can never leave the job
    /// visible in neither table nor both.
    async fn archive_instance(
        &self,
        instance_id: Uuid,
        final_state: State,
        end_date: DateTime<Utc>,
    ) -> StoreResult<History>;
    async fn find_history(&self, id: Uuid) -> StoreResult<Option<History>>;
}
