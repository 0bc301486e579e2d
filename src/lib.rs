//! Kiln - a distributed batch-job scheduler over a shared queue store.
//!
//! Nodes poll queues in a central store, attribute waiting job instances
//! to themselves, run the registered native payloads on bounded worker
//! pools and archive finished instances into an immutable history.

pub mod archiver;
pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod highlander;
pub mod model;
pub mod payload;
pub mod poller;
pub mod state;
pub mod store;
pub mod supervisor;

pub use archiver::HistoryArchiver;
pub use config::Config;
pub use engine::Engine;
pub use model::{
    ConnectionAlias, Deliverable, DeploymentParameter, History, JobDefinition, JobInstance,
    JobParameter, Message, Node, Queue, SubmissionRequest,
};
pub use payload::{
    JobManager, LegacyJob, PayloadError, PayloadRegistry, PayloadShape, RunnableJob,
};
pub use state::State;
pub use store::{MemoryStore, PostgresStore, Store, StoreError, StoreResult};
pub use supervisor::{ExecutionSupervisor, PoolFull};
