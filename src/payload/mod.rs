//! Payload surface: the calling conventions job code may expose and the
//! error type it reports through.
//!
//! A payload is registered native code, not something loaded from disk at
//! run time. Deployment means linking the payload crate into the node
//! binary and registering a factory under the job definition's entry
//! point. The factory builds a fresh value per execution, which is all the
//! isolation repeated launches need.

pub mod launcher;
pub mod loader;
pub mod manager;

pub use launcher::{LaunchError, LaunchOutcome, launch};
pub use loader::{LoadError, PayloadFactory, PayloadRegistry};
pub use manager::{JobEvent, JobManager};

/// What job code reports back to the engine.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// The payload observed a kill request at a checkpoint and unwound.
    #[error("kill acknowledged")]
    KillRequested,
    #[error("{0}")]
    Failure(String),
}

/// Preferred convention: a run method plus an engine handle bound before
/// launch. Payloads that never talk back to the engine can skip `bind`.
pub trait RunnableJob: Send {
    fn bind(&mut self, _manager: JobManager) {}
    fn run(&mut self) -> Result<(), PayloadError>;
}

/// Compatibility convention for payloads ported from older deployments
/// that exposed a `start` method instead of `run`.
pub trait LegacyJob: Send {
    fn bind(&mut self, _manager: JobManager) {}
    fn start(&mut self) -> Result<(), PayloadError>;
}

/// Plain-function convention. Receives the instance's parameter values
/// ordered by key and gets no engine handle.
pub type StaticMain = Box<dyn FnMut(Vec<String>) -> Result<(), PayloadError> + Send>;

/// One freshly instantiated payload, in whatever conventions it exposes.
/// The launcher probes `runnable`, then `legacy`, then `static_entry`.
#[derive(Default)]
pub struct PayloadShape {
    pub runnable: Option<Box<dyn RunnableJob>>,
    pub legacy: Option<Box<dyn LegacyJob>>,
    pub static_entry: Option<StaticMain>,
}

impl std::fmt::Debug for PayloadShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadShape")
            .field("runnable", &self.runnable.is_some())
            .field("legacy", &self.legacy.is_some())
            .field("static_entry", &self.static_entry.is_some())
            .finish()
    }
}

impl PayloadShape {
    pub fn runnable(job: impl RunnableJob + 'static) -> Self {
        Self {
            runnable: Some(Box::new(job)),
            ..Self::default()
        }
    }

    pub fn legacy(job: impl LegacyJob + 'static) -> Self {
        Self {
            legacy: Some(Box::new(job)),
            ..Self::default()
        }
    }

    pub fn static_main(
        entry: impl FnMut(Vec<String>) -> Result<(), PayloadError> + Send + 'static,
    ) -> Self {
        Self {
            static_entry: Some(Box::new(entry)),
            ..Self::default()
        }
    }

    /// A shape exposing none of the three conventions cannot be launched.
    pub fn is_supported(&self) -> bool {
        self.runnable.is_some() || self.legacy.is_some() || self.static_entry.is_some()
    }
}
