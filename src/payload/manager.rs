//! Engine handle handed to running payloads.
//!
//! Payload code runs on a blocking thread, so the handle is fully
//! synchronous: reads come from data captured at launch, writes go out as
//! events on an unbounded channel the supervisor drains into the store,
//! and the kill signal is an atomic flag flipped by the supervisor's
//! watcher task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::JobParameter;

use super::PayloadError;

/// Side effects a payload may emit mid-run.
#[derive(Debug)]
pub enum JobEvent {
    Message(String),
    Progress(i32),
    Deliverable {
        file_path: String,
        original_file_name: String,
        file_family: Option<String>,
    },
}

/// Per-launch handle a payload uses to read its parameters, report
/// progress and honor kill requests. Cloning is cheap and every clone
/// refers to the same launch.
#[derive(Clone)]
pub struct JobManager {
    instance_id: Uuid,
    parameters: Arc<Vec<JobParameter>>,
    kill_flag: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<JobEvent>,
}

impl JobManager {
    pub(crate) fn new(
        instance_id: Uuid,
        parameters: Vec<JobParameter>,
        kill_flag: Arc<AtomicBool>,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Self {
        Self {
            instance_id,
            parameters: Arc::new(parameters),
            kill_flag,
            events,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn parameters(&self) -> &[JobParameter] {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    /// Cooperative cancellation point. Long-running payloads call this
    /// inside their work loop; once a kill has been requested it returns
    /// `PayloadError::KillRequested`, which the payload propagates with `?`.
    pub fn checkpoint(&self) -> Result<(), PayloadError> {
        if self.kill_flag.load(Ordering::Relaxed) {
            return Err(PayloadError::KillRequested);
        }
        Ok(())
    }

    pub fn kill_requested(&self) -> bool {
        self.kill_flag.load(Ordering::Relaxed)
    }

    pub fn send_message(&self, text: impl Into<String>) {
        let _ = self.events.send(JobEvent::Message(text.into()));
    }

    pub fn set_progress(&self, progress: i32) {
        let _ = self.events.send(JobEvent::Progress(progress));
    }

    pub fn add_deliverable(
        &self,
        file_path: impl Into<String>,
        original_file_name: impl Into<String>,
        file_family: Option<String>,
    ) {
        let _ = self.events.send(JobEvent::Deliverable {
            file_path: file_path.into(),
            original_file_name: original_file_name.into(),
            file_family,
        });
    }
}
