//! Synchronous payload invocation.
//!
//! Runs on a blocking thread owned by the supervisor. Probes the shape's
//! conventions in order (runnable, legacy, static), binds the engine
//! handle where the convention accepts one, and folds panics and the
//! kill sentinel into a single outcome the supervisor can map onto a
//! terminal state.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::model::JobParameter;

use super::{JobManager, PayloadError, PayloadShape};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("payload failure: {0}")]
    Runtime(String),
    #[error("payload panicked: {0}")]
    Panic(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum LaunchOutcome {
    Completed,
    Killed,
}

/// Instance parameter values ordered by key, the argument list handed to
/// static-main payloads.
pub fn sorted_arguments(parameters: &[JobParameter]) -> Vec<String> {
    let mut sorted: Vec<&JobParameter> = parameters.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));
    sorted.into_iter().map(|p| p.value.clone()).collect()
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn fold(result: Result<(), PayloadError>) -> Result<LaunchOutcome, LaunchError> {
    match result {
        Ok(()) => Ok(LaunchOutcome::Completed),
        Err(PayloadError::KillRequested) => Ok(LaunchOutcome::Killed),
        Err(PayloadError::Failure(text)) => Err(LaunchError::Runtime(text)),
    }
}

pub fn launch(
    mut shape: PayloadShape,
    manager: JobManager,
) -> Result<LaunchOutcome, LaunchError> {
    if let Some(mut job) = shape.runnable.take() {
        job.bind(manager);
        return catch_unwind(AssertUnwindSafe(move || job.run()))
            .map_err(|panic| LaunchError::Panic(panic_text(panic)))
            .and_then(fold);
    }
    if let Some(mut job) = shape.legacy.take() {
        job.bind(manager);
        return catch_unwind(AssertUnwindSafe(move || job.start()))
            .map_err(|panic| LaunchError::Panic(panic_text(panic)))
            .and_then(fold);
    }
    if let Some(mut entry) = shape.static_entry.take() {
        // Static payloads get no handle, only their parameter values.
        let arguments = sorted_arguments(manager.parameters());
        return catch_unwind(AssertUnwindSafe(move || entry(arguments)))
            .map_err(|panic| LaunchError::Panic(panic_text(panic)))
            .and_then(fold);
    }
    // Unsupported shapes are rejected at load time.
    Err(LaunchError::Runtime(
        "payload exposes no calling convention".to_string(),
    ))
}
