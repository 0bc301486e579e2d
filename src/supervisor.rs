//! Per-queue execution supervisor.
//!
//! Owns a bounded worker pool (one semaphore permit per configured
//! thread) and drives a single instance through its run: mark running,
//! load the payload, launch it on a blocking thread, persist the events
//! it emits, watch for kill requests and archive the terminal result.
//! The pool never blocks the poller: a full pool is reported back so the
//! attribution can be released.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::archiver::HistoryArchiver;
use crate::model::{Deliverable, JobDefinition, JobInstance};
use crate::payload::{JobEvent, JobManager, LaunchError, LaunchOutcome, PayloadRegistry, launch};
use crate::state::State;
use crate::store::Store;

/// The worker pool has no free slot for another launch.
#[derive(Debug, thiserror::Error)]
#[error("worker pool full")]
pub struct PoolFull;

#[derive(Clone)]
pub struct ExecutionSupervisor {
    store: Arc<dyn Store>,
    registry: PayloadRegistry,
    archiver: HistoryArchiver,
    pool: Arc<Semaphore>,
    nb_thread: usize,
    kill_poll_ms: u64,
}

impl ExecutionSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        registry: PayloadRegistry,
        nb_thread: usize,
        kill_poll_ms: u64,
    ) -> Self {
        let nb_thread = nb_thread.max(1);
        Self {
            archiver: HistoryArchiver::new(store.clone()),
            store,
            registry,
            pool: Arc::new(Semaphore::new(nb_thread)),
            nb_thread,
            kill_poll_ms: kill_poll_ms.max(1),
        }
    }

    /// Claim a worker slot and run the instance on it. Fails fast with
    /// [`PoolFull`] when every slot is busy; the caller then releases the
    /// attribution so another node can pick the instance up.
    pub fn try_execute(
        &self,
        definition: JobDefinition,
        instance: JobInstance,
    ) -> Result<(), PoolFull> {
        let permit = self.pool.clone().try_acquire_owned().map_err(|_| PoolFull)?;
        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.run_instance(definition, instance).await;
            drop(permit);
        });
        Ok(())
    }

    /// Wait until every worker slot is free again. Used at shutdown to let
    /// in-flight launches finish.
    pub async fn wait_idle(&self) {
        let permits = self
            .pool
            .acquire_many(self.nb_thread as u32)
            .await
            .expect("worker pool semaphore closed");
        drop(permits);
    }

    async fn run_instance(&self, definition: JobDefinition, instance: JobInstance) {
        let instance_id = instance.id;

        if let Err(err) = self.store.mark_running(instance_id).await {
            // Lost a race with an external cancel; archive the terminal
            // state if the row is still live.
            if let Ok(Some(current)) = self.store.find_instance(instance_id).await
                && current.state.is_terminal()
            {
                if let Err(err) = self.archiver.archive(instance_id, current.state).await {
                    error!(instance = %instance_id, error = %err, "archive after cancel failed");
                }
            } else {
                warn!(instance = %instance_id, error = %err, "cannot mark instance running");
            }
            return;
        }
        info!(
            instance = %instance_id,
            job = %definition.name,
            "job instance starting"
        );

        // Load faults never reach a worker thread.
        let shape = match self.registry.load(&definition) {
            Ok(shape) => shape,
            Err(err) => {
                warn!(instance = %instance_id, job = %definition.name, error = %err, "payload load failed");
                if let Err(err) = self
                    .store
                    .append_message(instance_id, &format!("Could not load payload: {err}"))
                    .await
                {
                    warn!(instance = %instance_id, error = %err, "failed to persist load fault");
                }
                self.finish(instance_id, State::Crashed).await;
                return;
            }
        };

        let kill_flag = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let manager = JobManager::new(
            instance_id,
            instance.parameters.clone(),
            kill_flag.clone(),
            event_tx,
        );

        let (done_tx, done_rx) = watch::channel(false);
        let watcher = tokio::spawn(kill_watcher(
            self.store.clone(),
            instance_id,
            kill_flag,
            self.kill_poll_ms,
            done_rx,
        ));
        let drain = tokio::spawn(drain_events(self.store.clone(), instance_id, event_rx));

        let launched = tokio::task::spawn_blocking(move || launch(shape, manager)).await;

        let _ = done_tx.send(true);
        if let Err(err) = watcher.await {
            warn!(instance = %instance_id, error = %err, "kill watcher task failed");
        }
        // The payload dropped its handle when the blocking task ended, so
        // the drain sees end-of-channel once all events are persisted.
        if let Err(err) = drain.await {
            warn!(instance = %instance_id, error = %err, "event drain task failed");
        }

        let final_state = match launched {
            Ok(Ok(LaunchOutcome::Completed)) => State::Done,
            Ok(Ok(LaunchOutcome::Killed)) => {
                self.note(instance_id, "Kill order acknowledged").await;
                State::Killed
            }
            Ok(Err(LaunchError::Runtime(text))) => {
                warn!(instance = %instance_id, error = %text, "job instance failed");
                self.note(instance_id, &format!("Job crashed: {text}")).await;
                State::Crashed
            }
            Ok(Err(LaunchError::Panic(text))) => {
                error!(instance = %instance_id, panic = %text, "job instance panicked");
                self.note(instance_id, &format!("Job panicked: {text}")).await;
                State::Crashed
            }
            Err(join_err) => {
                error!(instance = %instance_id, error = %join_err, "worker thread failed");
                State::Crashed
            }
        };
        self.finish(instance_id, final_state).await;
    }

    async fn note(&self, instance_id: Uuid, text: &str) {
        if let Err(err) = self.store.append_message(instance_id, text).await {
            warn!(instance = %instance_id, error = %err, "failed to persist message");
        }
    }

    async fn finish(&self, instance_id: Uuid, final_state: State) {
        if let Err(err) = self.archiver.archive(instance_id, final_state).await {
            error!(instance = %instance_id, state = %final_state, error = %err, "archival failed");
        }
    }
}

/// Poll the store's kill flag until the run ends or a kill is seen, then
/// flip the payload-visible atomic so the next checkpoint unwinds.
async fn kill_watcher(
    store: Arc<dyn Store>,
    instance_id: Uuid,
    kill_flag: Arc<AtomicBool>,
    poll_ms: u64,
    mut done: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_millis(poll_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.kill_requested(instance_id).await {
                    Ok(true) => {
                        info!(instance = %instance_id, "kill requested");
                        kill_flag.store(true, Ordering::Relaxed);
                        return;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(instance = %instance_id, error = %err, "kill poll failed");
                    }
                }
            }
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    return;
                }
            }
        }
    }
}

async fn drain_events(
    store: Arc<dyn Store>,
    instance_id: Uuid,
    mut events: mpsc::UnboundedReceiver<JobEvent>,
) {
    while let Some(event) = events.recv().await {
        let written = match event {
            JobEvent::Message(text) => store.append_message(instance_id, &text).await,
            JobEvent::Progress(progress) => store.update_progress(instance_id, progress).await,
            JobEvent::Deliverable {
                file_path,
                original_file_name,
                file_family,
            } => {
                store
                    .register_deliverable(Deliverable {
                        id: Uuid::new_v4(),
                        random_id: Uuid::new_v4(),
                        file_path,
                        original_file_name,
                        file_family,
                        job_instance_id: instance_id,
                    })
                    .await
            }
        };
        if let Err(err) = written {
            warn!(instance = %instance_id, error = %err, "failed to persist job event");
        }
    }
}
