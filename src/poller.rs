//! Queue polling loop.
//!
//! One poller per (node, queue) binding. Each tick it checks its worker
//! pool headroom, takes the oldest Submitted instances in order, expires
//! stale ones, runs the Highlander election and attributes winners to
//! this node. An instance the pool cannot take is released back to
//! Submitted so any node can pick it up on a later tick.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, warn};

use crate::bootstrap::is_stale;
use crate::highlander;
use crate::model::{DeploymentParameter, Node, Queue};
use crate::state::State;
use crate::store::Store;
use crate::supervisor::ExecutionSupervisor;

pub struct QueuePoller {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl QueuePoller {
    pub fn start(
        store: Arc<dyn Store>,
        node: Node,
        queue: Queue,
        binding: DeploymentParameter,
        supervisor: ExecutionSupervisor,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let task = PollerTask {
                store,
                node,
                queue,
                binding,
                supervisor,
                shutdown_rx,
            };
            if let Err(err) = task.run().await {
                error!(?err, "queue poller terminated with error");
                Err(err)
            } else {
                Ok(())
            }
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("queue poller task panicked: {err}")),
        }
    }
}

struct PollerTask {
    store: Arc<dyn Store>,
    node: Node,
    queue: Queue,
    binding: DeploymentParameter,
    supervisor: ExecutionSupervisor,
    shutdown_rx: watch::Receiver<bool>,
}

impl PollerTask {
    async fn run(mut self) -> Result<()> {
        info!(
            node = %self.node.name,
            queue = %self.queue.name,
            nb_thread = self.binding.nb_thread,
            interval_ms = self.binding.polling_interval_ms,
            "starting queue poller"
        );

        let mut ticker = interval(Duration::from_millis(self.binding.polling_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(queue = %self.queue.name, error = %err, "poll tick failed");
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!(node = %self.node.name, queue = %self.queue.name, "queue poller shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        let active = self
            .store
            .count_active_instances(self.node.id, self.queue.id)
            .await?;
        let capacity = self.binding.nb_thread.saturating_sub(active);
        if capacity == 0 {
            debug!(queue = %self.queue.name, "worker pool saturated, skipping tick");
            return Ok(());
        }

        let mut taken = 0;
        while taken < capacity {
            let Some(instance) = self.store.next_submitted(self.queue.id).await? else {
                break;
            };

            if is_stale(instance.creation_date, &self.queue) {
                warn!(
                    instance = %instance.id,
                    queue = %self.queue.name,
                    ttl_seconds = self.queue.time_to_live,
                    "expiring stale instance"
                );
                self.store
                    .append_message(
                        instance.id,
                        &format!(
                            "Expired: waited past the queue time-to-live of {}s",
                            self.queue.time_to_live
                        ),
                    )
                    .await?;
                self.store
                    .archive_instance(instance.id, State::Crashed, chrono::Utc::now())
                    .await?;
                continue;
            }

            let definition = self.store.find_job_definition(instance.job_def_id).await?;
            let decision = highlander::resolve(self.store.as_ref(), &definition, &instance).await?;
            if !decision.attribute {
                // A singleton sibling is running; the instance waits.
                break;
            }

            let won = self
                .store
                .attribute_instance(instance.id, self.node.id, &decision.cancel)
                .await?;
            if !won {
                // A competing poller claimed the row first.
                continue;
            }
            for cancelled in &decision.cancel {
                if let Some(sibling) = self.store.find_instance(*cancelled).await?
                    && sibling.state == State::Cancelled
                {
                    self.store
                        .archive_instance(sibling.id, State::Cancelled, chrono::Utc::now())
                        .await?;
                }
            }

            // Re-read: attribution stamped the node and date.
            let Some(attributed) = self.store.find_instance(instance.id).await? else {
                continue;
            };
            match self.supervisor.try_execute(definition, attributed) {
                Ok(()) => taken += 1,
                Err(_) => {
                    debug!(instance = %instance.id, "worker pool full, releasing attribution");
                    self.store.release_attribution(instance.id).await?;
                    break;
                }
            }
        }
        Ok(())
    }
}
