//! Engine assembly: bootstrap the node, then start one poller and one
//! supervisor per (node, queue) binding. Shutdown stops the pollers first
//! and then waits for in-flight launches to drain.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::bootstrap;
use crate::model::Node;
use crate::payload::PayloadRegistry;
use crate::poller::QueuePoller;
use crate::store::Store;
use crate::supervisor::ExecutionSupervisor;

pub struct Engine {
    node: Node,
    pollers: Vec<QueuePoller>,
    supervisors: Vec<ExecutionSupervisor>,
}

impl Engine {
    pub async fn start(
        store: Arc<dyn Store>,
        registry: PayloadRegistry,
        node_name: &str,
    ) -> Result<Self> {
        let report = bootstrap::ensure_node(store.as_ref(), node_name).await?;
        let kill_poll_ms = bootstrap::internal_polling_period(store.as_ref()).await?;

        let mut pollers = Vec::with_capacity(report.bindings.len());
        let mut supervisors = Vec::with_capacity(report.bindings.len());
        for binding in report.bindings {
            let queue = store.find_queue(binding.queue_id).await?;
            let supervisor = ExecutionSupervisor::new(
                store.clone(),
                registry.clone(),
                binding.nb_thread,
                kill_poll_ms,
            );
            supervisors.push(supervisor.clone());
            pollers.push(QueuePoller::start(
                store.clone(),
                report.node.clone(),
                queue,
                binding,
                supervisor,
            ));
        }

        info!(
            node = %report.node.name,
            pollers = pollers.len(),
            "engine started"
        );
        Ok(Self {
            node: report.node,
            pollers,
            supervisors,
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Stop polling, then wait for every running launch to reach a
    /// terminal state and be archived.
    pub async fn shutdown(self) -> Result<()> {
        for poller in &self.pollers {
            poller.trigger_shutdown();
        }
        for poller in self.pollers {
            poller.shutdown().await?;
        }
        for supervisor in &self.supervisors {
            supervisor.wait_idle().await;
        }
        info!(node = %self.node.name, "engine stopped");
        Ok(())
    }
}
