//! Node bootstrap: make the store's configuration complete enough to poll.
//!
//! Runs once at engine startup and is idempotent at the level of each
//! individual record, so a crash halfway through heals on the next start.
//! Creates the node row, guarantees exactly one default queue, seeds the
//! baseline global parameters on first boot, registers the engine's own
//! connection alias and gives an unbound node a default queue binding.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{ConnectionAlias, DeploymentParameter, Node, Queue};
use crate::store::{Store, StoreError, StoreResult};

pub const DEFAULT_QUEUE_NAME: &str = "DEFAULT";
pub const DEFAULT_QUEUE_TTL_SECONDS: i64 = 1024;
pub const DEFAULT_NB_THREAD: usize = 5;
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_CONNECTION_ALIAS: &str = "default";

/// Key of the supervisor's kill-poll period, in milliseconds.
pub const INTERNAL_POLLING_PERIOD_MS: &str = "internal_polling_period_ms";

const BASELINE_GLOBAL_PARAMETERS: [(&str, &str); 6] = [
    ("default_connection", DEFAULT_CONNECTION_ALIAS),
    ("deadline", "10"),
    ("log_file_per_launch", "true"),
    (INTERNAL_POLLING_PERIOD_MS, "10000"),
    ("alive_signal_ms", "60000"),
    ("artifact_repo", "./jobs/"),
];

/// What bootstrap settled on, fed straight into poller construction.
pub struct BootstrapReport {
    pub node: Node,
    pub default_queue: Queue,
    pub bindings: Vec<DeploymentParameter>,
}

/// Bring the store to a runnable configuration for `node_name`.
pub async fn ensure_node(store: &dyn Store, node_name: &str) -> StoreResult<BootstrapReport> {
    let node = match store.find_node(node_name).await? {
        Some(node) => node,
        None => {
            let node = Node {
                id: Uuid::new_v4(),
                name: node_name.to_string(),
                port: 0,
                repo_directory: "./jobs/".to_string(),
                deliverable_directory: "./outputfiles/".to_string(),
                export_directory: "./exports/".to_string(),
            };
            store.insert_node(node.clone()).await?;
            info!(node = %node.name, "registered node");
            node
        }
    };

    for dir in [
        &node.repo_directory,
        &node.deliverable_directory,
        &node.export_directory,
    ] {
        tokio::fs::create_dir_all(dir).await.map_err(|err| {
            StoreError::Message(format!("cannot create node directory {dir}: {err}"))
        })?;
    }

    let default_queue = ensure_default_queue(store).await?;

    if store.count_global_parameters().await? == 0 {
        for (key, value) in BASELINE_GLOBAL_PARAMETERS {
            store.insert_global_parameter(key, value).await?;
        }
        info!("seeded baseline global parameters");
    }

    if store
        .find_connection_alias(DEFAULT_CONNECTION_ALIAS)
        .await?
        .is_none()
    {
        let description = store.connection_description();
        store
            .insert_connection_alias(ConnectionAlias {
                name: DEFAULT_CONNECTION_ALIAS.to_string(),
                ..description
            })
            .await?;
    }

    let mut bindings = store.deployment_parameters_for_node(node.id).await?;
    if bindings.is_empty() {
        let binding = DeploymentParameter {
            id: Uuid::new_v4(),
            node_id: node.id,
            queue_id: default_queue.id,
            nb_thread: DEFAULT_NB_THREAD,
            polling_interval_ms: DEFAULT_POLLING_INTERVAL_MS,
        };
        store.insert_deployment_parameter(binding.clone()).await?;
        info!(
            node = %node.name,
            queue = %default_queue.name,
            "bound unconfigured node to the default queue"
        );
        bindings.push(binding);
    }

    Ok(BootstrapReport {
        node,
        default_queue,
        bindings,
    })
}

/// Guarantee exactly one default queue, creating DEFAULT when the store has
/// no queues at all. With zero or several defaults among existing queues
/// the first by name wins, so every node repairs to the same answer.
async fn ensure_default_queue(store: &dyn Store) -> StoreResult<Queue> {
    let queues = store.list_queues().await?;
    if queues.is_empty() {
        let queue = Queue {
            id: Uuid::new_v4(),
            name: DEFAULT_QUEUE_NAME.to_string(),
            description: "default queue".to_string(),
            default_queue: true,
            time_to_live: DEFAULT_QUEUE_TTL_SECONDS,
        };
        store.insert_queue(queue.clone()).await?;
        info!(queue = %queue.name, "created default queue");
        return Ok(queue);
    }

    let defaults: Vec<&Queue> = queues.iter().filter(|q| q.default_queue).collect();
    match defaults.len() {
        1 => Ok(defaults[0].clone()),
        0 => {
            // list_queues is name-ordered.
            let chosen = queues[0].clone();
            warn!(queue = %chosen.name, "no default queue configured, electing one");
            store.set_default_queue(chosen.id, true).await?;
            Ok(Queue {
                default_queue: true,
                ..chosen
            })
        }
        _ => {
            let chosen = defaults[0].clone();
            warn!(
                queue = %chosen.name,
                extras = defaults.len() - 1,
                "several default queues configured, keeping the first"
            );
            for extra in &defaults[1..] {
                store.set_default_queue(extra.id, false).await?;
            }
            Ok(chosen)
        }
    }
}

/// Read the supervisor kill-poll period, falling back to the baseline.
pub async fn internal_polling_period(store: &dyn Store) -> StoreResult<u64> {
    let period = store
        .get_global_parameter(INTERNAL_POLLING_PERIOD_MS)
        .await?
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(10_000);
    Ok(period.max(1))
}

/// End-of-wait cutoff for a queue: seconds a Submitted instance may sit
/// before it is expired as Crashed.
pub fn staleness_cutoff(queue: &Queue) -> chrono::Duration {
    chrono::Duration::seconds(queue.time_to_live.max(0))
}

/// True when the instance has outlived its queue's time-to-live.
pub fn is_stale(instance_created: chrono::DateTime<Utc>, queue: &Queue) -> bool {
    queue.time_to_live > 0 && Utc::now() - instance_created > staleness_cutoff(queue)
}
