//! End-to-end engine tests over the in-memory store.
//!
//! Each test seeds its own topology (node, queue, binding), registers
//! payloads, starts an engine and watches instances travel from
//! submission to history.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::time::{Instant, sleep};
use uuid::Uuid;

use kiln::{
    DeploymentParameter, Engine, History, JobDefinition, JobManager, JobParameter, MemoryStore,
    Node, PayloadError, PayloadRegistry, PayloadShape, Queue, RunnableJob, State, Store,
    SubmissionRequest,
};

const FAST_POLL_MS: u64 = 25;

async fn seed_topology(store: &MemoryStore, node_name: &str, nb_thread: usize) -> Queue {
    let node = Node {
        id: Uuid::new_v4(),
        name: node_name.to_string(),
        port: 0,
        repo_directory: "./target/kiln-test/jobs/".to_string(),
        deliverable_directory: "./target/kiln-test/outputfiles/".to_string(),
        export_directory: "./target/kiln-test/exports/".to_string(),
    };
    let queue = Queue {
        id: Uuid::new_v4(),
        name: "DEFAULT".to_string(),
        description: "test queue".to_string(),
        default_queue: true,
        time_to_live: 1024,
    };
    store.insert_node(node.clone()).await.unwrap();
    store.insert_queue(queue.clone()).await.unwrap();
    store
        .insert_deployment_parameter(DeploymentParameter {
            id: Uuid::new_v4(),
            node_id: node.id,
            queue_id: queue.id,
            nb_thread,
            polling_interval_ms: FAST_POLL_MS,
        })
        .await
        .unwrap();
    // Fast kill polling for the tests that need it.
    store
        .insert_global_parameter("internal_polling_period_ms", "25")
        .await
        .unwrap();
    queue
}

async fn register_definition(
    store: &MemoryStore,
    queue: &Queue,
    name: &str,
    highlander: bool,
    parameters: Vec<JobParameter>,
) -> JobDefinition {
    let definition = JobDefinition {
        id: Uuid::new_v4(),
        name: name.to_string(),
        entry_point: name.to_string(),
        queue_id: queue.id,
        highlander,
        parameters,
        dependencies: vec![],
    };
    store
        .insert_job_definition(definition.clone())
        .await
        .unwrap();
    definition
}

async fn wait_for_history(store: &MemoryStore, instance_id: Uuid) -> History {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(history) = store.find_history(instance_id).await.unwrap() {
            return history;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for instance {instance_id} to be archived"
        );
        sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_state(store: &MemoryStore, instance_id: Uuid, state: State) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(instance) = store.find_instance(instance_id).await.unwrap()
            && instance.state == state
        {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for instance {instance_id} to reach {state}"
        );
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completed_instance_is_archived_with_parameters_and_messages() -> Result<()> {
    let store = MemoryStore::new();
    let queue = seed_topology(&store, "archive-node", 2).await;
    register_definition(&store, &queue, "reporter", false, vec![]).await;

    struct Reporter(Option<JobManager>);
    impl RunnableJob for Reporter {
        fn bind(&mut self, manager: JobManager) {
            self.0 = Some(manager);
        }
        fn run(&mut self) -> Result<(), PayloadError> {
            let manager = self.0.as_ref().unwrap();
            manager.send_message("phase one");
            manager.set_progress(50);
            manager.send_message("phase two");
            manager.send_message("phase three");
            manager.set_progress(100);
            Ok(())
        }
    }

    let registry = PayloadRegistry::new();
    registry.register_payload("reporter", || PayloadShape::runnable(Reporter(None)));
    let engine = Engine::start(Arc::new(store.clone()), registry, "archive-node").await?;

    let instance = store
        .submit_instance(
            SubmissionRequest::new("reporter")
                .with_parameter("period", "2026-08")
                .with_parameter("format", "csv"),
        )
        .await?;

    let history = wait_for_history(&store, instance.id).await;
    assert_eq!(history.final_state, State::Done);
    assert_eq!(history.progress, 100);
    assert_eq!(history.parameters.len(), 2);
    assert!(history.attribution_date.is_some());
    assert!(history.execution_date.is_some());
    let texts: Vec<&str> = history.messages.iter().map(|m| m.text.as_str()).collect();
    assert!(texts.contains(&"Status updated: ATTRIBUTED"));
    assert!(texts.contains(&"Status updated: RUNNING"));
    assert!(texts.contains(&"phase one"));
    assert!(texts.contains(&"phase two"));
    assert!(texts.contains(&"phase three"));

    // The live row is gone once the instance is in history.
    assert!(store.find_instance(instance.id).await?.is_none());

    engine.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn static_payload_receives_values_in_key_order() -> Result<()> {
    let store = MemoryStore::new();
    let queue = seed_topology(&store, "static-node", 2).await;
    register_definition(&store, &queue, "summing", false, vec![]).await;

    let captured: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let registry = PayloadRegistry::new();
    let sink = captured.clone();
    registry.register_payload("summing", move || {
        let sink = sink.clone();
        PayloadShape::static_main(move |args| {
            sink.lock().unwrap().push(args);
            Ok(())
        })
    });
    let engine = Engine::start(Arc::new(store.clone()), registry, "static-node").await?;

    let instance = store
        .submit_instance(
            SubmissionRequest::new("summing")
                .with_parameter("zeta", "last")
                .with_parameter("alpha", "first")
                .with_parameter("mu", "middle"),
        )
        .await?;

    let history = wait_for_history(&store, instance.id).await;
    assert_eq!(history.final_state, State::Done);
    let calls = captured.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], vec!["first", "middle", "last"]);
    drop(calls);

    engine.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn load_fault_crashes_instance_without_running_payload() -> Result<()> {
    let store = MemoryStore::new();
    let queue = seed_topology(&store, "load-node", 2).await;
    register_definition(&store, &queue, "hollow", false, vec![]).await;

    // Registered but exposing no calling convention.
    let registry = PayloadRegistry::new();
    registry.register_payload("hollow", PayloadShape::default);
    let engine = Engine::start(Arc::new(store.clone()), registry, "load-node").await?;

    let instance = store.submit_instance(SubmissionRequest::new("hollow")).await?;
    let history = wait_for_history(&store, instance.id).await;
    assert_eq!(history.final_state, State::Crashed);
    assert!(
        history
            .messages
            .iter()
            .any(|m| m.text.contains("Could not load payload"))
    );

    engine.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_artifact_dependency_crashes_instance() -> Result<()> {
    let store = MemoryStore::new();
    let queue = seed_topology(&store, "artifact-node", 2).await;
    let mut definition = register_definition(&store, &queue, "etl", false, vec![]).await;
    definition.dependencies = vec!["lib-that-is-not-deployed".to_string()];
    store.insert_job_definition(definition).await?;

    struct Noop;
    impl RunnableJob for Noop {
        fn run(&mut self) -> Result<(), PayloadError> {
            Ok(())
        }
    }
    let registry = PayloadRegistry::new();
    registry.register_payload("etl", || PayloadShape::runnable(Noop));
    let engine = Engine::start(Arc::new(store.clone()), registry, "artifact-node").await?;

    let instance = store.submit_instance(SubmissionRequest::new("etl")).await?;
    let history = wait_for_history(&store, instance.id).await;
    assert_eq!(history.final_state, State::Crashed);

    engine.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_request_terminates_running_instance() -> Result<()> {
    let store = MemoryStore::new();
    let queue = seed_topology(&store, "kill-node", 2).await;
    register_definition(&store, &queue, "long-haul", false, vec![]).await;

    struct LongHaul(Option<JobManager>);
    impl RunnableJob for LongHaul {
        fn bind(&mut self, manager: JobManager) {
            self.0 = Some(manager);
        }
        fn run(&mut self) -> Result<(), PayloadError> {
            let manager = self.0.as_ref().unwrap();
            loop {
                manager.checkpoint()?;
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    let registry = PayloadRegistry::new();
    registry.register_payload("long-haul", || PayloadShape::runnable(LongHaul(None)));
    let engine = Engine::start(Arc::new(store.clone()), registry, "kill-node").await?;

    let instance = store
        .submit_instance(SubmissionRequest::new("long-haul"))
        .await?;
    wait_for_state(&store, instance.id, State::Running).await;
    store.request_kill(instance.id).await?;

    let history = wait_for_history(&store, instance.id).await;
    assert_eq!(history.final_state, State::Killed);
    assert!(
        history
            .messages
            .iter()
            .any(|m| m.text == "Kill order acknowledged")
    );

    engine.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_payload_crashes_only_its_instance() -> Result<()> {
    let store = MemoryStore::new();
    let queue = seed_topology(&store, "panic-node", 2).await;
    register_definition(&store, &queue, "bomb", false, vec![]).await;
    register_definition(&store, &queue, "steady", false, vec![]).await;

    struct Bomb;
    impl RunnableJob for Bomb {
        fn run(&mut self) -> Result<(), PayloadError> {
            panic!("boom");
        }
    }
    struct Steady;
    impl RunnableJob for Steady {
        fn run(&mut self) -> Result<(), PayloadError> {
            Ok(())
        }
    }

    let registry = PayloadRegistry::new();
    registry.register_payload("bomb", || PayloadShape::runnable(Bomb));
    registry.register_payload("steady", || PayloadShape::runnable(Steady));
    let engine = Engine::start(Arc::new(store.clone()), registry, "panic-node").await?;

    let doomed = store.submit_instance(SubmissionRequest::new("bomb")).await?;
    let survivor = store
        .submit_instance(SubmissionRequest::new("steady"))
        .await?;

    let crashed = wait_for_history(&store, doomed.id).await;
    assert_eq!(crashed.final_state, State::Crashed);
    assert!(crashed.messages.iter().any(|m| m.text.contains("boom")));

    let done = wait_for_history(&store, survivor.id).await;
    assert_eq!(done.final_state, State::Done);

    engine.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn highlander_definition_never_has_two_live_instances() -> Result<()> {
    let store = MemoryStore::new();
    let queue = seed_topology(&store, "highlander-node", 4).await;
    register_definition(&store, &queue, "singleton", true, vec![]).await;

    struct Slow;
    impl RunnableJob for Slow {
        fn run(&mut self) -> Result<(), PayloadError> {
            std::thread::sleep(Duration::from_millis(80));
            Ok(())
        }
    }
    let registry = PayloadRegistry::new();
    registry.register_payload("singleton", || PayloadShape::runnable(Slow));

    // All three are queued before any poller sees them; the election must
    // keep the oldest and cancel the waiting siblings.
    let first = store
        .submit_instance(SubmissionRequest::new("singleton"))
        .await?;
    let second = store
        .submit_instance(SubmissionRequest::new("singleton"))
        .await?;
    let third = store
        .submit_instance(SubmissionRequest::new("singleton"))
        .await?;
    let engine = Engine::start(Arc::new(store.clone()), registry, "highlander-node").await?;

    let histories = [
        wait_for_history(&store, first.id).await,
        wait_for_history(&store, second.id).await,
        wait_for_history(&store, third.id).await,
    ];
    let done = histories
        .iter()
        .filter(|h| h.final_state == State::Done)
        .count();
    let cancelled = histories
        .iter()
        .filter(|h| h.final_state == State::Cancelled)
        .count();
    assert_eq!(done, 1, "exactly one singleton instance must run");
    assert_eq!(cancelled, 2, "waiting siblings lose the election");
    assert!(
        histories
            .iter()
            .filter(|h| h.final_state == State::Cancelled)
            .all(|h| h.execution_date.is_none())
    );

    engine.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_worker_runs_instances_in_queue_order() -> Result<()> {
    let store = MemoryStore::new();
    let queue = seed_topology(&store, "fifo-node", 1).await;
    register_definition(&store, &queue, "ordered", false, vec![]).await;

    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let registry = PayloadRegistry::new();
    let sink = order.clone();
    registry.register_payload("ordered", move || {
        let sink = sink.clone();
        PayloadShape::static_main(move |args| {
            sink.lock().unwrap().push(args[0].clone());
            Ok(())
        })
    });
    let engine = Engine::start(Arc::new(store.clone()), registry, "fifo-node").await?;

    let mut last = None;
    for tag in ["one", "two", "three"] {
        last = Some(
            store
                .submit_instance(SubmissionRequest::new("ordered").with_parameter("tag", tag))
                .await?,
        );
    }
    wait_for_history(&store, last.unwrap().id).await;

    assert_eq!(*order.lock().unwrap(), vec!["one", "two", "three"]);
    engine.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saturated_pool_rejects_and_attribution_is_released() -> Result<()> {
    let store = MemoryStore::new();
    let queue = seed_topology(&store, "saturated-node", 1).await;
    let node = store.find_node("saturated-node").await?.unwrap();
    let definition = register_definition(&store, &queue, "slow-lane", false, vec![]).await;

    struct Sleepy;
    impl RunnableJob for Sleepy {
        fn run(&mut self) -> Result<(), PayloadError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        }
    }
    let registry = PayloadRegistry::new();
    registry.register_payload("slow-lane", || PayloadShape::runnable(Sleepy));

    // One worker slot, driven directly: the second launch must be refused
    // while the first holds the slot.
    let supervisor = kiln::ExecutionSupervisor::new(Arc::new(store.clone()), registry, 1, 25);

    let first = store
        .submit_instance(SubmissionRequest::new("slow-lane"))
        .await?;
    assert!(store.attribute_instance(first.id, node.id, &[]).await?);
    let attributed = store.find_instance(first.id).await?.unwrap();
    assert!(supervisor.try_execute(definition.clone(), attributed).is_ok());

    let second = store
        .submit_instance(SubmissionRequest::new("slow-lane"))
        .await?;
    assert!(store.attribute_instance(second.id, node.id, &[]).await?);
    let rejected = store.find_instance(second.id).await?.unwrap();
    assert!(supervisor.try_execute(definition, rejected).is_err());

    // The rejected instance goes back to the queue for any node to take.
    store.release_attribution(second.id).await?;
    let released = store.find_instance(second.id).await?.unwrap();
    assert_eq!(released.state, State::Submitted);
    assert_eq!(released.node_id, None);

    let history = wait_for_history(&store, first.id).await;
    assert_eq!(history.final_state, State::Done);
    supervisor.wait_idle().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_instance_expires_without_execution() -> Result<()> {
    let store = MemoryStore::new();
    let node = Node {
        id: Uuid::new_v4(),
        name: "stale-node".to_string(),
        port: 0,
        repo_directory: "./target/kiln-test/jobs/".to_string(),
        deliverable_directory: "./target/kiln-test/outputfiles/".to_string(),
        export_directory: "./target/kiln-test/exports/".to_string(),
    };
    let queue = Queue {
        id: Uuid::new_v4(),
        name: "SHORT-LIVED".to_string(),
        description: String::new(),
        default_queue: true,
        time_to_live: 1,
    };
    store.insert_node(node.clone()).await?;
    store.insert_queue(queue.clone()).await?;
    store
        .insert_deployment_parameter(DeploymentParameter {
            id: Uuid::new_v4(),
            node_id: node.id,
            queue_id: queue.id,
            nb_thread: 1,
            polling_interval_ms: FAST_POLL_MS,
        })
        .await?;
    register_definition(&store, &queue, "never-runs", false, vec![]).await;

    struct Never;
    impl RunnableJob for Never {
        fn run(&mut self) -> Result<(), PayloadError> {
            panic!("a stale instance must never execute");
        }
    }
    let registry = PayloadRegistry::new();
    registry.register_payload("never-runs", || PayloadShape::runnable(Never));

    // Let the instance outlive the queue's one-second time-to-live before
    // any poller sees it.
    let instance = store
        .submit_instance(SubmissionRequest::new("never-runs"))
        .await?;
    sleep(Duration::from_millis(1200)).await;
    let engine = Engine::start(Arc::new(store.clone()), registry, "stale-node").await?;

    let history = wait_for_history(&store, instance.id).await;
    assert_eq!(history.final_state, State::Crashed);
    assert!(history.execution_date.is_none());
    assert!(history.messages.iter().any(|m| m.text.contains("Expired")));

    engine.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_waits_for_running_instances() -> Result<()> {
    let store = MemoryStore::new();
    let queue = seed_topology(&store, "drain-node", 2).await;
    register_definition(&store, &queue, "slowish", false, vec![]).await;

    struct Slowish;
    impl RunnableJob for Slowish {
        fn run(&mut self) -> Result<(), PayloadError> {
            std::thread::sleep(Duration::from_millis(150));
            Ok(())
        }
    }
    let registry = PayloadRegistry::new();
    registry.register_payload("slowish", || PayloadShape::runnable(Slowish));
    let engine = Engine::start(Arc::new(store.clone()), registry, "drain-node").await?;

    let instance = store
        .submit_instance(SubmissionRequest::new("slowish"))
        .await?;
    wait_for_state(&store, instance.id, State::Running).await;

    engine.shutdown().await?;

    // Shutdown returned only after the launch finished and was archived.
    let history = store.find_history(instance.id).await?.unwrap();
    assert_eq!(history.final_state, State::Done);
    Ok(())
}
