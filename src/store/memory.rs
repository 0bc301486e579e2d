//! Embedded in-memory store used when no database is configured, and by
//! the test suite. One mutex over the whole dataset gives every composite
//! operation the same atomicity the Postgres store gets from transactions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult};
use crate::model::{
    ConnectionAlias, Deliverable, DeploymentParameter, History, JobDefinition, JobInstance,
    JobParameter, Message, Node, Queue, SubmissionRequest,
};
use crate::state::State;

#[derive(Default)]
struct Inner {
    nodes: HashMap<Uuid, Node>,
    queues: HashMap<Uuid, Queue>,
    global_parameters: HashMap<String, String>,
    connection_aliases: HashMap<String, ConnectionAlias>,
    deployment_parameters: Vec<DeploymentParameter>,
    job_definitions: HashMap<Uuid, JobDefinition>,
    instances: HashMap<Uuid, JobInstance>,
    instance_messages: HashMap<Uuid, Vec<Message>>,
    deliverables: Vec<Deliverable>,
    histories: HashMap<Uuid, History>,
    next_position: HashMap<Uuid, i64>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store poisoned")
    }
}

fn push_message(inner: &mut Inner, instance_id: Uuid, text: &str) {
    inner
        .instance_messages
        .entry(instance_id)
        .or_default()
        .push(Message {
            id: Uuid::new_v4(),
            text: text.to_string(),
            created_at: Utc::now(),
        });
}

fn instance_mut<'a>(inner: &'a mut Inner, instance_id: Uuid) -> StoreResult<&'a mut JobInstance> {
    inner
        .instances
        .get_mut(&instance_id)
        .ok_or_else(|| StoreError::not_found("job instance", instance_id))
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_node(&self, name: &str) -> StoreResult<Option<Node>> {
        let inner = self.lock();
        Ok(inner.nodes.values().find(|n| n.name == name).cloned())
    }

    async fn insert_node(&self, node: Node) -> StoreResult<()> {
        self.lock().nodes.insert(node.id, node);
        Ok(())
    }

    async fn list_queues(&self) -> StoreResult<Vec<Queue>> {
        let inner = self.lock();
        let mut queues: Vec<Queue> = inner.queues.values().cloned().collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(queues)
    }

    async fn find_queue(&self, id: Uuid) -> StoreResult<Queue> {
        self.lock()
            .queues
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("queue", id))
    }

    async fn insert_queue(&self, queue: Queue) -> StoreResult<()> {
        self.lock().queues.insert(queue.id, queue);
        Ok(())
    }

    async fn set_default_queue(&self, queue_id: Uuid, default_queue: bool) -> StoreResult<()> {
        let mut inner = self.lock();
        let queue = inner
            .queues
            .get_mut(&queue_id)
            .ok_or_else(|| StoreError::not_found("queue", queue_id))?;
        queue.default_queue = default_queue;
        Ok(())
    }

    async fn get_global_parameter(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.lock().global_parameters.get(key).cloned())
    }

    async fn insert_global_parameter(&self, key: &str, value: &str) -> StoreResult<()> {
        self.lock()
            .global_parameters
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
        Ok(())
    }

    async fn count_global_parameters(&self) -> StoreResult<i64> {
        Ok(self.lock().global_parameters.len() as i64)
    }

    async fn find_connection_alias(&self, name: &str) -> StoreResult<Option<ConnectionAlias>> {
        Ok(self.lock().connection_aliases.get(name).cloned())
    }

    async fn insert_connection_alias(&self, alias: ConnectionAlias) -> StoreResult<()> {
        self.lock()
            .connection_aliases
            .entry(alias.name.clone())
            .or_insert(alias);
        Ok(())
    }

    fn connection_description(&self) -> ConnectionAlias {
        ConnectionAlias {
            name: String::new(),
            url: "mem://embedded".to_string(),
            user: None,
            password: None,
        }
    }

    async fn deployment_parameters_for_node(
        &self,
        node_id: Uuid,
    ) -> StoreResult<Vec<DeploymentParameter>> {
        Ok(self
            .lock()
            .deployment_parameters
            .iter()
            .filter(|dp| dp.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn insert_deployment_parameter(&self, binding: DeploymentParameter) -> StoreResult<()> {
        self.lock().deployment_parameters.push(binding);
        Ok(())
    }

    async fn insert_job_definition(&self, mut definition: JobDefinition) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(existing) = inner
            .job_definitions
            .values()
            .find(|jd| jd.name == definition.name)
        {
            definition.id = existing.id;
        }
        inner.job_definitions.insert(definition.id, definition);
        Ok(())
    }

    async fn find_job_definition(&self, id: Uuid) -> StoreResult<JobDefinition> {
        self.lock()
            .job_definitions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("job definition", id))
    }

    async fn find_job_definition_by_name(
        &self,
        name: &str,
    ) -> StoreResult<Option<JobDefinition>> {
        Ok(self
            .lock()
            .job_definitions
            .values()
            .find(|jd| jd.name == name)
            .cloned())
    }

    async fn submit_instance(&self, request: SubmissionRequest) -> StoreResult<JobInstance> {
        let mut inner = self.lock();
        let definition = inner
            .job_definitions
            .values()
            .find(|jd| jd.name == request.job_definition)
            .cloned()
            .ok_or_else(|| StoreError::not_found("job definition", &request.job_definition))?;

        let mut parameters: Vec<JobParameter> = definition.parameters.clone();
        for over in &request.parameters {
            match parameters.iter_mut().find(|p| p.key == over.key) {
                Some(existing) => existing.value = over.value.clone(),
                None => parameters.push(over.clone()),
            }
        }

        let position = inner.next_position.entry(definition.queue_id).or_insert(0);
        *position += 1;
        let instance = JobInstance {
            id: Uuid::new_v4(),
            job_def_id: definition.id,
            queue_id: definition.queue_id,
            state: State::Submitted,
            position: *position,
            creation_date: Utc::now(),
            attribution_date: None,
            execution_date: None,
            node_id: None,
            user_name: request.user_name,
            email: request.email,
            session_id: request.session_id,
            application: request.application,
            parent_id: request.parent_id,
            progress: 0,
            kill_requested: false,
            parameters,
        };
        inner.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn count_active_instances(&self, node_id: Uuid, queue_id: Uuid) -> StoreResult<usize> {
        Ok(self
            .lock()
            .instances
            .values()
            .filter(|i| {
                i.node_id == Some(node_id)
                    && i.queue_id == queue_id
                    && matches!(i.state, State::Attributed | State::Running)
            })
            .count())
    }

    async fn next_submitted(&self, queue_id: Uuid) -> StoreResult<Option<JobInstance>> {
        Ok(self
            .lock()
            .instances
            .values()
            .filter(|i| i.queue_id == queue_id && i.state == State::Submitted)
            .min_by_key(|i| (i.position, i.creation_date))
            .cloned())
    }

    async fn non_terminal_instances_of(
        &self,
        job_def_id: Uuid,
        excluding: Uuid,
    ) -> StoreResult<Vec<JobInstance>> {
        let mut instances: Vec<JobInstance> = self
            .lock()
            .instances
            .values()
            .filter(|i| i.job_def_id == job_def_id && i.id != excluding && !i.state.is_terminal())
            .cloned()
            .collect();
        instances.sort_by_key(|i| (i.position, i.creation_date));
        Ok(instances)
    }

    async fn attribute_instance(
        &self,
        instance_id: Uuid,
        node_id: Uuid,
        cancel: &[Uuid],
    ) -> StoreResult<bool> {
        let mut inner = self.lock();
        match inner.instances.get(&instance_id) {
            Some(instance) if instance.state == State::Submitted => {}
            _ => return Ok(false),
        }
        // The election that produced the cancel set ran before this lock
        // was taken. A target that started running in between invalidates
        // the decision: attributing anyway would leave two live instances
        // of a singleton definition.
        for sibling_id in cancel {
            if inner
                .instances
                .get(sibling_id)
                .is_some_and(|s| s.state == State::Running)
            {
                return Ok(false);
            }
        }

        let instance = instance_mut(&mut inner, instance_id)?;
        instance.state = State::Attributed;
        instance.node_id = Some(node_id);
        instance.attribution_date = Some(Utc::now());
        push_message(&mut inner, instance_id, "Status updated: ATTRIBUTED");
        for sibling_id in cancel {
            if let Some(sibling) = inner.instances.get_mut(sibling_id)
                && matches!(sibling.state, State::Submitted | State::Attributed)
            {
                sibling.state = State::Cancelled;
                push_message(&mut inner, *sibling_id, "Cancelled: Highlander election");
            }
        }
        Ok(true)
    }

    async fn release_attribution(&self, instance_id: Uuid) -> StoreResult<()> {
        let mut inner = self.lock();
        let instance = instance_mut(&mut inner, instance_id)?;
        if instance.state != State::Attributed {
            return Err(StoreError::IllegalTransition {
                from: instance.state,
                to: State::Submitted,
            });
        }
        instance.state = State::Submitted;
        instance.node_id = None;
        instance.attribution_date = None;
        Ok(())
    }

    async fn mark_running(&self, instance_id: Uuid) -> StoreResult<()> {
        let mut inner = self.lock();
        let instance = instance_mut(&mut inner, instance_id)?;
        if !instance.state.can_transition(State::Running) {
            return Err(StoreError::IllegalTransition {
                from: instance.state,
                to: State::Running,
            });
        }
        instance.state = State::Running;
        instance.execution_date = Some(Utc::now());
        push_message(&mut inner, instance_id, "Status updated: RUNNING");
        Ok(())
    }

    async fn request_kill(&self, instance_id: Uuid) -> StoreResult<()> {
        let mut inner = self.lock();
        instance_mut(&mut inner, instance_id)?.kill_requested = true;
        Ok(())
    }

    async fn kill_requested(&self, instance_id: Uuid) -> StoreResult<bool> {
        Ok(self
            .lock()
            .instances
            .get(&instance_id)
            .is_some_and(|i| i.kill_requested))
    }

    async fn cancel_instance(&self, instance_id: Uuid) -> StoreResult<()> {
        let mut inner = self.lock();
        let instance = instance_mut(&mut inner, instance_id)?;
        if !instance.state.can_transition(State::Cancelled) {
            return Err(StoreError::IllegalTransition {
                from: instance.state,
                to: State::Cancelled,
            });
        }
        instance.state = State::Cancelled;
        push_message(&mut inner, instance_id, "Cancelled by user request");
        Ok(())
    }

    async fn append_message(&self, instance_id: Uuid, text: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        push_message(&mut inner, instance_id, text);
        Ok(())
    }

    async fn update_progress(&self, instance_id: Uuid, progress: i32) -> StoreResult<()> {
        let mut inner = self.lock();
        instance_mut(&mut inner, instance_id)?.progress = progress;
        Ok(())
    }

    async fn register_deliverable(&self, deliverable: Deliverable) -> StoreResult<()> {
        self.lock().deliverables.push(deliverable);
        Ok(())
    }

    async fn find_instance(&self, instance_id: Uuid) -> StoreResult<Option<JobInstance>> {
        Ok(self.lock().instances.get(&instance_id).cloned())
    }

    async fn instance_messages(&self, instance_id: Uuid) -> StoreResult<Vec<Message>> {
        Ok(self
            .lock()
            .instance_messages
            .get(&instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn deliverables_for(&self, instance_id: Uuid) -> StoreResult<Vec<Deliverable>> {
        Ok(self
            .lock()
            .deliverables
            .iter()
            .filter(|d| d.job_instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn archive_instance(
        &self,
        instance_id: Uuid,
        final_state: State,
        end_date: DateTime<Utc>,
    ) -> StoreResult<History> {
        let mut inner = self.lock();
        let instance = inner
            .instances
            .get(&instance_id)
            .ok_or_else(|| StoreError::not_found("job instance", instance_id))?;
        if instance.state != final_state && !instance.state.can_transition(final_state) {
            return Err(StoreError::IllegalTransition {
                from: instance.state,
                to: final_state,
            });
        }
        let instance = inner
            .instances
            .remove(&instance_id)
            .expect("instance checked above");
        let messages = inner
            .instance_messages
            .remove(&instance_id)
            .unwrap_or_default();
        let history = History {
            id: instance.id,
            job_def_id: instance.job_def_id,
            queue_id: instance.queue_id,
            node_id: instance.node_id,
            final_state,
            enqueue_date: instance.creation_date,
            attribution_date: instance.attribution_date,
            execution_date: instance.execution_date,
            end_date,
            user_name: instance.user_name,
            email: instance.email,
            session_id: instance.session_id,
            application: instance.application,
            parent_id: instance.parent_id,
            progress: instance.progress,
            parameters: instance.parameters,
            messages,
        };
        inner.histories.insert(history.id, history.clone());
        Ok(history)
    }

    async fn find_history(&self, id: Uuid) -> StoreResult<Option<History>> {
        Ok(self.lock().histories.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(store: &MemoryStore) -> (Uuid, Uuid) {
        let queue_id = Uuid::new_v4();
        let def_id = Uuid::new_v4();
        {
            let mut inner = store.lock();
            inner.queues.insert(
                queue_id,
                Queue {
                    id: queue_id,
                    name: "DEFAULT".into(),
                    description: "default queue".into(),
                    default_queue: true,
                    time_to_live: 1024,
                },
            );
            inner.job_definitions.insert(
                def_id,
                JobDefinition {
                    id: def_id,
                    name: "fib".into(),
                    entry_point: "demo.Fib".into(),
                    queue_id,
                    highlander: false,
                    parameters: vec![JobParameter::new("n", "10")],
                    dependencies: vec![],
                },
            );
        }
        (queue_id, def_id)
    }

    #[tokio::test]
    async fn positions_are_monotonic_per_queue() {
        let store = MemoryStore::new();
        let (queue_id, _) = seed(&store);
        let a = store
            .submit_instance(SubmissionRequest::new("fib"))
            .await
            .unwrap();
        let b = store
            .submit_instance(SubmissionRequest::new("fib"))
            .await
            .unwrap();
        assert!(b.position > a.position);
        let next = store.next_submitted(queue_id).await.unwrap().unwrap();
        assert_eq!(next.id, a.id);
    }

    #[tokio::test]
    async fn submission_merges_parameter_defaults() {
        let store = MemoryStore::new();
        seed(&store);
        let instance = store
            .submit_instance(
                SubmissionRequest::new("fib")
                    .with_parameter("n", "42")
                    .with_parameter("verbose", "true"),
            )
            .await
            .unwrap();
        assert!(instance.parameters.contains(&JobParameter::new("n", "42")));
        assert!(
            instance
                .parameters
                .contains(&JobParameter::new("verbose", "true"))
        );
    }

    #[tokio::test]
    async fn concurrent_attribution_single_winner() {
        let store = MemoryStore::new();
        seed(&store);
        let instance = store
            .submit_instance(SubmissionRequest::new("fib"))
            .await
            .unwrap();
        let node_a = Uuid::new_v4();
        let node_b = Uuid::new_v4();
        let first = store
            .attribute_instance(instance.id, node_a, &[])
            .await
            .unwrap();
        let second = store
            .attribute_instance(instance.id, node_b, &[])
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
        let owned = store.find_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(owned.node_id, Some(node_a));
        assert_eq!(owned.state, State::Attributed);
    }

    #[tokio::test]
    async fn attribution_rolls_back_when_cancel_target_is_running() {
        let store = MemoryStore::new();
        seed(&store);
        let first = store
            .submit_instance(SubmissionRequest::new("fib"))
            .await
            .unwrap();
        let second = store
            .submit_instance(SubmissionRequest::new("fib"))
            .await
            .unwrap();
        let node = Uuid::new_v4();
        assert!(store.attribute_instance(first.id, node, &[]).await.unwrap());

        // The first instance starts running after the election decided to
        // cancel it but before the attribution lands.
        store.mark_running(first.id).await.unwrap();
        assert!(
            !store
                .attribute_instance(second.id, node, &[first.id])
                .await
                .unwrap()
        );

        let running = store.find_instance(first.id).await.unwrap().unwrap();
        assert_eq!(running.state, State::Running);
        let waiting = store.find_instance(second.id).await.unwrap().unwrap();
        assert_eq!(waiting.state, State::Submitted);
        assert_eq!(waiting.node_id, None);
    }

    #[tokio::test]
    async fn terminal_cancel_target_does_not_block_attribution() {
        let store = MemoryStore::new();
        seed(&store);
        let first = store
            .submit_instance(SubmissionRequest::new("fib"))
            .await
            .unwrap();
        let second = store
            .submit_instance(SubmissionRequest::new("fib"))
            .await
            .unwrap();
        let node = Uuid::new_v4();
        assert!(store.attribute_instance(first.id, node, &[]).await.unwrap());
        store.mark_running(first.id).await.unwrap();
        store
            .archive_instance(first.id, State::Done, Utc::now())
            .await
            .unwrap();

        // A target that already finished cannot violate the singleton
        // invariant; the stale cancel entry is simply skipped.
        assert!(
            store
                .attribute_instance(second.id, node, &[first.id])
                .await
                .unwrap()
        );
        let winner = store.find_instance(second.id).await.unwrap().unwrap();
        assert_eq!(winner.state, State::Attributed);
    }

    #[tokio::test]
    async fn redeployed_definition_keeps_its_id() {
        let store = MemoryStore::new();
        let (queue_id, def_id) = seed(&store);
        store
            .insert_job_definition(JobDefinition {
                id: Uuid::new_v4(),
                name: "fib".into(),
                entry_point: "demo.FibV2".into(),
                queue_id,
                highlander: true,
                parameters: vec![],
                dependencies: vec!["lib-math".into()],
            })
            .await
            .unwrap();

        let redeployed = store
            .find_job_definition_by_name("fib")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redeployed.id, def_id);
        assert_eq!(redeployed.entry_point, "demo.FibV2");
        assert!(redeployed.highlander);
    }

    #[tokio::test]
    async fn release_returns_instance_to_queue() {
        let store = MemoryStore::new();
        let (queue_id, _) = seed(&store);
        let instance = store
            .submit_instance(SubmissionRequest::new("fib"))
            .await
            .unwrap();
        let node = Uuid::new_v4();
        assert!(
            store
                .attribute_instance(instance.id, node, &[])
                .await
                .unwrap()
        );
        store.release_attribution(instance.id).await.unwrap();
        let released = store.next_submitted(queue_id).await.unwrap().unwrap();
        assert_eq!(released.id, instance.id);
        assert_eq!(released.node_id, None);
        assert_eq!(released.attribution_date, None);
    }

    #[tokio::test]
    async fn external_cancel_only_before_running() {
        let store = MemoryStore::new();
        seed(&store);
        let instance = store
            .submit_instance(SubmissionRequest::new("fib"))
            .await
            .unwrap();
        store.cancel_instance(instance.id).await.unwrap();
        let cancelled = store.find_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(cancelled.state, State::Cancelled);
        // A cancelled instance can still be archived under its own state.
        let history = store
            .archive_instance(instance.id, State::Cancelled, Utc::now())
            .await
            .unwrap();
        assert_eq!(history.final_state, State::Cancelled);

        let running = store
            .submit_instance(SubmissionRequest::new("fib"))
            .await
            .unwrap();
        let node = Uuid::new_v4();
        assert!(store.attribute_instance(running.id, node, &[]).await.unwrap());
        store.mark_running(running.id).await.unwrap();
        let err = store.cancel_instance(running.id).await.unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn archive_rejects_illegal_final_state() {
        let store = MemoryStore::new();
        seed(&store);
        let instance = store
            .submit_instance(SubmissionRequest::new("fib"))
            .await
            .unwrap();
        // Submitted may expire to Crashed but never complete to Done.
        let err = store
            .archive_instance(instance.id, State::Done, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }
}
