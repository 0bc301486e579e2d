//! Durable Postgres store. Every composite operation runs in one
//! transaction; attribution takes a `FOR UPDATE` claim on the instance row
//! so two pollers can never both win it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult};
use crate::model::{
    ConnectionAlias, Deliverable, DeploymentParameter, History, JobDefinition, JobInstance,
    JobParameter, Message, Node, Queue, SubmissionRequest,
};
use crate::state::State;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    dsn: String,
}

impl PostgresStore {
    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(dsn).await?;
        sqlx::migrate!()
            .run(&pool)
            .await
            .map_err(|err| StoreError::Message(err.to_string()))?;
        Ok(Self {
            pool,
            dsn: dsn.to_string(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_state(raw: &str) -> StoreResult<State> {
    raw.parse::<State>().map_err(StoreError::Message)
}

fn node_from_row(row: &PgRow) -> StoreResult<Node> {
    Ok(Node {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        port: row.try_get("port")?,
        repo_directory: row.try_get("repo_directory")?,
        deliverable_directory: row.try_get("deliverable_directory")?,
        export_directory: row.try_get("export_directory")?,
    })
}

fn queue_from_row(row: &PgRow) -> StoreResult<Queue> {
    Ok(Queue {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        default_queue: row.try_get("default_queue")?,
        time_to_live: row.try_get("time_to_live")?,
    })
}

fn definition_from_row(row: &PgRow) -> StoreResult<JobDefinition> {
    Ok(JobDefinition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        entry_point: row.try_get("entry_point")?,
        queue_id: row.try_get("queue_id")?,
        highlander: row.try_get("highlander")?,
        parameters: row
            .try_get::<Json<Vec<JobParameter>>, _>("parameters")?
            .0,
        dependencies: row.try_get::<Json<Vec<String>>, _>("dependencies")?.0,
    })
}

fn instance_from_row(row: &PgRow) -> StoreResult<JobInstance> {
    let state: String = row.try_get("state")?;
    Ok(JobInstance {
        id: row.try_get("id")?,
        job_def_id: row.try_get("job_def_id")?,
        queue_id: row.try_get("queue_id")?,
        state: parse_state(&state)?,
        position: row.try_get("queue_position")?,
        creation_date: row.try_get("creation_date")?,
        attribution_date: row.try_get("attribution_date")?,
        execution_date: row.try_get("execution_date")?,
        node_id: row.try_get("node_id")?,
        user_name: row.try_get("user_name")?,
        email: row.try_get("email")?,
        session_id: row.try_get("session_id")?,
        application: row.try_get("application")?,
        parent_id: row.try_get("parent_id")?,
        progress: row.try_get("progress")?,
        kill_requested: row.try_get("kill_requested")?,
        parameters: row
            .try_get::<Json<Vec<JobParameter>>, _>("parameters")?
            .0,
    })
}

fn message_from_row(row: &PgRow) -> StoreResult<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        text: row.try_get("text_message")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn insert_instance_message(
    conn: &mut sqlx::PgConnection,
    instance_id: Uuid,
    text: &str,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO job_instance_message (id, job_instance_id, text_message, created_at)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(Uuid::new_v4())
    .bind(instance_id)
    .bind(text)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PostgresStore {
    async fn find_node(&self, name: &str) -> StoreResult<Option<Node>> {
        let row = sqlx::query("SELECT * FROM node WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(node_from_row).transpose()
    }

    async fn insert_node(&self, node: Node) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO node (id, name, port, repo_directory, deliverable_directory, export_directory)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(node.id)
        .bind(&node.name)
        .bind(node.port)
        .bind(&node.repo_directory)
        .bind(&node.deliverable_directory)
        .bind(&node.export_directory)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_queues(&self) -> StoreResult<Vec<Queue>> {
        let rows = sqlx::query("SELECT * FROM queue ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(queue_from_row).collect()
    }

    async fn find_queue(&self, id: Uuid) -> StoreResult<Queue> {
        let row = sqlx::query("SELECT * FROM queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("queue", id))?;
        queue_from_row(&row)
    }

    async fn insert_queue(&self, queue: Queue) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO queue (id, name, description, default_queue, time_to_live)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(queue.id)
        .bind(&queue.name)
        .bind(&queue.description)
        .bind(queue.default_queue)
        .bind(queue.time_to_live)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_default_queue(&self, queue_id: Uuid, default_queue: bool) -> StoreResult<()> {
        sqlx::query("UPDATE queue SET default_queue = $2 WHERE id = $1")
            .bind(queue_id)
            .bind(default_queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_global_parameter(&self, key: &str) -> StoreResult<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM global_parameter WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn insert_global_parameter(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO global_parameter (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_global_parameters(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM global_parameter")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn find_connection_alias(&self, name: &str) -> StoreResult<Option<ConnectionAlias>> {
        let row = sqlx::query("SELECT * FROM connection_alias WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| -> StoreResult<ConnectionAlias> {
                Ok(ConnectionAlias {
                    name: row.try_get("name")?,
                    url: row.try_get("url")?,
                    user: row.try_get("user_name")?,
                    password: row.try_get("password")?,
                })
            })
            .transpose()?)
    }

    async fn insert_connection_alias(&self, alias: ConnectionAlias) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO connection_alias (name, url, user_name, password)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(&alias.name)
        .bind(&alias.url)
        .bind(&alias.user)
        .bind(&alias.password)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn connection_description(&self) -> ConnectionAlias {
        // Credentials stay embedded in the DSN; they are not split out here.
        ConnectionAlias {
            name: String::new(),
            url: self.dsn.clone(),
            user: None,
            password: None,
        }
    }

    async fn deployment_parameters_for_node(
        &self,
        node_id: Uuid,
    ) -> StoreResult<Vec<DeploymentParameter>> {
        let rows = sqlx::query("SELECT * FROM deployment_parameter WHERE node_id = $1")
            .bind(node_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> StoreResult<DeploymentParameter> {
                Ok(DeploymentParameter {
                    id: row.try_get("id")?,
                    node_id: row.try_get("node_id")?,
                    queue_id: row.try_get("queue_id")?,
                    nb_thread: row.try_get::<i32, _>("nb_thread")?.max(1) as usize,
                    polling_interval_ms: row.try_get::<i64, _>("polling_interval_ms")?.max(1)
                        as u64,
                })
            })
            .collect()
    }

    async fn insert_deployment_parameter(&self, binding: DeploymentParameter) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO deployment_parameter (id, node_id, queue_id, nb_thread, polling_interval_ms)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(binding.id)
        .bind(binding.node_id)
        .bind(binding.queue_id)
        .bind(binding.nb_thread as i32)
        .bind(binding.polling_interval_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_job_definition(&self, definition: JobDefinition) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO job_definition (id, name, entry_point, queue_id, highlander, parameters, dependencies)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (name) DO UPDATE SET
                 entry_point = EXCLUDED.entry_point,
                 queue_id = EXCLUDED.queue_id,
                 highlander = EXCLUDED.highlander,
                 parameters = EXCLUDED.parameters,
                 dependencies = EXCLUDED.dependencies",
        )
        .bind(definition.id)
        .bind(&definition.name)
        .bind(&definition.entry_point)
        .bind(definition.queue_id)
        .bind(definition.highlander)
        .bind(Json(&definition.parameters))
        .bind(Json(&definition.dependencies))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_job_definition(&self, id: Uuid) -> StoreResult<JobDefinition> {
        let row = sqlx::query("SELECT * FROM job_definition WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("job definition", id))?;
        definition_from_row(&row)
    }

    async fn find_job_definition_by_name(
        &self,
        name: &str,
    ) -> StoreResult<Option<JobDefinition>> {
        let row = sqlx::query("SELECT * FROM job_definition WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(definition_from_row).transpose()
    }

    async fn submit_instance(&self, request: SubmissionRequest) -> StoreResult<JobInstance> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM job_definition WHERE name = $1")
            .bind(&request.job_definition)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("job definition", &request.job_definition))?;
        let definition = definition_from_row(&row)?;

        let mut parameters = definition.parameters.clone();
        for over in &request.parameters {
            match parameters.iter_mut().find(|p| p.key == over.key) {
                Some(existing) => existing.value = over.value.clone(),
                None => parameters.push(over.clone()),
            }
        }

        // The queue row serializes position assignment.
        let position: i64 = sqlx::query_scalar(
            "UPDATE queue SET next_position = next_position + 1 WHERE id = $1
             RETURNING next_position",
        )
        .bind(definition.queue_id)
        .fetch_one(&mut *tx)
        .await?;

        let instance = JobInstance {
            id: Uuid::new_v4(),
            job_def_id: definition.id,
            queue_id: definition.queue_id,
            state: State::Submitted,
            position,
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
        sqlx::query(
            "INSERT INTO job_instance
                 (id, job_def_id, queue_id, state, queue_position, creation_date,
                  user_name, email, session_id, application, parent_id, progress,
                  kill_requested, parameters)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(instance.id)
        .bind(instance.job_def_id)
        .bind(instance.queue_id)
        .bind(instance.state.as_str())
        .bind(instance.position)
        .bind(instance.creation_date)
        .bind(&instance.user_name)
        .bind(&instance.email)
        .bind(&instance.session_id)
        .bind(&instance.application)
        .bind(instance.parent_id)
        .bind(instance.progress)
        .bind(instance.kill_requested)
        .bind(Json(&instance.parameters))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(instance)
    }

    async fn count_active_instances(&self, node_id: Uuid, queue_id: Uuid) -> StoreResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_instance
             WHERE node_id = $1 AND queue_id = $2 AND state IN ('ATTRIBUTED', 'RUNNING')",
        )
        .bind(node_id)
        .bind(queue_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn next_submitted(&self, queue_id: Uuid) -> StoreResult<Option<JobInstance>> {
        let row = sqlx::query(
            "SELECT * FROM job_instance
             WHERE queue_id = $1 AND state = 'SUBMITTED'
             ORDER BY queue_position ASC, creation_date ASC
             LIMIT 1",
        )
        .bind(queue_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn non_terminal_instances_of(
        &self,
        job_def_id: Uuid,
        excluding: Uuid,
    ) -> StoreResult<Vec<JobInstance>> {
        let rows = sqlx::query(
            "SELECT * FROM job_instance
             WHERE job_def_id = $1 AND id <> $2
               AND state IN ('SUBMITTED', 'ATTRIBUTED', 'RUNNING')
             ORDER BY queue_position ASC, creation_date ASC",
        )
        .bind(job_def_id)
        .bind(excluding)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn attribute_instance(
        &self,
        instance_id: Uuid,
        node_id: Uuid,
        cancel: &[Uuid],
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM job_instance WHERE id = $1 FOR UPDATE")
                .bind(instance_id)
                .fetch_optional(&mut *tx)
                .await?;
        match state.as_deref() {
            Some("SUBMITTED") => {}
            _ => {
                tx.rollback().await?;
                return Ok(false);
            }
        }

        sqlx::query(
            "UPDATE job_instance
             SET state = 'ATTRIBUTED', node_id = $2, attribution_date = $3
             WHERE id = $1",
        )
        .bind(instance_id)
        .bind(node_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        insert_instance_message(&mut tx, instance_id, "Status updated: ATTRIBUTED").await?;

        if !cancel.is_empty() {
            let cancelled: Vec<Uuid> = sqlx::query_scalar(
                "UPDATE job_instance SET state = 'CANCELLED'
                 WHERE id = ANY($1) AND state IN ('SUBMITTED', 'ATTRIBUTED')
                 RETURNING id",
            )
            .bind(cancel)
            .fetch_all(&mut *tx)
            .await?;
            // The election ran before this transaction. A target the update
            // skipped because it reached RUNNING in the meantime invalidates
            // the decision; the whole attribution rolls back and the poller
            // re-runs the election next cycle. The update above waits on any
            // in-flight mark_running row lock, so this read is conclusive.
            let still_running: Option<Uuid> = sqlx::query_scalar(
                "SELECT id FROM job_instance
                 WHERE id = ANY($1) AND state = 'RUNNING'
                 LIMIT 1",
            )
            .bind(cancel)
            .fetch_optional(&mut *tx)
            .await?;
            if still_running.is_some() {
                tx.rollback().await?;
                return Ok(false);
            }
            for sibling_id in cancelled {
                insert_instance_message(&mut tx, sibling_id, "Cancelled: Highlander election")
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn release_attribution(&self, instance_id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let state: String =
            sqlx::query_scalar("SELECT state FROM job_instance WHERE id = $1 FOR UPDATE")
                .bind(instance_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::not_found("job instance", instance_id))?;
        if parse_state(&state)? != State::Attributed {
            return Err(StoreError::IllegalTransition {
                from: parse_state(&state)?,
                to: State::Submitted,
            });
        }
        sqlx::query(
            "UPDATE job_instance
             SET state = 'SUBMITTED', node_id = NULL, attribution_date = NULL
             WHERE id = $1",
        )
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_running(&self, instance_id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let state: String =
            sqlx::query_scalar("SELECT state FROM job_instance WHERE id = $1 FOR UPDATE")
                .bind(instance_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::not_found("job instance", instance_id))?;
        let current = parse_state(&state)?;
        if !current.can_transition(State::Running) {
            return Err(StoreError::IllegalTransition {
                from: current,
                to: State::Running,
            });
        }
        sqlx::query(
            "UPDATE job_instance SET state = 'RUNNING', execution_date = $2 WHERE id = $1",
        )
        .bind(instance_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        insert_instance_message(&mut tx, instance_id, "Status updated: RUNNING").await?;
        tx.commit().await?;
        Ok(())
    }

    async fn request_kill(&self, instance_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE job_instance SET kill_requested = TRUE WHERE id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn kill_requested(&self, instance_id: Uuid) -> StoreResult<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT kill_requested FROM job_instance WHERE id = $1")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(flag.unwrap_or(false))
    }

    async fn cancel_instance(&self, instance_id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let state: String =
            sqlx::query_scalar("SELECT state FROM job_instance WHERE id = $1 FOR UPDATE")
                .bind(instance_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::not_found("job instance", instance_id))?;
        let current = parse_state(&state)?;
        if !current.can_transition(State::Cancelled) {
            return Err(StoreError::IllegalTransition {
                from: current,
                to: State::Cancelled,
            });
        }
        sqlx::query("UPDATE job_instance SET state = 'CANCELLED' WHERE id = $1")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        insert_instance_message(&mut tx, instance_id, "Cancelled by user request").await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_message(&self, instance_id: Uuid, text: &str) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_instance_message(&mut conn, instance_id, text).await
    }

    async fn update_progress(&self, instance_id: Uuid, progress: i32) -> StoreResult<()> {
        sqlx::query("UPDATE job_instance SET progress = $2 WHERE id = $1")
            .bind(instance_id)
            .bind(progress)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn register_deliverable(&self, deliverable: Deliverable) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO deliverable
                 (id, random_id, file_path, original_file_name, file_family, job_instance_id)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(deliverable.id)
        .bind(deliverable.random_id)
        .bind(&deliverable.file_path)
        .bind(&deliverable.original_file_name)
        .bind(&deliverable.file_family)
        .bind(deliverable.job_instance_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_instance(&self, instance_id: Uuid) -> StoreResult<Option<JobInstance>> {
        let row = sqlx::query("SELECT * FROM job_instance WHERE id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn instance_messages(&self, instance_id: Uuid) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM job_instance_message
             WHERE job_instance_id = $1
             ORDER BY created_at ASC, id ASC",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn deliverables_for(&self, instance_id: Uuid) -> StoreResult<Vec<Deliverable>> {
        let rows = sqlx::query("SELECT * FROM deliverable WHERE job_instance_id = $1")
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> StoreResult<Deliverable> {
                Ok(Deliverable {
                    id: row.try_get("id")?,
                    random_id: row.try_get("random_id")?,
                    file_path: row.try_get("file_path")?,
                    original_file_name: row.try_get("original_file_name")?,
                    file_family: row.try_get("file_family")?,
                    job_instance_id: row.try_get("job_instance_id")?,
                })
            })
            .collect()
    }

    async fn archive_instance(
        &self,
        instance_id: Uuid,
        final_state: State,
        end_date: DateTime<Utc>,
    ) -> StoreResult<History> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM job_instance WHERE id = $1 FOR UPDATE")
            .bind(instance_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("job instance", instance_id))?;
        let instance = instance_from_row(&row)?;
        if instance.state != final_state && !instance.state.can_transition(final_state) {
            return Err(StoreError::IllegalTransition {
                from: instance.state,
                to: final_state,
            });
        }

        let message_rows = sqlx::query(
            "SELECT * FROM job_instance_message
             WHERE job_instance_id = $1
             ORDER BY created_at ASC, id ASC",
        )
        .bind(instance_id)
        .fetch_all(&mut *tx)
        .await?;
        let messages: Vec<Message> = message_rows
            .iter()
            .map(message_from_row)
            .collect::<StoreResult<_>>()?;

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

        sqlx::query(
            "INSERT INTO history
                 (id, job_def_id, queue_id, node_id, final_state, enqueue_date,
                  attribution_date, execution_date, end_date, user_name, email,
                  session_id, application, parent_id, progress, parameters)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(history.id)
        .bind(history.job_def_id)
        .bind(history.queue_id)
        .bind(history.node_id)
        .bind(history.final_state.as_str())
        .bind(history.enqueue_date)
        .bind(history.attribution_date)
        .bind(history.execution_date)
        .bind(history.end_date)
        .bind(&history.user_name)
        .bind(&history.email)
        .bind(&history.session_id)
        .bind(&history.application)
        .bind(history.parent_id)
        .bind(history.progress)
        .bind(Json(&history.parameters))
        .execute(&mut *tx)
        .await?;

        for message in &history.messages {
            sqlx::query(
                "INSERT INTO history_message (id, history_id, text_message, created_at)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(message.id)
            .bind(history.id)
            .bind(&message.text)
            .bind(message.created_at)
            .execute(&mut *tx)
            .await?;
        }

        // Messages cascade with the instance row.
        sqlx::query("DELETE FROM job_instance WHERE id = $1")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(history)
    }

    async fn find_history(&self, id: Uuid) -> StoreResult<Option<History>> {
        let row = sqlx::query("SELECT * FROM history WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let final_state: String = row.try_get("final_state")?;
        let message_rows = sqlx::query(
            "SELECT * FROM history_message
             WHERE history_id = $1
             ORDER BY created_at ASC, id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let messages: Vec<Message> = message_rows
            .iter()
            .map(message_from_row)
            .collect::<StoreResult<_>>()?;
        Ok(Some(History {
            id: row.try_get("id")?,
            job_def_id: row.try_get("job_def_id")?,
            queue_id: row.try_get("queue_id")?,
            node_id: row.try_get("node_id")?,
            final_state: parse_state(&final_state)?,
            enqueue_date: row.try_get("enqueue_date")?,
            attribution_date: row.try_get("attribution_date")?,
            execution_date: row.try_get("execution_date")?,
            end_date: row.try_get("end_date")?,
            user_name: row.try_get("user_name")?,
            email: row.try_get("email")?,
            session_id: row.try_get("session_id")?,
            application: row.try_get("application")?,
            parent_id: row.try_get("parent_id")?,
            progress: row.try_get("progress")?,
            parameters: row
                .try_get::<Json<Vec<JobParameter>>, _>("parameters")?
                .0,
            messages,
        }))
    }
}
