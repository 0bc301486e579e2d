//! Terminal-state archival.
//!
//! Every instance that reaches a terminal state goes through here exactly
//! once: the store moves the row and its messages into history in one
//! transaction, freeing the queue slot.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::model::History;
use crate::state::State;
use crate::store::{Store, StoreResult};

#[derive(Clone)]
pub struct HistoryArchiver {
    store: Arc<dyn Store>,
}

impl HistoryArchiver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn archive(&self, instance_id: Uuid, final_state: State) -> StoreResult<History> {
        let history = self
            .store
            .archive_instance(instance_id, final_state, Utc::now())
            .await?;
        info!(instance = %instance_id, state = %final_state, "archived job instance");
        Ok(history)
    }
}
