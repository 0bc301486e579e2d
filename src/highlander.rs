//! Singleton-execution arbitration.
//!
//! A definition flagged highlander may have at most one non-terminal
//! instance system-wide. Before attributing a candidate the poller asks
//! the resolver what to do; the answer is either "attribute it and cancel
//! these waiting siblings" or "leave it queued because an instance is
//! already running". The actual cancellation happens inside the store's
//! attribution transaction so the decision and its effects are atomic.

use uuid::Uuid;

use crate::model::{JobDefinition, JobInstance};
use crate::state::State;
use crate::store::{Store, StoreResult};

/// Outcome of a Highlander election for one candidate instance.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HighlanderDecision {
    /// Whether the candidate may proceed to attribution now.
    pub attribute: bool,
    /// Waiting siblings to cancel in the same transaction.
    pub cancel: Vec<Uuid>,
}

impl HighlanderDecision {
    fn proceed() -> Self {
        Self {
            attribute: true,
            cancel: Vec::new(),
        }
    }
}

/// Decide whether `candidate` wins the election for `definition`.
///
/// Non-highlander definitions always proceed. For highlander definitions a
/// `Running` sibling blocks the candidate entirely, while `Submitted` and
/// `Attributed` siblings lose the election and get cancelled.
pub async fn resolve(
    store: &dyn Store,
    definition: &JobDefinition,
    candidate: &JobInstance,
) -> StoreResult<HighlanderDecision> {
    if !definition.highlander {
        return Ok(HighlanderDecision::proceed());
    }

    let siblings = store
        .non_terminal_instances_of(definition.id, candidate.id)
        .await?;
    if siblings.iter().any(|s| s.state == State::Running) {
        return Ok(HighlanderDecision::default());
    }
    Ok(HighlanderDecision {
        attribute: true,
        cancel: siblings.into_iter().map(|s| s.id).collect(),
    })
}
