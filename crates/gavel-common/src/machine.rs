//! Transition validation.
//!
//! [`ItemState::successors`] is the static edge table; [`StateMachine`] adds
//! the per-record rules for leaving `failed`: the only way out is back to the
//! state the failed attempt started from, and only while the retry cap allows.

use thiserror::Error;

use crate::record::{ItemRecord, ReservedKey};
use crate::state::ItemState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition for item {id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub id: String,
    pub from: ItemState,
    pub to: ItemState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMachine {
    max_retries: u32,
}

impl StateMachine {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Where a failed item goes when retried: the state its failed attempt
    /// started from. Records migrated without history fall back to the
    /// `failed_from` metadata key.
    pub fn retry_target(&self, record: &ItemRecord) -> Option<ItemState> {
        if record.state != ItemState::Failed {
            return None;
        }
        let target = match record.last_failure() {
            Some(t) => Some(t.from),
            None => record
                .reserved_str(ReservedKey::FailedFrom)
                .and_then(|s| s.parse().ok()),
        };
        target.filter(|t| ItemState::Failed.can_reach(*t))
    }

    pub fn can_retry(&self, record: &ItemRecord) -> bool {
        record.retry_count < self.max_retries && self.retry_target(record).is_some()
    }

    pub fn is_permanently_failed(&self, record: &ItemRecord) -> bool {
        record.state == ItemState::Failed && !self.can_retry(record)
    }

    /// Validate `record.state -> requested`. Never mutates.
    pub fn validate(
        &self,
        record: &ItemRecord,
        requested: ItemState,
    ) -> Result<(), InvalidTransition> {
        let allowed = if record.state == ItemState::Failed {
            self.can_retry(record) && self.retry_target(record) == Some(requested)
        } else {
            record.state.can_reach(requested)
        };

        if allowed {
            Ok(())
        } else {
            Err(InvalidTransition {
                id: record.id.clone(),
                from: record.state,
                to: requested,
            })
        }
    }
}
