//! Action merge table and admission rules.
//!
//! Both functions are pure; `TargetState::request` composes them.

use super::{ActionState, SyncState};
use crate::core::{Result, SyncError};

use ActionState::{BeingCreated, BeingDeleted, BeingFetched, BeingUpdated};

/// Combine a newly requested action with whatever is already queued.
///
/// | next \ incoming | CREATE | UPDATE | DELETE | FETCH  |
/// |-----------------|--------|--------|--------|--------|
/// | (none)          | CREATE | UPDATE | DELETE | FETCH  |
/// | CREATE          | CREATE | CREATE | (none) | CREATE |
/// | UPDATE          | -      | UPDATE | DELETE | FETCH  |
/// | DELETE          | -      | DELETE | DELETE | DELETE |
/// | FETCH           | -      | UPDATE | DELETE | FETCH  |
///
/// The "-" cells cannot be reached through `admit` and are reported as
/// `SyncError::InvalidTransition`.
pub fn merge(next: Option<ActionState>, incoming: ActionState) -> Result<Option<ActionState>> {
    let merged = match (next, incoming) {
        (None, incoming) => Some(incoming),

        (Some(BeingCreated), BeingDeleted) => None,
        (Some(BeingCreated), _) => Some(BeingCreated),

        (Some(queued), BeingCreated) => {
            return Err(SyncError::InvalidTransition { queued, incoming });
        }

        (Some(BeingDeleted), _) => Some(BeingDeleted),
        (Some(_), BeingDeleted) => Some(BeingDeleted),
        (Some(BeingUpdated), BeingUpdated) | (Some(BeingFetched), BeingUpdated) => {
            Some(BeingUpdated)
        }
        (Some(BeingUpdated), BeingFetched) | (Some(BeingFetched), BeingFetched) => {
            Some(BeingFetched)
        }
    };
    Ok(merged)
}

/// Decide which action, if any, a request contributes from `baseline`.
///
/// `request = None` stands for "no explicit action" and only bootstraps an
/// implicit create on a target that has never held the record. A `None`
/// result means the request is not legal from here and must be ignored.
pub fn admit(
    baseline: SyncState,
    queued: Option<ActionState>,
    request: Option<ActionState>,
) -> Option<ActionState> {
    match baseline {
        SyncState::BeingCreated | SyncState::BeingUpdated | SyncState::Existent => {
            request.filter(|action| *action != BeingCreated)
        }
        SyncState::BeingFetched => request.filter(|action| *action == BeingDeleted),
        SyncState::BeingDeleted | SyncState::Locked | SyncState::Deleted => None,
        SyncState::New => match (queued, request) {
            (None, None) | (None, Some(BeingCreated)) => Some(BeingCreated),
            (None, Some(_)) => None,
            (Some(BeingCreated), Some(action @ (BeingUpdated | BeingDeleted))) => Some(action),
            _ => None,
        },
    }
}
