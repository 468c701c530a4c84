// ============================================================================
// Per-target Synchronization State
// ============================================================================
//
// Each record tracks one `TargetState` per backing system:
//
//   current      the last confirmed, stable state (None = never created)
//   in_progress  the action currently on the wire
//   next         the single queued action, merged from every newer request
//
// Deleted and Locked are absorbing: nothing leaves them.
//
// ============================================================================

pub mod merge;

pub use merge::{admit, merge};

use crate::core::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, non-transitional status of a record on one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixedState {
    Existent,
    Deleted,
    Locked,
}

impl FixedState {
    /// Check if no transition may leave this state
    pub fn is_absorbing(&self) -> bool {
        matches!(self, FixedState::Deleted | FixedState::Locked)
    }
}

/// A queued or in-flight operation against one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionState {
    BeingCreated,
    BeingUpdated,
    BeingDeleted,
    BeingFetched,
}

impl ActionState {
    /// Name of the wire action this state issues.
    pub fn verb(&self) -> &'static str {
        match self {
            ActionState::BeingCreated => "create",
            ActionState::BeingUpdated => "update",
            ActionState::BeingDeleted => "delete",
            ActionState::BeingFetched => "fetch",
        }
    }

    /// The fixed state reached when the action succeeds.
    pub fn resolves_to(&self) -> FixedState {
        match self {
            ActionState::BeingDeleted => FixedState::Deleted,
            _ => FixedState::Existent,
        }
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SyncState::from(*self))
    }
}

/// Combined vocabulary of fixed and action states.
///
/// Used as the validation baseline and as the transporter-state marker that
/// the local cache persists alongside each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    New,
    Existent,
    Deleted,
    Locked,
    BeingCreated,
    BeingUpdated,
    BeingDeleted,
    BeingFetched,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::New => "NEW",
            SyncState::Existent => "EXISTENT",
            SyncState::Deleted => "DELETED",
            SyncState::Locked => "LOCKED",
            SyncState::BeingCreated => "BEING_CREATED",
            SyncState::BeingUpdated => "BEING_UPDATED",
            SyncState::BeingDeleted => "BEING_DELETED",
            SyncState::BeingFetched => "BEING_FETCHED",
        }
    }

    /// Parse a persisted marker string. Unknown markers yield `None`.
    pub fn parse(marker: &str) -> Option<Self> {
        let state = match marker {
            "NEW" => SyncState::New,
            "EXISTENT" => SyncState::Existent,
            "DELETED" => SyncState::Deleted,
            "LOCKED" => SyncState::Locked,
            "BEING_CREATED" => SyncState::BeingCreated,
            "BEING_UPDATED" => SyncState::BeingUpdated,
            "BEING_DELETED" => SyncState::BeingDeleted,
            "BEING_FETCHED" => SyncState::BeingFetched,
            _ => return None,
        };
        Some(state)
    }

    /// Whether a record carrying this transporter marker is being removed or
    /// can no longer become ready.
    pub fn is_terminal_marker(&self) -> bool {
        matches!(
            self,
            SyncState::BeingDeleted | SyncState::Deleted | SyncState::Locked
        )
    }

    /// Whether the marker describes a record marked for deletion.
    pub fn marks_removed(&self) -> bool {
        matches!(self, SyncState::BeingDeleted | SyncState::Deleted)
    }
}

impl From<FixedState> for SyncState {
    fn from(state: FixedState) -> Self {
        match state {
            FixedState::Existent => SyncState::Existent,
            FixedState::Deleted => SyncState::Deleted,
            FixedState::Locked => SyncState::Locked,
        }
    }
}

impl From<ActionState> for SyncState {
    fn from(state: ActionState) -> Self {
        match state {
            ActionState::BeingCreated => SyncState::BeingCreated,
            ActionState::BeingUpdated => SyncState::BeingUpdated,
            ActionState::BeingDeleted => SyncState::BeingDeleted,
            ActionState::BeingFetched => SyncState::BeingFetched,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Synchronization triple for one (record, target) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetState {
    pub current: Option<FixedState>,
    pub in_progress: Option<ActionState>,
    pub next: Option<ActionState>,
}

impl TargetState {
    /// A target the record has never been written to.
    pub fn new_record() -> Self {
        Self::default()
    }

    /// A target that already holds the record.
    pub fn existent() -> Self {
        Self {
            current: Some(FixedState::Existent),
            ..Self::default()
        }
    }

    /// Seed a target from a persisted transporter-state marker.
    pub fn from_marker(marker: SyncState) -> Self {
        match marker {
            SyncState::New => Self::new_record(),
            SyncState::Existent => Self::existent(),
            SyncState::Deleted => Self::fixed(FixedState::Deleted),
            SyncState::Locked => Self::fixed(FixedState::Locked),
            SyncState::BeingCreated => Self {
                next: Some(ActionState::BeingCreated),
                ..Self::new_record()
            },
            SyncState::BeingUpdated => Self::existent_with(ActionState::BeingUpdated),
            SyncState::BeingDeleted => Self::existent_with(ActionState::BeingDeleted),
            SyncState::BeingFetched => Self::existent_with(ActionState::BeingFetched),
        }
    }

    fn fixed(state: FixedState) -> Self {
        Self {
            current: Some(state),
            ..Self::default()
        }
    }

    fn existent_with(next: ActionState) -> Self {
        Self {
            next: Some(next),
            ..Self::existent()
        }
    }

    /// The state new requests are validated against: `in_progress ?? current`.
    pub fn baseline(&self) -> SyncState {
        match (self.in_progress, self.current) {
            (Some(action), _) => action.into(),
            (None, Some(fixed)) => fixed.into(),
            (None, None) => SyncState::New,
        }
    }

    /// Nothing queued and nothing on the wire.
    pub fn is_settled(&self) -> bool {
        self.in_progress.is_none() && self.next.is_none()
    }

    /// Settled and known to the target (the `synced` / `stored` flag).
    pub fn is_confirmed(&self) -> bool {
        self.is_settled() && self.current.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.current == Some(FixedState::Deleted)
    }

    pub fn is_locked(&self) -> bool {
        self.current == Some(FixedState::Locked)
    }

    /// What this target was last known to want, as a persisted marker.
    pub fn marker(&self) -> SyncState {
        match (self.next.or(self.in_progress), self.current) {
            (Some(ActionState::BeingDeleted), _) => SyncState::BeingDeleted,
            (Some(_), None) => SyncState::BeingCreated,
            (Some(action), Some(fixed)) if !fixed.is_absorbing() => action.into(),
            (_, Some(fixed)) => fixed.into(),
            (None, None) => SyncState::New,
        }
    }

    /// Apply a request through the admission rules and the merge table.
    ///
    /// `None` asks for "no explicit action", which only bootstraps an implicit
    /// create on a target that has never held the record. Returns whether
    /// `next` changed.
    pub fn request(&mut self, request: Option<ActionState>) -> Result<bool> {
        let baseline = self.baseline();
        let Some(incoming) = admit(baseline, self.next, request) else {
            if baseline == SyncState::New
                && self.next.is_none()
                && request == Some(ActionState::BeingDeleted)
            {
                // nothing exists on this target to delete
                self.current = Some(FixedState::Deleted);
            }
            return Ok(false);
        };

        let merged = merge(self.next, incoming)?;
        let changed = merged != self.next;
        self.next = merged;
        if merged.is_none() {
            self.settle_cancelled_create();
        }
        Ok(changed)
    }

    /// Put an action that never reached the target back in front of `next`.
    pub fn requeue(&mut self, action: ActionState) -> Result<()> {
        self.in_progress = None;
        self.next = match self.next {
            Some(newer) => merge(Some(action), newer)?,
            None => Some(action),
        };
        if self.next.is_none() {
            self.settle_cancelled_create();
        }
        Ok(())
    }

    /// Record a confirmed action, honoring absorbing states.
    pub fn resolve(&mut self, action: ActionState) {
        self.in_progress = None;
        if !self.current.is_some_and(|fixed| fixed.is_absorbing()) {
            self.current = Some(action.resolves_to());
        }
    }

    /// Freeze the target after an unrecoverable error.
    pub fn lock(&mut self) {
        self.current = Some(FixedState::Locked);
        self.in_progress = None;
        self.next = None;
    }

    /// The target told us the record is gone.
    pub fn mark_deleted(&mut self) {
        if !self.is_locked() {
            self.current = Some(FixedState::Deleted);
        }
        self.next = None;
    }

    // create + delete cancelled before anything reached the target
    fn settle_cancelled_create(&mut self) {
        if self.in_progress.is_none() && self.current.is_none() {
            self.current = Some(FixedState::Deleted);
        }
    }
}
