//! The per-(record, target) execution loop.
//!
//! One task drives one target through idle → preparing → in-flight →
//! applying-response until nothing is queued. Preparing builds the payload
//! and moves `next` into `in_progress` under a single lock, so a request that
//! arrives later always lands in the fresh `next` and a stale payload is never
//! sent.

use super::{Effects, ItemInner, ItemState, Readiness, signals};
use crate::backend::{Status, dispatch};
use crate::core::{Origin, RawRecord, Target};
use crate::state::ActionState;
use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// What the driver does after applying a response.
enum Step {
    Continue,
    WaitForBackend,
}

pub(super) async fn drive(inner: Arc<ItemInner>, target: Target) {
    let span = info_span!("item.sync", item = %inner.id, target = %target);
    run(inner, target).instrument(span).await
}

async fn run(inner: Arc<ItemInner>, target: Target) {
    let backend = inner.ctx.backend(target);
    while let Some((action, payload)) = inner.prepare(target) {
        event!(Level::DEBUG, action = action.verb(), "sending");

        let step = match dispatch(backend.as_ref(), action, payload).await {
            Ok(response) => match response.status {
                Status::Pending => inner.requeue(target, action),
                Status::NotFound if action != ActionState::BeingDeleted => {
                    inner.diverged(target, action);
                    Step::Continue
                }
                Status::Resolved | Status::NotFound => {
                    inner.confirm(target, action, response.data);
                    Step::Continue
                }
            },
            Err(err) => {
                inner.with_state(|inner, state, _| inner.fail(state, err));
                Step::Continue
            }
        };

        if let Step::WaitForBackend = step {
            event!(Level::DEBUG, "backend unreachable, waiting");
            backend.once_available().await;
        }
    }
}

impl ItemInner {
    /// Take the queued action and build its payload, or park the driver.
    fn prepare(self: &Arc<Self>, target: Target) -> Option<(ActionState, RawRecord)> {
        let index = target.index();
        let mut state = self.lock();
        if state.error.is_some() {
            state.running[index] = false;
            return None;
        }

        let Some(action) = state.targets[index].next else {
            state.running[index] = false;
            signals::finish(&self.phases[index]);
            return None;
        };

        let payload = self.payload(&state, target, action);
        let target_state = &mut state.targets[index];
        target_state.in_progress = Some(action);
        target_state.next = None;
        Some((action, payload))
    }

    fn payload(&self, state: &ItemState, target: Target, action: ActionState) -> RawRecord {
        let schema = self.ctx.schema();
        let mut keys = RawRecord::new();
        if let Some(key) = schema.primary_key(target, &state.fields) {
            keys.insert(self.ctx.key_identifier(target).to_string(), key);
        }

        let mut payload = match action {
            ActionState::BeingDeleted | ActionState::BeingFetched => return keys,
            ActionState::BeingCreated => schema.get_for(target, &state.fields, &RawRecord::new()),
            ActionState::BeingUpdated => schema.get_for(target, &state.fields, &keys),
        };

        if target == Target::LocalCache {
            let marker = state.target(Target::Transporter).marker();
            payload.insert(
                self.ctx.config().marker_field.clone(),
                Value::String(marker.as_str().to_string()),
            );
        }
        payload
    }

    /// The target was unreachable; put the action back and wait.
    fn requeue(self: &Arc<Self>, target: Target, action: ActionState) -> Step {
        self.with_state(|inner, state, effects| {
            if state.error.is_some() {
                return Step::Continue;
            }
            if let Err(err) = state.target_mut(target).requeue(action) {
                inner.fail(state, err);
                return Step::Continue;
            }
            inner.check_discard(state, effects);
            if state.target(target).next.is_some() {
                Step::WaitForBackend
            } else {
                Step::Continue
            }
        })
    }

    /// The target no longer holds the record: treat it as an external
    /// removal and delete it from the other side directly.
    fn diverged(self: &Arc<Self>, target: Target, action: ActionState) {
        event!(
            Level::INFO,
            action = action.verb(),
            "record missing on target, removing"
        );
        self.with_state(|inner, state, effects| {
            if state.error.is_some() {
                return;
            }
            inner.mark_removed(state, effects);
            let target_state = state.target_mut(target);
            target_state.in_progress = None;
            target_state.mark_deleted();
            inner.schedule(state, effects, target.other(), Some(ActionState::BeingDeleted));
            inner.check_discard(state, effects);
        });
    }

    fn confirm(self: &Arc<Self>, target: Target, action: ActionState, data: Value) {
        self.with_state(|inner, state, effects| {
            if state.error.is_some() {
                return;
            }
            let raw = data.as_object();

            if action == ActionState::BeingCreated {
                if let Some(raw) = raw {
                    inner
                        .ctx
                        .schema()
                        .set_primary_key(target, &mut state.fields, raw);
                }
                inner.readiness[target.index()].send_replace(Readiness::Ready);
            }

            state.target_mut(target).resolve(action);

            if action == ActionState::BeingFetched {
                if let Some(raw) = raw {
                    inner.merge_values(state, Origin::from(target), raw);
                }
                if state.bootstrap_after_fetch == Some(target) {
                    state.bootstrap_after_fetch = None;
                    inner.schedule(state, effects, target.other(), None);
                }
            }

            inner.after_sync(state, effects, target, action);
            inner.check_discard(state, effects);
            event!(Level::DEBUG, action = action.verb(), "confirmed");
        });
    }

    /// Post-sync hook: the local cache mirrors what the transporter last
    /// confirmed.
    fn after_sync(
        &self,
        state: &mut ItemState,
        effects: &mut Effects,
        target: Target,
        action: ActionState,
    ) {
        if target != Target::Transporter {
            return;
        }
        let cascade = match action {
            ActionState::BeingDeleted => ActionState::BeingDeleted,
            _ => ActionState::BeingUpdated,
        };
        self.schedule(state, effects, Target::LocalCache, Some(cascade));
    }
}
