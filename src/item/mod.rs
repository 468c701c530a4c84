// ============================================================================
// Item: per-record dual-target synchronization
// ============================================================================
//
// A record keeps one `TargetState` per backing system. Public operations
// only mutate that state and queue work; the actual wire calls run in one
// spawned driver task per (record, target), so a second request never
// overlaps a first, it is folded into `next` instead.
//
// All state sits behind a std mutex that is never held across an await.
// Side effects that leave the record (spawning drivers, store callbacks)
// are collected while locked and applied after the lock is released.
//
// ============================================================================

mod context;
mod driver;
mod signals;

pub use context::SyncContext;

use crate::core::{Fields, ItemId, Origin, RawRecord, Result, SyncError, Target};
use crate::state::{ActionState, SyncState, TargetState};
use futures::future::{BoxFuture, FutureExt, try_join_all};
use serde_json::Value;
use signals::{Readiness, Round};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{Level, event};

/// Resolves once every target touched by an operation has settled.
///
/// Work is scheduled before the future is returned; dropping it cancels
/// nothing.
pub type SyncFuture = BoxFuture<'static, Result<()>>;

/// Callbacks through which a record asks its owner to move it between
/// collections.
pub trait ItemHooks: Send + Sync {
    /// The record was removed and must leave the ready collection.
    fn on_removed(&self, id: ItemId);

    /// Both targets confirmed deletion; forget the record.
    fn on_discarded(&self, id: ItemId);
}

/// How a record enters the working copy.
#[derive(Debug, Clone)]
pub enum Seed {
    /// New user input in canonical shape.
    Fresh(Fields),
    /// A record as the transporter sent it.
    Transporter(RawRecord),
    /// A record as the local cache stored it, transporter marker included.
    LocalCache(RawRecord),
    /// Only a key on `target`; the rest arrives with the first fetch.
    Placeholder { target: Target, key: RawRecord },
}

#[derive(Debug)]
struct ItemState {
    fields: Fields,
    targets: [TargetState; 2],
    running: [bool; 2],
    removed: bool,
    detached: bool,
    discarded: bool,
    auto_save: bool,
    error: Option<SyncError>,
    bootstrap_after_fetch: Option<Target>,
}

impl ItemState {
    fn target(&self, target: Target) -> &TargetState {
        &self.targets[target.index()]
    }

    fn target_mut(&mut self, target: Target) -> &mut TargetState {
        &mut self.targets[target.index()]
    }
}

#[derive(Default)]
struct Effects {
    spawn: Vec<Target>,
    detach: bool,
    discard: bool,
}

struct ItemInner {
    id: ItemId,
    ctx: Arc<SyncContext>,
    state: Mutex<ItemState>,
    phases: [watch::Sender<Round>; 2],
    readiness: [watch::Sender<Readiness>; 2],
    hooks: Option<Arc<dyn ItemHooks>>,
}

/// A domain record synchronized against the transporter and the local cache.
///
/// Cloning yields another handle to the same record.
#[derive(Clone)]
pub struct Item {
    inner: Arc<ItemInner>,
}

impl Item {
    /// Create a record from `seed` and start whatever work the seed implies.
    pub fn new(ctx: &Arc<SyncContext>, seed: Seed) -> Self {
        Self::build(ctx, seed, None)
    }

    /// Create a record from fresh user input.
    pub fn fresh(ctx: &Arc<SyncContext>, values: Fields) -> Self {
        Self::new(ctx, Seed::Fresh(values))
    }

    /// Create a record from data originating at `origin`.
    pub fn from_origin(ctx: &Arc<SyncContext>, origin: Origin, raw: RawRecord) -> Self {
        let seed = match origin {
            Origin::Transporter => Seed::Transporter(raw),
            Origin::LocalCache => Seed::LocalCache(raw),
            Origin::Fresh => Seed::Fresh(raw),
        };
        Self::new(ctx, seed)
    }

    pub(crate) fn attached(ctx: &Arc<SyncContext>, seed: Seed, hooks: Arc<dyn ItemHooks>) -> Self {
        Self::build(ctx, seed, Some(hooks))
    }

    fn build(ctx: &Arc<SyncContext>, seed: Seed, hooks: Option<Arc<dyn ItemHooks>>) -> Self {
        let id = ItemId::new();
        let schema = ctx.schema();
        let mut fields = Fields::new();
        let mut targets = [TargetState::new_record(); 2];
        let mut ready = [false; 2];
        let mut removed = false;
        let mut locked = false;
        let mut bootstrap = Vec::new();
        let mut bootstrap_after_fetch = None;

        match seed {
            Seed::Fresh(values) => {
                fields = values;
                bootstrap = Target::ALL.map(|target| (target, None)).to_vec();
            }
            Seed::Transporter(raw) => {
                schema.set_from(Origin::Transporter, &mut fields, &raw);
                targets[Target::Transporter.index()] = TargetState::existent();
                ready[Target::Transporter.index()] = true;
                bootstrap.push((Target::LocalCache, None));
            }
            Seed::LocalCache(mut raw) => {
                let marker = Self::read_marker(ctx, &mut raw);
                schema.set_from(Origin::LocalCache, &mut fields, &raw);
                targets[Target::Transporter.index()] = TargetState::from_marker(marker);
                targets[Target::LocalCache.index()] = TargetState::existent();
                ready[Target::LocalCache.index()] = true;
                ready[Target::Transporter.index()] =
                    schema.primary_key(Target::Transporter, &fields).is_some();
                removed = marker.marks_removed();
                locked = marker == SyncState::Locked;
                if marker == SyncState::Deleted {
                    // the cascade that should have purged the cache never ran
                    bootstrap.push((Target::LocalCache, Some(ActionState::BeingDeleted)));
                }
            }
            Seed::Placeholder { target, key } => {
                schema.set_from(target.into(), &mut fields, &key);
                targets[target.index()] = TargetState::existent();
                ready[target.index()] = true;
                bootstrap_after_fetch = Some(target);
            }
        }

        let phases = [Round::channel(), Round::channel()];
        let readiness = ready.map(|ready| {
            watch::Sender::new(if ready {
                Readiness::Ready
            } else {
                Readiness::Pending
            })
        });

        let inner = Arc::new(ItemInner {
            id,
            ctx: Arc::clone(ctx),
            state: Mutex::new(ItemState {
                fields,
                targets,
                running: [false; 2],
                removed,
                detached: removed,
                discarded: false,
                auto_save: ctx.config().auto_save,
                error: None,
                bootstrap_after_fetch,
            }),
            phases,
            readiness,
            hooks,
        });

        event!(Level::DEBUG, item = %id, "item created");

        let item = Self { inner };
        item.inner.with_state(|inner, state, effects| {
            if locked {
                inner.fail(state, SyncError::Locked(id.as_u64()));
                return;
            }
            for (target, request) in bootstrap {
                inner.schedule(state, effects, target, request);
            }
            // seeded transporter work from the local cache starts right away
            for target in Target::ALL {
                inner.start_if_idle(state, effects, target);
            }
        });
        item
    }

    fn read_marker(ctx: &SyncContext, raw: &mut RawRecord) -> SyncState {
        let marker = raw
            .remove(&ctx.config().marker_field)
            .and_then(|marker| marker.as_str().and_then(SyncState::parse));
        marker.unwrap_or_else(|| {
            let has_key = raw
                .get(ctx.key_identifier(Target::Transporter))
                .is_some_and(|key| !key.is_null());
            if has_key {
                SyncState::Existent
            } else {
                SyncState::BeingCreated
            }
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Runtime-local identity.
    pub fn id(&self) -> ItemId {
        self.inner.id
    }

    /// Snapshot of the canonical fields.
    pub fn fields(&self) -> Fields {
        self.inner.lock().fields.clone()
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.inner.lock().fields.get(name).cloned()
    }

    /// Primary key on `target`, once established.
    pub fn key(&self, target: Target) -> Option<Value> {
        let state = self.inner.lock();
        self.inner.ctx.schema().primary_key(target, &state.fields)
    }

    pub fn target_state(&self, target: Target) -> TargetState {
        *self.inner.lock().target(target)
    }

    /// The transporter has nothing pending and holds the record.
    pub fn synced(&self) -> bool {
        self.inner.lock().target(Target::Transporter).is_confirmed()
    }

    /// The local cache has nothing pending and holds the record.
    pub fn stored(&self) -> bool {
        self.inner.lock().target(Target::LocalCache).is_confirmed()
    }

    pub fn removed(&self) -> bool {
        self.inner.lock().removed
    }

    pub fn locked(&self) -> bool {
        self.inner.lock().error.is_some()
    }

    /// The error that locked the record, if any.
    pub fn error(&self) -> Option<SyncError> {
        self.inner.lock().error.clone()
    }

    /// Marker the local cache persists for the transporter side.
    pub fn transporter_marker(&self) -> SyncState {
        self.inner.lock().target(Target::Transporter).marker()
    }

    pub fn auto_save(&self) -> bool {
        self.inner.lock().auto_save
    }

    /// Whether every filter field equals the record's field.
    pub fn matches(&self, filter: &Fields) -> bool {
        let state = self.inner.lock();
        filter
            .iter()
            .all(|(field, value)| state.fields.get(field) == Some(value))
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Merge `values` into the record and propagate them to every target
    /// that did not originate them.
    ///
    /// # Examples
    ///
    /// ```
    /// use itemsync::{Backends, FieldSchema, Item, MemoryBackend, Origin, StoreConfig, SyncContext, Target};
    /// use serde_json::json;
    /// use std::sync::Arc;
    ///
    /// # tokio_test::block_on(async {
    /// let transporter = Arc::new(MemoryBackend::new(Target::Transporter, "id"));
    /// let backends = Backends::new(
    ///     transporter.clone(),
    ///     Arc::new(MemoryBackend::new(Target::LocalCache, "localId")),
    /// );
    /// let ctx = SyncContext::new(Arc::new(FieldSchema::default()), backends, StoreConfig::default()).unwrap();
    ///
    /// let item = Item::fresh(&ctx, json!({"title": "draft"}).as_object().cloned().unwrap());
    /// item.once_synced().await.unwrap();
    ///
    /// let values = json!({"title": "final"}).as_object().cloned().unwrap();
    /// item.update(values, Origin::Fresh).await.unwrap();
    /// assert_eq!(transporter.get(&json!(1)).unwrap()["title"], json!("final"));
    /// # });
    /// ```
    pub fn update(&self, values: RawRecord, origin: Origin) -> SyncFuture {
        let downstream = origin.downstream();
        let accepted = self.inner.with_state(|inner, state, effects| {
            if let Some(err) = &state.error {
                return Err(err.clone());
            }
            inner.merge_values(state, origin, &values);
            for target in &downstream {
                inner.schedule(state, effects, *target, Some(ActionState::BeingUpdated));
            }
            Ok(())
        });
        match accepted {
            Ok(()) => self.settled(&downstream),
            Err(err) => futures::future::ready(Err(err)).boxed(),
        }
    }

    /// Mark the record removed and delete it from every target that did not
    /// originate the removal.
    pub fn remove(&self, origin: Origin) -> SyncFuture {
        let downstream = origin.downstream();
        let accepted = self.inner.with_state(|inner, state, effects| {
            if let Some(err) = &state.error {
                return Err(err.clone());
            }
            inner.mark_removed(state, effects);
            if let Some(source) = origin.target() {
                // the origin already lost the record
                state.target_mut(source).mark_deleted();
            }
            for target in &downstream {
                inner.schedule(state, effects, *target, Some(ActionState::BeingDeleted));
            }
            inner.check_discard(state, effects);
            Ok(())
        });
        event!(Level::DEBUG, item = %self.id(), origin = %origin, "item removed");
        match accepted {
            Ok(()) => self.settled(&downstream),
            Err(err) => futures::future::ready(Err(err)).boxed(),
        }
    }

    /// Alias of [`Item::remove`].
    pub fn delete(&self, origin: Origin) -> SyncFuture {
        self.remove(origin)
    }

    /// Re-read the record from `target`.
    pub fn fetch(&self, target: Target) -> SyncFuture {
        self.inner.with_state(|inner, state, effects| {
            inner.schedule(state, effects, target, Some(ActionState::BeingFetched));
        });
        self.settled(&[target])
    }

    /// Write one field. With auto-save on, the change is propagated to both
    /// targets.
    pub fn set(&self, field: &str, value: Value) -> SyncFuture {
        let scheduled = self.inner.with_state(|inner, state, effects| {
            if state.error.is_some() {
                return false;
            }
            let mut values = RawRecord::new();
            values.insert(field.to_string(), value);
            inner.merge_values(state, Origin::Fresh, &values);
            inner.auto_save(state, effects)
        });
        if scheduled {
            self.settled(&Target::ALL)
        } else {
            futures::future::ready(Ok(())).boxed()
        }
    }

    /// Propagate in-place changes made outside `update`, honoring auto-save.
    pub fn mark_dirty(&self) -> SyncFuture {
        let scheduled = self
            .inner
            .with_state(|inner, state, effects| inner.auto_save(state, effects));
        if scheduled {
            self.settled(&Target::ALL)
        } else {
            futures::future::ready(Ok(())).boxed()
        }
    }

    pub fn set_auto_save(&self, enabled: bool) {
        let mut state = self.inner.lock();
        state.auto_save = enabled && state.error.is_none();
    }

    /// Resolves once `target`'s primary key is established.
    pub fn once_ready_for(&self, target: Target) -> SyncFuture {
        let readiness = self.inner.readiness[target.index()].subscribe();
        let discarded = SyncError::Discarded(self.id().as_u64());
        signals::wait_ready(readiness, discarded).boxed()
    }

    /// Resolves once the transporter has no pending work.
    pub fn once_synced(&self) -> SyncFuture {
        self.settled(&[Target::Transporter])
    }

    /// Resolves once the local cache has no pending work.
    pub fn once_stored(&self) -> SyncFuture {
        self.settled(&[Target::LocalCache])
    }

    fn settled(&self, targets: &[Target]) -> SyncFuture {
        let waits: Vec<_> = targets
            .iter()
            .map(|target| signals::wait_settled(&self.inner.phases[target.index()]))
            .collect();
        async move {
            try_join_all(waits).await?;
            Ok(())
        }
        .boxed()
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Item")
            .field("id", &self.inner.id)
            .field("fields", &state.fields)
            .field("transporter", state.target(Target::Transporter))
            .field("local_cache", state.target(Target::LocalCache))
            .field("removed", &state.removed)
            .finish()
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Item {}

impl ItemInner {
    fn lock(&self) -> MutexGuard<'_, ItemState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` under the state lock, then apply the effects it collected.
    fn with_state<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&Self, &mut ItemState, &mut Effects) -> R,
    ) -> R {
        let mut effects = Effects::default();
        let result = {
            let mut state = self.lock();
            f(&**self, &mut state, &mut effects)
        };
        self.apply(effects);
        result
    }

    fn apply(self: &Arc<Self>, effects: Effects) {
        for target in effects.spawn {
            self.ctx
                .runtime()
                .spawn(driver::drive(Arc::clone(self), target));
        }
        if let Some(hooks) = &self.hooks {
            if effects.detach {
                hooks.on_removed(self.id);
            }
            if effects.discard {
                hooks.on_discarded(self.id);
            }
        }
    }

    /// Feed a request for `target` through admission and the merge table,
    /// starting a driver if the target was idle.
    fn schedule(
        &self,
        state: &mut ItemState,
        effects: &mut Effects,
        target: Target,
        request: Option<ActionState>,
    ) {
        if state.error.is_some() {
            return;
        }
        if let Err(err) = state.target_mut(target).request(request) {
            self.fail(state, err);
            return;
        }
        self.start_if_idle(state, effects, target);
        self.check_discard(state, effects);
    }

    fn start_if_idle(&self, state: &mut ItemState, effects: &mut Effects, target: Target) {
        let index = target.index();
        if state.running[index] || state.targets[index].next.is_none() || state.error.is_some() {
            return;
        }
        state.running[index] = true;
        signals::begin(&self.phases[index]);
        effects.spawn.push(target);
    }

    /// Merge values from `origin` while keeping established keys intact.
    fn merge_values(&self, state: &mut ItemState, origin: Origin, values: &RawRecord) {
        let schema = self.ctx.schema();
        let keys = Target::ALL.map(|target| {
            (
                self.ctx.key_identifier(target).to_string(),
                schema.primary_key(target, &state.fields),
            )
        });

        match origin {
            Origin::Fresh => {
                for (field, value) in values {
                    state.fields.insert(field.clone(), value.clone());
                }
            }
            Origin::Transporter | Origin::LocalCache => {
                let mut raw = values.clone();
                raw.remove(&self.ctx.config().marker_field);
                schema.set_from(origin, &mut state.fields, &raw);
            }
        }

        for (identifier, key) in keys {
            if let Some(key) = key {
                state.fields.insert(identifier, key);
            }
        }
    }

    fn auto_save(&self, state: &mut ItemState, effects: &mut Effects) -> bool {
        if !state.auto_save || state.error.is_some() {
            return false;
        }
        for target in Target::ALL {
            self.schedule(state, effects, target, Some(ActionState::BeingUpdated));
        }
        true
    }

    fn mark_removed(&self, state: &mut ItemState, effects: &mut Effects) {
        state.removed = true;
        if !state.detached {
            state.detached = true;
            effects.detach = true;
        }
    }

    fn check_discard(&self, state: &mut ItemState, effects: &mut Effects) {
        if state.discarded || !state.targets.iter().all(TargetState::is_deleted) {
            return;
        }
        state.discarded = true;
        effects.discard = true;
        let err = SyncError::Discarded(self.id.as_u64());
        for readiness in &self.readiness {
            signals::fail_pending(readiness, &err);
        }
        event!(Level::DEBUG, item = %self.id, "item discarded");
    }

    /// Lock both targets permanently and fail every outstanding waiter.
    fn fail(&self, state: &mut ItemState, err: SyncError) {
        if state.error.is_some() {
            return;
        }
        event!(Level::ERROR, item = %self.id, error = %err, "item locked");
        for target in state.targets.iter_mut() {
            target.lock();
        }
        state.auto_save = false;
        state.error = Some(err.clone());
        for round in &self.phases {
            signals::fail_round(round, &err);
        }
        for readiness in &self.readiness {
            signals::fail_pending(readiness, &err);
        }
    }
}
