// ============================================================================
// Store: collection-level reconciliation
// ============================================================================
//
// The store owns two disjoint, ordered collections:
//
//   items             ready, externally visible records
//   incomplete_items  records awaiting their first resolution or mid-deletion
//
// Records never touch these collections themselves; they ask through
// `ItemHooks` and the store moves them.
//
// ============================================================================

pub mod config;

pub use config::StoreConfig;

use crate::backend::{Backends, KeyRef, Response, Status};
use crate::core::{Fields, ItemId, Origin, RawRecord, Result, SyncError, Target};
use crate::item::{Item, ItemHooks, Seed, SyncContext, SyncFuture};
use crate::schema::Schema;
use futures::future::{FutureExt, join_all};
use log::{info, warn};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
enum LoadState {
    Loading,
    Loaded,
    Failed(SyncError),
}

#[derive(Default)]
struct Membership {
    items: Vec<Item>,
    incomplete: Vec<Item>,
}

impl Membership {
    fn all(&self) -> Vec<Item> {
        self.items.iter().chain(&self.incomplete).cloned().collect()
    }
}

/// Moves records between collections on their request.
struct MembershipHooks {
    membership: Weak<Mutex<Membership>>,
}

impl MembershipHooks {
    fn with_membership(&self, f: impl FnOnce(&mut Membership)) {
        if let Some(membership) = self.membership.upgrade() {
            let mut guard = membership
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard);
        }
    }
}

impl ItemHooks for MembershipHooks {
    fn on_removed(&self, id: ItemId) {
        self.with_membership(|membership| {
            if let Some(position) = membership.items.iter().position(|item| item.id() == id) {
                let item = membership.items.remove(position);
                membership.incomplete.push(item);
            }
        });
    }

    fn on_discarded(&self, id: ItemId) {
        self.with_membership(|membership| {
            membership.items.retain(|item| item.id() != id);
            membership.incomplete.retain(|item| item.id() != id);
        });
    }
}

/// A synchronized collection of records.
///
/// # Examples
///
/// ```
/// use itemsync::{Backends, FieldSchema, MemoryBackend, Origin, Store, StoreConfig, Target};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let backends = Backends::new(
///     Arc::new(MemoryBackend::new(Target::Transporter, "id")),
///     Arc::new(MemoryBackend::new(Target::LocalCache, "localId")),
/// );
/// let store = Store::open(Arc::new(FieldSchema::default()), backends, StoreConfig::new("todos"))
///     .await
///     .unwrap();
///
/// let mut values = serde_json::Map::new();
/// values.insert("title".into(), "write docs".into());
/// let item = store.create(values, Origin::Fresh);
/// item.once_synced().await.unwrap();
/// assert!(item.key(Target::Transporter).is_some());
/// # });
/// ```
#[derive(Clone)]
pub struct Store {
    ctx: Arc<SyncContext>,
    membership: Arc<Mutex<Membership>>,
    hooks: Arc<dyn ItemHooks>,
    loaded: Arc<watch::Sender<LoadState>>,
}

impl Store {
    /// Create the store and start the initial dual-source load.
    ///
    /// Must be called inside a tokio runtime. Await [`Store::once_loaded`]
    /// before relying on the collections.
    pub fn new(schema: Arc<dyn Schema>, backends: Backends, config: StoreConfig) -> Result<Self> {
        let ctx = SyncContext::new(schema, backends, config)?;
        let membership = Arc::new(Mutex::new(Membership::default()));
        let hooks: Arc<dyn ItemHooks> = Arc::new(MembershipHooks {
            membership: Arc::downgrade(&membership),
        });

        let store = Self {
            ctx,
            membership,
            hooks,
            loaded: Arc::new(watch::Sender::new(LoadState::Loading)),
        };

        let loader = store.clone();
        store.ctx.runtime().spawn(async move {
            let outcome = match loader.load().await {
                Ok(()) => LoadState::Loaded,
                Err(err) => {
                    warn!("Store '{}' failed to load: {}", loader.config().name, err);
                    LoadState::Failed(err)
                }
            };
            loader.loaded.send_replace(outcome);
        });

        Ok(store)
    }

    /// Create the store and wait for the initial load.
    pub async fn open(
        schema: Arc<dyn Schema>,
        backends: Backends,
        config: StoreConfig,
    ) -> Result<Self> {
        let store = Self::new(schema, backends, config)?;
        store.once_loaded().await?;
        Ok(store)
    }

    /// Resolves when the initial load finishes; fails if the local cache
    /// could not be read.
    pub fn once_loaded(&self) -> SyncFuture {
        let mut loaded = self.loaded.subscribe();
        async move {
            let state = loaded
                .wait_for(|state| *state != LoadState::Loading)
                .await
                .map(|state| state.clone());
            match state {
                Ok(LoadState::Failed(err)) => Err(err),
                _ => Ok(()),
            }
        }
        .boxed()
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn config(&self) -> &StoreConfig {
        self.ctx.config()
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, Membership> {
        self.membership
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ready records in insertion order.
    pub fn items(&self) -> Vec<Item> {
        self.lock().items.clone()
    }

    /// Records awaiting first resolution or mid-deletion.
    pub fn incomplete_items(&self) -> Vec<Item> {
        self.lock().incomplete.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push_ready(&self, item: Item) {
        self.lock().items.push(item);
    }

    fn push_incomplete(&self, item: Item) {
        self.lock().incomplete.push(item);
    }

    fn promote(&self, id: ItemId) {
        let mut membership = self.lock();
        if let Some(position) = membership.incomplete.iter().position(|item| item.id() == id) {
            let item = membership.incomplete.remove(position);
            membership.items.push(item);
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Every record whose fields equal all of `filter`'s fields.
    pub fn find(&self, filter: &Fields) -> Vec<Item> {
        let candidates = self.lock().all();
        candidates
            .into_iter()
            .filter(|item| item.matches(filter))
            .collect()
    }

    pub fn find_one(&self, filter: &Fields) -> Option<Item> {
        let candidates = self.lock().all();
        candidates.into_iter().find(|item| item.matches(filter))
    }

    /// The record holding `key` on `target`. Keys compare by value, so `1`,
    /// `1.0` and `"1"` name the same record.
    pub fn find_by_key(&self, target: Target, key: &Value) -> Option<Item> {
        let candidates = self.lock().all();
        find_keyed(candidates, target, key)
    }

    /// Return the record `key` names on `target`, fetching it from there when
    /// it is not held yet. Resolves to `None` when the target does not have
    /// it either.
    pub async fn find_one_or_fetch(&self, key: RawRecord, target: Target) -> Result<Option<Item>> {
        let identifier = self.ctx.key_identifier(target).to_string();
        let Some(key_value) = key.get(&identifier).filter(|key| !key.is_null()).cloned() else {
            return Err(SyncError::MissingKey(identifier));
        };

        if let Some(item) = self.find_by_key(target, &key_value) {
            return Ok(Some(item));
        }

        let item = Item::attached(
            &self.ctx,
            Seed::Placeholder { target, key },
            Arc::clone(&self.hooks),
        );
        self.push_incomplete(item.clone());

        let fetched = item.fetch(target);
        let store = self.clone();
        let placeholder = item.clone();
        let promotion = self.ctx.runtime().spawn(async move {
            let outcome = fetched.await;
            if outcome.is_ok() && !placeholder.removed() {
                store.promote(placeholder.id());
            }
            outcome
        });

        promotion
            .await
            .map_err(|err| SyncError::backend(target, format!("fetch task failed: {err}")))??;
        Ok((!item.removed()).then_some(item))
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Add a record from `origin` to the ready collection.
    pub fn create(&self, values: RawRecord, origin: Origin) -> Item {
        let seed = match origin {
            Origin::Fresh => Seed::Fresh(values),
            Origin::Transporter => Seed::Transporter(values),
            Origin::LocalCache => Seed::LocalCache(values),
        };
        let item = Item::attached(&self.ctx, seed, Arc::clone(&self.hooks));
        self.push_ready(item.clone());
        item
    }

    /// Re-fetch the whole collection from `target` and reconcile it against
    /// the ready records, keyed by `target`'s identifier.
    pub async fn fetch(&self, target: Target) -> Result<()> {
        let records = self.fetch_all(target).await?;
        let origin = Origin::from(target);
        let identifier = self.ctx.key_identifier(target).to_string();

        let (ready, incomplete) = {
            let membership = self.lock();
            (membership.items.clone(), membership.incomplete.clone())
        };
        let by_key: HashMap<String, Item> = ready
            .into_iter()
            .filter_map(|item| item.key(target).map(|key| (canonical_key(&key), item)))
            .collect();
        let settling: HashSet<String> = incomplete
            .iter()
            .filter_map(|item| item.key(target).map(|key| canonical_key(&key)))
            .collect();

        let mut seen = HashSet::new();
        let mut created = 0;
        for raw in records {
            let key = raw
                .get(&identifier)
                .filter(|key| !key.is_null())
                .map(canonical_key);
            match key {
                Some(key) if by_key.contains_key(&key) => {
                    let item = &by_key[&key];
                    self.warn_if_rejected(item, "update", item.update(raw, origin));
                    seen.insert(key);
                }
                // removal in flight; do not resurrect it
                Some(key) if settling.contains(&key) => {}
                _ => {
                    self.create(raw, origin);
                    created += 1;
                }
            }
        }

        let mut removed = 0;
        for (key, item) in &by_key {
            if !seen.contains(key) {
                self.warn_if_rejected(item, "remove", item.remove(origin));
                removed += 1;
            }
        }

        info!(
            "Store '{}' reconciled against {}: {} updated, {} removed, {} created",
            self.config().name,
            target,
            seen.len(),
            removed,
            created
        );
        Ok(())
    }

    /// Log an operation a locked record refused. Accepted operations keep
    /// running in the background.
    fn warn_if_rejected(&self, item: &Item, operation: &str, outcome: SyncFuture) {
        if let Some(Err(err)) = outcome.now_or_never() {
            warn!(
                "Store '{}' could not {} record {}: {}",
                self.config().name,
                operation,
                item.id(),
                err
            );
        }
    }

    async fn fetch_all(&self, target: Target) -> Result<Vec<RawRecord>> {
        let backend = self.ctx.backend(target);
        loop {
            let response = backend.fetch_all().await?;
            match response.status {
                Status::Resolved => return response.records(),
                Status::Pending => backend.once_available().await,
                Status::NotFound => {
                    return Err(SyncError::backend(target, "collection not found"));
                }
            }
        }
    }

    /// Resolves once every tracked record has nothing pending on the
    /// transporter.
    pub fn once_synced(&self) -> SyncFuture {
        self.settle_all(Item::once_synced)
    }

    /// Resolves once every tracked record has nothing pending on the local
    /// cache.
    pub fn once_stored(&self) -> SyncFuture {
        self.settle_all(Item::once_stored)
    }

    fn settle_all(&self, settle: fn(&Item) -> SyncFuture) -> SyncFuture {
        let waits: Vec<SyncFuture> = self.lock().all().iter().map(settle).collect();
        async move {
            join_all(waits).await.into_iter().collect::<Result<Vec<()>>>()?;
            Ok(())
        }
        .boxed()
    }

    // ------------------------------------------------------------------
    // Initial load
    // ------------------------------------------------------------------

    async fn load(&self) -> Result<()> {
        let local = self.ctx.backend(Target::LocalCache);
        let response = local
            .initial_fetch(Vec::new())
            .await
            .map_err(|err| SyncError::LocalCacheUnavailable(err.to_string()))?;
        if response.status != Status::Resolved {
            return Err(SyncError::LocalCacheUnavailable(format!(
                "initial fetch answered {:?}",
                response.status
            )));
        }
        let cached = response.initial_fetch()?.items;

        for raw in &cached {
            let item = Item::attached(
                &self.ctx,
                Seed::LocalCache(raw.clone()),
                Arc::clone(&self.hooks),
            );
            let marker = item.target_state(Target::Transporter).marker();
            if marker.is_terminal_marker() {
                self.push_incomplete(item);
            } else {
                self.push_ready(item);
            }
        }
        info!(
            "Store '{}' loaded {} records from the local cache",
            self.config().name,
            cached.len()
        );

        let transporter = self.ctx.backend(Target::Transporter);
        match transporter.initial_fetch(cached).await {
            Ok(response) if response.status == Status::Resolved => {
                self.merge_initial(response);
            }
            Ok(response) => {
                warn!(
                    "Store '{}' loading from local cache only: transporter answered {:?}",
                    self.config().name,
                    response.status
                );
            }
            Err(err) => {
                warn!(
                    "Store '{}' loading from local cache only: {}",
                    self.config().name,
                    err
                );
            }
        }
        Ok(())
    }

    fn merge_initial(&self, response: Response) {
        let answer = match response.initial_fetch() {
            Ok(answer) => answer,
            Err(err) => {
                warn!(
                    "Store '{}' ignoring malformed transporter answer: {}",
                    self.config().name,
                    err
                );
                return;
            }
        };
        let identifier = self.ctx.key_identifier(Target::Transporter).to_string();

        for raw in answer.items {
            let existing = raw
                .get(&identifier)
                .filter(|key| !key.is_null())
                .and_then(|key| self.find_by_key(Target::Transporter, key));
            match existing {
                Some(item) => {
                    self.warn_if_rejected(&item, "update", item.update(raw, Origin::Transporter));
                }
                None => {
                    self.create(raw, Origin::Transporter);
                }
            }
        }

        // only records already pending deletion are confirmed gone
        for reference in &answer.to_delete {
            let Some(key) = KeyRef(reference).key(&identifier) else {
                continue;
            };
            let pending = self.incomplete_items();
            match find_keyed(pending, Target::Transporter, &key) {
                Some(item) => {
                    self.warn_if_rejected(&item, "remove", item.remove(Origin::Transporter));
                }
                None => {
                    info!(
                        "Store '{}' ignoring toDelete key {} with no pending deletion",
                        self.config().name,
                        key
                    );
                }
            }
        }
    }
}

fn find_keyed(candidates: Vec<Item>, target: Target, key: &Value) -> Option<Item> {
    let wanted = canonical_key(key);
    candidates
        .into_iter()
        .find(|item| item.key(target).is_some_and(|held| canonical_key(&held) == wanted))
}

/// Normalized text of a key value: integral numbers lose their fraction and
/// strings lose their quotes.
fn canonical_key(key: &Value) -> String {
    match key {
        Value::String(text) => text.clone(),
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                integer.to_string()
            } else if let Some(integer) = number.as_u64() {
                integer.to_string()
            } else {
                match number.as_f64() {
                    Some(float) if float.fract() == 0.0 && float.abs() < i64::MAX as f64 => {
                        (float as i64).to_string()
                    }
                    _ => number.to_string(),
                }
            }
        }
        other => other.to_string(),
    }
}
