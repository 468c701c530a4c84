// ============================================================================
// Target Backend Protocol
// ============================================================================
//
// Both the remote service and the local cache speak the same CRUD-like
// protocol. Every call answers with a status:
//
//   Resolved  the call succeeded, `data` carries the result
//   Pending   the backend is unreachable; ignore `data`, retry after
//             `once_available()`
//   NotFound  authoritative: the record does not exist there
//
// Any `Err` is unrecoverable for the record that issued the call.
//
// ============================================================================

pub mod memory;

pub use memory::{BackendCall, MemoryBackend};

use crate::core::{RawRecord, Result, SyncError, Target};
use crate::state::ActionState;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Outcome class of a backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Resolved,
    Pending,
    NotFound,
}

/// Result of a backend call.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    pub data: Value,
}

impl Response {
    pub fn resolved(data: Value) -> Self {
        Self {
            status: Status::Resolved,
            data,
        }
    }

    pub fn pending() -> Self {
        Self {
            status: Status::Pending,
            data: Value::Null,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: Status::NotFound,
            data: Value::Null,
        }
    }

    /// The response data as a single record, if it is one.
    pub fn record(&self) -> Option<&RawRecord> {
        self.data.as_object()
    }

    /// Decode `data` as a list of records.
    pub fn records(self) -> Result<Vec<RawRecord>> {
        match self.data {
            Value::Null => Ok(Vec::new()),
            data => Ok(serde_json::from_value(data)?),
        }
    }

    /// Decode `data` as an initial-fetch answer.
    pub fn initial_fetch(self) -> Result<InitialFetch> {
        match self.data {
            Value::Null => Ok(InitialFetch::default()),
            data => Ok(serde_json::from_value(data)?),
        }
    }
}

/// Answer to `Backend::initial_fetch`.
///
/// `to_delete` entries are either bare keys or records carrying the key
/// field; both resolve through `KeyRef`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InitialFetch {
    #[serde(default)]
    pub items: Vec<RawRecord>,
    #[serde(default, rename = "toDelete")]
    pub to_delete: Vec<Value>,
}

/// A reference to a record by primary key, as sent in `toDelete` lists.
pub struct KeyRef<'a>(pub &'a Value);

impl KeyRef<'_> {
    /// Resolve the key value using `identifier` when the reference is a record.
    pub fn key(&self, identifier: &str) -> Option<Value> {
        match self.0 {
            Value::Object(record) => record.get(identifier).filter(|v| !v.is_null()).cloned(),
            Value::Null => None,
            scalar => Some(scalar.clone()),
        }
    }
}

/// Uniform protocol implemented once per target.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn create(&self, payload: RawRecord) -> Result<Response>;

    async fn update(&self, payload: RawRecord) -> Result<Response>;

    async fn delete(&self, payload: RawRecord) -> Result<Response>;

    async fn fetch(&self, payload: RawRecord) -> Result<Response>;

    /// Fetch the full collection; `data` is an array of records.
    async fn fetch_all(&self) -> Result<Response>;

    /// Boot-time fetch. `seed` carries the records the client already holds
    /// so the backend may diff server-side; `data` decodes as `InitialFetch`.
    async fn initial_fetch(&self, seed: Vec<RawRecord>) -> Result<Response>;

    /// Resolves once a backend that answered `Pending` is reachable again.
    async fn once_available(&self);
}

/// The pair of backends a store synchronizes against.
#[derive(Clone)]
pub struct Backends {
    pub transporter: Arc<dyn Backend>,
    pub local_cache: Arc<dyn Backend>,
}

impl Backends {
    pub fn new(transporter: Arc<dyn Backend>, local_cache: Arc<dyn Backend>) -> Self {
        Self {
            transporter,
            local_cache,
        }
    }

    pub fn get(&self, target: Target) -> &Arc<dyn Backend> {
        match target {
            Target::Transporter => &self.transporter,
            Target::LocalCache => &self.local_cache,
        }
    }
}

/// Issue the wire call named by `action`.
pub async fn dispatch(
    backend: &dyn Backend,
    action: ActionState,
    payload: RawRecord,
) -> Result<Response> {
    match action {
        ActionState::BeingCreated => backend.create(payload).await,
        ActionState::BeingUpdated => backend.update(payload).await,
        ActionState::BeingDeleted => backend.delete(payload).await,
        ActionState::BeingFetched => backend.fetch(payload).await,
    }
}
