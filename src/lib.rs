// ============================================================================
// itemsync Library
// ============================================================================
//
// Offline-first record synchronization. Every record is mirrored to a remote
// service (the transporter) and a persistent local cache; each side is driven
// by its own small state machine so the two converge independently.
//
//   core     identities, targets, errors
//   state    per-target sync state and the transition merge table
//   backend  the protocol both targets speak, plus an in-memory backend
//   schema   mapping between canonical fields and wire shapes
//   item     one record and its sync drivers
//   store    the collection, initial load and re-fetch reconciliation
//
// ============================================================================

pub mod backend;
pub mod core;
pub mod item;
pub mod schema;
pub mod state;
pub mod store;

pub use backend::{
    Backend, BackendCall, Backends, InitialFetch, KeyRef, MemoryBackend, Response, Status,
};
pub use core::{Fields, ItemId, Origin, RawRecord, Result, SyncError, Target};
pub use item::{Item, ItemHooks, Seed, SyncContext, SyncFuture};
pub use schema::{FieldSchema, Schema};
pub use state::{ActionState, FixedState, SyncState, TargetState, admit, merge};
pub use store::{Store, StoreConfig};

pub mod prelude {
    //! Everything needed to wire a store against two backends.
    pub use crate::{
        Backend, Backends, FieldSchema, Item, MemoryBackend, Origin, Result, Schema, Store,
        StoreConfig, SyncError, Target,
    };
}
