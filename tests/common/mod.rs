#![allow(dead_code)]

use async_trait::async_trait;
use itemsync::{
    Backend, Backends, FieldSchema, MemoryBackend, RawRecord, Response, Result, Store,
    StoreConfig, SyncContext, Target,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};

pub fn record(value: Value) -> RawRecord {
    value.as_object().cloned().unwrap()
}

pub struct Harness {
    pub transporter: Arc<MemoryBackend>,
    pub local: Arc<MemoryBackend>,
    pub ctx: Arc<SyncContext>,
}

pub fn transporter() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new(Target::Transporter, "id"))
}

pub fn local_cache() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new(Target::LocalCache, "localId"))
}

/// Must be called inside a runtime.
pub fn harness() -> Harness {
    harness_with(transporter(), local_cache(), StoreConfig::new("test"))
}

pub fn harness_with(
    transporter: Arc<MemoryBackend>,
    local: Arc<MemoryBackend>,
    config: StoreConfig,
) -> Harness {
    let backends = Backends::new(transporter.clone(), local.clone());
    let ctx = SyncContext::new(Arc::new(FieldSchema::default()), backends, config).unwrap();
    Harness {
        transporter,
        local,
        ctx,
    }
}

pub fn store(transporter: Arc<dyn Backend>, local: Arc<dyn Backend>) -> Store {
    Store::new(
        Arc::new(FieldSchema::default()),
        Backends::new(transporter, local),
        StoreConfig::new("test"),
    )
    .unwrap()
}

/// Let spawned drivers run until `done` holds.
pub async fn until(mut done: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// A `MemoryBackend` whose collection-level answers can be scripted.
///
/// Scripted answers bypass the inner backend entirely, including its pause
/// gate; record-level calls always go to the inner backend.
pub struct ScriptedBackend {
    pub inner: Arc<MemoryBackend>,
    initial_fetch: Mutex<Option<Value>>,
    fetch_all: Mutex<Option<Value>>,
}

impl ScriptedBackend {
    pub fn new(inner: Arc<MemoryBackend>) -> Self {
        Self {
            inner,
            initial_fetch: Mutex::new(None),
            fetch_all: Mutex::new(None),
        }
    }

    pub fn answer_initial_fetch(self, data: Value) -> Self {
        *self.initial_fetch.lock().unwrap() = Some(data);
        self
    }

    pub fn answer_fetch_all(&self, data: Value) {
        *self.fetch_all.lock().unwrap() = Some(data);
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn create(&self, payload: RawRecord) -> Result<Response> {
        self.inner.create(payload).await
    }

    async fn update(&self, payload: RawRecord) -> Result<Response> {
        self.inner.update(payload).await
    }

    async fn delete(&self, payload: RawRecord) -> Result<Response> {
        self.inner.delete(payload).await
    }

    async fn fetch(&self, payload: RawRecord) -> Result<Response> {
        self.inner.fetch(payload).await
    }

    async fn fetch_all(&self) -> Result<Response> {
        let scripted = self.fetch_all.lock().unwrap().take();
        match scripted {
            Some(data) => Ok(Response::resolved(data)),
            None => self.inner.fetch_all().await,
        }
    }

    async fn initial_fetch(&self, seed: Vec<RawRecord>) -> Result<Response> {
        let scripted = self.initial_fetch.lock().unwrap().take();
        match scripted {
            Some(data) => Ok(Response::resolved(data)),
            None => self.inner.initial_fetch(seed).await,
        }
    }

    async fn once_available(&self) {
        self.inner.once_available().await
    }
}
