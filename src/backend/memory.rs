//! In-memory implementation of the backend protocol.
//!
//! Records live in insertion order behind a mutex. Reachability and latency
//! are switchable at runtime so callers can simulate a flaky network or a
//! slow disk, and every call is logged for inspection.

use super::{Backend, Response};
use crate::core::{RawRecord, Result, SyncError, Target};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// A call received by a `MemoryBackend`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCall {
    pub verb: &'static str,
    pub payload: RawRecord,
}

pub struct MemoryBackend {
    role: Target,
    key_field: String,
    records: Mutex<Vec<RawRecord>>,
    calls: Mutex<Vec<BackendCall>>,
    next_key: AtomicU64,
    injected_failure: Mutex<Option<String>>,
    not_found_verbs: Mutex<Vec<&'static str>>,
    available: watch::Sender<bool>,
    gate_open: watch::Sender<bool>,
}

impl MemoryBackend {
    /// Create an empty backend playing `role`, keyed by `key_field`.
    pub fn new(role: Target, key_field: &str) -> Self {
        Self {
            role,
            key_field: key_field.to_string(),
            records: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            next_key: AtomicU64::new(1),
            injected_failure: Mutex::new(None),
            not_found_verbs: Mutex::new(Vec::new()),
            available: watch::Sender::new(true),
            gate_open: watch::Sender::new(true),
        }
    }

    /// Seed records without logging a call.
    pub fn with_records(self, records: Vec<RawRecord>) -> Self {
        for record in records {
            self.insert(record);
        }
        self
    }

    pub fn role(&self) -> Target {
        self.role
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Store a record directly, assigning a key if it has none.
    pub fn insert(&self, mut record: RawRecord) -> RawRecord {
        match record.get(&self.key_field).and_then(Value::as_u64) {
            Some(numeric) => {
                self.next_key.fetch_max(numeric + 1, Ordering::SeqCst);
            }
            None if record.get(&self.key_field).is_none_or(Value::is_null) => {
                let key = self.next_key.fetch_add(1, Ordering::SeqCst);
                record.insert(self.key_field.clone(), Value::from(key));
            }
            None => {}
        }
        let mut records = self.lock_records();
        records.push(record.clone());
        record
    }

    /// Snapshot of stored records in insertion order.
    pub fn records(&self) -> Vec<RawRecord> {
        self.lock_records().clone()
    }

    /// Look up a stored record by key.
    pub fn get(&self, key: &Value) -> Option<RawRecord> {
        let records = self.lock_records();
        records
            .iter()
            .find(|record| record.get(&self.key_field) == Some(key))
            .cloned()
    }

    /// Drop a record behind the client's back.
    pub fn forget(&self, key: &Value) -> Option<RawRecord> {
        let mut records = self.lock_records();
        let position = records
            .iter()
            .position(|record| record.get(&self.key_field) == Some(key))?;
        Some(records.remove(position))
    }

    pub fn len(&self) -> usize {
        self.lock_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// Calls received so far for one verb.
    pub fn calls_for(&self, verb: &str) -> Vec<BackendCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.verb == verb)
            .collect()
    }

    pub fn call_count(&self, verb: &str) -> usize {
        self.calls_for(verb).len()
    }

    /// Toggle reachability. While unreachable every call answers `Pending`.
    pub fn set_available(&self, available: bool) {
        self.available.send_replace(available);
    }

    pub fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    /// Hold every subsequent call at the door until `resume` is called.
    pub fn pause(&self) {
        self.gate_open.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate_open.send_replace(true);
    }

    /// Make the next call fail with an unrecoverable error.
    pub fn fail_next_call(&self, message: &str) {
        if let Ok(mut failure) = self.injected_failure.lock() {
            *failure = Some(message.to_string());
        }
    }

    /// Make every subsequent `verb` call answer `NotFound`.
    pub fn answer_not_found(&self, verb: &'static str) {
        if let Ok(mut verbs) = self.not_found_verbs.lock() {
            verbs.push(verb);
        }
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, Vec<RawRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn key_of(&self, payload: &RawRecord) -> Option<Value> {
        payload
            .get(&self.key_field)
            .filter(|key| !key.is_null())
            .cloned()
    }

    fn position_of(&self, records: &[RawRecord], key: &Value) -> Option<usize> {
        records
            .iter()
            .position(|record| record.get(&self.key_field) == Some(key))
    }

    /// Log the call, wait at the gate, then decide whether it proceeds.
    async fn admit(&self, verb: &'static str, payload: &RawRecord) -> Result<Option<Response>> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(BackendCall {
                verb,
                payload: payload.clone(),
            });
        }

        let mut gate = self.gate_open.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        if let Some(message) = self
            .injected_failure
            .lock()
            .ok()
            .and_then(|mut failure| failure.take())
        {
            return Err(SyncError::backend(self.role, message));
        }

        if !self.is_available() {
            return Ok(Some(Response::pending()));
        }

        let forced_not_found = self
            .not_found_verbs
            .lock()
            .map(|verbs| verbs.contains(&verb))
            .unwrap_or(false);
        if forced_not_found {
            return Ok(Some(Response::not_found()));
        }

        Ok(None)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create(&self, payload: RawRecord) -> Result<Response> {
        if let Some(early) = self.admit("create", &payload).await? {
            return Ok(early);
        }
        let stored = self.insert(payload);
        Ok(Response::resolved(Value::Object(stored)))
    }

    async fn update(&self, payload: RawRecord) -> Result<Response> {
        if let Some(early) = self.admit("update", &payload).await? {
            return Ok(early);
        }
        let Some(key) = self.key_of(&payload) else {
            return Ok(Response::not_found());
        };

        let mut records = self.lock_records();
        let Some(position) = self.position_of(&records, &key) else {
            return Ok(Response::not_found());
        };
        let record = &mut records[position];
        for (field, value) in payload {
            record.insert(field, value);
        }
        Ok(Response::resolved(Value::Object(record.clone())))
    }

    async fn delete(&self, payload: RawRecord) -> Result<Response> {
        if let Some(early) = self.admit("delete", &payload).await? {
            return Ok(early);
        }
        let Some(key) = self.key_of(&payload) else {
            return Ok(Response::not_found());
        };

        let mut records = self.lock_records();
        match self.position_of(&records, &key) {
            Some(position) => Ok(Response::resolved(Value::Object(
                records.remove(position),
            ))),
            None => Ok(Response::not_found()),
        }
    }

    async fn fetch(&self, payload: RawRecord) -> Result<Response> {
        if let Some(early) = self.admit("fetch", &payload).await? {
            return Ok(early);
        }
        let Some(key) = self.key_of(&payload) else {
            return Ok(Response::not_found());
        };

        let records = self.lock_records();
        match self.position_of(&records, &key) {
            Some(position) => Ok(Response::resolved(Value::Object(
                records[position].clone(),
            ))),
            None => Ok(Response::not_found()),
        }
    }

    async fn fetch_all(&self) -> Result<Response> {
        if let Some(early) = self.admit("fetch_all", &RawRecord::new()).await? {
            return Ok(early);
        }
        let records = self.records().into_iter().map(Value::Object).collect();
        Ok(Response::resolved(Value::Array(records)))
    }

    async fn initial_fetch(&self, seed: Vec<RawRecord>) -> Result<Response> {
        if let Some(early) = self.admit("initial_fetch", &RawRecord::new()).await? {
            return Ok(early);
        }

        let records = self.records();
        let seeded_keys: Vec<Value> = seed.iter().filter_map(|r| self.key_of(r)).collect();

        // records the client does not hold yet
        let items: Vec<Value> = records
            .iter()
            .filter(|record| {
                self.key_of(record)
                    .is_none_or(|key| !seeded_keys.contains(&key))
            })
            .cloned()
            .map(Value::Object)
            .collect();

        // keys the client holds that no longer exist here
        let to_delete: Vec<Value> = seeded_keys
            .into_iter()
            .filter(|key| self.position_of(&records, key).is_none())
            .collect();

        Ok(Response::resolved(serde_json::json!({
            "items": items,
            "toDelete": to_delete,
        })))
    }

    async fn once_available(&self) {
        let mut available = self.available.subscribe();
        let _ = available.wait_for(|available| *available).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_create_assigns_keys() {
        let backend = MemoryBackend::new(Target::Transporter, "id");
        let response = backend.create(record(json!({"title": "a"}))).await.unwrap();
        assert_eq!(response.status, super::super::Status::Resolved);
        assert_eq!(response.record().unwrap()["id"], json!(1));

        let response = backend.create(record(json!({"title": "b"}))).await.unwrap();
        assert_eq!(response.record().unwrap()["id"], json!(2));
        assert_eq!(backend.call_count("create"), 2);
    }

    #[tokio::test]
    async fn test_unavailable_answers_pending() {
        let backend = MemoryBackend::new(Target::Transporter, "id");
        backend.set_available(false);
        let response = backend.create(record(json!({"title": "a"}))).await.unwrap();
        assert_eq!(response, Response::pending());
        assert!(backend.is_empty());

        backend.set_available(true);
        backend.once_available().await;
    }

    #[tokio::test]
    async fn test_missing_records_answer_not_found() {
        let backend = MemoryBackend::new(Target::LocalCache, "localId");
        let response = backend.update(record(json!({"localId": 9}))).await.unwrap();
        assert_eq!(response, Response::not_found());
        let response = backend.delete(record(json!({}))).await.unwrap();
        assert_eq!(response, Response::not_found());
    }

    #[tokio::test]
    async fn test_initial_fetch_diffs_against_seed() {
        let backend = MemoryBackend::new(Target::Transporter, "id").with_records(vec![
            record(json!({"id": 2})),
            record(json!({"id": 5})),
        ]);
        let seed = vec![record(json!({"id": 1})), record(json!({"id": 2})), record(json!({}))];

        let answer = backend.initial_fetch(seed).await.unwrap().initial_fetch().unwrap();
        assert_eq!(answer.items, vec![record(json!({"id": 5}))]);
        assert_eq!(answer.to_delete, vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let backend = MemoryBackend::new(Target::Transporter, "id");
        backend.fail_next_call("disk on fire");
        assert!(backend.fetch_all().await.is_err());
        assert!(backend.fetch_all().await.is_ok());
    }
}
