//! Field mapping between the canonical record shape and each target's wire
//! shape.
//!
//! Primary keys live in the canonical fields under the identifier name the
//! schema reports for each target, so filtering and reconciliation can treat
//! them like any other field.

use crate::core::{Fields, Origin, RawRecord, Target};
use serde_json::Value;

pub trait Schema: Send + Sync {
    /// Field holding `target`'s primary key.
    fn key_identifier_for(&self, target: Target) -> &str;

    /// Merge a raw record from `source` into the canonical fields.
    fn set_from(&self, source: Origin, fields: &mut Fields, raw: &RawRecord);

    /// Project the canonical fields into `target`'s wire shape, merged with
    /// `base_keys`.
    fn get_for(&self, target: Target, fields: &Fields, base_keys: &RawRecord) -> RawRecord;

    /// `target`'s primary key, if established.
    fn primary_key(&self, target: Target, fields: &Fields) -> Option<Value> {
        fields
            .get(self.key_identifier_for(target))
            .filter(|key| !key.is_null())
            .cloned()
    }

    /// Record the key `target` issued in `raw`. Write-once: an established key
    /// is never replaced. Returns whether a key was written.
    fn set_primary_key(&self, target: Target, fields: &mut Fields, raw: &RawRecord) -> bool {
        if self.primary_key(target, fields).is_some() {
            return false;
        }
        let identifier = self.key_identifier_for(target);
        match raw.get(identifier).filter(|key| !key.is_null()) {
            Some(key) => {
                fields.insert(identifier.to_string(), key.clone());
                true
            }
            None => false,
        }
    }
}

/// Schema that copies a declared set of fields (or every field) verbatim.
///
/// The local-cache key is kept out of transporter payloads; the local cache
/// receives everything, transporter key included, so a cold start can rebuild
/// both sides.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    transporter_key: String,
    local_key: String,
    fields: Option<Vec<String>>,
}

impl FieldSchema {
    pub fn new(transporter_key: &str, local_key: &str) -> Self {
        Self {
            transporter_key: transporter_key.to_string(),
            local_key: local_key.to_string(),
            fields: None,
        }
    }

    /// Restrict mapping to the given fields (keys are always mapped).
    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    fn maps(&self, field: &str) -> bool {
        field == self.transporter_key
            || field == self.local_key
            || self
                .fields
                .as_ref()
                .is_none_or(|declared| declared.iter().any(|f| f == field))
    }
}

impl Default for FieldSchema {
    fn default() -> Self {
        Self::new("id", "localId")
    }
}

impl Schema for FieldSchema {
    fn key_identifier_for(&self, target: Target) -> &str {
        match target {
            Target::Transporter => &self.transporter_key,
            Target::LocalCache => &self.local_key,
        }
    }

    fn set_from(&self, _source: Origin, fields: &mut Fields, raw: &RawRecord) {
        for (field, value) in raw {
            if self.maps(field) {
                fields.insert(field.clone(), value.clone());
            }
        }
    }

    fn get_for(&self, target: Target, fields: &Fields, base_keys: &RawRecord) -> RawRecord {
        let mut projected: RawRecord = fields
            .iter()
            .filter(|(field, value)| self.maps(field) && !value.is_null())
            .filter(|(field, _)| target == Target::LocalCache || **field != self.local_key)
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();
        for (field, value) in base_keys {
            projected.insert(field.clone(), value.clone());
        }
        projected
    }
}
