//! Additive payload merging
//!
//! Additive groups carry a JSON document of the form
//! `{ "records": [...], "totals": { "name": 3 } }`. Merging takes the set union
//! of records and sums totals, so the result does not depend on grouping or
//! order of the inputs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::ResolveError;

/// Decoded additive payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditivePayload {
    #[serde(default)]
    pub records: Vec<Value>,
    #[serde(default)]
    pub totals: BTreeMap<String, i64>,
}

impl AdditivePayload {
    pub fn decode(payload: &[u8]) -> Result<Self, ResolveError> {
        if payload.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(payload).map_err(ResolveError::Malformed)
    }

    /// Canonical encoding: records sorted and deduplicated by their JSON text
    pub fn encode(&self) -> Result<Vec<u8>, ResolveError> {
        let mut canonical = self.clone();
        canonical.records = canonical_records(self.records.iter());
        serde_json::to_vec(&canonical).map_err(ResolveError::Malformed)
    }

    /// Union of records, sum of totals
    pub fn merge(&self, other: &Self) -> Result<Self, ResolveError> {
        let records = canonical_records(self.records.iter().chain(other.records.iter()));

        let mut totals = self.totals.clone();
        for (name, value) in &other.totals {
            let slot = totals.entry(name.clone()).or_insert(0);
            *slot = slot
                .checked_add(*value)
                .ok_or_else(|| ResolveError::Overflow(name.clone()))?;
        }

        Ok(Self { records, totals })
    }
}

// serde_json maps are key-ordered, so `to_string` is a stable identity for a record.
fn canonical_records<'a>(records: impl Iterator<Item = &'a Value>) -> Vec<Value> {
    records
        .map(|record| (record.to_string(), record.clone()))
        .collect::<BTreeMap<_, _>>()
        .into_values()
        .collect()
}

/// Fold several encoded payloads into one
pub fn merge_payloads<'a>(payloads: impl IntoIterator<Item = &'a [u8]>) -> Result<AdditivePayload, ResolveError> {
    let mut merged = AdditivePayload::default();
    for payload in payloads {
        merged = merged.merge(&AdditivePayload::decode(payload)?)?;
    }
    Ok(merged)
}
