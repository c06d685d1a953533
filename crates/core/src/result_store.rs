use std::collections::HashMap;
use std::sync::Mutex;

use altec_common::AltecError;

/// Reference implementation of the "external result store" that §4.4's checkpoint
/// contract requires phase functions to write rich payloads under content-addressed
/// names. Production deployments back `result_ref`s with a document store the way the
/// teacher's `store::StoreClient` backs assessments in Postgres; this in-process map
/// is sufficient for tests and local runs, not a production object-store client.
///
/// Content-addressing makes a reclaimed execution's replay of a finalize phase safe:
/// the same payload hashes to the same `result_ref`, so a duplicate write is a
/// harmless overwrite rather than a second, divergent result.
#[derive(Default)]
pub struct ResultStore {
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `payload` under a content-addressed key derived from its bytes and
    /// returns the `result_ref`. Writing the same payload twice is a no-op past the
    /// first write — the idempotency the checkpoint contract requires of phase
    /// functions that write their own side effects.
    pub fn put(&self, payload: &serde_json::Value) -> Result<String, AltecError> {
        let result_ref = content_address(payload);
        let mut entries = self.entries.lock().unwrap();
        entries.entry(result_ref.clone()).or_insert_with(|| payload.clone());
        Ok(result_ref)
    }

    pub fn get(&self, result_ref: &str) -> Option<serde_json::Value> {
        self.entries.lock().unwrap().get(result_ref).cloned()
    }
}

fn content_address(payload: &serde_json::Value) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    payload.to_string().hash(&mut hasher);
    format!("altec-result:{:x}", hasher.finish())
}
