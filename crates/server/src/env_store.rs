//! In-memory store of agent-scoped environment variables.
//!
//! Volatile by design: a restart empties the store. External reads mask
//! sensitive values; the agent-injection path gets the raw record.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use agentdeck_protocol::EnvVar;

use crate::error::{GatewayError, GatewayResult};

const MASK_SENTINEL: &str = "***HIDDEN***";

/// Seconds-precision timestamp in the `<secs>Z` wire format
fn now_stamp() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

#[derive(Debug, Clone)]
struct EnvEntry {
    value: String,
    description: Option<String>,
    created_at: String,
    updated_at: String,
}

/// Single-writer-at-a-time store; reads are snapshots.
#[derive(Default)]
pub struct EnvStore {
    inner: RwLock<BTreeMap<String, EnvEntry>>,
}

impl EnvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All variables sorted by key, sensitive values masked.
    pub fn list(&self) -> Vec<EnvVar> {
        let inner = self.inner.read().expect("env store lock poisoned");
        inner
            .iter()
            .map(|(key, entry)| masked_var(key, entry))
            .collect()
    }

    /// One variable, masked.
    pub fn get(&self, key: &str) -> Option<EnvVar> {
        let inner = self.inner.read().expect("env store lock poisoned");
        inner.get(key).map(|entry| masked_var(key, entry))
    }

    /// Upsert. Preserves `created_at` across updates.
    pub fn set(
        &self,
        key: &str,
        value: String,
        description: Option<String>,
    ) -> GatewayResult<EnvVar> {
        let key = key.trim();
        if key.is_empty() {
            return Err(GatewayError::invalid("env var key must not be empty"));
        }

        let now = now_stamp();
        let mut inner = self.inner.write().expect("env store lock poisoned");
        let entry = inner
            .entry(key.to_string())
            .and_modify(|e| {
                e.value = value.clone();
                if description.is_some() {
                    e.description = description.clone();
                }
                e.updated_at = now.clone();
            })
            .or_insert_with(|| EnvEntry {
                value,
                description,
                created_at: now.clone(),
                updated_at: now,
            });
        Ok(masked_var(key, entry))
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write().expect("env store lock poisoned");
        inner.remove(key).is_some()
    }

    /// Upsert many pairs; returns the updated records in key order.
    pub fn bulk_set(&self, vars: HashMap<String, String>) -> GatewayResult<Vec<EnvVar>> {
        let mut keys: Vec<String> = Vec::with_capacity(vars.len());
        for (key, value) in vars {
            self.set(&key, value, None)?;
            keys.push(key);
        }
        keys.sort();
        Ok(keys
            .iter()
            .filter_map(|k| self.get(k.trim()))
            .collect())
    }

    /// Unmasked record for the agent-injection path. Internal only.
    pub fn as_record(&self) -> HashMap<String, String> {
        let inner = self.inner.read().expect("env store lock poisoned");
        inner
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }
}

fn masked_var(key: &str, entry: &EnvEntry) -> EnvVar {
    let value = if is_sensitive_key(key) && !entry.value.is_empty() {
        MASK_SENTINEL.to_string()
    } else {
        entry.value.clone()
    };
    EnvVar {
        key: key.to_string(),
        value,
        description: entry.description.clone(),
        created_at: entry.created_at.clone(),
        updated_at: entry.updated_at.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    upper.contains("TOKEN") || upper.contains("KEY") || upper.contains("SECRET")
}
