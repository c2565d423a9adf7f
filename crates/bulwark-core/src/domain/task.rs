use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Number of hex characters kept from the SHA-256 digest.
const HASH_LEN: usize = 16;

/// Names which kind of work unit is executed (e.g. which downstream
/// consultation type). Breakers and handlers are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable short hash of a JSON value.
///
/// `serde_json::Map` keeps keys sorted, so two payloads that compare equal
/// always hash the same.
pub fn content_hash(value: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LEN);
    hex
}

/// One unit of work: task key + shared payload. Immutable once built.
///
/// The payload sits behind an `Arc` because a batch fans the same payload out
/// to every task key.
#[derive(Debug, Clone)]
pub struct Task {
    key: TaskKey,
    payload: Arc<serde_json::Value>,
    payload_hash: String,
    context_hash: Option<String>,
}

impl Task {
    pub fn new(key: impl Into<TaskKey>, payload: serde_json::Value) -> Self {
        Self::with_shared_payload(key, Arc::new(payload))
    }

    pub fn with_shared_payload(key: impl Into<TaskKey>, payload: Arc<serde_json::Value>) -> Self {
        let payload_hash = content_hash(&payload);
        Self {
            key: key.into(),
            payload,
            payload_hash,
            context_hash: None,
        }
    }

    /// Attach a hash of surrounding context (conversation state, etc.) so that
    /// the same payload under different context does not share a cache entry.
    pub fn with_context_hash(mut self, context_hash: impl Into<String>) -> Self {
        self.context_hash = Some(context_hash.into());
        self
    }

    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn shared_payload(&self) -> Arc<serde_json::Value> {
        Arc::clone(&self.payload)
    }

    pub fn payload_hash(&self) -> &str {
        &self.payload_hash
    }

    pub fn context_hash(&self) -> Option<&str> {
        self.context_hash.as_deref()
    }

    /// Cache key: `task_key:payload_hash[:context_hash]`.
    pub fn cache_key(&self) -> String {
        match &self.context_hash {
            Some(ctx) => format!("{}:{}:{}", self.key, self.payload_hash, ctx),
            None => format!("{}:{}", self.key, self.payload_hash),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_payloads_hash_equal() {
        let a = json!({"b": 1, "a": [1, 2]});
        let b = json!({"a": [1, 2], "b": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_eq!(content_hash(&a).len(), HASH_LEN);
    }

    #[test]
    fn different_payloads_hash_differently() {
        assert_ne!(content_hash(&json!({"q": "x"})), content_hash(&json!({"q": "y"})));
    }

    #[test]
    fn cache_key_includes_context_when_present() {
        let task = Task::new("review", json!({"doc": 1}));
        let plain = task.cache_key();
        assert!(plain.starts_with("review:"));
        assert_eq!(plain.matches(':').count(), 1);

        let with_ctx = task.with_context_hash("ctx42").cache_key();
        assert!(with_ctx.ends_with(":ctx42"));
        assert!(with_ctx.starts_with(&plain));
    }

    #[test]
    fn task_key_is_transparent_in_json() {
        let key = TaskKey::new("security");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"security\"");
    }
}
