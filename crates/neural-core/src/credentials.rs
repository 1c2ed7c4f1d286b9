//! Per-session provider credentials.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Storage for provider API keys, keyed by session.
pub trait CredentialStore: Send + Sync {
    fn resolve_api_key(&self, session_id: &str, provider_id: &str) -> Option<String>;
    fn save(&self, session_id: &str, provider_id: &str, api_key: &str);
}

/// Process-lifetime store; keys are never written to disk.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    keys: Mutex<HashMap<(String, String), String>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), String>> {
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn resolve_api_key(&self, session_id: &str, provider_id: &str) -> Option<String> {
        self.lock()
            .get(&(session_id.to_string(), provider_id.to_string()))
            .cloned()
    }

    fn save(&self, session_id: &str, provider_id: &str, api_key: &str) {
        self.lock().insert(
            (session_id.to_string(), provider_id.to_string()),
            api_key.trim().to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_scoped_by_session_and_provider() {
        let store = InMemoryCredentialStore::new();
        store.save("s1", "openai", " sk-one ");

        assert_eq!(store.resolve_api_key("s1", "openai").as_deref(), Some("sk-one"));
        assert!(store.resolve_api_key("s2", "openai").is_none());
        assert!(store.resolve_api_key("s1", "openrouter").is_none());
    }
}
