//! Provider registry (section 6): hosts register one or more named
//! providers up front; the engine resolves the *active* one for a scope
//! indirectly, through a pointer that can be repointed at runtime (e.g.
//! switching a workspace from a gateway to a direct provider without
//! restarting the engine).

use super::Provider;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
    active: RwLock<HashMap<String, String>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider_id: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.write().insert(provider_id.into(), provider);
    }

    pub fn unregister(&self, provider_id: &str) {
        self.providers.write().remove(provider_id);
    }

    /// Points `scope_key` (typically a `Scope::to_string()`) at
    /// `provider_id`. Does not validate the id is registered yet, so a
    /// host can set the pointer before the provider finishes constructing.
    pub fn set_active(&self, scope_key: impl Into<String>, provider_id: impl Into<String>) {
        self.active.write().insert(scope_key.into(), provider_id.into());
    }

    pub fn clear_active(&self, scope_key: &str) {
        self.active.write().remove(scope_key);
    }

    pub fn active_for(&self, scope_key: &str) -> Option<Arc<dyn Provider>> {
        let provider_id = self.active.read().get(scope_key).cloned()?;
        self.providers.read().get(&provider_id).cloned()
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.read().get(provider_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::direct::{DirectBackend, DirectProvider};
    use crate::provider::{PullResult, PushOutcome};
    use crate::types::{PendingOp, Scope};

    struct NullBackend;
    impl DirectBackend for NullBackend {
        fn pull(&self, _scope: &Scope, cursor: u64, _limit: usize) -> crate::error::Result<PullResult> {
            Ok(PullResult {
                changes: vec![],
                next_cursor: cursor,
                has_more: false,
            })
        }
        fn push(&self, _scope: &Scope, _ops: &[PendingOp]) -> crate::error::Result<PushOutcome> {
            Ok(PushOutcome::default())
        }
    }

    #[test]
    fn test_active_pointer_resolves_registered_provider() {
        let registry = ProviderRegistry::new();
        let provider = DirectProvider::new(NullBackend);
        registry.register("p1", provider.clone() as Arc<dyn Provider>);
        registry.set_active("ws1", "p1");
        assert!(registry.active_for("ws1").is_some());
        assert!(registry.active_for("ws2").is_none());
    }

    #[test]
    fn test_repointing_active_switches_provider() {
        let registry = ProviderRegistry::new();
        let a = DirectProvider::new(NullBackend);
        let b = DirectProvider::new(NullBackend);
        registry.register("a", a as Arc<dyn Provider>);
        registry.register("b", b as Arc<dyn Provider>);
        registry.set_active("ws1", "a");
        assert!(Arc::ptr_eq(&registry.active_for("ws1").unwrap(), &registry.get("a").unwrap()));
        registry.set_active("ws1", "b");
        assert!(Arc::ptr_eq(&registry.active_for("ws1").unwrap(), &registry.get("b").unwrap()));
    }
}
