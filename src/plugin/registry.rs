//! Typed service lookup shared across plugins. Written only during
//! `PluginHost::load`'s init pass and read-only afterwards, per spec's
//! shared-resource rule — there's no runtime mutation path once the daemon
//! is up.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    pub fn insert<T: Any + Send + Sync>(&self, name: &'static str, value: Arc<T>) {
        self.services.insert(name, value);
    }

    pub fn get<T: Any + Send + Sync>(&self, name: &'static str) -> Option<Arc<T>> {
        self.services.get(name).and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_round_trips() {
        let registry = ServiceRegistry::new();
        registry.insert("count", Arc::new(42u32));
        assert_eq!(*registry.get::<u32>("count").unwrap(), 42);
    }

    #[test]
    fn wrong_type_returns_none() {
        let registry = ServiceRegistry::new();
        registry.insert("count", Arc::new(42u32));
        assert!(registry.get::<String>("count").is_none());
    }

    #[test]
    fn missing_key_returns_none() {
        let registry = ServiceRegistry::new();
        assert!(registry.get::<u32>("missing").is_none());
    }
}
