use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Typed service registry handed to every plugin at initialization.
///
/// Services are indexed by interface identity. A string-keyed side table is
/// kept for callers that only know a service by name; it points at the same
/// `Arc`s.
#[derive(Clone, Default)]
pub struct PluginContext {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    by_type: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    by_name: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl PluginContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&self, service: Arc<T>) {
        if let Ok(mut guard) = self.inner.by_type.write() {
            guard.insert(TypeId::of::<T>(), service);
        }
    }

    pub fn insert_named<T: Send + Sync + 'static>(&self, name: &str, service: Arc<T>) {
        self.insert(Arc::clone(&service));
        if let Ok(mut guard) = self.inner.by_name.write() {
            guard.insert(name.to_string(), service);
        }
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let guard = self.inner.by_type.read().ok()?;
        let service = guard.get(&TypeId::of::<T>())?;
        Arc::clone(service).downcast::<T>().ok()
    }

    /// Compatibility lookup for callers that address services by name.
    pub fn get_named<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        let guard = self.inner.by_name.read().ok()?;
        let service = guard.get(name)?;
        Arc::clone(service).downcast::<T>().ok()
    }
}
