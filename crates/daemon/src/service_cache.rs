//! Shares one [`Service`] between every connection declaring the same
//! settings triple.
//!
//! Entries hold weak references; the cache itself keeps only the most
//! recently built service alive so a client reconnecting right away does not
//! rebuild its engine.

use std::collections::HashMap;
use std::collections::hash_map::{DefaultHasher, Entry};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, error, info};
use warden_core::{EngineError, EngineFactory};

use crate::service::{Service, ServiceSettings};

/// Settings triple with its hash computed once.
#[derive(Debug, Clone)]
struct CacheKey {
    settings: ServiceSettings,
    hash: u64,
}

impl CacheKey {
    fn new(settings: ServiceSettings) -> Self {
        let mut hasher = DefaultHasher::new();
        settings.hash(&mut hasher);
        Self {
            hash: hasher.finish(),
            settings,
        }
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.settings == other.settings
    }
}

impl Eq for CacheKey {}

#[derive(Default)]
struct Entries {
    services: HashMap<CacheKey, Weak<Service>>,
    last_service: Option<Arc<Service>>,
}

pub struct ServiceCache {
    factory: Arc<dyn EngineFactory>,
    entries: Mutex<Entries>,
}

impl ServiceCache {
    #[must_use]
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            entries: Mutex::new(Entries::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the live service for `settings`, building it if needed.
    ///
    /// Construction happens under the cache lock, so concurrent callers with
    /// the same settings never build twice.
    ///
    /// # Errors
    ///
    /// Returns the engine error if a new service cannot be built; no entry
    /// is left behind.
    pub fn get_or_create(&self, settings: ServiceSettings) -> Result<Arc<Service>, EngineError> {
        let key = CacheKey::new(settings);
        let mut entries = self.lock();

        if let Some(weak) = entries.services.get(&key) {
            if let Some(service) = weak.upgrade() {
                debug!(key = key.hash, "reusing service");
                return Ok(service);
            }
            entries.services.remove(&key);
        }

        let service = Arc::new(Service::new(key.settings.clone(), self.factory.as_ref())?);
        info!(
            key = key.hash,
            rules = key.settings.engine.rules_file_or_default(),
            "created service"
        );

        match entries.services.entry(key) {
            Entry::Occupied(occupied) => {
                error!(key = occupied.key().hash, "service cache key already present");
                std::process::abort();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::downgrade(&service));
            }
        }
        entries.last_service = Some(Arc::clone(&service));

        let before = entries.services.len();
        entries.services.retain(|_, weak| weak.strong_count() > 0);
        let swept = before - entries.services.len();
        if swept > 0 {
            debug!(swept, "dropped expired services");
        }

        Ok(service)
    }

    fn live_services(&self, filter: impl Fn(&Service) -> bool) -> Vec<Arc<Service>> {
        self.lock()
            .services
            .values()
            .filter_map(Weak::upgrade)
            .filter(|s| filter(s))
            .collect()
    }

    /// Run an update on every live service polling `path`.
    pub fn notify_of_rc_updates(&self, path: &Path) {
        let services = self.live_services(|s| {
            let rc = &s.settings().remote_config;
            rc.enabled && rc.path == path
        });
        debug!(path = %path.display(), services = services.len(), "remote config changed");
        for service in services {
            service.update();
        }
    }

    /// Poll remote config for every live service that uses it.
    pub fn poll_all(&self) {
        for service in self.live_services(Service::remote_config_enabled) {
            service.try_update();
        }
    }

    /// Entries in the table, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
