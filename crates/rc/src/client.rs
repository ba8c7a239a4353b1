//! Remote-config client: polls a transport, diffs the config set and drives
//! listeners through one init/update/commit cycle per change.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, instrument, warn};
use warden_core::TelemetrySubmitter;

use crate::config::{Config, Product};
use crate::error::TransportError;
use crate::listener::Listener;
use crate::transport::{ConfigTransport, hash_content};

struct Applied {
    hash: u64,
    config: Config,
}

pub struct RemoteConfigClient {
    transport: Box<dyn ConfigTransport>,
    listeners: Vec<Box<dyn Listener>>,
    routes: HashMap<Product, usize>,
    applied: BTreeMap<String, Applied>,
    /// Last version of each path its listener accepted.
    last_good: HashMap<String, Config>,
}

impl RemoteConfigClient {
    #[must_use]
    pub fn new(transport: Box<dyn ConfigTransport>, listeners: Vec<Box<dyn Listener>>) -> Self {
        let mut routes = HashMap::new();
        for (idx, listener) in listeners.iter().enumerate() {
            for product in listener.products() {
                if routes.insert(product.clone(), idx).is_some() {
                    warn!(%product, "product claimed by more than one listener, last one wins");
                }
            }
        }
        Self {
            transport,
            listeners,
            routes,
            applied: BTreeMap::new(),
            last_good: HashMap::new(),
        }
    }

    /// Union of the capability bits of every listener.
    #[must_use]
    pub fn capabilities(&self) -> u64 {
        self.listeners
            .iter()
            .fold(0, |caps, l| caps | l.capabilities())
    }

    #[must_use]
    pub fn products(&self) -> BTreeSet<Product> {
        self.routes.keys().cloned().collect()
    }

    /// Poll once and apply whatever changed.
    ///
    /// Every product with a new, modified or vanished config gets all of its
    /// live configs re-delivered, so aggregators always see the full set.
    /// A config the listener rejects is replaced by the last version of the
    /// same path that it accepted, if any.
    /// Returns whether anything was committed.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails; nothing is applied.
    #[instrument(skip_all)]
    pub fn poll_and_apply(
        &mut self,
        telemetry: &mut dyn TelemetrySubmitter,
    ) -> Result<bool, TransportError> {
        let Some(configs) = self.transport.poll()? else {
            return Ok(false);
        };

        let mut current = BTreeMap::new();
        for config in configs {
            if config.product == Product::Unknown {
                warn!(path = %config.path, "skipping config with unrecognised path");
                continue;
            }
            let hash = hash_content(&config.contents);
            current.insert(config.path.clone(), Applied { hash, config });
        }

        let mut changed: BTreeSet<Product> = BTreeSet::new();
        for (path, entry) in &current {
            if self.applied.get(path).is_none_or(|old| old.hash != entry.hash) {
                changed.insert(entry.config.product.clone());
            }
        }
        let removed: Vec<&Config> = self
            .applied
            .iter()
            .filter(|(path, _)| !current.contains_key(*path))
            .map(|(_, old)| &old.config)
            .collect();
        changed.extend(removed.iter().map(|c| c.product.clone()));

        if changed.is_empty() {
            self.applied = current;
            return Ok(false);
        }
        debug!(?changed, removed = removed.len(), "applying remote config changes");

        for listener in &mut self.listeners {
            listener.init();
        }

        for product in &changed {
            let Some(&idx) = self.routes.get(product) else {
                warn!(%product, "no listener for product, ignoring");
                continue;
            };
            let listener = &mut self.listeners[idx];

            for entry in current.values().filter(|e| &e.config.product == product) {
                let path = &entry.config.path;
                match listener.on_update(&entry.config) {
                    Ok(()) => {
                        self.last_good.insert(path.clone(), entry.config.clone());
                    }
                    Err(e) => {
                        let previous = self.last_good.get(path);
                        warn!(
                            %path,
                            %e,
                            keeping_previous = previous.is_some(),
                            "rejected remote config"
                        );
                        if let Some(previous) = previous {
                            if let Err(e) = listener.on_update(previous) {
                                warn!(%path, %e, "previous remote config no longer applies");
                            }
                        }
                    }
                }
            }
            for config in removed.iter().filter(|c| &c.product == product) {
                if let Err(e) = listener.on_unapply(config) {
                    warn!(path = %config.path, %e, "failed to unapply remote config");
                }
            }
        }

        for listener in &mut self.listeners {
            listener.commit(telemetry);
        }

        self.last_good.retain(|path, _| current.contains_key(path));
        self.applied = current;
        Ok(true)
    }
}
