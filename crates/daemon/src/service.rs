//! A configured engine plus the remote-config client feeding it.

use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use warden_core::telemetry::{MetricsCollector, Tags, TelemetrySubmitter, WAF_INIT};
use warden_core::{
    Engine, EngineContext, EngineError, EngineFactory, EngineSettings, RemoteConfigSettings,
    TelemetrySettings,
};
use warden_rc::{
    EngineListener, FeatureState, FeaturesListener, FileTransport, RemoteConfigClient,
    SharedFeatures,
};

use crate::sampler::SchemaSampler;

/// The settings triple a service was built from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ServiceSettings {
    pub engine: EngineSettings,
    pub remote_config: RemoteConfigSettings,
    pub telemetry: TelemetrySettings,
}

// ─── Rate limiter ────────────────────────────────────────────────────────────

/// Fixed one-second window limiter; a limit of 0 lets everything through.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    start: Instant,
    count: u32,
}

impl RateLimiter {
    const WINDOW: Duration = Duration::from_secs(1);

    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            window: Mutex::new(Window {
                start: Instant::now(),
                count: 0,
            }),
        }
    }

    pub fn allow(&self) -> bool {
        if self.limit == 0 {
            return true;
        }
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if now.duration_since(window.start) >= Self::WINDOW {
            window.start = now;
            window.count = 0;
        }
        if window.count < self.limit {
            window.count += 1;
            true
        } else {
            false
        }
    }
}

// ─── Service ─────────────────────────────────────────────────────────────────

pub struct Service {
    engine: Arc<dyn Engine>,
    settings: ServiceSettings,
    rc_client: Option<Mutex<RemoteConfigClient>>,
    features: SharedFeatures,
    limiter: RateLimiter,
    /// `None` with extraction enabled means every request is extracted.
    schema_sampler: Option<SchemaSampler>,
    telemetry: Mutex<MetricsCollector>,
}

impl Service {
    /// Build the engine and, when remote config is enabled, apply whatever
    /// the transport already holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be built.
    #[instrument(skip_all, fields(rules = settings.engine.rules_file_or_default()))]
    pub fn new(settings: ServiceSettings, factory: &dyn EngineFactory) -> Result<Self, EngineError> {
        let mut telemetry = MetricsCollector::new();
        let built = factory.build(&settings.engine);

        let mut tags = Tags::new();
        tags.add("success", if built.is_ok() { "true" } else { "false" });
        telemetry.submit_metric(WAF_INIT, 1.0, tags);
        let engine = built?;

        let features: SharedFeatures = Arc::new(RwLock::new(FeatureState::default()));
        let rc_client = settings.remote_config.enabled.then(|| {
            let client = RemoteConfigClient::new(
                Box::new(FileTransport::new(&settings.remote_config.path)),
                vec![
                    Box::new(EngineListener::new(Arc::clone(&engine))),
                    Box::new(FeaturesListener::new(Arc::clone(&features))),
                ],
            );
            info!(
                path = %settings.remote_config.path.display(),
                capabilities = format_args!("{:#x}", client.capabilities()),
                "remote config enabled"
            );
            Mutex::new(client)
        });

        let extraction = &settings.engine.schema_extraction;
        let schema_sampler = (extraction.enabled && extraction.sampling_period > 0).then(|| {
            SchemaSampler::new(Duration::from_secs(u64::from(extraction.sampling_period)))
        });

        let service = Self {
            engine,
            limiter: RateLimiter::new(settings.engine.trace_rate_limit),
            schema_sampler,
            settings,
            rc_client,
            features,
            telemetry: Mutex::new(telemetry),
        };
        service.update();
        Ok(service)
    }

    #[must_use]
    pub const fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    #[must_use]
    pub fn new_context(&self) -> Box<dyn EngineContext> {
        self.engine.new_context()
    }

    #[must_use]
    pub fn rules_version(&self) -> Option<String> {
        self.engine.rules_version()
    }

    #[must_use]
    pub fn features(&self) -> FeatureState {
        *self.features.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn remote_config_enabled(&self) -> bool {
        self.rc_client.is_some()
    }

    /// Whether a trace with events may be force-kept.
    pub fn allow_force_keep(&self) -> bool {
        self.limiter.allow()
    }

    /// Whether the request identified by `key` should have its schema
    /// extracted. Key 0 means the client did not compute one. A remotely
    /// pushed sample rate of zero turns extraction off; any other rate leaves
    /// the decision to the per-key window.
    pub fn should_extract_schema(&self, key: u64) -> bool {
        if !self.settings.engine.schema_extraction.enabled || key == 0 {
            return false;
        }
        if self
            .features()
            .api_security_sample_rate
            .is_some_and(|rate| rate <= 0.0)
        {
            return false;
        }
        self.schema_sampler
            .as_ref()
            .is_none_or(|sampler| sampler.hit(key))
    }

    /// Poll remote config and apply changes, waiting for any update already
    /// in progress.
    pub fn update(&self) -> bool {
        let Some(rc) = &self.rc_client else {
            return false;
        };
        let mut client = rc.lock().unwrap_or_else(PoisonError::into_inner);
        self.poll(&mut client)
    }

    /// Like [`Service::update`] but skips when another thread is applying.
    pub fn try_update(&self) -> bool {
        let Some(rc) = &self.rc_client else {
            return false;
        };
        let mut client = match rc.try_lock() {
            Ok(client) => client,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!("remote config update already in progress");
                return false;
            }
        };
        self.poll(&mut client)
    }

    fn poll(&self, client: &mut RemoteConfigClient) -> bool {
        let mut telemetry = self.telemetry.lock().unwrap_or_else(PoisonError::into_inner);
        match client.poll_and_apply(&mut *telemetry) {
            Ok(applied) => applied,
            Err(e) => {
                warn!(%e, "remote config poll failed");
                false
            }
        }
    }

    /// Take everything reported since the last drain.
    pub fn drain_telemetry(&self) -> MetricsCollector {
        self.telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("settings", &self.settings)
            .field("remote_config", &self.rc_client.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::hash::{DefaultHasher, Hash, Hasher};
    use std::path::Path;

    use data_encoding::BASE64URL_NOPAD;

    /// Write a remote-config index listing `configs` under `dir`. File names
    /// follow the contents, so changing a config also changes the index.
    pub fn write_index(dir: &Path, configs: &[(&str, &str)]) -> std::path::PathBuf {
        let mut index = String::from("test-runtime\n");
        for (i, (rc_path, contents)) in configs.iter().enumerate() {
            let mut hasher = DefaultHasher::new();
            contents.hash(&mut hasher);
            let file = dir.join(format!("config-{i}-{:x}", hasher.finish()));
            std::fs::write(&file, contents).unwrap();
            index.push_str(&format!(
                "{}:0:{}\n",
                file.display(),
                BASE64URL_NOPAD.encode(rc_path.as_bytes())
            ));
        }
        let path = dir.join("index");
        std::fs::write(&path, index).unwrap();
        path
    }
}
