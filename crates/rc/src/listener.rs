//! Listeners route configs of the products they own into aggregators and
//! publish the merged result once per cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use warden_core::telemetry::{RULES_FAILED, RULES_LOADED, RULES_VERSION, WAF_UPDATES};
use warden_core::{Engine, Ruleset, Tags, TelemetrySubmitter};

use crate::aggregator::asm_features::{API_SECURITY, ASM, AUTO_USER_INSTRUM};
use crate::aggregator::{
    Aggregator, AsmAggregator, AsmDataAggregator, AsmDdAggregator, AsmFeaturesAggregator,
};
use crate::config::{Config, Product};
use crate::error::ConfigError;

/// Capability bits advertised to the remote-config backend.
pub mod capability {
    pub const ASM_ACTIVATION: u64 = 1 << 1;
    pub const ASM_IP_BLOCKING: u64 = 1 << 2;
    pub const ASM_DD_RULES: u64 = 1 << 3;
    pub const ASM_EXCLUSIONS: u64 = 1 << 4;
    pub const ASM_REQUEST_BLOCKING: u64 = 1 << 5;
    pub const ASM_USER_BLOCKING: u64 = 1 << 7;
    pub const ASM_CUSTOM_RULES: u64 = 1 << 8;
    pub const ASM_CUSTOM_BLOCKING_RESPONSE: u64 = 1 << 9;
    pub const ASM_API_SECURITY_SAMPLE_RATE: u64 = 1 << 11;
    pub const ASM_AUTO_USER_INSTRUM_MODE: u64 = 1 << 31;
}

pub trait Listener: Send {
    fn products(&self) -> Vec<Product>;

    fn capabilities(&self) -> u64;

    /// Start a cycle.
    fn init(&mut self);

    /// # Errors
    ///
    /// Returns an error if the config cannot be applied; only that config is
    /// lost.
    fn on_update(&mut self, config: &Config) -> Result<(), ConfigError>;

    /// # Errors
    ///
    /// Returns an error if the removal cannot be applied.
    fn on_unapply(&mut self, config: &Config) -> Result<(), ConfigError>;

    /// Publish everything accumulated since `init()`.
    fn commit(&mut self, telemetry: &mut dyn TelemetrySubmitter);
}

// ─── Engine listener ─────────────────────────────────────────────────────────

/// Feeds `ASM_DD`, `ASM` and `ASM_DATA` into the engine as one ruleset per
/// cycle.
pub struct EngineListener {
    engine: Arc<dyn Engine>,
    aggregators: BTreeMap<Product, Box<dyn Aggregator>>,
    dirty: BTreeSet<Product>,
}

impl EngineListener {
    #[must_use]
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        let mut aggregators: BTreeMap<Product, Box<dyn Aggregator>> = BTreeMap::new();
        aggregators.insert(Product::AsmDd, Box::new(AsmDdAggregator::new()));
        aggregators.insert(Product::Asm, Box::new(AsmAggregator::new()));
        aggregators.insert(Product::AsmData, Box::new(AsmDataAggregator::new()));
        Self {
            engine,
            aggregators,
            dirty: BTreeSet::new(),
        }
    }

    fn aggregator(&mut self, product: &Product) -> Result<&mut Box<dyn Aggregator>, ConfigError> {
        self.aggregators
            .get_mut(product)
            .ok_or_else(|| ConfigError::UnknownProduct(product.name().to_string()))
    }
}

impl Listener for EngineListener {
    fn products(&self) -> Vec<Product> {
        self.aggregators.keys().cloned().collect()
    }

    fn capabilities(&self) -> u64 {
        capability::ASM_IP_BLOCKING
            | capability::ASM_DD_RULES
            | capability::ASM_EXCLUSIONS
            | capability::ASM_REQUEST_BLOCKING
            | capability::ASM_USER_BLOCKING
            | capability::ASM_CUSTOM_RULES
            | capability::ASM_CUSTOM_BLOCKING_RESPONSE
    }

    fn init(&mut self) {
        self.dirty.clear();
        for agg in self.aggregators.values_mut() {
            agg.init();
        }
    }

    fn on_update(&mut self, config: &Config) -> Result<(), ConfigError> {
        let product = config.product.clone();
        // Marked dirty even on failure: the product's set of configs changed.
        self.dirty.insert(product.clone());
        self.aggregator(&product)?.add(config)
    }

    fn on_unapply(&mut self, config: &Config) -> Result<(), ConfigError> {
        let product = config.product.clone();
        self.dirty.insert(product.clone());
        self.aggregator(&product)?.remove(config)
    }

    #[instrument(skip_all, fields(products = self.dirty.len()))]
    fn commit(&mut self, telemetry: &mut dyn TelemetrySubmitter) {
        if self.dirty.is_empty() {
            return;
        }

        let mut ruleset = Ruleset::new();
        for product in std::mem::take(&mut self.dirty) {
            if let Some(agg) = self.aggregators.get_mut(&product) {
                agg.aggregate(&mut ruleset);
            }
        }

        let mut tags = Tags::new();
        match self.engine.update(&ruleset) {
            Ok(outcome) => {
                info!(
                    rules = outcome.rules_loaded,
                    failed = outcome.rules_failed,
                    version = ?outcome.version,
                    "engine ruleset updated"
                );
                let version = outcome.version.unwrap_or_default();
                tags.add("success", "true").add("event_rules_version", version.clone());
                telemetry.submit_span_metric(RULES_LOADED, f64::from(outcome.rules_loaded));
                telemetry.submit_span_metric(RULES_FAILED, f64::from(outcome.rules_failed));
                if !version.is_empty() {
                    telemetry.submit_span_meta(RULES_VERSION, version);
                }
            }
            Err(e) => {
                warn!(%e, "engine rejected ruleset, keeping previous rules");
                tags.add("success", "false");
            }
        }
        telemetry.submit_metric(WAF_UPDATES, 1.0, tags);
    }
}

// ─── Feature listener ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AsmStatus {
    #[default]
    Unknown,
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AutoUserInstrumMode {
    #[default]
    Undefined,
    Unknown,
    Disabled,
    Identification,
    Anonymization,
}

impl AutoUserInstrumMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Unknown => "unknown",
            Self::Disabled => "disabled",
            Self::Identification => "identification",
            Self::Anonymization => "anonymization",
        }
    }

    fn from_feature(value: Option<&Value>) -> Self {
        let Some(mode) = value.and_then(|v| v.get("mode")) else {
            return Self::Undefined;
        };
        match mode.as_str() {
            Some("identification" | "ident") => Self::Identification,
            Some("anonymization" | "anon") => Self::Anonymization,
            Some("disabled") => Self::Disabled,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeatureState {
    pub asm: AsmStatus,
    pub auto_user_instrum: AutoUserInstrumMode,
    /// `api_security.request_sample_rate`, when pushed.
    pub api_security_sample_rate: Option<f64>,
}

/// Handle to feature state shared between a listener and its readers.
pub type SharedFeatures = Arc<RwLock<FeatureState>>;

/// Applies `ASM_FEATURES` to a shared [`FeatureState`].
pub struct FeaturesListener {
    state: SharedFeatures,
    aggregator: AsmFeaturesAggregator,
    dirty: bool,
}

impl FeaturesListener {
    #[must_use]
    pub fn new(state: SharedFeatures) -> Self {
        Self {
            state,
            aggregator: AsmFeaturesAggregator::new(),
            dirty: false,
        }
    }
}

impl Listener for FeaturesListener {
    fn products(&self) -> Vec<Product> {
        vec![Product::AsmFeatures]
    }

    fn capabilities(&self) -> u64 {
        capability::ASM_ACTIVATION
            | capability::ASM_API_SECURITY_SAMPLE_RATE
            | capability::ASM_AUTO_USER_INSTRUM_MODE
    }

    fn init(&mut self) {
        self.dirty = false;
        self.aggregator.init();
    }

    fn on_update(&mut self, config: &Config) -> Result<(), ConfigError> {
        self.dirty = true;
        self.aggregator.add(config)
    }

    fn on_unapply(&mut self, config: &Config) -> Result<(), ConfigError> {
        self.dirty = true;
        self.aggregator.remove(config)
    }

    fn commit(&mut self, _telemetry: &mut dyn TelemetrySubmitter) {
        if !std::mem::take(&mut self.dirty) {
            return;
        }

        let mut doc = Ruleset::new();
        self.aggregator.aggregate(&mut doc);

        let enabled = doc
            .get(ASM)
            .and_then(|asm| asm.get("enabled"))
            .is_some_and(|e| e.as_bool() == Some(true) || e.as_str() == Some("true"));
        let next = FeatureState {
            asm: if enabled {
                AsmStatus::Enabled
            } else {
                AsmStatus::Disabled
            },
            auto_user_instrum: AutoUserInstrumMode::from_feature(doc.get(AUTO_USER_INSTRUM)),
            api_security_sample_rate: doc
                .get(API_SECURITY)
                .and_then(|api| api.get("request_sample_rate"))
                .and_then(Value::as_f64),
        };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!(?next, "feature state changed");
        }
        *state = next;
    }
}
