//! Inspection engine collaborator interface.
//!
//! The helper never matches rules itself: it hands request data to an
//! [`Engine`] through per-request [`EngineContext`]s and feeds merged remote
//! configuration in through [`Engine::update`].

pub mod basic;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::EngineError;
use crate::settings::EngineSettings;
use crate::telemetry::TelemetrySubmitter;

/// Top-level ruleset sections understood by engines.
pub mod section {
    pub const VERSION: &str = "version";
    pub const METADATA: &str = "metadata";
    pub const RULES: &str = "rules";
    pub const RULES_OVERRIDE: &str = "rules_override";
    pub const EXCLUSIONS: &str = "exclusions";
    pub const ACTIONS: &str = "actions";
    pub const CUSTOM_RULES: &str = "custom_rules";
    pub const RULES_DATA: &str = "rules_data";
}

/// Request address carrying per-context processing directives.
pub const CONTEXT_PROCESSOR: &str = "waf.context.processor";
/// Directive under [`CONTEXT_PROCESSOR`] asking for schema extraction.
pub const EXTRACT_SCHEMA: &str = "extract-schema";

/// Merged configuration document committed to an engine as one unit.
///
/// Sections present replace the engine's current ones; absent sections are
/// left untouched. A `null` section resets it to the engine's baseline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ruleset(Map<String, Value>);

impl Ruleset {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, section: &str, value: Value) {
        self.0.insert(section.to_string(), value);
    }

    #[must_use]
    pub fn get(&self, section: &str) -> Option<&Value> {
        self.0.get(section)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl From<Map<String, Value>> for Ruleset {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub rules_loaded: u32,
    pub rules_failed: u32,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Block,
    Redirect,
    StackTrace,
    Record,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub parameters: BTreeMap<String, String>,
}

impl Action {
    #[must_use]
    pub const fn record() -> Self {
        Self {
            kind: ActionKind::Record,
            parameters: BTreeMap::new(),
        }
    }
}

/// Outcome of one engine run that produced events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineResult {
    pub actions: Vec<Action>,
    pub triggers: Vec<Value>,
    pub force_keep: bool,
}

/// A configured inspection engine shared by many connections.
///
/// Implementations must tolerate concurrent independent contexts while
/// `update` swaps the ruleset underneath them.
pub trait Engine: Send + Sync {
    /// Apply a merged ruleset atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the ruleset is rejected; the previous ruleset
    /// stays in effect.
    fn update(&self, ruleset: &Ruleset) -> Result<UpdateOutcome, EngineError>;

    /// Per-request state bound to the current ruleset.
    fn new_context(&self) -> Box<dyn EngineContext>;

    fn rules_version(&self) -> Option<String> {
        None
    }
}

pub trait EngineContext: Send {
    /// Feed request data; returns `None` when nothing new matched.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not something the engine accepts.
    fn run(
        &mut self,
        data: &Value,
        rasp_rule: Option<&str>,
    ) -> Result<Option<EngineResult>, EngineError>;

    /// Report request-scoped metrics accumulated so far.
    fn metrics(&self, _submitter: &mut dyn TelemetrySubmitter) {}
}

/// Builds engines for declared settings.
pub trait EngineFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the rules cannot be loaded.
    fn build(&self, settings: &EngineSettings) -> Result<Arc<dyn Engine>, EngineError>;
}
