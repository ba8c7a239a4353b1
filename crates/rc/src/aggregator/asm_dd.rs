//! `ASM_DD`: a complete precompiled ruleset pushed by the backend.
//!
//! Only the ruleset's own sections are taken. Overrides, exclusions, actions
//! and custom rules belong to `ASM`, so whatever `ASM_DD` carries for those
//! is dropped rather than competing with it.

use serde_json::{Map, Value};
use tracing::debug;
use warden_core::Ruleset;
use warden_core::engine::section;

use super::{Aggregator, expect_array};
use crate::config::Config;
use crate::error::ConfigError;

const SECTIONS: [&str; 3] = [section::VERSION, section::METADATA, section::RULES];

/// Keeps the most recently added ruleset. With none left, the engine is told
/// to fall back to its baseline rules via `rules: null`.
#[derive(Debug, Default)]
pub struct AsmDdAggregator {
    latest: Option<Map<String, Value>>,
}

impl AsmDdAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Aggregator for AsmDdAggregator {
    fn init(&mut self) {
        self.latest = None;
    }

    fn add(&mut self, config: &Config) -> Result<(), ConfigError> {
        let doc = config.read_object()?;
        if expect_array(&doc, section::RULES)?.is_none() {
            return Err(ConfigError::MissingKey(section::RULES.to_string()));
        }
        debug!(path = %config.path, "accepted precompiled ruleset");
        self.latest = Some(doc);
        Ok(())
    }

    fn aggregate(&mut self, ruleset: &mut Ruleset) {
        match self.latest.take() {
            Some(mut doc) => {
                for key in SECTIONS {
                    if let Some(value) = doc.remove(key) {
                        ruleset.insert(key, value);
                    }
                }
            }
            None => ruleset.insert(section::RULES, Value::Null),
        }
    }
}
