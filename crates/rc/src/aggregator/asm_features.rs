//! `ASM_FEATURES`: feature toggles, overwritten key by key.

use serde_json::{Map, Value};
use warden_core::Ruleset;

use super::Aggregator;
use crate::config::Config;
use crate::error::{ConfigError, JsonKind};

pub const ASM: &str = "asm";
pub const AUTO_USER_INSTRUM: &str = "auto_user_instrum";
pub const ATTACK_MODE: &str = "attack_mode";
pub const API_SECURITY: &str = "api_security";

const KEYS: [&str; 4] = [ASM, AUTO_USER_INSTRUM, ATTACK_MODE, API_SECURITY];

#[derive(Debug, Default)]
pub struct AsmFeaturesAggregator {
    features: Map<String, Value>,
}

impl AsmFeaturesAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Aggregator for AsmFeaturesAggregator {
    fn init(&mut self) {
        self.features.clear();
    }

    fn add(&mut self, config: &Config) -> Result<(), ConfigError> {
        let mut doc = config.read_object()?;

        for key in KEYS {
            if doc.get(key).is_some_and(|v| !v.is_object()) {
                return Err(ConfigError::invalid_type(key, JsonKind::Object));
            }
        }
        for key in KEYS {
            if let Some(value) = doc.remove(key) {
                self.features.insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    fn aggregate(&mut self, ruleset: &mut Ruleset) {
        for (key, value) in std::mem::take(&mut self.features) {
            ruleset.insert(&key, value);
        }
    }
}
