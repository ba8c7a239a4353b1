//! `ASM`: user-defined overrides, exclusions, actions and custom rules.
//!
//! Each section is an array; configs are concatenated in arrival order.

use serde_json::Value;
use warden_core::Ruleset;
use warden_core::engine::section;

use super::{Aggregator, expect_array};
use crate::config::Config;
use crate::error::ConfigError;

const SECTIONS: [&str; 4] = [
    section::RULES_OVERRIDE,
    section::EXCLUSIONS,
    section::ACTIONS,
    section::CUSTOM_RULES,
];

#[derive(Debug, Default)]
pub struct AsmAggregator {
    collected: [Vec<Value>; 4],
}

impl AsmAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Aggregator for AsmAggregator {
    fn init(&mut self) {
        for items in &mut self.collected {
            items.clear();
        }
    }

    fn add(&mut self, config: &Config) -> Result<(), ConfigError> {
        let doc = config.read_object()?;

        let mut found = Vec::with_capacity(SECTIONS.len());
        for key in SECTIONS {
            found.push(expect_array(&doc, key)?);
        }

        for (items, new) in self.collected.iter_mut().zip(found) {
            if let Some(new) = new {
                items.extend(new.iter().cloned());
            }
        }
        Ok(())
    }

    fn aggregate(&mut self, ruleset: &mut Ruleset) {
        for (key, items) in SECTIONS.iter().zip(&mut self.collected) {
            ruleset.insert(key, Value::Array(std::mem::take(items)));
        }
    }
}
