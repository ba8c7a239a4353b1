//! Per-product accumulators.
//!
//! An [`Aggregator`] absorbs the configs of one product between `init()`
//! and `aggregate()`. A config that fails validation is rejected whole:
//! nothing from it reaches the accumulator.

pub mod asm;
pub mod asm_data;
pub mod asm_dd;
pub mod asm_features;

use serde_json::{Map, Value};
use warden_core::Ruleset;

use crate::config::Config;
use crate::error::{ConfigError, JsonKind};

pub use asm::AsmAggregator;
pub use asm_data::AsmDataAggregator;
pub use asm_dd::AsmDdAggregator;
pub use asm_features::AsmFeaturesAggregator;

pub trait Aggregator: Send {
    /// Reset the per-cycle accumulator.
    fn init(&mut self);

    /// # Errors
    ///
    /// Returns an error if the config is malformed; the accumulator is left
    /// as it was before the call.
    fn add(&mut self, config: &Config) -> Result<(), ConfigError>;

    /// Account for a config that no longer exists.
    ///
    /// Every live config is re-delivered through `add()` each cycle, so most
    /// aggregators have nothing to undo here.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal cannot be applied.
    fn remove(&mut self, _config: &Config) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Merge the accumulated state into `ruleset`.
    fn aggregate(&mut self, ruleset: &mut Ruleset);
}

pub(crate) fn expect_array<'a>(
    doc: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Vec<Value>>, ConfigError> {
    match doc.get(key) {
        None => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(_) => Err(ConfigError::invalid_type(key, JsonKind::Array)),
    }
}

pub(crate) fn require<'a>(doc: &'a Map<String, Value>, key: &str) -> Result<&'a Value, ConfigError> {
    doc.get(key).ok_or_else(|| ConfigError::MissingKey(key.to_string()))
}

pub(crate) fn require_str<'a>(doc: &'a Map<String, Value>, key: &str) -> Result<&'a str, ConfigError> {
    require(doc, key)?
        .as_str()
        .ok_or_else(|| ConfigError::invalid_type(key, JsonKind::String))
}
