//! `ASM_DATA`: expiring block lists keyed by data id.
//!
//! Entries merge by id (the first type seen wins) and then by value. A
//! value's expiration is the latest of its contributors, and permanent if
//! any contributor omits it.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};
use tracing::warn;
use warden_core::Ruleset;
use warden_core::engine::section;

use super::{Aggregator, expect_array, require, require_str};
use crate::config::Config;
use crate::error::{ConfigError, JsonKind};

const KNOWN_TYPES: [&str; 2] = ["ip_with_expiration", "data_with_expiration"];

/// `None` expiration means the entry never expires.
#[derive(Debug)]
struct DataSet {
    kind: String,
    values: BTreeMap<String, Option<u64>>,
}

#[derive(Debug)]
struct Entry {
    id: String,
    kind: String,
    data: Vec<(String, Option<u64>)>,
}

#[derive(Debug, Default)]
pub struct AsmDataAggregator {
    sets: BTreeMap<String, DataSet>,
}

impl AsmDataAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn parse_entry(value: &Value) -> Result<Entry, ConfigError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ConfigError::invalid_type("rules_data[]", JsonKind::Object))?;
    let id = require_str(obj, "id")?.to_string();
    let kind = require_str(obj, "type")?.to_string();
    let items = require(obj, "data")?
        .as_array()
        .ok_or_else(|| ConfigError::invalid_type("data", JsonKind::Array))?;

    let data = items
        .iter()
        .map(parse_data_item)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Entry { id, kind, data })
}

fn parse_data_item(value: &Value) -> Result<(String, Option<u64>), ConfigError> {
    let obj: &Map<String, Value> = value
        .as_object()
        .ok_or_else(|| ConfigError::invalid_type("data[]", JsonKind::Object))?;
    let item = require_str(obj, "value")?.to_string();
    let expiration = match obj.get("expiration") {
        None => None,
        Some(v) => Some(
            v.as_u64()
                .ok_or_else(|| ConfigError::invalid_type("expiration", JsonKind::Number))?,
        ),
    };
    Ok((item, expiration))
}

impl Aggregator for AsmDataAggregator {
    fn init(&mut self) {
        self.sets.clear();
    }

    fn add(&mut self, config: &Config) -> Result<(), ConfigError> {
        let doc = config.read_object()?;
        let rules_data = expect_array(&doc, section::RULES_DATA)?
            .ok_or_else(|| ConfigError::MissingKey(section::RULES_DATA.to_string()))?;

        let entries = rules_data
            .iter()
            .map(parse_entry)
            .collect::<Result<Vec<_>, _>>()?;

        for entry in entries {
            if !KNOWN_TYPES.contains(&entry.kind.as_str()) {
                warn!(id = %entry.id, kind = %entry.kind, "skipping unsupported rules data type");
                continue;
            }

            let set = self.sets.entry(entry.id).or_insert_with(|| DataSet {
                kind: entry.kind,
                values: BTreeMap::new(),
            });
            for (value, expiration) in entry.data {
                set.values
                    .entry(value)
                    .and_modify(|current| {
                        *current = match (*current, expiration) {
                            (Some(a), Some(b)) => Some(a.max(b)),
                            _ => None,
                        };
                    })
                    .or_insert(expiration);
            }
        }
        Ok(())
    }

    fn aggregate(&mut self, ruleset: &mut Ruleset) {
        let rules_data: Vec<Value> = std::mem::take(&mut self.sets)
            .into_iter()
            .filter(|(_, set)| !set.values.is_empty())
            .map(|(id, set)| {
                let data: Vec<Value> = set
                    .values
                    .into_iter()
                    .map(|(value, expiration)| match expiration {
                        Some(exp) => json!({"value": value, "expiration": exp}),
                        None => json!({"value": value}),
                    })
                    .collect();
                json!({"id": id, "type": set.kind, "data": data})
            })
            .collect();

        ruleset.insert(section::RULES_DATA, Value::Array(rules_data));
    }
}
