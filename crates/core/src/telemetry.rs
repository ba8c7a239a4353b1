//! Telemetry submission.
//!
//! Engines and services report metrics through [`TelemetrySubmitter`]; the
//! daemon drains a [`MetricsCollector`] into protocol responses.

use std::collections::BTreeMap;
use std::fmt;

pub const WAF_INIT: &str = "waf.init";
pub const WAF_UPDATES: &str = "waf.updates";
pub const WAF_REQUESTS: &str = "waf.requests";

pub const RULES_LOADED: &str = "warden.rules.loaded";
pub const RULES_FAILED: &str = "warden.rules.failed";
pub const RULES_VERSION: &str = "warden.rules.version";
pub const RULES_MATCHED: &str = "warden.rules.matched";
pub const WAF_TIMEOUTS: &str = "warden.waf.timeouts";

/// Span meta prefix for schemas extracted from request addresses.
pub const SCHEMA_PREFIX: &str = "_dd.appsec.s.";

/// Ordered `key:value` tag list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags(Vec<(String, String)>);

impl Tags {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn add(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.0.push((key.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}:{v}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub tags: Tags,
}

pub trait TelemetrySubmitter {
    /// Generic telemetry metric (counts, distributions).
    fn submit_metric(&mut self, name: &str, value: f64, tags: Tags);
    /// Numeric value attached to the request's trace.
    fn submit_span_metric(&mut self, name: &str, value: f64);
    /// String value attached to the request's trace.
    fn submit_span_meta(&mut self, name: &str, value: String);
}

/// Collects everything submitted to it until drained.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    metrics: Vec<Metric>,
    span_metrics: BTreeMap<String, f64>,
    span_meta: BTreeMap<String, String>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.span_metrics.is_empty() && self.span_meta.is_empty()
    }

    #[must_use]
    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    #[must_use]
    pub const fn span_metrics(&self) -> &BTreeMap<String, f64> {
        &self.span_metrics
    }

    #[must_use]
    pub const fn span_meta(&self) -> &BTreeMap<String, String> {
        &self.span_meta
    }

    /// Move everything out, leaving the collector empty.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Absorb `other`; span values from `other` win on key collisions.
    pub fn merge(&mut self, other: Self) {
        self.metrics.extend(other.metrics);
        self.span_metrics.extend(other.span_metrics);
        self.span_meta.extend(other.span_meta);
    }
}

impl TelemetrySubmitter for MetricsCollector {
    fn submit_metric(&mut self, name: &str, value: f64, tags: Tags) {
        tracing::trace!(name, value, %tags, "submit_metric");
        self.metrics.push(Metric {
            name: name.to_string(),
            value,
            tags,
        });
    }

    fn submit_span_metric(&mut self, name: &str, value: f64) {
        self.span_metrics.insert(name.to_string(), value);
    }

    fn submit_span_meta(&mut self, name: &str, value: String) {
        self.span_meta.insert(name.to_string(), value);
    }
}
