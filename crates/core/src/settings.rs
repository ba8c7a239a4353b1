//! Settings declared by a client in `client_init`.
//!
//! The three structs together form the settings triple that identifies a
//! shared service: two clients declaring equal triples share one engine.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

/// Inspection engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Rules file; `None` uses the engine's bundled baseline.
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub rules_file: Option<String>,
    /// Per-call engine budget in microseconds; `None` means unlimited.
    #[serde(default, deserialize_with = "zero_as_none")]
    pub timeout_us: Option<u64>,
    /// Traces kept per second when events are found (0 = unlimited).
    #[serde(default)]
    pub trace_rate_limit: u32,
    #[serde(default)]
    pub schema_extraction: SchemaExtractionSettings,
}

/// API security schema extraction, requested on `request_shutdown`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaExtractionSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Seconds before the same sampling key is extracted again; 0 extracts
    /// every request.
    #[serde(default = "default_sampling_period")]
    pub sampling_period: u32,
}

impl Default for SchemaExtractionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            sampling_period: default_sampling_period(),
        }
    }
}

const fn default_sampling_period() -> u32 {
    30
}

impl EngineSettings {
    /// Human readable rules source, used in logs and error messages.
    #[must_use]
    pub fn rules_file_or_default(&self) -> &str {
        self.rules_file.as_deref().unwrap_or("<bundled>")
    }
}

/// Remote configuration settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteConfigSettings {
    pub enabled: bool,
    /// Location of the remote-config index this service polls.
    #[serde(default)]
    pub path: PathBuf,
}

impl RemoteConfigSettings {
    /// Settings for a given `config_sync` path; an empty path disables RC.
    #[must_use]
    pub fn from_sync_path(path: &str) -> Self {
        if path.is_empty() {
            Self::default()
        } else {
            Self {
                enabled: true,
                path: PathBuf::from(path),
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub env_name: String,
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    Ok(opt.filter(|s| !s.is_empty()))
}

fn zero_as_none<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<u64> = Option::deserialize(deserializer)?;
    Ok(opt.filter(|v| *v != 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_strings_and_zero_become_none() {
        let settings: EngineSettings = serde_json::from_value(serde_json::json!({
            "rules_file": "",
            "timeout_us": 0,
            "trace_rate_limit": 100,
        }))
        .unwrap();
        assert_eq!(settings.rules_file, None);
        assert_eq!(settings.timeout_us, None);
        assert_eq!(settings.trace_rate_limit, 100);
    }

    #[test]
    fn schema_extraction_defaults_to_off() {
        let settings: EngineSettings = serde_json::from_value(serde_json::json!({
            "schema_extraction": {"enabled": true}
        }))
        .unwrap();
        assert!(settings.schema_extraction.enabled);
        assert_eq!(settings.schema_extraction.sampling_period, 30);
        assert!(!EngineSettings::default().schema_extraction.enabled);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let settings: EngineSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, EngineSettings::default());
        assert_eq!(settings.rules_file_or_default(), "<bundled>");
    }

    #[test]
    fn sync_path_toggles_remote_config() {
        assert!(!RemoteConfigSettings::from_sync_path("").enabled);
        let rc = RemoteConfigSettings::from_sync_path("/dev/shm/rc-index");
        assert!(rc.enabled);
        assert_eq!(rc.path, PathBuf::from("/dev/shm/rc-index"));
    }
}
