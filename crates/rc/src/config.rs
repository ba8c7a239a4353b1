//! Remote config files and the products they belong to.

use std::fmt;

use data_encoding::BASE64;
use serde_json::Value;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Product {
    AsmFeatures,
    Asm,
    AsmData,
    AsmDd,
    /// A well-formed product name this helper has no aggregator for.
    Other(String),
    /// The rc path does not follow a known layout.
    Unknown,
}

impl Product {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "ASM_FEATURES" => Self::AsmFeatures,
            "ASM" => Self::Asm,
            "ASM_DATA" => Self::AsmData,
            "ASM_DD" => Self::AsmDd,
            other => Self::Other(other.to_string()),
        }
    }

    /// Product named by an rc path.
    ///
    /// Paths look like `datadog/<org>/<PRODUCT>/<id>/<name>` or
    /// `employee/<PRODUCT>/<id>/<name>`.
    #[must_use]
    pub fn from_rc_path(path: &str) -> Self {
        let name = if let Some(rest) = path.strip_prefix("datadog/") {
            rest.split_once('/')
                .and_then(|(_, rest)| rest.split_once('/'))
                .map(|(product, _)| product)
        } else if let Some(rest) = path.strip_prefix("employee/") {
            rest.split_once('/').map(|(product, _)| product)
        } else {
            None
        };

        match name {
            Some(name) if !name.is_empty() => Self::from_name(name),
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::AsmFeatures => "ASM_FEATURES",
            Self::Asm => "ASM",
            Self::AsmData => "ASM_DATA",
            Self::AsmDd => "ASM_DD",
            Self::Other(name) => name,
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One version of one remote config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub product: Product,
    pub path: String,
    pub contents: Vec<u8>,
}

impl Config {
    #[must_use]
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        let path = path.into();
        Self {
            product: Product::from_rc_path(&path),
            path,
            contents: contents.into(),
        }
    }

    /// Decode the contents as a JSON document.
    ///
    /// Contents not starting with `{` are treated as standard base64.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidContents`] if decoding or parsing fails.
    pub fn read(&self) -> Result<Value, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidContents {
            path: self.path.clone(),
            reason,
        };

        let raw = self.contents.trim_ascii();
        let decoded;
        let json = if raw.first() == Some(&b'{') {
            raw
        } else {
            decoded = BASE64
                .decode(raw)
                .map_err(|e| invalid(format!("base64: {e}")))?;
            &decoded[..]
        };

        serde_json::from_slice(json).map_err(|e| invalid(e.to_string()))
    }

    /// Decoded contents, which must be a JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error if the contents are not a JSON object.
    pub fn read_object(&self) -> Result<serde_json::Map<String, Value>, ConfigError> {
        match self.read()? {
            Value::Object(map) => Ok(map),
            _ => Err(ConfigError::InvalidContents {
                path: self.path.clone(),
                reason: "top level is not an object".into(),
            }),
        }
    }
}
