use std::fmt;

/// A remote config that could not be applied.
///
/// Raised per file: the aggregation cycle skips the offending config and
/// continues with the rest.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid contents in {path}: {reason}")]
    InvalidContents { path: String, reason: String },
    #[error("invalid type for {key}: expected {expected}")]
    InvalidType { key: String, expected: JsonKind },
    #[error("missing key {0}")]
    MissingKey(String),
    #[error("no aggregator for product {0}")]
    UnknownProduct(String),
}

impl ConfigError {
    pub(crate) fn invalid_type(key: &str, expected: JsonKind) -> Self {
        Self::InvalidType {
            key: key.to_string(),
            expected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    Object,
    Array,
    String,
    Number,
}

impl fmt::Display for JsonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Number => "number",
        };
        f.write_str(name)
    }
}

/// Failure to fetch configs; the whole poll is skipped and retried later.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config index line {line}: {reason}")]
    MalformedIndex { line: usize, reason: String },
}
