//! Where remote configs come from.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};

use data_encoding::BASE64URL_NOPAD;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::TransportError;

pub trait ConfigTransport: Send {
    /// The full current set of configs, or `None` when nothing changed since
    /// the previous poll.
    ///
    /// # Errors
    ///
    /// Returns an error if the configs cannot be read; the next poll retries.
    fn poll(&mut self) -> Result<Option<Vec<Config>>, TransportError>;
}

pub(crate) fn hash_content(content: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// Reads configs listed in an index file.
///
/// The index starts with the runtime id on its own line; every following
/// line is `<file>:<limiter_idx>:<base64url(rc path)>`. Relative file names
/// resolve against the index's directory.
pub struct FileTransport {
    index: PathBuf,
    last_hash: Option<u64>,
    runtime_id: Option<String>,
}

impl FileTransport {
    #[must_use]
    pub fn new(index: impl Into<PathBuf>) -> Self {
        Self {
            index: index.into(),
            last_hash: None,
            runtime_id: None,
        }
    }

    #[must_use]
    pub fn runtime_id(&self) -> Option<&str> {
        self.runtime_id.as_deref()
    }

    fn resolve(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        match self.index.parent() {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn read_entry(&self, line_no: usize, line: &str) -> Result<Config, TransportError> {
        let malformed = |reason: &str| TransportError::MalformedIndex {
            line: line_no,
            reason: reason.to_string(),
        };

        let mut parts = line.splitn(3, ':');
        let (Some(file), Some(limiter), Some(encoded)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed("expected <file>:<limiter_idx>:<rc_path>"));
        };
        limiter
            .parse::<u32>()
            .map_err(|_| malformed("limiter index is not a number"))?;
        let rc_path = BASE64URL_NOPAD
            .decode(encoded.as_bytes())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| malformed("rc path is not base64url"))?;

        let file = self.resolve(file);
        let contents = std::fs::read(&file).map_err(|source| TransportError::Io {
            path: file.display().to_string(),
            source,
        })?;
        trace!(rc_path, file = %file.display(), len = contents.len(), "read config");
        Ok(Config::new(rc_path, contents))
    }
}

impl ConfigTransport for FileTransport {
    fn poll(&mut self) -> Result<Option<Vec<Config>>, TransportError> {
        let index = match std::fs::read(&self.index) {
            Ok(index) => index,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(TransportError::Io {
                    path: self.index.display().to_string(),
                    source,
                });
            }
        };

        let hash = hash_content(&index);
        if self.last_hash == Some(hash) {
            return Ok(None);
        }

        let text = String::from_utf8_lossy(&index);
        let mut lines = text.lines();
        let runtime_id = lines.next().unwrap_or_default().trim().to_string();

        let configs = lines
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| self.read_entry(i + 2, line.trim()))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            index = %self.index.display(),
            %runtime_id,
            configs = configs.len(),
            "config index changed"
        );
        self.runtime_id = Some(runtime_id);
        self.last_hash = Some(hash);
        Ok(Some(configs))
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::path::Path;

    use data_encoding::BASE64URL_NOPAD;

    /// Write config files and an index listing them. File names follow the
    /// contents, so changing a config also changes the index.
    pub fn write_index(dir: &Path, runtime_id: &str, configs: &[(&str, &str)]) {
        let mut index = format!("{runtime_id}\n");
        for (i, (rc_path, contents)) in configs.iter().enumerate() {
            let file = format!("cfg-{i}-{:x}", super::hash_content(contents.as_bytes()));
            std::fs::write(dir.join(&file), contents).unwrap();
            index.push_str(&format!(
                "{file}:0:{}\n",
                BASE64URL_NOPAD.encode(rc_path.as_bytes())
            ));
        }
        std::fs::write(dir.join("index"), index).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::write_index;
    use super::*;
    use crate::config::Product;

    #[test]
    fn missing_index_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = FileTransport::new(dir.path().join("index"));
        assert!(transport.poll().unwrap().is_none());
    }

    #[test]
    fn reads_listed_configs_once() {
        let dir = tempfile::tempdir().unwrap();
        write_index(
            dir.path(),
            "rt-1",
            &[
                ("datadog/2/ASM_FEATURES/a/config", r#"{"asm":{"enabled":true}}"#),
                ("employee/ASM_DD/b/config", r#"{"rules":[]}"#),
            ],
        );
        let mut transport = FileTransport::new(dir.path().join("index"));

        let configs = transport.poll().unwrap().unwrap();
        assert_eq!(transport.runtime_id(), Some("rt-1"));
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].product, Product::AsmFeatures);
        assert_eq!(configs[1].product, Product::AsmDd);
        assert_eq!(configs[1].contents, br#"{"rules":[]}"#);

        assert!(transport.poll().unwrap().is_none());
    }

    #[test]
    fn index_change_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        write_index(dir.path(), "rt-1", &[("datadog/2/ASM/a/config", "{}")]);
        let mut transport = FileTransport::new(dir.path().join("index"));
        assert_eq!(transport.poll().unwrap().unwrap().len(), 1);

        write_index(dir.path(), "rt-1", &[]);
        assert!(transport.poll().unwrap().unwrap().is_empty());
    }

    #[test]
    fn malformed_line_fails_the_poll_and_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index"), "rt-1\nnot-a-config-line\n").unwrap();
        let mut transport = FileTransport::new(dir.path().join("index"));

        assert!(matches!(
            transport.poll(),
            Err(TransportError::MalformedIndex { line: 2, .. })
        ));
        assert!(transport.poll().is_err());
    }

    #[test]
    fn missing_config_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let line = format!(
            "gone:0:{}",
            BASE64URL_NOPAD.encode(b"datadog/2/ASM/a/config")
        );
        std::fs::write(dir.path().join("index"), format!("rt-1\n{line}\n")).unwrap();
        let mut transport = FileTransport::new(dir.path().join("index"));
        assert!(matches!(transport.poll(), Err(TransportError::Io { .. })));
    }
}
