use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

use filewire_core::{Error, Result, Timeout};

/// Settings for a [`ResourceClient`](crate::ResourceClient).
///
/// Every field has a default, so a config file only lists what it changes:
///
/// ```json
/// {
///   "base_address": "file:///srv/data/",
///   "timeout": { "millis": 5000 },
///   "default_headers": { "user-agent": "filewire" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relative addresses are resolved against this.
    pub base_address: Option<Url>,
    pub timeout: Timeout,
    /// Read buffer for downloads, in bytes.
    pub buffer_size: usize,
    /// Write granularity for uploads, in bytes. One progress event per chunk.
    pub upload_chunk_size: usize,
    pub request_workers: usize,
    pub operation_workers: usize,
    pub default_headers: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_address: None,
            timeout: Timeout::DEFAULT,
            buffer_size: 32 * 1024,
            upload_chunk_size: 4096,
            request_workers: 4,
            operation_workers: 2,
            default_headers: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("buffer_size", self.buffer_size),
            ("upload_chunk_size", self.upload_chunk_size),
            ("request_workers", self.request_workers),
            ("operation_workers", self.operation_workers),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config {
                    message: format!("{} must be greater than zero", name),
                });
            }
        }
        self.header_map().map(|_| ())
    }

    /// `default_headers` as a header map.
    pub fn header_map(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.default_headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_object_gives_defaults() {
        let config = ClientConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.timeout, Timeout::Millis(100_000));
        assert_eq!(config.buffer_size, 32 * 1024);
    }

    #[test]
    fn fields_override_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{
                "base_address": "file:///srv/data/",
                "timeout": "infinite",
                "upload_chunk_size": 16,
                "default_headers": { "X-Client": "filewire" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.base_address.as_ref().unwrap().as_str(), "file:///srv/data/");
        assert_eq!(config.timeout, Timeout::Infinite);
        assert_eq!(config.upload_chunk_size, 16);
        assert_eq!(config.header_map().unwrap()["x-client"], "filewire");
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let err = ClientConfig::from_json_str(r#"{ "buffer_size": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn bad_header_is_rejected() {
        let err =
            ClientConfig::from_json_str(r#"{ "default_headers": { "bad name": "x" } }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidHeader { .. }));
    }

    #[test]
    fn malformed_json_is_config_error() {
        assert!(matches!(
            ClientConfig::from_json_str("{ not json"),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "operation_workers": 3 }}"#).unwrap();
        let config = ClientConfig::from_path(file.path()).unwrap();
        assert_eq!(config.operation_workers, 3);
    }
}
