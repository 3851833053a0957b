use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Method token carried by a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    GET,
    HEAD,
    CONNECT,
    POST,
    PUT,
    DELETE,
    PATCH,
    OPTIONS,
}

impl Method {
    /// Whether a request with this method may carry a body.
    pub fn allows_body(self) -> bool {
        !matches!(self, Method::GET | Method::HEAD | Method::CONNECT)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::HEAD => "HEAD",
            Method::CONNECT => "CONNECT",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::PATCH => "PATCH",
            Method::OPTIONS => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    /// Method tokens compare case-insensitively.
    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let method = match token.to_ascii_uppercase().as_str() {
            "GET" => Method::GET,
            "HEAD" => Method::HEAD,
            "CONNECT" => Method::CONNECT,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "PATCH" => Method::PATCH,
            "OPTIONS" => Method::OPTIONS,
            "" => {
                return Err(Error::Config {
                    message: "method cannot be blank".to_string(),
                })
            }
            other => {
                return Err(Error::Config {
                    message: format!("unsupported method '{}'", other),
                })
            }
        };
        Ok(method)
    }
}

impl From<Method> for http::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::GET => http::Method::GET,
            Method::HEAD => http::Method::HEAD,
            Method::CONNECT => http::Method::CONNECT,
            Method::POST => http::Method::POST,
            Method::PUT => http::Method::PUT,
            Method::DELETE => http::Method::DELETE,
            Method::PATCH => http::Method::PATCH,
            Method::OPTIONS => http::Method::OPTIONS,
        }
    }
}

/// Desired access to the target resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Read only; no write stream may be opened.
    #[default]
    Read,
    /// Write stream creates or truncates the resource.
    Write,
    /// Write stream overwrites in place without truncating.
    ReadWrite,
}

impl AccessMode {
    pub fn allows_write(self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}

/// Per-request wait deadline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Timeout {
    Infinite,
    Millis(u64),
}

impl Timeout {
    pub const DEFAULT: Timeout = Timeout::Millis(100_000);

    /// `None` means wait forever.
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Timeout::Infinite => None,
            Timeout::Millis(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::DEFAULT
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Timeout::Millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}
