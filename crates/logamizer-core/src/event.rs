use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Status code class (2xx, 3xx, 4xx, 5xx).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatusClass {
    Success,
    Redirect,
    ClientError,
    ServerError,
    Other,
}

impl StatusClass {
    pub fn of(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            300..=399 => Self::Redirect,
            400..=499 => Self::ClientError,
            500..=599 => Self::ServerError,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "2xx",
            Self::Redirect => "3xx",
            Self::ClientError => "4xx",
            Self::ServerError => "5xx",
            Self::Other => "other",
        }
    }
}

/// Normalized access-log event. Produced by the parser, consumed by the
/// aggregator and rule engine, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessEvent {
    /// UTC, second precision.
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    /// 0 when the log recorded `-`.
    pub bytes_sent: u64,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub user: Option<String>,
    pub protocol: Option<String>,
    /// The line as it appeared in the file, kept verbatim for evidence.
    #[serde(skip)]
    pub raw_line: String,
    #[serde(skip)]
    pub line_number: u64,
}

impl AccessEvent {
    pub fn status_class(&self) -> StatusClass {
        StatusClass::of(self.status)
    }
}

/// Parsed error-log occurrence, input to the error grouper.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    pub timestamp: DateTime<Utc>,
    pub error_type: String,
    pub message: String,
    pub level: Option<String>,
    pub module: Option<String>,
    pub pid: Option<u32>,
    pub stack_trace: Option<String>,
    pub file_path: Option<String>,
    pub file_line: Option<u32>,
    pub function_name: Option<String>,
    pub request_url: Option<String>,
    pub request_method: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    /// Free-form key/value context (e.g. ModSecurity rule id and severity).
    pub context: BTreeMap<String, String>,
    #[serde(skip)]
    pub raw_line: String,
    #[serde(skip)]
    pub line_number: u64,
}

impl ErrorEvent {
    pub fn new(timestamp: DateTime<Utc>, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            error_type: error_type.into(),
            message: message.into(),
            level: None,
            module: None,
            pid: None,
            stack_trace: None,
            file_path: None,
            file_line: None,
            function_name: None,
            request_url: None,
            request_method: None,
            ip: None,
            user_agent: None,
            referer: None,
            context: BTreeMap::new(),
            raw_line: String::new(),
            line_number: 0,
        }
    }

    /// Basename of `file_path`, used for fingerprinting.
    pub fn file_basename(&self) -> Option<&str> {
        self.file_path
            .as_deref()
            .map(|p| p.rsplit('/').next().unwrap_or(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert_eq!(StatusClass::of(200), StatusClass::Success);
        assert_eq!(StatusClass::of(301), StatusClass::Redirect);
        assert_eq!(StatusClass::of(404), StatusClass::ClientError);
        assert_eq!(StatusClass::of(503), StatusClass::ServerError);
        assert_eq!(StatusClass::of(101), StatusClass::Other);
        assert_eq!(StatusClass::of(418).as_str(), "4xx");
    }

    #[test]
    fn file_basename_strips_directories() {
        let mut e = ErrorEvent::new(Utc::now(), "ApacheError", "boom");
        e.file_path = Some("/var/www/app/handlers/upload.php".into());
        assert_eq!(e.file_basename(), Some("upload.php"));

        e.file_path = Some("upload.php".into());
        assert_eq!(e.file_basename(), Some("upload.php"));

        e.file_path = None;
        assert_eq!(e.file_basename(), None);
    }
}
