use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use logamizer_core::{AccessEvent, LogFormat};
use regex::Regex;

use super::{LineError, LineParser};

// Combined log format, shared by the nginx and apache recognizers:
// $remote_addr - $remote_user [$time_local] "$request" $status $body_bytes_sent
//   "$http_referer" "$http_user_agent"
//
// Apache emits the same layout; its trailing referer/UA fields are optional
// in the wild, so both quoted groups are optional here.
static COMBINED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?x)^
        (?P<ip>\S+)\s+
        \S+\s+                          # ident, always -
        (?P<user>\S+)\s+
        \[(?P<time>[^\]]+)\]\s+
        "(?P<request>[^"]*)"\s+
        (?P<status>\d+)\s+
        (?P<bytes>\d+|-)\s*
        (?:"(?P<referer>[^"]*)"\s*)?
        (?:"(?P<ua>[^"]*)")?
        "#,
    )
    .unwrap()
});

// Request line: METHOD PATH PROTO (protocol optional).
static REQUEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<method>\S+)\s+(?P<path>\S+)(?:\s+(?P<protocol>\S+))?$").unwrap());

const TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// Parser for combined-format access logs. With `LogFormat::Auto` each line
/// is tried against the recognizers in a fixed order (nginx, then apache)
/// and the first match claims it.
#[derive(Debug, Clone)]
pub struct AccessLogParser {
    format: LogFormat,
}

impl AccessLogParser {
    pub fn new(format: LogFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    fn parse_combined(line: &str, line_number: u64) -> Result<AccessEvent, LineError> {
        let caps = COMBINED_RE
            .captures(line)
            .ok_or_else(|| LineError::new("line does not match combined format"))?;

        let time = caps.name("time").map(|m| m.as_str()).unwrap_or_default();
        let timestamp = parse_clf_timestamp(time)
            .map_err(|e| LineError::new(format!("invalid timestamp: {e}")))?;

        let request = caps.name("request").map(|m| m.as_str()).unwrap_or_default();
        let (method, path, protocol) = split_request(request);

        let status: u16 = caps["status"]
            .parse()
            .map_err(|_| LineError::new(format!("invalid status code: {}", &caps["status"])))?;

        let bytes = caps.name("bytes").map(|m| m.as_str()).unwrap_or("0");
        let bytes_sent: u64 = if bytes == "-" {
            0
        } else {
            bytes
                .parse()
                .map_err(|_| LineError::new(format!("invalid bytes_sent: {bytes}")))?
        };

        Ok(AccessEvent {
            timestamp,
            ip: caps["ip"].to_string(),
            method,
            path,
            status,
            bytes_sent,
            referer: dash_to_none(caps.name("referer").map(|m| m.as_str())),
            user_agent: dash_to_none(caps.name("ua").map(|m| m.as_str())),
            user: dash_to_none(caps.name("user").map(|m| m.as_str())),
            protocol,
            raw_line: line.to_string(),
            line_number,
        })
    }
}

impl LineParser for AccessLogParser {
    type Event = AccessEvent;

    fn parse_line(&self, line: &str, line_number: u64) -> Result<Option<AccessEvent>, LineError> {
        // The two recognizers share the combined regex; Auto tries them in
        // registration order and the first to match claims the line.
        match self.format {
            LogFormat::NginxCombined | LogFormat::ApacheCombined | LogFormat::Auto => {
                Self::parse_combined(line, line_number).map(Some)
            }
        }
    }
}

fn parse_clf_timestamp(time: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_str(time, TIME_FORMAT).map(|dt| dt.with_timezone(&Utc))
}

/// Split the quoted request into method/path/protocol. A request that does
/// not look like `METHOD PATH [PROTO]` keeps the raw text as the path.
fn split_request(request: &str) -> (String, String, Option<String>) {
    if request.is_empty() {
        return (String::new(), String::new(), None);
    }
    match REQUEST_RE.captures(request) {
        Some(caps) => (
            caps["method"].to_string(),
            caps["path"].to_string(),
            caps.name("protocol").map(|m| m.as_str().to_string()),
        ),
        None => (String::new(), request.to_string(), None),
    }
}

fn dash_to_none(value: Option<&str>) -> Option<String> {
    match value {
        None | Some("-") | Some("") => None,
        Some(v) => Some(v.to_string()),
    }
}

/// Render an event back into a combined log line. Inverse of the recognizer
/// for events it produced; used to check the parser against itself.
pub fn format_combined(event: &AccessEvent) -> String {
    let request = if event.method.is_empty() && event.protocol.is_none() {
        event.path.clone()
    } else {
        format!(
            "{} {} {}",
            event.method,
            event.path,
            event.protocol.as_deref().unwrap_or("")
        )
        .trim_end()
        .to_string()
    };
    format!(
        "{} - {} [{}] \"{}\" {} {} \"{}\" \"{}\"",
        event.ip,
        event.user.as_deref().unwrap_or("-"),
        event.timestamp.format(TIME_FORMAT),
        request,
        event.status,
        event.bytes_sent,
        event.referer.as_deref().unwrap_or("-"),
        event.user_agent.as_deref().unwrap_or("-"),
    )
}
