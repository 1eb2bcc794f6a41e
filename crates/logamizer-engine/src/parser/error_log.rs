use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use logamizer_core::ErrorEvent;
use regex::Regex;

use super::{LineError, LineParser};

// Apache error log, 2.4 style with optional module, pid/tid and client:
// [Fri Jan 23 17:36:10.123456 2026] [proxy:error] [pid 123:tid 456]
//   [client 192.0.2.1:51234] AH01114: failed to connect ..., referer: http://x
// 2.2 style ([Mon Jan 19 01:07:36 2026] [error] [client 1.2.3.4] msg) matches too.
static APACHE_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)^
        \[(?P<time>[A-Z][a-z]{2}\s+[A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2}(?:\.\d+)?\s+\d{4})\]\s+
        \[(?:(?P<module>[\w-]+):)?(?P<level>\w+)\]\s*
        (?:\[pid\s+(?P<pid>\d+)(?::tid\s+\d+)?\]\s*)?
        (?:\[client\s+(?P<client>[^\]]+)\]\s*)?
        (?P<message>.*)$",
    )
    .unwrap()
});

// Nginx error log:
// 2026/01/23 17:36:10 [error] 123#456: *789 open() "/x" failed, client: 1.2.3.4, ...
static NGINX_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)^
        (?P<time>\d{4}/\d{2}/\d{2}\s+\d{2}:\d{2}:\d{2})\s+
        \[(?P<level>\w+)\]\s+
        (?P<pid>\d+)\#\d+:\s+
        (?:\*\d+\s+)?
        (?P<message>.*)$",
    )
    .unwrap()
});

static MODSEC_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\[(?P<tag>id|msg|severity|uri|file) "(?P<value>[^"]*)"\]"#).unwrap());

static NGINX_CLIENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:, |^)client: (?P<ip>[^,\s]+)").unwrap());

static NGINX_REQUEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#", request: "(?P<method>\S+) (?P<url>\S+)(?: \S+)?""#).unwrap());

static REFERER_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r", referer: (?P<referer>\S+)$").unwrap());

static DENIED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"client denied by server configuration: (?P<target>.*)$").unwrap());

const APACHE_TIME_FORMATS: [&str; 2] = ["%a %b %d %H:%M:%S%.f %Y", "%a %b %d %H:%M:%S %Y"];
const NGINX_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// Parser for error logs: Apache-style error lines (including ModSecurity
/// audit records) and nginx-style error lines, tried in that order. Lines
/// claimed by neither recognizer count as failed without aborting the run.
#[derive(Debug, Clone, Default)]
pub struct ErrorLogParser;

impl ErrorLogParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_apache(line: &str, line_number: u64) -> Option<Result<ErrorEvent, LineError>> {
        let caps = APACHE_ERROR_RE.captures(line)?;

        let timestamp = match parse_apache_timestamp(&caps["time"]) {
            Ok(ts) => ts,
            Err(e) => return Some(Err(LineError::new(format!("invalid timestamp: {e}")))),
        };

        let mut message = caps.name("message").map(|m| m.as_str()).unwrap_or("").to_string();
        let referer = REFERER_SUFFIX_RE.captures(&message).map(|c| c["referer"].to_string());
        if let Some(cut) = REFERER_SUFFIX_RE.find(&message).map(|m| m.start()) {
            message.truncate(cut);
        }

        let (ip, _port) = split_client(caps.name("client").map(|m| m.as_str()));

        let mut event = if message.contains("ModSecurity:") {
            Self::parse_modsecurity(&message, timestamp)
        } else {
            let text = match DENIED_RE.captures(&message) {
                Some(denied) => format!("client denied by server configuration: {}", &denied["target"]),
                None => message.clone(),
            };
            ErrorEvent::new(timestamp, "ApacheError", text)
        };

        event.level = caps.name("level").map(|m| m.as_str().to_string());
        event.module = caps.name("module").map(|m| m.as_str().to_string());
        event.pid = caps.name("pid").and_then(|m| m.as_str().parse().ok());
        event.ip = ip;
        event.referer = referer;
        event.raw_line = line.to_string();
        event.line_number = line_number;
        Some(Ok(event))
    }

    /// ModSecurity audit record embedded in an apache error message: pull the
    /// rule id, severity, attack message and target URI out of the tag soup.
    fn parse_modsecurity(message: &str, timestamp: DateTime<Utc>) -> ErrorEvent {
        let mut msg = None;
        let mut uri = None;
        let mut rule_id = None;
        let mut severity = None;
        let mut file = None;

        for caps in MODSEC_TAG_RE.captures_iter(message) {
            let value = caps["value"].to_string();
            match &caps["tag"] {
                "msg" => msg = Some(value),
                "uri" => uri = Some(value),
                "id" => rule_id = Some(value),
                "severity" => severity = Some(value),
                "file" => file = Some(value),
                _ => {}
            }
        }

        let mut event = ErrorEvent::new(
            timestamp,
            "ModSecurity",
            msg.unwrap_or_else(|| message.to_string()),
        );
        event.request_url = uri;
        if let Some(id) = rule_id {
            event.context.insert("rule_id".into(), id);
        }
        if let Some(sev) = severity {
            event.context.insert("severity".into(), sev);
        }
        if let Some(f) = file {
            event.context.insert("rule_file".into(), f);
        }
        event
    }

    fn parse_nginx(line: &str, line_number: u64) -> Option<Result<ErrorEvent, LineError>> {
        let caps = NGINX_ERROR_RE.captures(line)?;

        let timestamp = match NaiveDateTime::parse_from_str(&caps["time"], NGINX_TIME_FORMAT) {
            Ok(naive) => naive.and_utc(),
            Err(e) => return Some(Err(LineError::new(format!("invalid timestamp: {e}")))),
        };

        let message = caps.name("message").map(|m| m.as_str()).unwrap_or("");

        let mut event = ErrorEvent::new(timestamp, "NginxError", strip_nginx_context(message));
        event.level = caps.name("level").map(|m| m.as_str().to_string());
        event.pid = caps.name("pid").and_then(|m| m.as_str().parse().ok());
        event.ip = NGINX_CLIENT_RE.captures(message).map(|c| c["ip"].to_string());
        if let Some(req) = NGINX_REQUEST_RE.captures(message) {
            event.request_method = Some(req["method"].to_string());
            event.request_url = Some(req["url"].to_string());
        }
        event.referer = REFERER_SUFFIX_RE.captures(message).map(|c| c["referer"].to_string());
        event.raw_line = line.to_string();
        event.line_number = line_number;
        Some(Ok(event))
    }
}

impl LineParser for ErrorLogParser {
    type Event = ErrorEvent;

    fn parse_line(&self, line: &str, line_number: u64) -> Result<Option<ErrorEvent>, LineError> {
        if let Some(result) = Self::parse_apache(line, line_number) {
            return result.map(Some);
        }
        if let Some(result) = Self::parse_nginx(line, line_number) {
            return result.map(Some);
        }
        Err(LineError::new("no error-log recognizer matched"))
    }
}

/// Error-log timestamps carry no zone; they normalize to UTC as written.
fn parse_apache_timestamp(time: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let mut last_err = None;
    for fmt in APACHE_TIME_FORMATS {
        match NaiveDateTime::parse_from_str(time, fmt) {
            Ok(naive) => return Ok(naive.and_utc()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.expect("at least one format attempted"))
}

fn split_client(client: Option<&str>) -> (Option<String>, Option<u16>) {
    match client {
        None => (None, None),
        Some(c) => match c.rsplit_once(':') {
            Some((ip, port)) if port.chars().all(|ch| ch.is_ascii_digit()) => {
                (Some(ip.to_string()), port.parse().ok())
            }
            _ => (Some(c.to_string()), None),
        },
    }
}

/// Cut the trailing `, client: ..., server: ...` context off an nginx
/// message, keeping the free-form part.
fn strip_nginx_context(message: &str) -> String {
    for marker in [", client: ", ", server: "] {
        if let Some(pos) = message.find(marker) {
            return message[..pos].to_string();
        }
    }
    message.to_string()
}
