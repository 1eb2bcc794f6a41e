use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use logamizer_core::{ErrorEvent, ErrorOccurrence};
use regex::Regex;
use sha2::{Digest, Sha256};

// Canonicalization strips everything that varies between occurrences of the
// same underlying error. Kept pure so fingerprints can be recomputed offline.
static RE_ISO_TS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}:\d{2}(\.\d+)?(z|[+-]\d{2}:?\d{2})?").unwrap()
});
static RE_CLF_TS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{2}/[a-z]{3}/\d{4}:\d{2}:\d{2}:\d{2}( [+-]\d{4})?").unwrap());
static RE_SLASH_TS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}").unwrap());
static RE_DQUOTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""[^"]*""#).unwrap());
static RE_SQUOTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"'[^']*'").unwrap());
static RE_ABS_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(/[\w.-]+){2,}/([\w.-]+)").unwrap());
static RE_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Canonical form of an error message: lowercase, timestamps stripped,
/// quoted strings collapsed to `"S"`, absolute paths reduced to basenames,
/// digit runs collapsed to `N`.
pub fn canonicalize_message(message: &str) -> String {
    let lower = message.to_lowercase();
    let s = RE_ISO_TS.replace_all(&lower, "");
    let s = RE_CLF_TS.replace_all(&s, "");
    let s = RE_SLASH_TS.replace_all(&s, "");
    let s = RE_DQUOTE.replace_all(&s, "\"S\"");
    let s = RE_SQUOTE.replace_all(&s, "\"S\"");
    let s = RE_ABS_PATH.replace_all(&s, "$2");
    let s = RE_DIGITS.replace_all(&s, "N");
    s.trim().to_string()
}

/// Error-group fingerprint: first 16 bytes of SHA-256 over
/// `(error_type, canonical_message, file_basename, function_name)`, nulls as
/// empty strings, hex encoded.
pub fn error_fingerprint(
    error_type: &str,
    canonical_message: &str,
    file_basename: Option<&str>,
    function_name: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(error_type.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_message.as_bytes());
    hasher.update(b"|");
    hasher.update(file_basename.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(function_name.unwrap_or("").as_bytes());
    let digest = hasher.finalize();
    crate::hex_string(&digest[..16])
}

/// Per-run accumulation for one error group; applied to the store as a
/// single atomic upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupDelta {
    pub fingerprint: String,
    pub error_type: String,
    /// Canonical message of the first occurrence in this run.
    pub error_message: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrences: u64,
}

/// Folds parsed error events into group deltas plus their occurrence rows.
pub struct ErrorGrouper {
    site_id: String,
    log_file_id: String,
    groups: HashMap<String, GroupDelta>,
    order: Vec<String>,
    occurrences: Vec<ErrorOccurrence>,
}

impl ErrorGrouper {
    pub fn new(site_id: impl Into<String>, log_file_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            log_file_id: log_file_id.into(),
            groups: HashMap::new(),
            order: Vec::new(),
            occurrences: Vec::new(),
        }
    }

    pub fn observe(&mut self, event: &ErrorEvent) {
        let canonical = canonicalize_message(&event.message);
        let fingerprint = error_fingerprint(
            &event.error_type,
            &canonical,
            event.file_basename(),
            event.function_name.as_deref(),
        );

        match self.groups.get_mut(&fingerprint) {
            Some(delta) => {
                delta.occurrences += 1;
                if event.timestamp < delta.first_seen {
                    delta.first_seen = event.timestamp;
                }
                if event.timestamp > delta.last_seen {
                    delta.last_seen = event.timestamp;
                }
            }
            None => {
                self.groups.insert(
                    fingerprint.clone(),
                    GroupDelta {
                        fingerprint: fingerprint.clone(),
                        error_type: event.error_type.clone(),
                        error_message: canonical,
                        first_seen: event.timestamp,
                        last_seen: event.timestamp,
                        occurrences: 1,
                    },
                );
                self.order.push(fingerprint.clone());
            }
        }

        self.occurrences.push(ErrorOccurrence {
            site_id: self.site_id.clone(),
            group_fingerprint: fingerprint,
            log_file_id: self.log_file_id.clone(),
            timestamp: event.timestamp,
            error_type: event.error_type.clone(),
            message: event.message.clone(),
            stack_trace: event.stack_trace.clone(),
            file_path: event.file_path.clone(),
            file_line: event.file_line,
            function_name: event.function_name.clone(),
            request_url: event.request_url.clone(),
            request_method: event.request_method.clone(),
            ip: event.ip.clone(),
            user_agent: event.user_agent.clone(),
            context: event.context.clone(),
        })
    }

    pub fn events_seen(&self) -> u64 {
        self.occurrences.len() as u64
    }

    /// Deltas in first-seen order plus the occurrence rows, consuming the
    /// grouper.
    pub fn into_parts(mut self) -> (Vec<GroupDelta>, Vec<ErrorOccurrence>) {
        let deltas = self
            .order
            .iter()
            .filter_map(|fp| self.groups.remove(fp))
            .collect();
        (deltas, self.occurrences)
    }
}
