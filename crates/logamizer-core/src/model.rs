use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Sites
// ---------------------------------------------------------------------------

/// Supported access-log formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    NginxCombined,
    ApacheCombined,
    #[default]
    Auto,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NginxCombined => "nginx_combined",
            Self::ApacheCombined => "apache_combined",
            Self::Auto => "auto",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = crate::LogamizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nginx_combined" => Ok(Self::NginxCombined),
            "apache_combined" => Ok(Self::ApacheCombined),
            "auto" => Ok(Self::Auto),
            other => Err(crate::LogamizerError::UnknownFormat(other.to_string())),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning knobs for the anomaly detector, stored per site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyParams {
    /// Baseline window length in days (>= 1).
    pub baseline_days: u32,
    /// Minimum baseline hours before any signal is emitted (>= 1).
    pub min_baseline_hours: u32,
    /// z-score threshold (>= 0).
    pub z_threshold: f64,
    /// Minimum hourly count before a new path is reported (>= 1).
    pub new_path_min_count: u64,
}

impl Default for AnomalyParams {
    fn default() -> Self {
        Self {
            baseline_days: 7,
            min_baseline_hours: 24,
            z_threshold: 3.0,
            new_path_min_count: 10,
        }
    }
}

/// A site is the identity everything else hangs off: aggregates, findings,
/// error groups and log files all reference exactly one site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub domain: Option<String>,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub anomaly: AnomalyParams,
    /// IPs excluded from aggregation and rules, in configuration order.
    #[serde(default)]
    pub hidden_ips: Vec<String>,
}

impl Site {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            domain: None,
            log_format: LogFormat::Auto,
            anomaly: AnomalyParams::default(),
            hidden_ips: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Log files
// ---------------------------------------------------------------------------

/// Processing status of an uploaded log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFileStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for LogFileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What the file contains, which decides the stages it flows through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFileKind {
    #[default]
    Access,
    Error,
}

/// One ingestion unit. `(site_id, sha256)` is unique: re-uploading identical
/// bytes reuses the existing record and its derived data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFile {
    pub id: String,
    pub site_id: String,
    pub filename: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the file content.
    pub sha256: String,
    pub storage_key: String,
    pub kind: LogFileKind,
    pub status: LogFileStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Hourly aggregates
// ---------------------------------------------------------------------------

/// One `(key, count)` entry of a bounded top-K summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopEntry {
    pub key: String,
    pub count: u64,
}

impl TopEntry {
    pub fn new(key: impl Into<String>, count: u64) -> Self {
        Self {
            key: key.into(),
            count,
        }
    }
}

/// One row per `(site, hour_bucket)`; updates are commutative-additive so
/// concurrent ingests of the same bucket converge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyAggregate {
    pub site_id: String,
    /// Timestamp floored to the hour, UTC.
    pub hour_bucket: DateTime<Utc>,
    pub requests_count: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    /// Exact within a single run; additive upper bound across runs.
    pub unique_ips: u64,
    pub total_bytes: u64,
    pub top_paths: Vec<TopEntry>,
    pub top_ips: Vec<TopEntry>,
    pub top_user_agents: Vec<TopEntry>,
    pub top_status_codes: Vec<TopEntry>,
}

impl HourlyAggregate {
    pub fn empty(site_id: impl Into<String>, hour_bucket: DateTime<Utc>) -> Self {
        Self {
            site_id: site_id.into(),
            hour_bucket,
            requests_count: 0,
            status_2xx: 0,
            status_3xx: 0,
            status_4xx: 0,
            status_5xx: 0,
            unique_ips: 0,
            total_bytes: 0,
            top_paths: Vec::new(),
            top_ips: Vec::new(),
            top_user_agents: Vec::new(),
            top_status_codes: Vec::new(),
        }
    }

    /// Events whose status fell outside the 2xx..5xx classes.
    pub fn unclassified(&self) -> u64 {
        self.requests_count
            .saturating_sub(self.status_2xx + self.status_3xx + self.status_4xx + self.status_5xx)
    }
}

// ---------------------------------------------------------------------------
// Findings
// ---------------------------------------------------------------------------

/// Finding severity, ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw log line kept as evidence for a finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSample {
    pub line: u64,
    pub raw: String,
}

/// A security or anomaly finding. `fingerprint` identifies the finding across
/// runs so that re-ingesting the same file upserts instead of duplicating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub site_id: String,
    pub finding_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    /// The rule-specific canonical subject (an IP, a path, a UA, ...).
    pub subject: String,
    pub fingerprint: String,
    pub evidence: Vec<EvidenceSample>,
    pub suggested_action: Option<String>,
    pub match_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Error groups
// ---------------------------------------------------------------------------

/// User-controlled triage state of an error group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorGroupStatus {
    #[default]
    Unresolved,
    Resolved,
    Ignored,
}

/// Recurring errors deduplicated by fingerprint; `(site, fingerprint)` is
/// unique and counters only ever grow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorGroup {
    pub site_id: String,
    pub fingerprint: String,
    pub error_type: String,
    /// Canonical message of the first occurrence seen.
    pub error_message: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u64,
    pub status: ErrorGroupStatus,
}

/// One concrete error event, owned by the log file it was parsed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorOccurrence {
    pub site_id: String,
    pub group_fingerprint: String,
    pub log_file_id: String,
    pub timestamp: DateTime<Utc>,
    pub error_type: String,
    pub message: String,
    pub stack_trace: Option<String>,
    pub file_path: Option<String>,
    pub file_line: Option<u32>,
    pub function_name: Option<String>,
    pub request_url: Option<String>,
    pub request_method: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub context: std::collections::BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Parse quality
// ---------------------------------------------------------------------------

/// A failed line kept as a sample in the quality report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedLine {
    pub line: u64,
    pub raw: String,
    pub error: String,
}

/// Per-file parse quality report, persisted alongside the log file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseQuality {
    pub total_lines: u64,
    pub parsed_lines: u64,
    pub failed_lines: u64,
    pub empty_lines: u64,
    /// Up to 10 samples of lines that failed to parse.
    pub sample_errors: Vec<FailedLine>,
}

impl ParseQuality {
    pub const MAX_SAMPLES: usize = 10;

    /// parsed / (total - empty); 0.0 when nothing was parseable.
    pub fn success_rate(&self) -> f64 {
        let parseable = self.total_lines.saturating_sub(self.empty_lines);
        if parseable == 0 {
            return 0.0;
        }
        self.parsed_lines as f64 / parseable as f64
    }

    pub fn record_failure(&mut self, line: u64, raw: &str, error: impl Into<String>) {
        self.failed_lines += 1;
        if self.sample_errors.len() < Self::MAX_SAMPLES {
            self.sample_errors.push(FailedLine {
                line,
                raw: truncate_chars(raw, 200),
                error: error.into(),
            });
        }
    }

    /// JSON report in the persisted shape, success rate as a percentage.
    pub fn report(&self) -> serde_json::Value {
        serde_json::json!({
            "total_lines": self.total_lines,
            "parsed_lines": self.parsed_lines,
            "failed_lines": self.failed_lines,
            "empty_lines": self.empty_lines,
            "success_rate": (self.success_rate() * 10_000.0).round() / 100.0,
            "sample_errors": self.sample_errors,
        })
    }
}

/// Truncate to at most `max` bytes without splitting a UTF-8 character.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s[..cut].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_round_trip() {
        for fmt in [LogFormat::NginxCombined, LogFormat::ApacheCombined, LogFormat::Auto] {
            assert_eq!(fmt.as_str().parse::<LogFormat>().unwrap(), fmt);
        }
        assert!("common".parse::<LogFormat>().is_err());
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical < Severity::High);
        assert!(Severity::High < Severity::Medium);
        assert!(Severity::Low < Severity::Info);
    }

    #[test]
    fn unclassified_counts() {
        let mut row = HourlyAggregate::empty("site", Utc::now());
        row.requests_count = 10;
        row.status_2xx = 7;
        row.status_4xx = 2;
        assert_eq!(row.unclassified(), 1);
    }

    #[test]
    fn success_rate_ignores_empty_lines() {
        let q = ParseQuality {
            total_lines: 10,
            parsed_lines: 6,
            failed_lines: 2,
            empty_lines: 2,
            sample_errors: vec![],
        };
        assert!((q.success_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn success_rate_empty_file() {
        let q = ParseQuality::default();
        assert_eq!(q.success_rate(), 0.0);
    }

    #[test]
    fn failure_samples_are_bounded() {
        let mut q = ParseQuality::default();
        for i in 0..20 {
            q.record_failure(i, "garbage line", "no recognizer matched");
        }
        assert_eq!(q.failed_lines, 20);
        assert_eq!(q.sample_errors.len(), ParseQuality::MAX_SAMPLES);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("short", 200), "short");
        // 'é' is two bytes; cutting at 1 must not split it.
        assert_eq!(truncate_chars("éé", 1), "");
        assert_eq!(truncate_chars("éé", 2), "é");
        let long = "x".repeat(300);
        assert_eq!(truncate_chars(&long, 200).len(), 200);
    }
}
