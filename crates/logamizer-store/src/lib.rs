//! Storage interfaces the pipeline consumes from downstream collaborators,
//! plus the in-memory reference implementation used by tests and the CLI.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logamizer_core::{
    ErrorGroup, ErrorOccurrence, Finding, HourlyAggregate, LogFile, LogFileStatus, LogamizerError,
    ParseQuality, Site,
};
use logamizer_engine::grouper::GroupDelta;

pub use memory::MemoryStore;

/// Read access to uploaded log file bytes. Timeouts and unreadable blobs
/// surface as decode errors on the job.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read(&self, storage_key: &str) -> Result<Vec<u8>, LogamizerError>;
}

/// Site settings and log file records.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn site(&self, site_id: &str) -> Result<Site, LogamizerError>;

    async fn log_file(&self, log_file_id: &str) -> Result<LogFile, LogamizerError>;

    async fn log_files_for_site(&self, site_id: &str) -> Result<Vec<LogFile>, LogamizerError>;

    /// Lookup by the `(site, sha256)` uniqueness key.
    async fn find_log_file(
        &self,
        site_id: &str,
        sha256: &str,
    ) -> Result<Option<LogFile>, LogamizerError>;

    async fn set_log_file_status(
        &self,
        log_file_id: &str,
        status: LogFileStatus,
        failure_reason: Option<String>,
    ) -> Result<(), LogamizerError>;
}

/// Derived analytics rows. All write operations are idempotent per content
/// hash: merging the same `(scope, sha256)` delta twice is a no-op, which is
/// what makes pipeline re-runs converge.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// Commutative-additive upsert of one hourly row. Counters add, top-K
    /// summaries merge by summed counts with lexicographic tie-break;
    /// `unique_ips` adds as an upper bound.
    async fn merge_aggregate(
        &self,
        content_sha: &str,
        delta: HourlyAggregate,
    ) -> Result<(), LogamizerError>;

    /// Rows of a site with `from <= hour_bucket < to`, ascending.
    async fn aggregates_in_range(
        &self,
        site_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HourlyAggregate>, LogamizerError>;

    /// Drop rows (and their merge ledger) in `from..to`; used by reanalyze
    /// before an exact recompute.
    async fn clear_aggregates(
        &self,
        site_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(), LogamizerError>;

    /// Insert-or-merge keyed on the finding fingerprint: evidence unions up
    /// to the bound, counts keep the maximum, the time span widens.
    async fn upsert_finding(&self, finding: Finding) -> Result<(), LogamizerError>;

    async fn findings_for_site(&self, site_id: &str) -> Result<Vec<Finding>, LogamizerError>;

    /// Drop findings whose first_seen falls in `from..to`.
    async fn clear_findings(
        &self,
        site_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(), LogamizerError>;

    /// Atomic upsert of one error group delta; `(site, fingerprint)` rows
    /// are created on first sight and only ever grow.
    async fn apply_error_group(
        &self,
        site_id: &str,
        content_sha: &str,
        delta: GroupDelta,
    ) -> Result<(), LogamizerError>;

    /// Replace the occurrence rows a log file owns.
    async fn replace_occurrences(
        &self,
        log_file_id: &str,
        rows: Vec<ErrorOccurrence>,
    ) -> Result<(), LogamizerError>;

    async fn error_groups_for_site(&self, site_id: &str) -> Result<Vec<ErrorGroup>, LogamizerError>;

    async fn occurrences_for_group(
        &self,
        site_id: &str,
        fingerprint: &str,
    ) -> Result<Vec<ErrorOccurrence>, LogamizerError>;

    async fn put_quality(
        &self,
        log_file_id: &str,
        quality: ParseQuality,
    ) -> Result<(), LogamizerError>;

    async fn quality_for(
        &self,
        log_file_id: &str,
    ) -> Result<Option<ParseQuality>, LogamizerError>;
}

/// Where job progress lands. Implementations must not block the caller.
pub trait ProgressSink: Send + Sync {
    fn report(&self, job_id: &str, percent: u8, message: &str);
}

/// Progress sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _job_id: &str, _percent: u8, _message: &str) {}
}

/// Trailing error activity per site, fed by the occurrence rows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorRateSummary {
    pub total_groups: u64,
    pub active_groups: u64,
    pub recent_occurrences: u64,
}
