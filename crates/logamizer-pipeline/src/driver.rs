use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as TimeDelta, Utc};
use logamizer_config::LogamizerConfig;
use logamizer_core::{
    LogFile, LogFileKind, LogFileStatus, LogamizerError, ParseQuality, Site,
};
use logamizer_engine::aggregate::{FileSummary, HourlyAggregator};
use logamizer_engine::anomaly::AnomalyDetector;
use logamizer_engine::content_sha256;
use logamizer_engine::decoder::LineReader;
use logamizer_engine::filter::HiddenIpFilter;
use logamizer_engine::grouper::ErrorGrouper;
use logamizer_engine::parser::{track_line, AccessLogParser, ErrorLogParser};
use logamizer_engine::rules::{RuleEngine, RuleThresholds};
use logamizer_store::{AnalyticsStore, BlobStore, MetaStore, NullProgress, ProgressSink};
use tracing::{debug, info, warn};

/// How often the soft deadline is polled inside the event loop.
const DEADLINE_CHECK_EVERY: u64 = 100;

// ---------------------------------------------------------------------------
// Settings and reports
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DriverSettings {
    pub thresholds: RuleThresholds,
    /// Retry attempts for transient persistence failures.
    pub persist_retries: u32,
    /// Soft deadline per job; None disables cancellation.
    pub job_deadline: Option<Duration>,
    /// Events between progress reports.
    pub progress_interval: u64,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            thresholds: RuleThresholds::default(),
            persist_retries: 5,
            job_deadline: Some(Duration::from_secs(900)),
            progress_interval: 10_000,
        }
    }
}

impl DriverSettings {
    pub fn from_config(config: &LogamizerConfig) -> Self {
        let r = &config.rules;
        Self {
            thresholds: RuleThresholds {
                scanner_threshold: r.scanner_threshold,
                scanner_window_minutes: r.scanner_window_minutes,
                brute_force_threshold: r.brute_force_threshold,
                brute_force_window_minutes: r.brute_force_window_minutes,
                server_error_threshold: r.server_error_threshold,
                server_error_window_minutes: r.server_error_window_minutes,
                extra_auth_paths: r.extra_auth_paths.clone(),
                evidence_limit: config.pipeline.evidence_limit,
                ..RuleThresholds::default()
            },
            persist_retries: config.pipeline.persist_retries,
            job_deadline: match config.pipeline.job_deadline_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            progress_interval: config.pipeline.progress_interval.max(1),
        }
    }
}

/// Outcome of one access-log ingest.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestReport {
    pub job_id: String,
    pub log_file_id: String,
    pub quality: ParseQuality,
    pub summary: FileSummary,
    pub hours_flushed: usize,
    pub findings: usize,
    pub anomaly_signals: usize,
    /// True when identical content had already been ingested for the site.
    pub reused: bool,
}

/// Outcome of an error-log analysis.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorAnalysisReport {
    pub job_id: String,
    pub log_file_id: String,
    pub quality: ParseQuality,
    pub groups: usize,
    pub occurrences: usize,
    pub reused: bool,
}

/// Outcome of a reanalyze pass.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReanalyzeReport {
    pub files_processed: usize,
    pub hours_recomputed: usize,
    pub findings: usize,
    pub anomaly_signals: usize,
}

// ---------------------------------------------------------------------------
// Soft deadline
// ---------------------------------------------------------------------------

struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    fn start(limit: Option<Duration>) -> Self {
        Self {
            at: limit.map(|d| Instant::now() + d),
        }
    }

    fn exceeded(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Orchestrates pipeline runs: selects the parser from site settings,
/// streams events through filter, aggregator, rule engine and grouper,
/// runs the anomaly pass, and owns idempotency, retries, progress and
/// deadlines. At most one job is in flight per log file.
pub struct PipelineDriver {
    blobs: Arc<dyn BlobStore>,
    meta: Arc<dyn MetaStore>,
    analytics: Arc<dyn AnalyticsStore>,
    progress: Arc<dyn ProgressSink>,
    settings: DriverSettings,
    in_flight: Mutex<HashSet<String>>,
}

/// Removes the log file from the in-flight set when the job ends.
struct FlightGuard<'a> {
    driver: &'a PipelineDriver,
    log_file_id: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.driver
            .in_flight
            .lock()
            .unwrap()
            .remove(&self.log_file_id);
    }
}

impl PipelineDriver {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        meta: Arc<dyn MetaStore>,
        analytics: Arc<dyn AnalyticsStore>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            blobs,
            meta,
            analytics,
            progress: Arc::new(NullProgress),
            settings,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    fn acquire(&self, log_file_id: &str) -> Result<FlightGuard<'_>, LogamizerError> {
        let mut set = self.in_flight.lock().unwrap();
        if !set.insert(log_file_id.to_string()) {
            return Err(LogamizerError::JobInFlight(log_file_id.to_string()));
        }
        Ok(FlightGuard {
            driver: self,
            log_file_id: log_file_id.to_string(),
        })
    }

    /// Retry transient persistence failures with capped exponential backoff.
    async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T, LogamizerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LogamizerError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.settings.persist_retries => {
                    attempt += 1;
                    let backoff = Duration::from_millis(50u64 << attempt.min(5));
                    warn!(attempt, error = %e, "transient persistence error, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound operations
    // -----------------------------------------------------------------------

    /// Run the full pipeline for a log file. Running twice on the same
    /// `(site, sha256)` content yields the same persisted state.
    pub async fn run_ingest(&self, log_file_id: &str) -> Result<IngestReport, LogamizerError> {
        let _guard = self.acquire(log_file_id)?;
        let job_id = format!("job-ingest-{log_file_id}");
        let file = self.meta.log_file(log_file_id).await?;

        if let Some(report) = self.reuse_check(&job_id, &file).await? {
            return Ok(report);
        }

        let site = self.meta.site(&file.site_id).await?;
        self.set_status(&file.id, LogFileStatus::Processing, None).await?;
        info!(log_file = %file.id, site = %site.id, kind = ?file.kind, "pipeline run started");

        let result = match file.kind {
            LogFileKind::Access => self.ingest_access(&job_id, &file, &site).await,
            LogFileKind::Error => self
                .ingest_errors(&job_id, &file, &site)
                .await
                .map(|r| IngestReport {
                    job_id: r.job_id,
                    log_file_id: r.log_file_id,
                    quality: r.quality,
                    summary: FileSummary::default(),
                    hours_flushed: 0,
                    findings: 0,
                    anomaly_signals: 0,
                    reused: false,
                }),
        };

        match result {
            Ok(report) => {
                self.set_status(&file.id, LogFileStatus::Completed, None).await?;
                self.progress.report(&job_id, 100, "completed");
                Ok(report)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(log_file = %file.id, error = %reason, "pipeline run failed");
                self.set_status(&file.id, LogFileStatus::Failed, Some(reason.clone()))
                    .await?;
                self.progress.report(&job_id, 100, &format!("failed: {reason}"));
                Err(e)
            }
        }
    }

    /// Run only the error grouper over a log file.
    pub async fn analyze_errors(
        &self,
        log_file_id: &str,
    ) -> Result<ErrorAnalysisReport, LogamizerError> {
        let _guard = self.acquire(log_file_id)?;
        let job_id = format!("job-errors-{log_file_id}");
        let file = self.meta.log_file(log_file_id).await?;
        let site = self.meta.site(&file.site_id).await?;

        self.set_status(&file.id, LogFileStatus::Processing, None).await?;
        match self.ingest_errors(&job_id, &file, &site).await {
            Ok(report) => {
                self.set_status(&file.id, LogFileStatus::Completed, None).await?;
                self.progress.report(&job_id, 100, "completed");
                Ok(report)
            }
            Err(e) => {
                self.set_status(&file.id, LogFileStatus::Failed, Some(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    /// Recompute aggregates and findings for a site over a time window
    /// (whole history when `hour_range` is None). This is the exact path:
    /// the window is cleared and rebuilt from every completed access file,
    /// so `unique_ips` is recomputed from the union of all events.
    pub async fn reanalyze(
        &self,
        site_id: &str,
        hour_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<ReanalyzeReport, LogamizerError> {
        let site = self.meta.site(site_id).await?;
        let (from, to) = hour_range.unwrap_or((DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC));

        let analytics = self.analytics.clone();
        let site_key = site.id.clone();
        self.retry(|| {
            let analytics = analytics.clone();
            let site_key = site_key.clone();
            async move { analytics.clear_aggregates(&site_key, from, to).await }
        })
        .await?;
        self.retry(|| {
            let analytics = analytics.clone();
            let site_key = site_key.clone();
            async move { analytics.clear_findings(&site_key, from, to).await }
        })
        .await?;

        let parser = AccessLogParser::new(site.log_format);
        let filter = HiddenIpFilter::new(&site.hidden_ips);
        let mut aggregator = HourlyAggregator::new(&site.id);
        let mut findings_count = 0usize;
        let mut files_processed = 0usize;

        let files = self.meta.log_files_for_site(&site.id).await?;
        for file in files {
            if file.kind != LogFileKind::Access || file.status != LogFileStatus::Completed {
                continue;
            }
            let bytes = self.blobs.read(&file.storage_key).await?;
            let mut reader = LineReader::new(&file.filename, bytes)?;
            let mut quality = ParseQuality::default();
            let mut engine = RuleEngine::new(&site.id, &self.settings.thresholds);

            for (line_number, line) in reader.by_ref() {
                if let Some(event) = track_line(&parser, &mut quality, &line, line_number) {
                    if event.timestamp >= from && event.timestamp < to && filter.allows(&event) {
                        aggregator.observe(&event);
                        engine.step(&event);
                    }
                }
            }
            if let Some(failure) = reader.take_failure() {
                return Err(failure);
            }

            for finding in engine.finish() {
                self.retry(|| {
                    let analytics = self.analytics.clone();
                    let finding = finding.clone();
                    async move { analytics.upsert_finding(finding).await }
                })
                .await?;
                findings_count += 1;
            }
            files_processed += 1;
        }

        let fresh_hours = aggregator.hours();
        let rows = aggregator.flush();
        let hours_recomputed = rows.len();
        for row in rows {
            self.retry(|| {
                let analytics = self.analytics.clone();
                let row = row.clone();
                async move { analytics.merge_aggregate("reanalyze", row).await }
            })
            .await?;
        }

        let anomaly_signals = self.anomaly_pass(&site, &fresh_hours).await?;
        info!(site = %site.id, files_processed, hours_recomputed, "reanalyze finished");

        Ok(ReanalyzeReport {
            files_processed,
            hours_recomputed,
            findings: findings_count,
            anomaly_signals,
        })
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    /// Skip work when this file, or another file with identical content,
    /// already completed: re-uploads of identical bytes reuse derived data.
    async fn reuse_check(
        &self,
        job_id: &str,
        file: &LogFile,
    ) -> Result<Option<IngestReport>, LogamizerError> {
        let mut reusable: Option<String> = None;
        if file.status == LogFileStatus::Completed {
            reusable = Some(file.id.clone());
        } else if !file.sha256.is_empty() {
            if let Some(twin) = self.meta.find_log_file(&file.site_id, &file.sha256).await? {
                if twin.id != file.id && twin.status == LogFileStatus::Completed {
                    self.set_status(&file.id, LogFileStatus::Completed, None).await?;
                    reusable = Some(twin.id);
                }
            }
        }

        let Some(source_id) = reusable else {
            return Ok(None);
        };
        debug!(log_file = %file.id, source = %source_id, "reusing completed ingest");
        let quality = self.analytics.quality_for(&source_id).await?.unwrap_or_default();
        self.progress.report(job_id, 100, "already ingested");
        Ok(Some(IngestReport {
            job_id: job_id.to_string(),
            log_file_id: file.id.clone(),
            quality,
            summary: FileSummary::default(),
            hours_flushed: 0,
            findings: 0,
            anomaly_signals: 0,
            reused: true,
        }))
    }

    async fn ingest_access(
        &self,
        job_id: &str,
        file: &LogFile,
        site: &Site,
    ) -> Result<IngestReport, LogamizerError> {
        let bytes = self.blobs.read(&file.storage_key).await?;
        let content_sha = if file.sha256.is_empty() {
            content_sha256(&bytes)
        } else {
            file.sha256.clone()
        };
        let estimated_lines = (bytes.len() as u64 / 100).max(1);
        self.progress.report(job_id, 5, "decoding");

        let parser = AccessLogParser::new(site.log_format);
        let filter = HiddenIpFilter::new(&site.hidden_ips);
        let mut aggregator = HourlyAggregator::new(&site.id);
        let mut engine = RuleEngine::new(&site.id, &self.settings.thresholds);
        let mut quality = ParseQuality::default();
        let mut reader = LineReader::new(&file.filename, bytes)?;
        let deadline = Deadline::start(self.settings.job_deadline);
        let mut processed: u64 = 0;

        for (line_number, line) in reader.by_ref() {
            if let Some(event) = track_line(&parser, &mut quality, &line, line_number) {
                if filter.allows(&event) {
                    aggregator.observe(&event);
                    engine.step(&event);
                }
            }
            processed += 1;

            if processed % self.settings.progress_interval == 0 {
                let percent = (10 + processed * 60 / estimated_lines.max(processed)).min(70) as u8;
                let through = aggregator
                    .latest_hour()
                    .map(|h| h.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                self.progress.report(
                    job_id,
                    percent,
                    &format!("processed {processed} lines, through hour {through}"),
                );
            }
            if processed % DEADLINE_CHECK_EVERY == 0 && deadline.exceeded() {
                return self.cancel_access(job_id, &content_sha, aggregator).await;
            }
        }
        if let Some(failure) = reader.take_failure() {
            return Err(failure);
        }

        // Flush barrier: merge every bucket, commutative-additive per row.
        self.progress.report(job_id, 75, "flushing aggregates");
        let summary = aggregator.summary();
        let fresh_hours = aggregator.hours();
        let rows = aggregator.flush();
        let hours_flushed = rows.len();
        for row in rows {
            self.retry(|| {
                let analytics = self.analytics.clone();
                let sha = content_sha.clone();
                let row = row.clone();
                async move { analytics.merge_aggregate(&sha, row).await }
            })
            .await?;
        }

        self.progress.report(job_id, 85, "storing findings");
        let findings = engine.finish();
        let findings_count = findings.len();
        for finding in findings {
            self.retry(|| {
                let analytics = self.analytics.clone();
                let finding = finding.clone();
                async move { analytics.upsert_finding(finding).await }
            })
            .await?;
        }

        self.progress.report(job_id, 95, "scoring anomalies");
        let anomaly_signals = self.anomaly_pass(site, &fresh_hours).await?;

        self.retry(|| {
            let analytics = self.analytics.clone();
            let id = file.id.clone();
            let quality = quality.clone();
            async move { analytics.put_quality(&id, quality).await }
        })
        .await?;

        info!(
            log_file = %file.id,
            parsed = quality.parsed_lines,
            failed = quality.failed_lines,
            hours = hours_flushed,
            findings = findings_count,
            "ingest finished"
        );

        Ok(IngestReport {
            job_id: job_id.to_string(),
            log_file_id: file.id.clone(),
            quality,
            summary,
            hours_flushed,
            findings: findings_count,
            anomaly_signals,
            reused: false,
        })
    }

    /// Deadline hit: stop reading, flush only hours that are complete, and
    /// fail the job. Partial data stays; an idempotent re-run reconciles.
    async fn cancel_access(
        &self,
        job_id: &str,
        content_sha: &str,
        mut aggregator: HourlyAggregator,
    ) -> Result<IngestReport, LogamizerError> {
        warn!(job = job_id, "soft deadline exceeded, cancelling");
        if let Some(last) = aggregator.latest_hour() {
            for row in aggregator.flush_before(last) {
                self.retry(|| {
                    let analytics = self.analytics.clone();
                    let sha = content_sha.to_string();
                    let row = row.clone();
                    async move { analytics.merge_aggregate(&sha, row).await }
                })
                .await?;
            }
        }
        Err(LogamizerError::DeadlineExceeded)
    }

    async fn ingest_errors(
        &self,
        job_id: &str,
        file: &LogFile,
        site: &Site,
    ) -> Result<ErrorAnalysisReport, LogamizerError> {
        let bytes = self.blobs.read(&file.storage_key).await?;
        let content_sha = if file.sha256.is_empty() {
            content_sha256(&bytes)
        } else {
            file.sha256.clone()
        };
        self.progress.report(job_id, 5, "decoding");

        let parser = ErrorLogParser::new();
        let mut grouper = ErrorGrouper::new(&site.id, &file.id);
        let mut quality = ParseQuality::default();
        let mut reader = LineReader::new(&file.filename, bytes)?;
        let deadline = Deadline::start(self.settings.job_deadline);
        let mut processed: u64 = 0;

        for (line_number, line) in reader.by_ref() {
            if let Some(event) = track_line(&parser, &mut quality, &line, line_number) {
                grouper.observe(&event);
            }
            processed += 1;
            if processed % self.settings.progress_interval == 0 {
                self.progress
                    .report(job_id, 50, &format!("processed {processed} lines"));
            }
            if processed % DEADLINE_CHECK_EVERY == 0 && deadline.exceeded() {
                return Err(LogamizerError::DeadlineExceeded);
            }
        }
        if let Some(failure) = reader.take_failure() {
            return Err(failure);
        }

        let (deltas, occurrences) = grouper.into_parts();
        let groups = deltas.len();
        let occurrence_count = occurrences.len();

        self.progress.report(job_id, 70, "storing occurrences");
        self.retry(|| {
            let analytics = self.analytics.clone();
            let id = file.id.clone();
            let rows = occurrences.clone();
            async move { analytics.replace_occurrences(&id, rows).await }
        })
        .await?;

        self.progress.report(job_id, 85, "upserting error groups");
        for delta in deltas {
            self.retry(|| {
                let analytics = self.analytics.clone();
                let site_id = site.id.clone();
                let sha = content_sha.clone();
                let delta = delta.clone();
                async move { analytics.apply_error_group(&site_id, &sha, delta).await }
            })
            .await?;
        }

        self.retry(|| {
            let analytics = self.analytics.clone();
            let id = file.id.clone();
            let quality = quality.clone();
            async move { analytics.put_quality(&id, quality).await }
        })
        .await?;

        info!(log_file = %file.id, groups, occurrences = occurrence_count, "error analysis finished");

        Ok(ErrorAnalysisReport {
            job_id: job_id.to_string(),
            log_file_id: file.id.clone(),
            quality,
            groups,
            occurrences: occurrence_count,
            reused: false,
        })
    }

    /// Score freshly-touched hours against the rolling baseline and store
    /// the resulting signals through the finding channel.
    async fn anomaly_pass(
        &self,
        site: &Site,
        fresh_hours: &[DateTime<Utc>],
    ) -> Result<usize, LogamizerError> {
        let Some((&first, &last)) = fresh_hours.first().zip(fresh_hours.last()) else {
            return Ok(0);
        };
        let from = first - TimeDelta::days(site.anomaly.baseline_days as i64);
        let to = last + TimeDelta::hours(1);
        let aggregates = self.analytics.aggregates_in_range(&site.id, from, to).await?;

        let detector = AnomalyDetector::new(site.anomaly.clone());
        let signals = detector.detect(&site.id, &aggregates, fresh_hours);
        let count = signals.len();
        for signal in signals {
            self.retry(|| {
                let analytics = self.analytics.clone();
                let signal = signal.clone();
                async move { analytics.upsert_finding(signal).await }
            })
            .await?;
        }
        Ok(count)
    }

    async fn set_status(
        &self,
        log_file_id: &str,
        status: LogFileStatus,
        reason: Option<String>,
    ) -> Result<(), LogamizerError> {
        self.retry(|| {
            let meta = self.meta.clone();
            let id = log_file_id.to_string();
            let reason = reason.clone();
            async move { meta.set_log_file_status(&id, status, reason).await }
        })
        .await
    }
}
