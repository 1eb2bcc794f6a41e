//! In-memory store backing tests and the CLI. Mirrors the semantics a
//! relational backend must provide: additive aggregate merges under a row
//! lock, fingerprint-keyed finding upserts, atomic error-group upserts, and
//! a per-content-hash ledger that makes every write idempotent.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logamizer_core::{
    ErrorGroup, ErrorGroupStatus, ErrorOccurrence, Finding, HourlyAggregate, LogFile,
    LogFileStatus, LogamizerError, ParseQuality, Site,
};
use logamizer_engine::grouper::GroupDelta;
use logamizer_engine::topk::merge_top_entries;

use crate::{AnalyticsStore, BlobStore, ErrorRateSummary, MetaStore};

const TOP_K: usize = 10;
const EVIDENCE_LIMIT: usize = 20;

struct AggregateSlot {
    row: HourlyAggregate,
    applied: HashSet<String>,
}

struct GroupSlot {
    row: ErrorGroup,
    applied: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    blobs: HashMap<String, Vec<u8>>,
    sites: HashMap<String, Site>,
    log_files: HashMap<String, LogFile>,
    aggregates: HashMap<(String, DateTime<Utc>), AggregateSlot>,
    findings: HashMap<String, Finding>,
    groups: HashMap<(String, String), GroupSlot>,
    occurrences: Vec<ErrorOccurrence>,
    quality: HashMap<String, ParseQuality>,
}

/// Thread-safe in-memory implementation of every collaborator interface.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_blob(&self, storage_key: impl Into<String>, bytes: Vec<u8>) {
        self.inner.lock().unwrap().blobs.insert(storage_key.into(), bytes);
    }

    pub fn put_site(&self, site: Site) {
        self.inner.lock().unwrap().sites.insert(site.id.clone(), site);
    }

    pub fn put_log_file(&self, log_file: LogFile) {
        self.inner
            .lock()
            .unwrap()
            .log_files
            .insert(log_file.id.clone(), log_file);
    }

    /// User-facing triage action on an error group.
    pub fn set_group_status(
        &self,
        site_id: &str,
        fingerprint: &str,
        status: ErrorGroupStatus,
    ) -> Result<(), LogamizerError> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .groups
            .get_mut(&(site_id.to_string(), fingerprint.to_string()))
            .ok_or_else(|| LogamizerError::permanent(format!("no error group {fingerprint}")))?;
        slot.row.status = status;
        Ok(())
    }

    /// Error activity for a site since `cutoff`.
    pub fn error_rate_summary(&self, site_id: &str, cutoff: DateTime<Utc>) -> ErrorRateSummary {
        let inner = self.inner.lock().unwrap();
        let total_groups = inner
            .groups
            .keys()
            .filter(|(site, _)| site == site_id)
            .count() as u64;
        let mut active: HashSet<&str> = HashSet::new();
        let mut recent = 0u64;
        for occ in &inner.occurrences {
            if occ.site_id == site_id && occ.timestamp >= cutoff {
                recent += 1;
                active.insert(occ.group_fingerprint.as_str());
            }
        }
        ErrorRateSummary {
            total_groups,
            active_groups: active.len() as u64,
            recent_occurrences: recent,
        }
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn read(&self, storage_key: &str) -> Result<Vec<u8>, LogamizerError> {
        self.inner
            .lock()
            .unwrap()
            .blobs
            .get(storage_key)
            .cloned()
            .ok_or_else(|| LogamizerError::Decode(format!("no blob at {storage_key}")))
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    async fn site(&self, site_id: &str) -> Result<Site, LogamizerError> {
        self.inner
            .lock()
            .unwrap()
            .sites
            .get(site_id)
            .cloned()
            .ok_or_else(|| LogamizerError::SiteNotFound(site_id.to_string()))
    }

    async fn log_file(&self, log_file_id: &str) -> Result<LogFile, LogamizerError> {
        self.inner
            .lock()
            .unwrap()
            .log_files
            .get(log_file_id)
            .cloned()
            .ok_or_else(|| LogamizerError::LogFileNotFound(log_file_id.to_string()))
    }

    async fn log_files_for_site(&self, site_id: &str) -> Result<Vec<LogFile>, LogamizerError> {
        let inner = self.inner.lock().unwrap();
        let mut files: Vec<LogFile> = inner
            .log_files
            .values()
            .filter(|f| f.site_id == site_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(files)
    }

    async fn find_log_file(
        &self,
        site_id: &str,
        sha256: &str,
    ) -> Result<Option<LogFile>, LogamizerError> {
        let inner = self.inner.lock().unwrap();
        let mut candidates: Vec<&LogFile> = inner
            .log_files
            .values()
            .filter(|f| f.site_id == site_id && f.sha256 == sha256)
            .collect();
        // Completed files first so content reuse finds the finished twin.
        candidates.sort_by(|a, b| {
            (a.status != LogFileStatus::Completed)
                .cmp(&(b.status != LogFileStatus::Completed))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(candidates.first().map(|f| (*f).clone()))
    }

    async fn set_log_file_status(
        &self,
        log_file_id: &str,
        status: LogFileStatus,
        failure_reason: Option<String>,
    ) -> Result<(), LogamizerError> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner
            .log_files
            .get_mut(log_file_id)
            .ok_or_else(|| LogamizerError::LogFileNotFound(log_file_id.to_string()))?;
        file.status = status;
        file.failure_reason = failure_reason;
        file.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl AnalyticsStore for MemoryStore {
    async fn merge_aggregate(
        &self,
        content_sha: &str,
        delta: HourlyAggregate,
    ) -> Result<(), LogamizerError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (delta.site_id.clone(), delta.hour_bucket);
        match inner.aggregates.get_mut(&key) {
            None => {
                let mut applied = HashSet::new();
                applied.insert(content_sha.to_string());
                inner.aggregates.insert(key, AggregateSlot { row: delta, applied });
            }
            Some(slot) => {
                // Same content already merged into this row: no-op, which is
                // what keeps re-runs idempotent.
                if !slot.applied.insert(content_sha.to_string()) {
                    return Ok(());
                }
                let row = &mut slot.row;
                row.requests_count += delta.requests_count;
                row.status_2xx += delta.status_2xx;
                row.status_3xx += delta.status_3xx;
                row.status_4xx += delta.status_4xx;
                row.status_5xx += delta.status_5xx;
                row.unique_ips += delta.unique_ips;
                row.total_bytes += delta.total_bytes;
                row.top_paths = merge_top_entries(&row.top_paths, &delta.top_paths, TOP_K);
                row.top_ips = merge_top_entries(&row.top_ips, &delta.top_ips, TOP_K);
                row.top_user_agents =
                    merge_top_entries(&row.top_user_agents, &delta.top_user_agents, TOP_K);
                row.top_status_codes =
                    merge_top_entries(&row.top_status_codes, &delta.top_status_codes, TOP_K);
            }
        }
        Ok(())
    }

    async fn aggregates_in_range(
        &self,
        site_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HourlyAggregate>, LogamizerError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<HourlyAggregate> = inner
            .aggregates
            .values()
            .filter(|slot| {
                slot.row.site_id == site_id
                    && slot.row.hour_bucket >= from
                    && slot.row.hour_bucket < to
            })
            .map(|slot| slot.row.clone())
            .collect();
        rows.sort_by_key(|r| r.hour_bucket);
        Ok(rows)
    }

    async fn clear_aggregates(
        &self,
        site_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(), LogamizerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.aggregates.retain(|(site, hour), _| {
            !(site == site_id && *hour >= from && *hour < to)
        });
        Ok(())
    }

    async fn upsert_finding(&self, finding: Finding) -> Result<(), LogamizerError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.findings.get_mut(&finding.fingerprint) {
            None => {
                inner.findings.insert(finding.fingerprint.clone(), finding);
            }
            Some(existing) => {
                for sample in finding.evidence {
                    if existing.evidence.len() >= EVIDENCE_LIMIT {
                        break;
                    }
                    if !existing.evidence.contains(&sample) {
                        existing.evidence.push(sample);
                    }
                }
                existing.match_count = existing.match_count.max(finding.match_count);
                existing.first_seen = existing.first_seen.min(finding.first_seen);
                existing.last_seen = existing.last_seen.max(finding.last_seen);
                // Severity enum orders most-severe first.
                existing.severity = existing.severity.min(finding.severity);
                existing.description = finding.description;
            }
        }
        Ok(())
    }

    async fn findings_for_site(&self, site_id: &str) -> Result<Vec<Finding>, LogamizerError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<Finding> = inner
            .findings
            .values()
            .filter(|f| f.site_id == site_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.severity
                .cmp(&b.severity)
                .then_with(|| a.finding_type.cmp(&b.finding_type))
                .then_with(|| a.subject.cmp(&b.subject))
        });
        Ok(rows)
    }

    async fn clear_findings(
        &self,
        site_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(), LogamizerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.findings.retain(|_, f| {
            !(f.site_id == site_id && f.first_seen >= from && f.first_seen < to)
        });
        Ok(())
    }

    async fn apply_error_group(
        &self,
        site_id: &str,
        content_sha: &str,
        delta: GroupDelta,
    ) -> Result<(), LogamizerError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (site_id.to_string(), delta.fingerprint.clone());
        match inner.groups.get_mut(&key) {
            None => {
                let mut applied = HashSet::new();
                applied.insert(content_sha.to_string());
                inner.groups.insert(
                    key,
                    GroupSlot {
                        row: ErrorGroup {
                            site_id: site_id.to_string(),
                            fingerprint: delta.fingerprint,
                            error_type: delta.error_type,
                            error_message: delta.error_message,
                            first_seen: delta.first_seen,
                            last_seen: delta.last_seen,
                            occurrence_count: delta.occurrences,
                            status: ErrorGroupStatus::Unresolved,
                        },
                        applied,
                    },
                );
            }
            Some(slot) => {
                if !slot.applied.insert(content_sha.to_string()) {
                    return Ok(());
                }
                let row = &mut slot.row;
                row.first_seen = row.first_seen.min(delta.first_seen);
                row.last_seen = row.last_seen.max(delta.last_seen);
                row.occurrence_count += delta.occurrences;
            }
        }
        Ok(())
    }

    async fn replace_occurrences(
        &self,
        log_file_id: &str,
        rows: Vec<ErrorOccurrence>,
    ) -> Result<(), LogamizerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.occurrences.retain(|o| o.log_file_id != log_file_id);
        inner.occurrences.extend(rows);
        Ok(())
    }

    async fn error_groups_for_site(&self, site_id: &str) -> Result<Vec<ErrorGroup>, LogamizerError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<ErrorGroup> = inner
            .groups
            .values()
            .filter(|slot| slot.row.site_id == site_id)
            .map(|slot| slot.row.clone())
            .collect();
        rows.sort_by(|a, b| {
            b.occurrence_count
                .cmp(&a.occurrence_count)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        Ok(rows)
    }

    async fn occurrences_for_group(
        &self,
        site_id: &str,
        fingerprint: &str,
    ) -> Result<Vec<ErrorOccurrence>, LogamizerError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<ErrorOccurrence> = inner
            .occurrences
            .iter()
            .filter(|o| o.site_id == site_id && o.group_fingerprint == fingerprint)
            .cloned()
            .collect();
        rows.sort_by_key(|o| o.timestamp);
        Ok(rows)
    }

    async fn put_quality(
        &self,
        log_file_id: &str,
        quality: ParseQuality,
    ) -> Result<(), LogamizerError> {
        self.inner
            .lock()
            .unwrap()
            .quality
            .insert(log_file_id.to_string(), quality);
        Ok(())
    }

    async fn quality_for(
        &self,
        log_file_id: &str,
    ) -> Result<Option<ParseQuality>, LogamizerError> {
        Ok(self.inner.lock().unwrap().quality.get(log_file_id).cloned())
    }
}
