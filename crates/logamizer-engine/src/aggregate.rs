use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, DurationRound, Utc};
use logamizer_core::{AccessEvent, HourlyAggregate, StatusClass, TopEntry};

use crate::topk::TopK;

pub const TOP_K: usize = 10;

/// Floor a timestamp to its UTC hour bucket.
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1)).expect("hour is a valid rounding unit")
}

/// In-memory state for one hour bucket.
struct BucketState {
    requests_count: u64,
    status_2xx: u64,
    status_3xx: u64,
    status_4xx: u64,
    status_5xx: u64,
    total_bytes: u64,
    ips: HashSet<String>,
    top_paths: TopK,
    top_ips: TopK,
    top_user_agents: TopK,
    top_status_codes: TopK,
}

impl BucketState {
    fn new() -> Self {
        Self {
            requests_count: 0,
            status_2xx: 0,
            status_3xx: 0,
            status_4xx: 0,
            status_5xx: 0,
            total_bytes: 0,
            ips: HashSet::new(),
            top_paths: TopK::new(TOP_K),
            top_ips: TopK::new(TOP_K),
            top_user_agents: TopK::new(TOP_K),
            top_status_codes: TopK::new(TOP_K),
        }
    }

    fn observe(&mut self, event: &AccessEvent) {
        self.requests_count += 1;
        self.total_bytes += event.bytes_sent;
        match event.status_class() {
            StatusClass::Success => self.status_2xx += 1,
            StatusClass::Redirect => self.status_3xx += 1,
            StatusClass::ClientError => self.status_4xx += 1,
            StatusClass::ServerError => self.status_5xx += 1,
            StatusClass::Other => {}
        }
        self.ips.insert(event.ip.clone());
        self.top_paths.observe(&event.path);
        self.top_ips.observe(&event.ip);
        self.top_status_codes.observe(&event.status.to_string());
        if let Some(ua) = &event.user_agent {
            self.top_user_agents.observe(ua);
        }
    }

    fn into_row(self, site_id: &str, hour: DateTime<Utc>) -> HourlyAggregate {
        HourlyAggregate {
            site_id: site_id.to_string(),
            hour_bucket: hour,
            requests_count: self.requests_count,
            status_2xx: self.status_2xx,
            status_3xx: self.status_3xx,
            status_4xx: self.status_4xx,
            status_5xx: self.status_5xx,
            unique_ips: self.ips.len() as u64,
            total_bytes: self.total_bytes,
            top_paths: self.top_paths.top(),
            top_ips: self.top_ips.top(),
            top_user_agents: self.top_user_agents.top(),
            top_status_codes: self.top_status_codes.top(),
        }
    }
}

/// File-level summary kept alongside the hourly rows; feeds the report the
/// operator sees after a run.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FileSummary {
    pub total_requests: u64,
    pub total_bytes: u64,
    pub unique_ips: u64,
    pub unique_paths: u64,
    pub methods: Vec<TopEntry>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

/// Buckets events into per-hour rows with additive counters and bounded
/// top-K summaries. One instance per pipeline run; flushed rows merge
/// commutatively into the store.
pub struct HourlyAggregator {
    site_id: String,
    buckets: BTreeMap<DateTime<Utc>, BucketState>,
    events_seen: u64,
    // file-level rollup
    unique_ips: HashSet<String>,
    unique_paths: HashSet<String>,
    methods: HashMap<String, u64>,
    total_bytes: u64,
    first_ts: Option<DateTime<Utc>>,
    last_ts: Option<DateTime<Utc>>,
}

impl HourlyAggregator {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            buckets: BTreeMap::new(),
            events_seen: 0,
            unique_ips: HashSet::new(),
            unique_paths: HashSet::new(),
            methods: HashMap::new(),
            total_bytes: 0,
            first_ts: None,
            last_ts: None,
        }
    }

    pub fn observe(&mut self, event: &AccessEvent) {
        let hour = hour_bucket(event.timestamp);
        self.buckets.entry(hour).or_insert_with(BucketState::new).observe(event);

        self.events_seen += 1;
        self.total_bytes += event.bytes_sent;
        self.unique_ips.insert(event.ip.clone());
        self.unique_paths.insert(event.path.clone());
        if !event.method.is_empty() {
            *self.methods.entry(event.method.clone()).or_default() += 1;
        }
        if self.first_ts.map_or(true, |ts| event.timestamp < ts) {
            self.first_ts = Some(event.timestamp);
        }
        if self.last_ts.map_or(true, |ts| event.timestamp > ts) {
            self.last_ts = Some(event.timestamp);
        }
    }

    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    /// The most recent hour that has received an event.
    pub fn latest_hour(&self) -> Option<DateTime<Utc>> {
        self.buckets.keys().next_back().copied()
    }

    /// Hours currently held in memory, ascending.
    pub fn hours(&self) -> Vec<DateTime<Utc>> {
        self.buckets.keys().copied().collect()
    }

    pub fn summary(&self) -> FileSummary {
        let mut methods: Vec<TopEntry> = self
            .methods
            .iter()
            .map(|(k, c)| TopEntry::new(k.clone(), *c))
            .collect();
        methods.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        methods.truncate(TOP_K);
        FileSummary {
            total_requests: self.events_seen,
            total_bytes: self.total_bytes,
            unique_ips: self.unique_ips.len() as u64,
            unique_paths: self.unique_paths.len() as u64,
            methods,
            first_timestamp: self.first_ts,
            last_timestamp: self.last_ts,
        }
    }

    /// Drain every bucket into aggregate rows, ascending by hour.
    pub fn flush(&mut self) -> Vec<HourlyAggregate> {
        let site_id = self.site_id.clone();
        std::mem::take(&mut self.buckets)
            .into_iter()
            .map(|(hour, state)| state.into_row(&site_id, hour))
            .collect()
    }

    /// Drain only buckets strictly before `cutoff`. Used on cancellation so
    /// that only complete hours are flushed; the trailing partial hour is
    /// dropped and reconciled by the idempotent re-run.
    pub fn flush_before(&mut self, cutoff: DateTime<Utc>) -> Vec<HourlyAggregate> {
        let keep = self.buckets.split_off(&cutoff);
        let drained = std::mem::replace(&mut self.buckets, keep);
        let site_id = self.site_id.clone();
        drained
            .into_iter()
            .map(|(hour, state)| state.into_row(&site_id, hour))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(ts: DateTime<Utc>, ip: &str, path: &str, status: u16, bytes: u64) -> AccessEvent {
        AccessEvent {
            timestamp: ts,
            ip: ip.into(),
            method: "GET".into(),
            path: path.into(),
            status,
            bytes_sent: bytes,
            referer: None,
            user_agent: Some("Mozilla/5.0".into()),
            user: None,
            protocol: Some("HTTP/1.1".into()),
            raw_line: String::new(),
            line_number: 1,
        }
    }

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 23, h, m, s).unwrap()
    }

    #[test]
    fn hour_bucket_floors_to_hour() {
        assert_eq!(hour_bucket(ts(17, 36, 10)), ts(17, 0, 0));
        assert_eq!(hour_bucket(ts(17, 0, 0)), ts(17, 0, 0));
    }

    #[test]
    fn single_event_aggregate_row() {
        let mut agg = HourlyAggregator::new("site-1");
        agg.observe(&event(ts(17, 36, 10), "203.0.113.42", "/api/health", 200, 532));

        let rows = agg.flush();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.hour_bucket, ts(17, 0, 0));
        assert_eq!(row.requests_count, 1);
        assert_eq!(row.status_2xx, 1);
        assert_eq!(row.unique_ips, 1);
        assert_eq!(row.total_bytes, 532);
        assert_eq!(row.top_paths, vec![TopEntry::new("/api/health", 1)]);
        assert_eq!(row.top_status_codes, vec![TopEntry::new("200", 1)]);
    }

    #[test]
    fn counters_partition_by_status_class() {
        let mut agg = HourlyAggregator::new("site-1");
        for (status, n) in [(200u16, 5u64), (301, 2), (404, 3), (503, 1)] {
            for i in 0..n {
                agg.observe(&event(ts(10, 0, i as u32), "1.1.1.1", "/p", status, 10));
            }
        }
        // An unclassified status keeps requests_count ahead of the classes.
        agg.observe(&event(ts(10, 30, 0), "1.1.1.1", "/p", 101, 0));

        let rows = agg.flush();
        let row = &rows[0];
        assert_eq!(row.requests_count, 12);
        assert_eq!(row.status_2xx, 5);
        assert_eq!(row.status_3xx, 2);
        assert_eq!(row.status_4xx, 3);
        assert_eq!(row.status_5xx, 1);
        assert_eq!(row.unclassified(), 1);
        assert_eq!(
            row.requests_count,
            row.status_2xx + row.status_3xx + row.status_4xx + row.status_5xx + row.unclassified()
        );
    }

    #[test]
    fn events_split_across_hours() {
        let mut agg = HourlyAggregator::new("site-1");
        agg.observe(&event(ts(10, 59, 59), "1.1.1.1", "/a", 200, 1));
        agg.observe(&event(ts(11, 0, 0), "1.1.1.1", "/a", 200, 1));
        let rows = agg.flush();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].hour_bucket, ts(10, 0, 0));
        assert_eq!(rows[1].hour_bucket, ts(11, 0, 0));
    }

    #[test]
    fn unique_ips_deduplicate_within_bucket() {
        let mut agg = HourlyAggregator::new("site-1");
        for _ in 0..5 {
            agg.observe(&event(ts(9, 1, 0), "1.1.1.1", "/a", 200, 0));
        }
        agg.observe(&event(ts(9, 2, 0), "2.2.2.2", "/a", 200, 0));
        let rows = agg.flush();
        assert_eq!(rows[0].unique_ips, 2);
        assert_eq!(rows[0].requests_count, 6);
    }

    #[test]
    fn summary_rolls_up_the_file() {
        let mut agg = HourlyAggregator::new("site-1");
        agg.observe(&event(ts(9, 0, 0), "1.1.1.1", "/a", 200, 100));
        agg.observe(&event(ts(12, 0, 0), "2.2.2.2", "/b", 404, 50));
        let summary = agg.summary();
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.total_bytes, 150);
        assert_eq!(summary.unique_ips, 2);
        assert_eq!(summary.unique_paths, 2);
        assert_eq!(summary.first_timestamp, Some(ts(9, 0, 0)));
        assert_eq!(summary.last_timestamp, Some(ts(12, 0, 0)));
        assert_eq!(summary.methods[0], TopEntry::new("GET", 2));
    }

    #[test]
    fn flush_before_keeps_trailing_hour() {
        let mut agg = HourlyAggregator::new("site-1");
        agg.observe(&event(ts(9, 0, 0), "1.1.1.1", "/a", 200, 1));
        agg.observe(&event(ts(10, 0, 0), "1.1.1.1", "/a", 200, 1));
        agg.observe(&event(ts(11, 30, 0), "1.1.1.1", "/a", 200, 1));

        let flushed = agg.flush_before(ts(11, 0, 0));
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[1].hour_bucket, ts(10, 0, 0));

        let rest = agg.flush();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].hour_bucket, ts(11, 0, 0));
    }
}
