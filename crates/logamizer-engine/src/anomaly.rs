use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use logamizer_core::{AnomalyParams, EvidenceSample, Finding, HourlyAggregate, Severity};

use crate::finding_fingerprint;

/// Variance floor: keeps z-scores finite on flat baselines.
const SIGMA_EPSILON: f64 = 1.0;
/// Absolute floors below which a spike is not worth reporting.
const REQUESTS_FLOOR: u64 = 200;
const ERRORS_FLOOR: u64 = 10;

/// Compares freshly-touched hour buckets against a rolling baseline of the
/// same site and emits deviation findings. Runs after aggregation for a file
/// has completed.
pub struct AnomalyDetector {
    params: AnomalyParams,
}

impl AnomalyDetector {
    pub fn new(params: AnomalyParams) -> Self {
        Self { params }
    }

    /// Score the `fresh_hours` of `site_id`. `aggregates` must contain the
    /// site's rows covering at least the baseline window before each fresh
    /// hour; rows for the fresh hours themselves are required and excluded
    /// from their own baseline.
    pub fn detect(
        &self,
        site_id: &str,
        aggregates: &[HourlyAggregate],
        fresh_hours: &[DateTime<Utc>],
    ) -> Vec<Finding> {
        let mut findings = Vec::new();
        let window = Duration::days(self.params.baseline_days as i64);

        for &hour in fresh_hours {
            let Some(current) = aggregates.iter().find(|a| a.hour_bucket == hour) else {
                continue;
            };
            let baseline: Vec<&HourlyAggregate> = aggregates
                .iter()
                .filter(|a| a.hour_bucket >= hour - window && a.hour_bucket < hour)
                .collect();
            if (baseline.len() as u32) < self.params.min_baseline_hours {
                continue;
            }

            let requests: Vec<f64> = baseline.iter().map(|a| a.requests_count as f64).collect();
            let errors: Vec<f64> = baseline
                .iter()
                .map(|a| (a.status_4xx + a.status_5xx) as f64)
                .collect();

            let current_errors = current.status_4xx + current.status_5xx;

            if let Some(z) = zscore(current.requests_count as f64, &requests) {
                if z >= self.params.z_threshold && current.requests_count >= REQUESTS_FLOOR {
                    findings.push(self.signal(
                        site_id,
                        current,
                        "anomaly.traffic_spike",
                        Severity::High,
                        "Traffic spike detected",
                        format!(
                            "Hour {} saw {} requests, {:.1} standard deviations above the baseline",
                            hour.to_rfc3339(),
                            current.requests_count,
                            z
                        ),
                        hour.to_rfc3339(),
                    ));
                }
            }

            if let Some(z) = zscore(current_errors as f64, &errors) {
                if z >= self.params.z_threshold && current_errors >= ERRORS_FLOOR {
                    findings.push(self.signal(
                        site_id,
                        current,
                        "anomaly.error_spike",
                        Severity::Critical,
                        "Error spike detected",
                        format!(
                            "Hour {} saw {} 4xx/5xx responses, {:.1} standard deviations above the baseline",
                            hour.to_rfc3339(),
                            current_errors,
                            z
                        ),
                        hour.to_rfc3339(),
                    ));
                }
            }

            findings.extend(self.new_path_signals(site_id, current, &baseline));
        }

        findings
    }

    /// Paths first observed in the current hour with enough traffic to
    /// matter: compared against the union of baseline top-path keys.
    fn new_path_signals(
        &self,
        site_id: &str,
        current: &HourlyAggregate,
        baseline: &[&HourlyAggregate],
    ) -> Vec<Finding> {
        let known: HashSet<&str> = baseline
            .iter()
            .flat_map(|a| a.top_paths.iter().map(|e| e.key.as_str()))
            .collect();

        current
            .top_paths
            .iter()
            .filter(|entry| {
                entry.count >= self.params.new_path_min_count && !known.contains(entry.key.as_str())
            })
            .map(|entry| {
                let hour = current.hour_bucket.to_rfc3339();
                let subject = format!("{}|{}", hour, entry.key);
                Finding {
                    site_id: site_id.to_string(),
                    finding_type: "anomaly.new_path".to_string(),
                    severity: Severity::Medium,
                    title: "New endpoint receiving traffic".to_string(),
                    description: format!(
                        "Path {} first appeared in hour {} with {} requests",
                        entry.key, hour, entry.count
                    ),
                    subject: entry.key.clone(),
                    fingerprint: finding_fingerprint("anomaly.new_path", site_id, &subject, &hour),
                    evidence: Vec::new(),
                    suggested_action: Some(
                        "Verify the endpoint exists intentionally and is not an exposed artifact."
                            .to_string(),
                    ),
                    match_count: entry.count,
                    first_seen: current.hour_bucket,
                    last_seen: current.hour_bucket,
                }
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn signal(
        &self,
        site_id: &str,
        current: &HourlyAggregate,
        finding_type: &str,
        severity: Severity,
        title: &str,
        description: String,
        hour_key: String,
    ) -> Finding {
        Finding {
            site_id: site_id.to_string(),
            finding_type: finding_type.to_string(),
            severity,
            title: title.to_string(),
            description,
            subject: hour_key.clone(),
            fingerprint: finding_fingerprint(finding_type, site_id, &hour_key, &hour_key),
            evidence: vec![EvidenceSample {
                line: 0,
                raw: format!(
                    "hour={} requests={} 4xx={} 5xx={}",
                    hour_key, current.requests_count, current.status_4xx, current.status_5xx
                ),
            }],
            suggested_action: Some(
                "Compare with recent deployments and traffic sources for this hour.".to_string(),
            ),
            match_count: current.requests_count,
            first_seen: current.hour_bucket,
            last_seen: current.hour_bucket,
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation, matching how baselines are scored.
fn pstdev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// z = (value − μ) / max(σ, ε); None on an empty baseline.
fn zscore(value: f64, baseline: &[f64]) -> Option<f64> {
    if baseline.is_empty() {
        return None;
    }
    let sigma = pstdev(baseline).max(SIGMA_EPSILON);
    Some((value - mean(baseline)) / sigma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use logamizer_core::TopEntry;

    fn hour(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, d, h, 0, 0).unwrap()
    }

    fn row(bucket: DateTime<Utc>, requests: u64, errors: u64) -> HourlyAggregate {
        let mut row = HourlyAggregate::empty("site-1", bucket);
        row.requests_count = requests;
        row.status_2xx = requests.saturating_sub(errors);
        row.status_5xx = errors;
        row
    }

    /// 48 steady baseline hours before day 23 hour 12.
    fn steady_baseline() -> Vec<HourlyAggregate> {
        let mut rows = Vec::new();
        for d in 21..23 {
            for h in 0..24 {
                rows.push(row(hour(d, h), 100 + (h as u64 % 3), 2));
            }
        }
        rows
    }

    fn detect(rows: &[HourlyAggregate], fresh: DateTime<Utc>) -> Vec<Finding> {
        AnomalyDetector::new(AnomalyParams::default()).detect("site-1", rows, &[fresh])
    }

    #[test]
    fn traffic_spike_is_flagged() {
        let mut rows = steady_baseline();
        let fresh = hour(23, 12);
        rows.push(row(fresh, 1000, 2));
        let findings = detect(&rows, fresh);
        assert!(findings.iter().any(|f| f.finding_type == "anomaly.traffic_spike"));
        let spike = findings
            .iter()
            .find(|f| f.finding_type == "anomaly.traffic_spike")
            .unwrap();
        assert_eq!(spike.severity, Severity::High);
    }

    #[test]
    fn error_spike_is_critical() {
        let mut rows = steady_baseline();
        let fresh = hour(23, 12);
        rows.push(row(fresh, 120, 80));
        let findings = detect(&rows, fresh);
        let spike = findings
            .iter()
            .find(|f| f.finding_type == "anomaly.error_spike")
            .unwrap();
        assert_eq!(spike.severity, Severity::Critical);
    }

    #[test]
    fn insufficient_baseline_emits_nothing() {
        // 12 prior hours < default 24 minimum, then a 10x spike.
        let mut rows: Vec<HourlyAggregate> =
            (0..12).map(|h| row(hour(22, h), 100, 2)).collect();
        let fresh = hour(22, 12);
        rows.push(row(fresh, 1000, 50));
        assert!(detect(&rows, fresh).is_empty());
    }

    #[test]
    fn below_floor_spike_is_ignored() {
        // Baseline near zero: z is huge but absolute volume is tiny.
        let mut rows: Vec<HourlyAggregate> = steady_baseline()
            .into_iter()
            .map(|mut r| {
                r.requests_count = 2;
                r.status_2xx = 2;
                r.status_5xx = 0;
                r
            })
            .collect();
        let fresh = hour(23, 12);
        rows.push(row(fresh, 150, 0));
        let findings = detect(&rows, fresh);
        assert!(findings.iter().all(|f| f.finding_type != "anomaly.traffic_spike"));
    }

    #[test]
    fn flat_baseline_uses_epsilon_sigma() {
        // Perfectly flat baseline would divide by zero without the floor.
        let mut rows: Vec<HourlyAggregate> = (0..48)
            .map(|i| row(hour(21 + i / 24, i % 24), 100, 2))
            .collect();
        let fresh = hour(23, 12);
        rows.push(row(fresh, 400, 2));
        let findings = detect(&rows, fresh);
        assert!(findings.iter().any(|f| f.finding_type == "anomaly.traffic_spike"));
    }

    #[test]
    fn new_path_signal_respects_min_count() {
        let mut rows = steady_baseline();
        for r in rows.iter_mut() {
            r.top_paths = vec![TopEntry::new("/", 50), TopEntry::new("/about", 10)];
        }
        let fresh = hour(23, 12);
        let mut current = row(fresh, 100, 2);
        current.top_paths = vec![
            TopEntry::new("/", 40),
            TopEntry::new("/new-endpoint", 15),
            TopEntry::new("/rare", 3),
        ];
        rows.push(current);

        let findings = detect(&rows, fresh);
        let new_paths: Vec<_> = findings
            .iter()
            .filter(|f| f.finding_type == "anomaly.new_path")
            .collect();
        assert_eq!(new_paths.len(), 1);
        assert_eq!(new_paths[0].subject, "/new-endpoint");
        assert_eq!(new_paths[0].severity, Severity::Medium);
    }

    #[test]
    fn fingerprints_are_stable_per_hour_and_type() {
        let mut rows = steady_baseline();
        let fresh = hour(23, 12);
        rows.push(row(fresh, 1000, 2));
        let a = detect(&rows, fresh);
        let b = detect(&rows, fresh);
        let fa = a.iter().find(|f| f.finding_type == "anomaly.traffic_spike").unwrap();
        let fb = b.iter().find(|f| f.finding_type == "anomaly.traffic_spike").unwrap();
        assert_eq!(fa.fingerprint, fb.fingerprint);
    }

    #[test]
    fn pstdev_basics() {
        assert_eq!(pstdev(&[]), 0.0);
        assert_eq!(pstdev(&[5.0, 5.0, 5.0]), 0.0);
        assert!((pstdev(&[2.0, 4.0]) - 1.0).abs() < f64::EPSILON);
    }
}
