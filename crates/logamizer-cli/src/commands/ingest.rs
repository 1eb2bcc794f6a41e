use anyhow::Result;
use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Table};
use logamizer_core::LogFileKind;
use logamizer_store::AnalyticsStore;

use super::{load_config, resolve_site, stage_file};

pub async fn run(
    config_path: Option<&str>,
    path: &str,
    site: Option<String>,
    format: Option<String>,
    hidden_ips: Vec<String>,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let mut site = resolve_site(&config, site)?;
    if let Some(fmt) = format {
        site.log_format = fmt.parse()?;
    }
    site.hidden_ips.extend(hidden_ips);

    let site_id = site.id.clone();
    let (store, driver, file) = stage_file(&config, site, path, LogFileKind::Access)?;
    let report = driver.run_ingest(&file.id).await?;

    let rows = store
        .aggregates_in_range(&site_id, DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
        .await?;
    let findings = store.findings_for_site(&site_id).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "report": &report,
                "quality": report.quality.report(),
                "aggregates": rows,
                "findings": findings,
            }))?
        );
        return Ok(());
    }

    let q = &report.quality;
    println!(
        "Parsed {}/{} lines ({:.1}% of parseable), {} failed, {} empty",
        q.parsed_lines,
        q.total_lines,
        q.success_rate() * 100.0,
        q.failed_lines,
        q.empty_lines
    );
    let s = &report.summary;
    println!(
        "Requests: {} | Bytes: {} | Unique IPs: {} | Unique paths: {}",
        s.total_requests, s.total_bytes, s.unique_ips, s.unique_paths
    );
    if let (Some(first), Some(last)) = (s.first_timestamp, s.last_timestamp) {
        println!("Time range: {} .. {}", first.to_rfc3339(), last.to_rfc3339());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        "hour (UTC)",
        "requests",
        "2xx",
        "3xx",
        "4xx",
        "5xx",
        "unique IPs",
        "bytes",
        "top path",
    ]);
    for row in &rows {
        table.add_row(vec![
            Cell::new(row.hour_bucket.format("%Y-%m-%d %H:00")),
            Cell::new(row.requests_count),
            Cell::new(row.status_2xx),
            Cell::new(row.status_3xx),
            Cell::new(row.status_4xx),
            Cell::new(row.status_5xx),
            Cell::new(row.unique_ips),
            Cell::new(row.total_bytes),
            Cell::new(row.top_paths.first().map(|e| e.key.as_str()).unwrap_or("-")),
        ]);
    }
    println!("{table}");

    if findings.is_empty() {
        println!("No findings.");
    } else {
        println!("Findings:");
        for f in &findings {
            println!(
                "  [{}] {} — {} (subject: {}, {} matches)",
                f.severity, f.finding_type, f.title, f.subject, f.match_count
            );
        }
    }

    Ok(())
}
