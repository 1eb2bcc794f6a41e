use anyhow::Result;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Table};
use logamizer_core::LogFileKind;
use logamizer_store::AnalyticsStore;

use super::{load_config, resolve_site, stage_file};

pub async fn run(
    config_path: Option<&str>,
    path: &str,
    site: Option<String>,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let site = resolve_site(&config, site)?;
    let site_id = site.id.clone();

    let (store, driver, file) = stage_file(&config, site, path, LogFileKind::Error)?;
    let report = driver.analyze_errors(&file.id).await?;

    let groups = store.error_groups_for_site(&site_id).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "report": &report,
                "quality": report.quality.report(),
                "groups": groups,
            }))?
        );
        return Ok(());
    }

    let q = &report.quality;
    println!(
        "Parsed {}/{} lines, {} failed, {} empty — {} occurrences in {} groups",
        q.parsed_lines, q.total_lines, q.failed_lines, q.empty_lines, report.occurrences, report.groups
    );

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["count", "type", "first seen", "last seen", "message"]);
    for g in &groups {
        let mut message = logamizer_core::model::truncate_chars(&g.error_message, 57);
        if message.len() < g.error_message.len() {
            message.push_str("...");
        }
        table.add_row(vec![
            Cell::new(g.occurrence_count),
            Cell::new(&g.error_type),
            Cell::new(g.first_seen.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(g.last_seen.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(message),
        ]);
    }
    println!("{table}");

    Ok(())
}
