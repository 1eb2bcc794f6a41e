pub mod errors;
pub mod ingest;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use logamizer_config::LogamizerConfig;
use logamizer_core::{LogFile, LogFileKind, LogFileStatus, Site};
use logamizer_engine::content_sha256;
use logamizer_pipeline::{DriverSettings, PipelineDriver};
use logamizer_store::MemoryStore;

/// Load configuration from `--config`, or defaults when omitted.
pub fn load_config(path: Option<&str>) -> Result<LogamizerConfig> {
    match path {
        Some(p) => logamizer_config::load(std::path::Path::new(p))
            .with_context(|| format!("loading config {p}")),
        None => Ok(LogamizerConfig::default()),
    }
}

/// Resolve the site to run under: a configured one by id, or an ad-hoc site.
pub fn resolve_site(config: &LogamizerConfig, site: Option<String>) -> Result<Site> {
    match site {
        Some(id) => config.resolve_site(&id).context("resolving site"),
        None => Ok(Site::new("local", "local")),
    }
}

/// Stage a local file into the in-memory store and return the driver plus
/// the registered log file.
pub fn stage_file(
    config: &LogamizerConfig,
    site: Site,
    path: &str,
    kind: LogFileKind,
) -> Result<(Arc<MemoryStore>, PipelineDriver, LogFile)> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {path}"))?;
    let filename = std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());

    let store = Arc::new(MemoryStore::new());
    let file = LogFile {
        id: "local-1".to_string(),
        site_id: site.id.clone(),
        filename,
        size_bytes: bytes.len() as u64,
        sha256: content_sha256(&bytes),
        storage_key: "local/1".to_string(),
        kind,
        status: LogFileStatus::Pending,
        failure_reason: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    store.put_site(site);
    store.put_blob(file.storage_key.clone(), bytes);
    store.put_log_file(file.clone());

    let driver = PipelineDriver::new(
        store.clone(),
        store.clone(),
        store.clone(),
        DriverSettings::from_config(config),
    );
    Ok((store, driver, file))
}
