use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use logamizer_core::{AnomalyParams, LogFormat, Site};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("site not found in config: {0}")]
    SiteNotFound(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// TOML data model
// ---------------------------------------------------------------------------

/// Driver-level settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Evidence samples kept per finding (default: 20).
    #[serde(default = "default_evidence_limit")]
    pub evidence_limit: usize,
    /// Progress is reported at least every this many events (default: 10000).
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
    /// Retry attempts for transient persistence failures (default: 5).
    #[serde(default = "default_persist_retries")]
    pub persist_retries: u32,
    /// Soft job deadline in seconds; 0 disables (default: 900).
    #[serde(default = "default_job_deadline")]
    pub job_deadline_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            evidence_limit: default_evidence_limit(),
            progress_interval: default_progress_interval(),
            persist_retries: default_persist_retries(),
            job_deadline_secs: default_job_deadline(),
        }
    }
}

/// Thresholds for the security rule engine.
#[derive(Debug, Clone, Deserialize)]
pub struct RulesConfig {
    /// 404s from one IP inside the scanner window before a finding (default: 20).
    #[serde(default = "default_scanner_threshold")]
    pub scanner_threshold: u64,
    /// Scanner sliding window in minutes (default: 10).
    #[serde(default = "default_scanner_window")]
    pub scanner_window_minutes: u64,
    /// 4xx on auth paths from one IP before a brute-force finding (default: 10).
    #[serde(default = "default_brute_force_threshold")]
    pub brute_force_threshold: u64,
    /// Brute-force sliding window in minutes (default: 5).
    #[serde(default = "default_brute_force_window")]
    pub brute_force_window_minutes: u64,
    /// 5xx toward one IP before an abuse finding (default: 10).
    #[serde(default = "default_server_error_threshold")]
    pub server_error_threshold: u64,
    /// 5xx-burst sliding window in minutes (default: 5).
    #[serde(default = "default_server_error_window")]
    pub server_error_window_minutes: u64,
    /// Extra path fragments treated as authentication endpoints.
    #[serde(default)]
    pub extra_auth_paths: Vec<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            scanner_threshold: default_scanner_threshold(),
            scanner_window_minutes: default_scanner_window(),
            brute_force_threshold: default_brute_force_threshold(),
            brute_force_window_minutes: default_brute_force_window(),
            server_error_threshold: default_server_error_threshold(),
            server_error_window_minutes: default_server_error_window(),
            extra_auth_paths: Vec::new(),
        }
    }
}

/// Anomaly detector defaults, overridable per site.
#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyConfig {
    #[serde(default = "default_baseline_days")]
    pub baseline_days: u32,
    #[serde(default = "default_min_baseline_hours")]
    pub min_baseline_hours: u32,
    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,
    #[serde(default = "default_new_path_min_count")]
    pub new_path_min_count: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            baseline_days: default_baseline_days(),
            min_baseline_hours: default_min_baseline_hours(),
            z_threshold: default_z_threshold(),
            new_path_min_count: default_new_path_min_count(),
        }
    }
}

impl AnomalyConfig {
    pub fn to_params(&self) -> AnomalyParams {
        AnomalyParams {
            baseline_days: self.baseline_days,
            min_baseline_hours: self.min_baseline_hours,
            z_threshold: self.z_threshold,
            new_path_min_count: self.new_path_min_count,
        }
    }
}

/// Configuration for a single site.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Display name (defaults to the TOML key if omitted).
    pub name: Option<String>,
    pub domain: Option<String>,
    /// nginx_combined | apache_combined | auto.
    #[serde(default)]
    pub log_format: LogFormat,
    /// IPs excluded from aggregation and rules.
    #[serde(default)]
    pub filtered_ips: Vec<String>,
    /// Per-site anomaly overrides.
    pub anomaly: Option<AnomalyConfig>,
}

/// Top-level TOML config file (`logamizer.toml`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogamizerConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    /// Per-site configs, keyed by site id.
    #[serde(default)]
    pub sites: HashMap<String, SiteConfig>,
}

// ---------------------------------------------------------------------------
// Serde defaults
// ---------------------------------------------------------------------------

fn default_evidence_limit() -> usize {
    20
}
fn default_progress_interval() -> u64 {
    10_000
}
fn default_persist_retries() -> u32 {
    5
}
fn default_job_deadline() -> u64 {
    900
}
fn default_scanner_threshold() -> u64 {
    20
}
fn default_scanner_window() -> u64 {
    10
}
fn default_brute_force_threshold() -> u64 {
    10
}
fn default_brute_force_window() -> u64 {
    5
}
fn default_server_error_threshold() -> u64 {
    10
}
fn default_server_error_window() -> u64 {
    5
}
fn default_baseline_days() -> u32 {
    7
}
fn default_min_baseline_hours() -> u32 {
    24
}
fn default_z_threshold() -> f64 {
    3.0
}
fn default_new_path_min_count() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
pub fn load(path: &Path) -> Result<LogamizerConfig> {
    let content = std::fs::read_to_string(path)?;
    parse(&content)
}

/// Parse TOML string into a LogamizerConfig.
pub fn parse(toml_str: &str) -> Result<LogamizerConfig> {
    let mut config: LogamizerConfig = toml::from_str(toml_str)?;

    // Back-fill name from the TOML key if not explicitly set.
    for (key, site) in config.sites.iter_mut() {
        if site.name.is_none() {
            site.name = Some(key.clone());
        }
    }

    validate(&config)?;
    Ok(config)
}

impl LogamizerConfig {
    pub fn get_site(&self, id: &str) -> Option<&SiteConfig> {
        self.sites.get(id)
    }

    /// Materialize a site record, applying per-site anomaly overrides on top
    /// of the global defaults.
    pub fn resolve_site(&self, id: &str) -> Result<Site> {
        let sc = self
            .sites
            .get(id)
            .ok_or_else(|| ConfigError::SiteNotFound(id.to_string()))?;
        let anomaly = sc.anomaly.as_ref().unwrap_or(&self.anomaly).to_params();
        Ok(Site {
            id: id.to_string(),
            name: sc.name.clone().unwrap_or_else(|| id.to_string()),
            domain: sc.domain.clone(),
            log_format: sc.log_format,
            anomaly,
            hidden_ips: sc.filtered_ips.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &LogamizerConfig) -> Result<()> {
    validate_anomaly("anomaly", &config.anomaly)?;

    if config.pipeline.evidence_limit == 0 {
        return Err(ConfigError::Validation(
            "pipeline.evidence_limit must be >= 1".into(),
        ));
    }
    if config.pipeline.progress_interval == 0 {
        return Err(ConfigError::Validation(
            "pipeline.progress_interval must be >= 1".into(),
        ));
    }

    let r = &config.rules;
    for (name, value) in [
        ("rules.scanner_threshold", r.scanner_threshold),
        ("rules.brute_force_threshold", r.brute_force_threshold),
        ("rules.server_error_threshold", r.server_error_threshold),
    ] {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{name} must be >= 1")));
        }
    }
    for (name, value) in [
        ("rules.scanner_window_minutes", r.scanner_window_minutes),
        ("rules.brute_force_window_minutes", r.brute_force_window_minutes),
        ("rules.server_error_window_minutes", r.server_error_window_minutes),
    ] {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{name} must be >= 1")));
        }
    }

    for (key, site) in &config.sites {
        let name = site.name.as_deref().unwrap_or(key);
        if name.is_empty() {
            return Err(ConfigError::Validation("site name must not be empty".into()));
        }
        for ip in &site.filtered_ips {
            if ip.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "site '{name}': filtered_ips entries must not be empty"
                )));
            }
        }
        if let Some(ref a) = site.anomaly {
            validate_anomaly(&format!("sites.{key}.anomaly"), a)?;
        }
    }

    Ok(())
}

fn validate_anomaly(prefix: &str, a: &AnomalyConfig) -> Result<()> {
    if a.baseline_days < 1 {
        return Err(ConfigError::Validation(format!(
            "{prefix}.baseline_days must be >= 1, got {}",
            a.baseline_days
        )));
    }
    if a.min_baseline_hours < 1 {
        return Err(ConfigError::Validation(format!(
            "{prefix}.min_baseline_hours must be >= 1, got {}",
            a.min_baseline_hours
        )));
    }
    if a.z_threshold < 0.0 || !a.z_threshold.is_finite() {
        return Err(ConfigError::Validation(format!(
            "{prefix}.z_threshold must be >= 0, got {}",
            a.z_threshold
        )));
    }
    if a.new_path_min_count < 1 {
        return Err(ConfigError::Validation(format!(
            "{prefix}.new_path_min_count must be >= 1, got {}",
            a.new_path_min_count
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
