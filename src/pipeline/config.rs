//! Pipeline configuration.
//!
//! Defaults are operational; every knob has an `OTCPIPE_*` environment
//! override so deployments tune behavior without code changes. The readiness
//! completeness policy lives here too: it varies by domain and tier in
//! practice, so it is injected configuration rather than a constant.

use crate::pipeline::anomaly::Severity;
use crate::pipeline::manifest::Stage;
use crate::pipeline::partition::OTC_TRANSPARENCY_DOMAIN;
use crate::pipeline::readiness::ReadinessPolicy;
use chrono::Duration;
use std::env;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Directory the filesystem fetcher reads weekly files from.
    pub data_dir: PathBuf,
    /// Source domain namespacing all partitions this instance processes.
    pub domain: String,
    /// Maximum fraction of source rows that may be skipped for schema
    /// violations before the RAW stage fails outright.
    pub max_schema_skip_rate: f64,
    /// RUNNING entries with a heartbeat older than this are eligible for the
    /// reaper.
    pub stale_run_threshold: Duration,
    /// Readiness completeness policy.
    pub readiness: ReadinessPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("otc_transparency.db"),
            data_dir: PathBuf::from("data"),
            domain: OTC_TRANSPARENCY_DOMAIN.to_string(),
            max_schema_skip_rate: 0.05,
            stale_run_threshold: Duration::minutes(30),
            readiness: ReadinessPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults with environment overrides applied. Unparseable values are
    /// logged and ignored rather than fatal.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = env::var("OTCPIPE_DB") {
            config.db_path = PathBuf::from(path);
        }
        if let Ok(dir) = env::var("OTCPIPE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(domain) = env::var("OTCPIPE_DOMAIN") {
            config.domain = domain;
        }
        if let Some(rate) = parse_env("OTCPIPE_MAX_SKIP_RATE") {
            config.max_schema_skip_rate = rate;
        }
        if let Some(minutes) = parse_env::<i64>("OTCPIPE_STALE_MINUTES") {
            config.stale_run_threshold = Duration::minutes(minutes);
        }
        if let Some(weeks) = parse_env("OTCPIPE_MIN_TRAILING_WEEKS") {
            config.readiness.min_trailing_weeks = weeks;
        }
        if let Ok(severity) = env::var("OTCPIPE_BLOCKING_SEVERITY") {
            match Severity::parse(&severity) {
                Some(s) => config.readiness.blocking_severity = s,
                None => warn!("ignoring invalid OTCPIPE_BLOCKING_SEVERITY '{}'", severity),
            }
        }
        if let Ok(stages) = env::var("OTCPIPE_REQUIRE_STAGES") {
            let parsed: Vec<Stage> = stages
                .split(',')
                .filter_map(|s| {
                    let label = s.trim();
                    let stage = Stage::parse(label);
                    if stage.is_none() {
                        warn!("ignoring invalid stage '{}' in OTCPIPE_REQUIRE_STAGES", label);
                    }
                    stage
                })
                .collect();
            if !parsed.is_empty() {
                config.readiness.require_stages = parsed;
            }
        }

        config
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring unparseable {} '{}'", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.domain, OTC_TRANSPARENCY_DOMAIN);
        assert_eq!(config.readiness.blocking_severity, Severity::Critical);
        assert_eq!(config.readiness.require_stages, Stage::ORDER.to_vec());
        assert!(config.max_schema_skip_rate > 0.0);
    }
}
