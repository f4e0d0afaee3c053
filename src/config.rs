//! Configuration loading: YAML file plus `IDBDS_*` environment overrides.
//!
//! The file path defaults to the deployment location, can be pointed
//! elsewhere with `IDBDS_CONF`, and switches to the test-database config
//! when `IDBDS_TESTDB` is set. Environment values win over file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::collection::Collection;

/// Deployment config location.
const DEFAULT_CONF: &str = "/opt/idbdownsampler/etc/idbdownsampler.conf";

/// Config location used when `IDBDS_TESTDB` is set.
const TESTDB_CONF: &str = "/opt/idbdownsampler/etc/idbdownsampler_testdb.conf";

/// Runtime configuration shared by both binaries.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// TSDB base URL.
    #[serde(default)]
    pub db_url: String,

    /// TSDB auth token.
    #[serde(default)]
    pub token: String,

    /// TSDB organization. Also the organization downsample and bandwidth
    /// programs write under.
    #[serde(default)]
    pub org: String,

    /// Bucket holding the DB server's self-metrics.
    #[serde(default)]
    pub stats_bucket: String,

    /// Target bucket for bandwidth utilization data.
    #[serde(default)]
    pub bw_bucket: String,

    /// Comma-separated collections to downsample.
    #[serde(default)]
    pub ds_collections: String,

    /// Memory usage gate threshold in percent. Default: 40.
    #[serde(default = "default_mem_limit")]
    pub mem_limit: f64,

    /// Base number of aggregation windows per submitted chunk. Default: 8.
    #[serde(default = "default_aggr_cnt")]
    pub aggr_cnt: i32,

    /// Cardinality at or above which an instance counts as medium. Default: 50.
    #[serde(default = "default_card_medium")]
    pub card_medium: i64,

    /// Cardinality at or above which an instance counts as heavy. Default: 1000.
    #[serde(default = "default_card_hevy")]
    pub card_hevy: i64,

    /// Per-request HTTP timeout. Default: 600s.
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub http_timeout: Duration,
}

// --- Default value functions ---

fn default_mem_limit() -> f64 {
    40.0
}

fn default_aggr_cnt() -> i32 {
    8
}

fn default_card_medium() -> i64 {
    50
}

fn default_card_hevy() -> i64 {
    1000
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(600)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_url: String::new(),
            token: String::new(),
            org: String::new(),
            stats_bucket: String::new(),
            bw_bucket: String::new(),
            ds_collections: String::new(),
            mem_limit: default_mem_limit(),
            aggr_cnt: default_aggr_cnt(),
            card_medium: default_card_medium(),
            card_hevy: default_card_hevy(),
            http_timeout: default_http_timeout(),
        }
    }
}

impl Config {
    /// Resolve the config file path from the environment.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if env_set("IDBDS_TESTDB") {
            return PathBuf::from(TESTDB_CONF);
        }
        if let Some(p) = env_get("IDBDS_CONF") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONF)
    }

    /// Load configuration from a file, apply environment overrides, and
    /// validate.
    pub fn load(path: &Path) -> Result<Config> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.apply_env(|name| env_get(name))?;
        cfg.normalize();
        cfg.validate()?;

        Ok(cfg)
    }

    /// Apply `IDBDS_*` overrides from the given lookup.
    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = get("IDBDS_DBURL") {
            self.db_url = v;
        }
        if let Some(v) = get("IDBDS_TOKEN") {
            self.token = v;
        }
        if let Some(v) = get("IDBDS_ORG") {
            self.org = v;
        }
        if let Some(v) = get("IDBDS_STATSBUCKET") {
            self.stats_bucket = v;
        }
        if let Some(v) = get("IDBDS_BWBUCKET") {
            self.bw_bucket = v;
        }
        if let Some(v) = get("IDBDS_DSCOLLECTIONS") {
            self.ds_collections = v;
        }
        if let Some(v) = get("IDBDS_MEMLIMIT") {
            self.mem_limit = v.parse().context("parsing IDBDS_MEMLIMIT")?;
        }
        if let Some(v) = get("IDBDS_AGGRCNT") {
            self.aggr_cnt = v.parse().context("parsing IDBDS_AGGRCNT")?;
        }
        if let Some(v) = get("IDBDS_CARDMEDIUM") {
            self.card_medium = v.parse().context("parsing IDBDS_CARDMEDIUM")?;
        }
        if let Some(v) = get("IDBDS_CARDHEVY") {
            self.card_hevy = v.parse().context("parsing IDBDS_CARDHEVY")?;
        }
        Ok(())
    }

    /// Replace non-positive tunables with their defaults. Zero in the file
    /// means "unset", matching the original deployment's semantics.
    fn normalize(&mut self) {
        if self.mem_limit <= 0.0 {
            self.mem_limit = default_mem_limit();
        }
        if self.aggr_cnt <= 0 {
            self.aggr_cnt = default_aggr_cnt();
        }
        if self.card_medium <= 0 {
            self.card_medium = default_card_medium();
        }
        if self.card_hevy <= 0 {
            self.card_hevy = default_card_hevy();
        }
    }

    /// Check the fields every run needs.
    pub fn validate(&self) -> Result<()> {
        if self.db_url.is_empty() {
            bail!("db_url is required");
        }
        if self.token.is_empty() {
            bail!("token is required");
        }
        if self.org.is_empty() {
            bail!("org is required");
        }
        if self.stats_bucket.is_empty() {
            bail!("stats_bucket is required");
        }
        Ok(())
    }

    /// Parse the configured collection list. Empty input is an error: a
    /// downsampler with nothing to downsample is misconfigured.
    pub fn collections(&self) -> Result<Vec<Collection>> {
        let names: Vec<&str> = self
            .ds_collections
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        if names.is_empty() {
            bail!("no collections for downsampling provided");
        }

        names.iter().map(|n| n.parse()).collect()
    }
}

/// Whether debug logging is forced via the environment.
pub fn debug_enabled() -> bool {
    env_set("IDBDS_DEBUG")
}

fn env_get(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_set(name: &str) -> bool {
    env_get(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            db_url: "http://localhost:8086".to_string(),
            token: "t0ken".to_string(),
            org: "acme".to_string(),
            stats_bucket: "monitoring".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.mem_limit, 40.0);
        assert_eq!(cfg.aggr_cnt, 8);
        assert_eq!(cfg.card_medium, 50);
        assert_eq!(cfg.card_hevy, 1000);
        assert_eq!(cfg.http_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_parse_yaml_with_defaults() {
        let cfg: Config = serde_yaml::from_str(
            "db_url: http://db:8086\ntoken: abc\norg: acme\nstats_bucket: monitoring\n",
        )
        .expect("parse");
        assert_eq!(cfg.db_url, "http://db:8086");
        assert_eq!(cfg.mem_limit, 40.0);
        assert_eq!(cfg.card_hevy, 1000);
    }

    #[test]
    fn test_parse_http_timeout() {
        let cfg: Config = serde_yaml::from_str("http_timeout: 30s\n").expect("parse");
        assert_eq!(cfg.http_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = minimal();
        cfg.apply_env(|name| match name {
            "IDBDS_DBURL" => Some("http://other:8086".to_string()),
            "IDBDS_MEMLIMIT" => Some("55.5".to_string()),
            "IDBDS_CARDHEVY" => Some("2000".to_string()),
            _ => None,
        })
        .expect("apply");

        assert_eq!(cfg.db_url, "http://other:8086");
        assert_eq!(cfg.mem_limit, 55.5);
        assert_eq!(cfg.card_hevy, 2000);
        // Untouched fields keep their values.
        assert_eq!(cfg.org, "acme");
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut cfg = minimal();
        let err = cfg
            .apply_env(|name| (name == "IDBDS_AGGRCNT").then(|| "eight".to_string()))
            .expect_err("should fail");
        assert!(err.to_string().contains("IDBDS_AGGRCNT"));
    }

    #[test]
    fn test_normalize_restores_defaults() {
        let mut cfg = minimal();
        cfg.mem_limit = 0.0;
        cfg.aggr_cnt = -1;
        cfg.normalize();
        assert_eq!(cfg.mem_limit, 40.0);
        assert_eq!(cfg.aggr_cnt, 8);
    }

    #[test]
    fn test_validate_missing_fields() {
        let mut cfg = minimal();
        cfg.token = String::new();
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("token"));

        let cfg = Config::default();
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("db_url"));
    }

    #[test]
    fn test_collections_parsing() {
        let mut cfg = minimal();
        cfg.ds_collections = "iftraffic, icingachk".to_string();
        let cols = cfg.collections().expect("parse");
        assert_eq!(cols, vec![Collection::IfTraffic, Collection::IcingaChk]);
    }

    #[test]
    fn test_collections_empty_rejected() {
        let cfg = minimal();
        let err = cfg.collections().expect_err("should fail");
        assert!(err.to_string().contains("no collections"));
    }

    #[test]
    fn test_collections_unknown_rejected() {
        let mut cfg = minimal();
        cfg.ds_collections = "iftraffic,cpuload".to_string();
        let err = cfg.collections().expect_err("should fail");
        assert!(err.to_string().contains("unknown collection"));
    }
}
