//! Typed facade over the InfluxDB v2 HTTP query API.
//!
//! The gateway issues declarative Flux programs and extracts scalar or row
//! results; it holds no mutable policy and is safe to share across workers.
//! The [`Gateway`] trait captures the operations the tier walker and the
//! scheduler need, so tests can substitute an in-memory implementation.

pub mod csv;

use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::bucket::Bucket;
use crate::collection::Collection;
use crate::config::Config;

/// How far back the health probes look for a self-metrics point.
const HEALTH_PROBE_RANGE: &str = "-15s";

/// Window for the server-side cardinality probe.
const CARDINALITY_RANGE: &str = "-28d";

/// Instance discovery looks at the last `RECENCY_INTERVALS` aggregation
/// intervals of the head bucket.
const RECENCY_INTERVALS: i32 = 10;

/// Operations the orchestration engine performs against the TSDB.
pub trait Gateway: Send + Sync {
    /// Last "active task executor runs" gauge within the probe range.
    /// Absence of a point is `None`, not an error.
    fn running_tasks(&self) -> impl std::future::Future<Output = Result<Option<f64>>> + Send;

    /// Last ratio of allocated to system bytes, in percent.
    fn memory_used_pct(&self) -> impl std::future::Future<Output = Result<Option<f64>>> + Send;

    /// Server-side series cardinality for one instance in a bucket.
    fn cardinality(
        &self,
        bucket: &Bucket,
        tag: &str,
        instance: &str,
    ) -> impl std::future::Future<Output = Result<i64>> + Send;

    /// Distinct instance-tag values seen recently in a bucket.
    fn instances(
        &self,
        bucket: &Bucket,
        collection: Collection,
    ) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;

    /// Timestamp of the last primary-field point for (bucket, instance).
    /// `source` is the bucket feeding this one (`None` for the head tier);
    /// it bounds the scan and selects the per-tier frontier filter. When no
    /// point matches, the result is `now - retention` of the probed bucket.
    fn last_timestamp(
        &self,
        bucket: &Bucket,
        source: Option<&Bucket>,
        instance: &str,
        collection: Collection,
    ) -> impl std::future::Future<Output = Result<DateTime<Utc>>> + Send;

    /// Whether a `bwutil` point exists for the instance within the last 24h.
    fn is_bw_done(&self, instance: &str)
        -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Submit a raw Flux program; only the error status is consumed.
    fn execute(&self, program: &str) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// HTTP gateway to an InfluxDB 2.x server.
pub struct Influx {
    http: reqwest::Client,
    url: String,
    token: String,
    org: String,
    stats_bucket: String,
    bw_bucket: String,
}

impl Influx {
    /// Build the gateway from configuration. The HTTP client carries the
    /// per-request timeout; everything else is immutable after construction.
    pub fn new(cfg: &Config) -> Result<Influx> {
        let timeout = if cfg.http_timeout.is_zero() {
            StdDuration::from_secs(600)
        } else {
            cfg.http_timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Influx {
            http,
            url: cfg.db_url.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
            org: cfg.org.clone(),
            stats_bucket: cfg.stats_bucket.clone(),
            bw_bucket: cfg.bw_bucket.clone(),
        })
    }

    /// POST a Flux program to the query endpoint and return the CSV body.
    async fn query(&self, flux: &str) -> Result<String> {
        let url = format!("{}/api/v2/query", self.url);

        let response = self
            .http
            .post(&url)
            .query(&[("org", self.org.as_str())])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "application/vnd.flux")
            .header("Accept", "application/csv")
            .body(flux.to_string())
            .send()
            .await
            .context("sending query request")?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            bail!("unexpected status {status} from query API: {body}");
        }

        Ok(body)
    }
}

impl Gateway for Influx {
    async fn running_tasks(&self) -> Result<Option<f64>> {
        let q = format!(
            r#"from(bucket: "{sb}")
  |> range(start: {range})
  |> filter(fn: (r) => r["_measurement"] == "task_executor_total_runs_active" and r._field == "gauge")
  |> last()"#,
            sb = self.stats_bucket,
            range = HEALTH_PROBE_RANGE,
        );

        let body = self.query(&q).await.context("querying running tasks")?;
        csv::last_value_f64(&body).context("decoding running tasks")
    }

    async fn memory_used_pct(&self) -> Result<Option<f64>> {
        let q = format!(
            r#"bytes_used = from(bucket: "{sb}")
  |> range(start: {range})
  |> filter(fn: (r) => r._measurement == "go_memstats_alloc_bytes" and r._field == "gauge")
  |> last()

total_bytes = from(bucket: "{sb}")
  |> range(start: {range})
  |> filter(fn: (r) => r._measurement == "go_memstats_sys_bytes" and r._field == "gauge")
  |> last()

join(tables: {{key1: bytes_used, key2: total_bytes}}, on: ["_time", "_field"], method: "inner")
  |> map(fn: (r) => ({{
    _value: (float(v: r._value_key1) / float(v: r._value_key2)) * 100.0
  }}))"#,
            sb = self.stats_bucket,
            range = HEALTH_PROBE_RANGE,
        );

        let body = self.query(&q).await.context("querying memory usage")?;
        csv::last_value_f64(&body).context("decoding memory usage")
    }

    async fn cardinality(&self, bucket: &Bucket, tag: &str, instance: &str) -> Result<i64> {
        let q = format!(
            r#"import "influxdata/influxdb"
influxdb.cardinality(bucket: "{b}",
  start: {range},
  predicate: (r) => r["{tag}"] == "{instance}")"#,
            b = bucket.name,
            range = CARDINALITY_RANGE,
        );

        debug!(bucket = %bucket.name, instance, "cardinality query:\n{q}");

        let body = self
            .query(&q)
            .await
            .with_context(|| format!("querying cardinality of {instance} in {}", bucket.name))?;

        Ok(csv::last_value_i64(&body)
            .context("decoding cardinality")?
            .unwrap_or(0))
    }

    async fn instances(&self, bucket: &Bucket, collection: Collection) -> Result<Vec<String>> {
        let start = (Utc::now() - bucket.agg_interval * RECENCY_INTERVALS).timestamp();

        let q = if collection.uses_tag_values_lookup() {
            format!(
                r#"import "influxdata/influxdb/schema"
schema.measurementTagValues(
  bucket: "{b}",
  measurement: "{m}",
  tag: "{tag}",
  start: {start}
)"#,
                b = bucket.name,
                m = collection,
                tag = collection.instance_tag(),
            )
        } else {
            format!(
                r#"from(bucket: "{b}")
  |> range(start: {start})
  |> filter(fn: (r) => (r._measurement == "my-hostalive-icmp"
      or r._measurement == "my-hostalive-tcp"
      or r._measurement == "my-hostalive-http")
    and r._field == "value")
  |> keyValues(keyColumns: ["hostname"])
  |> keep(columns: ["_value"])
  |> unique()"#,
                b = bucket.name,
            )
        };

        debug!(bucket = %bucket.name, collection = %collection, "instances query:\n{q}");

        let body = self
            .query(&q)
            .await
            .with_context(|| format!("querying {collection} instances in {}", bucket.name))?;

        csv::values_string(&body).context("decoding instances")
    }

    async fn last_timestamp(
        &self,
        bucket: &Bucket,
        source: Option<&Bucket>,
        instance: &str,
        collection: Collection,
    ) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        // Missing data defaults to the earliest point this bucket can hold.
        let fallback = now - bucket.retention;
        let scan_start = now - source.map_or(bucket.retention, |s| s.retention);

        let q = format!(
            r#"from(bucket: "{b}")
  |> range(start: {start})
  |> filter(fn: (r) => {filter})
  |> group()
  |> last()
  |> keep(columns: ["_time"])"#,
            b = bucket.name,
            start = scan_start.timestamp(),
            filter = collection.frontier_filter(instance, source.is_none()),
        );

        debug!(bucket = %bucket.name, instance, "last timestamp query:\n{q}");

        let body = self
            .query(&q)
            .await
            .with_context(|| format!("querying last timestamp in {}", bucket.name))?;

        Ok(csv::last_time(&body)
            .context("decoding last timestamp")?
            .unwrap_or(fallback))
    }

    async fn is_bw_done(&self, instance: &str) -> Result<bool> {
        let start = (Utc::now() - Duration::hours(24)).timestamp();

        let q = format!(
            r#"from(bucket: "{b}")
  |> range(start: {start})
  |> filter(fn: (r) => r._measurement == "bwutil" and r["agent_name"] == "{instance}")
  |> group()
  |> last()
  |> keep(columns: ["_time"])"#,
            b = self.bw_bucket,
        );

        debug!(instance, "bandwidth presence query:\n{q}");

        let body = self
            .query(&q)
            .await
            .with_context(|| format!("querying bandwidth presence for {instance}"))?;

        Ok(csv::last_time(&body)
            .context("decoding bandwidth presence")?
            .is_some())
    }

    async fn execute(&self, program: &str) -> Result<()> {
        self.query(program).await.context("executing program")?;
        Ok(())
    }
}
