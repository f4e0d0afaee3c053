//! Bandwidth-utilization histogram program.
//!
//! For one instance, the program reads yesterday's interface counters from
//! the head bucket, converts octet counters to bit rates, buckets
//! utilization (rate / ifHighSpeed) into deciles, and writes one `bwutil`
//! row per (interface, direction) whose fields `"0-10"`..`"90-100"` hold
//! the percentage of time spent in each decile. Only ethernet interfaces
//! (`ifType == "6"`) are considered.

use anyhow::{Context, Result};
use tracing::debug;

use crate::bucket::Bucket;
use crate::db::Gateway;

/// Calculate and store yesterday's bandwidth usage for one instance,
/// unless a `bwutil` point already landed within the last 24h.
pub async fn store_bw_usage<G: Gateway>(
    gw: &G,
    instance: &str,
    head: &Bucket,
    bw_bucket: &str,
    org: &str,
) -> Result<()> {
    let present = gw
        .is_bw_done(instance)
        .await
        .context("checking bandwidth data presence")?;

    if present {
        debug!(instance, "bandwidth data for yesterday already present");
        return Ok(());
    }

    let program = build_bw_program(instance, head, bw_bucket, org);
    debug!(instance, "bandwidth program:\n{program}");

    gw.execute(&program).await.context("storing bandwidth data")
}

/// Render the bandwidth-utilization program for one instance.
///
/// `head` is the raw-ingest bucket holding `ifstats`; `bw_bucket` receives
/// the histogram rows.
pub fn build_bw_program(instance: &str, head: &Bucket, bw_bucket: &str, org: &str) -> String {
    format!(
        r#"import "math"
import "influxdata/influxdb/schema"
import "experimental/date/boundaries"
import "contrib/tomhollingworth/events"

yesterday = boundaries.yesterday()

percToNextTen = (in, hundred) => {{
  perc = in / hundred * 100.0
  return uint(v: math.ceil(x: perc / 10.0) * 10.0)
}}

setvalue = (v) => {{
  r = if exists v then float(v) else 0.0
  return r
}}

allData = from(bucket: "{head}")
  |> range(start: yesterday.start, stop: yesterday.stop)
  |> filter(fn: (r) => r["_measurement"] == "ifstats")
  |> filter(fn: (r) => r["agent_name"] == "{instance}")
  |> filter(fn: (r) => r["ifType"] == "6")

counterData = allData
  |> filter(fn: (r) => r._field == "ifHCOutOctets" or r._field == "ifHCInOctets")
  |> derivative(unit: 1s, nonNegative: true, columns: ["_value"], timeColumn: "_time")
  |> map(fn: (r) => ({{r with _value: r._value * 8.0}}))

ifSpeed = allData
  |> filter(fn: (r) => r._field == "ifHighSpeed")
  |> map(fn: (r) => ({{r with _value: float(v: r._value) * 1000000.0}}))

fulltable = union(tables: [counterData, ifSpeed])
  |> filter(fn: (r) => r._value > 0)
  |> schema.fieldsAsCols()

otable = fulltable
  |> filter(fn: (r) => r["ifHCOutOctets"] <= r["ifHighSpeed"])
  |> set(key: "direction", value: "out")
  |> map(
    fn: (r) => ({{r with util: percToNextTen(in: r["ifHCOutOctets"], hundred: r["ifHighSpeed"])}}),
  )
  |> events.duration(unit: 1s, columnName: "duration")

itable = fulltable
  |> filter(fn: (r) => r["ifHCInOctets"] <= r["ifHighSpeed"])
  |> set(key: "direction", value: "in")
  |> map(
    fn: (r) => ({{r with util: percToNextTen(in: r["ifHCInOctets"], hundred: r["ifHighSpeed"])}}),
  )
  |> events.duration(unit: 1s, columnName: "duration")

union(tables: [otable, itable])
  |> group(columns: ["agent_host", "agent_name", "util", "direction", "ifDescr", "ifName", "index"])
  |> sum(column: "duration")
  |> map(
    fn: (r) => ({{r with _time: yesterday.stop}}),
  )
  |> pivot(rowKey: ["_time"], columnKey: ["util"], valueColumn: "duration")
  |> group()
  |> map(
    fn: (r) => ({{r with totaltime: setvalue(v: r["10"]) + setvalue(v: r["20"]) + setvalue(v: r["30"]) + setvalue(v: r["40"]) + setvalue(v: r["50"]) + setvalue(v: r["60"]) + setvalue(v: r["70"]) + setvalue(v: r["80"]) + setvalue(v: r["90"]) + setvalue(v: r["100"])}})
  )
  |> map(
    fn: (r) => ({{_time: r._time, _measurement: r._measurement, agent_host: r.agent_host, agent_name: r.agent_name, ifDescr: r.ifDescr, ifName: r.ifName, index: r.index, direction: r.direction,
    "0-10": (setvalue(v: r["10"]) * 100.0 / r.totaltime),
    "10-20": (setvalue(v: r["20"]) * 100.0 / r.totaltime),
    "20-30": (setvalue(v: r["30"]) * 100.0 / r.totaltime),
    "30-40": (setvalue(v: r["40"]) * 100.0 / r.totaltime),
    "40-50": (setvalue(v: r["50"]) * 100.0 / r.totaltime),
    "50-60": (setvalue(v: r["60"]) * 100.0 / r.totaltime),
    "60-70": (setvalue(v: r["70"]) * 100.0 / r.totaltime),
    "70-80": (setvalue(v: r["80"]) * 100.0 / r.totaltime),
    "80-90": (setvalue(v: r["90"]) * 100.0 / r.totaltime),
    "90-100": (setvalue(v: r["100"]) * 100.0 / r.totaltime),
    }})
  )
  |> map(
    fn: (r) => ({{r with maxutil:
      if r["90-100"] > 0 then "90-100"
      else if r["80-90"] > 0 then "80-90"
      else if r["70-80"] > 0 then "70-80"
      else if r["60-70"] > 0 then "60-70"
      else if r["50-60"] > 0 then "50-60"
      else if r["40-50"] > 0 then "40-50"
      else if r["30-40"] > 0 then "30-40"
      else if r["20-30"] > 0 then "20-30"
      else if r["10-20"] > 0 then "10-20"
      else "0-10"
      }})
  )
  |> set(key: "_measurement", value: "bwutil")
  |> to(
    org: "{org}",
    bucket: "{bw_bucket}",
    fieldFn: (r) => ({{
      "0-10": r["0-10"],
      "10-20": r["10-20"],
      "20-30": r["20-30"],
      "30-40": r["30-40"],
      "40-50": r["40-50"],
      "50-60": r["50-60"],
      "60-70": r["60-70"],
      "70-80": r["70-80"],
      "80-90": r["80-90"],
      "90-100": r["90-100"],
    }})
  )"#,
        head = head.name,
    )
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn head() -> Bucket {
        Bucket::new("telegraf/2d", Duration::minutes(2), Duration::hours(48))
    }

    #[test]
    fn test_program_targets_and_instance() {
        let p = build_bw_program("sw1", &head(), "telegraf/bw", "acme");

        assert!(p.contains(r#"from(bucket: "telegraf/2d")"#));
        assert!(p.contains(r#"r["agent_name"] == "sw1""#));
        assert!(p.contains(r#"bucket: "telegraf/bw""#));
        assert!(p.contains(r#"org: "acme""#));
        assert!(p.contains(r#"set(key: "_measurement", value: "bwutil")"#));
    }

    #[test]
    fn test_only_ethernet_interfaces() {
        let p = build_bw_program("sw1", &head(), "telegraf/bw", "acme");
        assert!(p.contains(r#"r["ifType"] == "6""#));
    }

    #[test]
    fn test_decile_fields_present() {
        let p = build_bw_program("sw1", &head(), "telegraf/bw", "acme");
        for decile in [
            "0-10", "10-20", "20-30", "30-40", "40-50", "50-60", "60-70", "70-80", "80-90",
            "90-100",
        ] {
            assert!(
                p.contains(&format!(r#""{decile}": r["{decile}"]"#)),
                "missing field {decile}"
            );
        }
        assert!(p.contains("maxutil"));
    }

    #[test]
    fn test_rate_and_capacity_scaling() {
        let p = build_bw_program("sw1", &head(), "telegraf/bw", "acme");
        // Octet counters become bit rates; ifHighSpeed (Mb/s) becomes bits.
        assert!(p.contains("r._value * 8.0"));
        assert!(p.contains("float(v: r._value) * 1000000.0"));
        assert!(p.contains("derivative(unit: 1s, nonNegative: true"));
    }

    #[test]
    fn test_deterministic_output() {
        let a = build_bw_program("sw1", &head(), "telegraf/bw", "acme");
        let b = build_bw_program("sw1", &head(), "telegraf/bw", "acme");
        assert_eq!(a, b);
    }
}
