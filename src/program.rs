//! Flux program construction for one downsampling step.
//!
//! Given (collection, source tier, target tier, window, instance) the
//! builder renders the program the TSDB executes server-side: bind the
//! source rows, derive per-collection sub-projections, aggregate each and
//! write the results into the target bucket tagged with an `aggregate`
//! label. Rendering is a pure function of its inputs, so identical inputs
//! produce byte-identical programs.

use chrono::{DateTime, Utc};

use crate::bucket::Bucket;
use crate::collection::Collection;

/// A named sub-projection of the bound source rows.
struct Projection {
    name: &'static str,
    /// Projection this one chains off; `None` binds to `allData`.
    from: Option<&'static str>,
    op: ProjectionOp,
}

enum ProjectionOp {
    /// Filter on `r._field` with the given predicate body.
    FieldFilter(&'static str),
    /// Per-second non-negative derivative of the upstream rows.
    Derivative,
}

/// One aggregate-and-write pipeline into the target bucket.
struct Write {
    /// Projection feeding the write; `None` reads `allData` directly.
    from: Option<&'static str>,
    /// Re-aggregation filter on the stored `aggregate` label.
    aggregate_filter: Option<&'static str>,
    /// Aggregation function (`last`, `max`, `min`, `mean`).
    func: &'static str,
    /// Suffix appended to `_field` (derivative extrema keep their own
    /// series next to the raw counters).
    field_suffix: Option<&'static str>,
    /// Value for the `aggregate` tag on written rows.
    set_aggregate: Option<&'static str>,
}

/// The full aggregation recipe for one (collection, tier-role) pair.
struct Recipe {
    projections: &'static [Projection],
    writes: &'static [Write],
}

// ---------------------------------------------------------------------------
// Per-collection recipes
// ---------------------------------------------------------------------------

const IFSTATS_HEAD: Recipe = Recipe {
    projections: &[
        Projection {
            name: "toCounterData",
            from: None,
            op: ProjectionOp::FieldFilter(r"r._field =~ /^if(?:HC)*(?:In|Out)/"),
        },
        Projection {
            name: "toCountPsData",
            from: Some("toCounterData"),
            op: ProjectionOp::Derivative,
        },
        Projection {
            name: "toMaxData",
            from: None,
            op: ProjectionOp::FieldFilter(r"r._field =~ /^(?:ifAdminStatus|ifOperStatus)$/"),
        },
    ],
    writes: &[
        Write {
            from: Some("toCounterData"),
            aggregate_filter: None,
            func: "last",
            field_suffix: None,
            set_aggregate: Some("last"),
        },
        Write {
            from: Some("toCountPsData"),
            aggregate_filter: None,
            func: "max",
            field_suffix: Some("Max"),
            set_aggregate: Some("max"),
        },
        Write {
            from: Some("toCountPsData"),
            aggregate_filter: None,
            func: "min",
            field_suffix: Some("Min"),
            set_aggregate: Some("min"),
        },
        Write {
            from: Some("toMaxData"),
            aggregate_filter: None,
            func: "max",
            field_suffix: None,
            set_aggregate: Some("max"),
        },
    ],
};

const IFTRAFFIC_HEAD: Recipe = Recipe {
    projections: &[
        Projection {
            name: "toCounterData",
            from: None,
            op: ProjectionOp::FieldFilter(
                r#"r._field == "ifHCInOctets" or r._field == "ifHCOutOctets""#,
            ),
        },
        Projection {
            name: "toCountPsData",
            from: Some("toCounterData"),
            op: ProjectionOp::Derivative,
        },
        Projection {
            name: "toMaxData",
            from: None,
            op: ProjectionOp::FieldFilter(r#"r._field == "ifOperStatus""#),
        },
    ],
    writes: IFSTATS_HEAD.writes,
};

/// Counter-style re-aggregation: max/min/last subsets carry straight over.
const COUNTER_TIER: Recipe = Recipe {
    projections: &[],
    writes: &[
        Write {
            from: None,
            aggregate_filter: Some("max"),
            func: "max",
            field_suffix: None,
            set_aggregate: None,
        },
        Write {
            from: None,
            aggregate_filter: Some("min"),
            func: "min",
            field_suffix: None,
            set_aggregate: None,
        },
        Write {
            from: None,
            aggregate_filter: Some("last"),
            func: "last",
            field_suffix: None,
            set_aggregate: None,
        },
    ],
};

const GENGAUGE_HEAD: Recipe = Recipe {
    projections: &[],
    writes: &[
        Write {
            from: None,
            aggregate_filter: None,
            func: "mean",
            field_suffix: None,
            set_aggregate: Some("mean"),
        },
        Write {
            from: None,
            aggregate_filter: None,
            func: "max",
            field_suffix: Some("Max"),
            set_aggregate: Some("max"),
        },
        Write {
            from: None,
            aggregate_filter: None,
            func: "min",
            field_suffix: Some("Min"),
            set_aggregate: Some("min"),
        },
    ],
};

const GENGAUGE_TIER: Recipe = Recipe {
    projections: &[],
    writes: &[
        Write {
            from: None,
            aggregate_filter: Some("mean"),
            func: "mean",
            field_suffix: None,
            set_aggregate: None,
        },
        Write {
            from: None,
            aggregate_filter: Some("max"),
            func: "max",
            field_suffix: None,
            set_aggregate: None,
        },
        Write {
            from: None,
            aggregate_filter: Some("min"),
            func: "min",
            field_suffix: None,
            set_aggregate: None,
        },
    ],
};

const GENCOUNTER_HEAD: Recipe = Recipe {
    projections: &[Projection {
        name: "toCountPsData",
        from: None,
        op: ProjectionOp::Derivative,
    }],
    writes: &[
        Write {
            from: None,
            aggregate_filter: None,
            func: "last",
            field_suffix: None,
            set_aggregate: Some("last"),
        },
        Write {
            from: Some("toCountPsData"),
            aggregate_filter: None,
            func: "max",
            field_suffix: Some("Max"),
            set_aggregate: Some("max"),
        },
        Write {
            from: Some("toCountPsData"),
            aggregate_filter: None,
            func: "min",
            field_suffix: Some("Min"),
            set_aggregate: Some("min"),
        },
    ],
};

const ICINGACHK_HEAD: Recipe = Recipe {
    projections: &[
        Projection {
            name: "toMeanData",
            from: None,
            op: ProjectionOp::FieldFilter(r"r._field =~ /^value$/"),
        },
        Projection {
            name: "toLastData",
            from: None,
            op: ProjectionOp::FieldFilter(r"r._field =~ /^(crit|min|max|warn|unit)$/"),
        },
    ],
    writes: &[
        Write {
            from: Some("toMeanData"),
            aggregate_filter: None,
            func: "mean",
            field_suffix: None,
            set_aggregate: Some("mean"),
        },
        Write {
            from: Some("toMeanData"),
            aggregate_filter: None,
            func: "min",
            field_suffix: None,
            set_aggregate: Some("min"),
        },
        Write {
            from: Some("toMeanData"),
            aggregate_filter: None,
            func: "max",
            field_suffix: None,
            set_aggregate: Some("max"),
        },
        Write {
            from: Some("toLastData"),
            aggregate_filter: None,
            func: "last",
            field_suffix: None,
            set_aggregate: Some("last"),
        },
    ],
};

const ICINGACHK_TIER: Recipe = Recipe {
    projections: &[
        Projection {
            name: "toMeanData",
            from: None,
            op: ProjectionOp::FieldFilter(r"r._field =~ /^(value|execution_time|latency)$/"),
        },
        Projection {
            name: "toLastData",
            from: None,
            op: ProjectionOp::FieldFilter(
                r"r._field =~ /^(reachable|acknowledgement|crit|downtime_depth|min|max|warn|unit)$/",
            ),
        },
    ],
    writes: &[
        Write {
            from: Some("toMeanData"),
            aggregate_filter: Some("mean"),
            func: "mean",
            field_suffix: None,
            set_aggregate: Some("mean"),
        },
        Write {
            from: Some("toMeanData"),
            aggregate_filter: Some("min"),
            func: "min",
            field_suffix: None,
            set_aggregate: Some("min"),
        },
        Write {
            from: Some("toMeanData"),
            aggregate_filter: Some("max"),
            func: "max",
            field_suffix: None,
            set_aggregate: Some("max"),
        },
        Write {
            from: Some("toLastData"),
            aggregate_filter: Some("last"),
            func: "last",
            field_suffix: None,
            set_aggregate: Some("last"),
        },
    ],
};

/// Check-result fields never carried past the head tier.
const ICINGACHK_HEAD_EXCLUDE: &str = "current_attempt|max_check_attempts|state|state_type|execution_time|latency|reachable|acknowledgement|downtime_depth";

/// Fields excluded on later tiers (mean/last targets widen there).
const ICINGACHK_TIER_EXCLUDE: &str = "current_attempt|max_check_attempts|state|state_type";

fn recipe(collection: Collection, source_is_head: bool) -> &'static Recipe {
    match (collection, source_is_head) {
        (Collection::IfStats, true) => &IFSTATS_HEAD,
        (Collection::IfTraffic, true) => &IFTRAFFIC_HEAD,
        (Collection::IfStats | Collection::IfTraffic | Collection::GenCounter, false) => {
            &COUNTER_TIER
        }
        (Collection::GenGauge, true) => &GENGAUGE_HEAD,
        (Collection::GenGauge, false) => &GENGAUGE_TIER,
        (Collection::GenCounter, true) => &GENCOUNTER_HEAD,
        (Collection::IcingaChk, true) => &ICINGACHK_HEAD,
        (Collection::IcingaChk, false) => &ICINGACHK_TIER,
    }
}

/// Predicate binding `allData` to the collection's rows for one instance.
fn all_data_filter(collection: Collection, instance: &str, source_is_head: bool) -> String {
    match collection {
        Collection::IcingaChk => {
            let exclude = if source_is_head {
                ICINGACHK_HEAD_EXCLUDE
            } else {
                ICINGACHK_TIER_EXCLUDE
            };
            format!(r#"r["hostname"] == "{instance}" and r._field !~ /^({exclude})$/"#)
        }
        _ => format!(
            r#"r._measurement == "{collection}" and r["agent_name"] == "{instance}""#
        ),
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render the downsampling program for one chunk.
///
/// `source_is_head` selects the head recipe (derivatives, field suffixes)
/// versus the re-aggregation recipe keyed on the stored `aggregate` label.
/// The window is `[start, stop)` in Unix seconds.
pub fn build_program(
    collection: Collection,
    source: &Bucket,
    target: &Bucket,
    source_is_head: bool,
    instance: &str,
    start: DateTime<Utc>,
    stop: DateTime<Utc>,
    org: &str,
) -> String {
    let r = recipe(collection, source_is_head);
    let every = target.flux_interval();
    let mut out = String::with_capacity(2048);

    out.push_str(&format!(
        "allData =\n    from(bucket: \"{src}\")\n        |> range(start: {start}, stop: {stop})\n        |> filter(fn: (r) => {filter})\n",
        src = source.name,
        start = start.timestamp(),
        stop = stop.timestamp(),
        filter = all_data_filter(collection, instance, source_is_head),
    ));

    for p in r.projections {
        let from = p.from.unwrap_or("allData");
        out.push('\n');
        out.push_str(&format!("{} =\n    {}\n", p.name, from));
        match &p.op {
            ProjectionOp::FieldFilter(pred) => {
                out.push_str(&format!("        |> filter(fn: (r) => {pred})\n"));
            }
            ProjectionOp::Derivative => {
                out.push_str(
                    "        |> derivative(unit: 1s, nonNegative: true, columns: [\"_value\"], timeColumn: \"_time\")\n",
                );
            }
        }
    }

    for w in r.writes {
        out.push('\n');
        out.push_str(w.from.unwrap_or("allData"));
        out.push('\n');
        if let Some(label) = w.aggregate_filter {
            out.push_str(&format!(
                "    |> filter(fn: (r) => r[\"aggregate\"] == \"{label}\")\n"
            ));
        }
        out.push_str(&format!(
            "    |> aggregateWindow(every: {every}, fn: {func}, createEmpty: false)\n",
            func = w.func,
        ));
        if let Some(suffix) = w.field_suffix {
            out.push_str(&format!(
                "    |> map(fn: (r) => ({{r with _field: r._field + \"{suffix}\"}}))\n"
            ));
        }
        if let Some(label) = w.set_aggregate {
            out.push_str(&format!(
                "    |> set(key: \"aggregate\", value: \"{label}\")\n"
            ));
        }
        out.push_str(&format!(
            "    |> to(org: \"{org}\", bucket: \"{tgt}\")\n",
            tgt = target.name,
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::bucket::BucketChain;

    fn telegraf_chain() -> BucketChain {
        BucketChain::for_collection(Collection::IfTraffic)
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).single().expect("ts");
        (start, start + Duration::minutes(640))
    }

    fn build(collection: Collection, tier: usize, head: bool) -> String {
        let chain = match collection {
            Collection::IcingaChk => BucketChain::for_collection(Collection::IcingaChk),
            _ => telegraf_chain(),
        };
        let source = chain.source_of(tier).expect("source tier");
        let target = chain.get(tier).expect("target tier");
        let (start, stop) = window();
        build_program(collection, source, target, head, "r1", start, stop, "acme")
    }

    #[test]
    fn test_deterministic_output() {
        let a = build(Collection::GenGauge, 1, true);
        let b = build(Collection::GenGauge, 1, true);
        assert_eq!(a, b);
    }

    #[test]
    fn test_gengauge_head_writes() {
        let p = build(Collection::GenGauge, 1, true);

        assert!(p.contains(r#"from(bucket: "telegraf/2d")"#));
        assert_eq!(p.matches(r#"|> to(org: "acme", bucket: "telegraf/7d")"#).count(), 3);
        assert!(p.contains(r#"|> set(key: "aggregate", value: "mean")"#));
        assert!(p.contains(r#"_field: r._field + "Max""#));
        assert!(p.contains(r#"_field: r._field + "Min""#));
        assert!(p.contains("aggregateWindow(every: 8m, fn: mean, createEmpty: false)"));
        assert!(!p.contains("derivative"));
    }

    #[test]
    fn test_iftraffic_head_derivative_and_suffixes() {
        let p = build(Collection::IfTraffic, 1, true);

        assert!(p.contains(r#"r._measurement == "iftraffic" and r["agent_name"] == "r1""#));
        assert!(p.contains(r#"r._field == "ifHCInOctets" or r._field == "ifHCOutOctets""#));
        assert_eq!(p.matches("derivative(unit: 1s, nonNegative: true").count(), 1);
        assert_eq!(p.matches("|> to(").count(), 4);
        // Raw counters keep their field names; derivative extrema are suffixed.
        assert!(p.contains(r#"|> set(key: "aggregate", value: "last")"#));
        assert!(p.contains(r#"_field: r._field + "Max""#));
    }

    #[test]
    fn test_iftraffic_tier_reaggregates_by_label() {
        let p = build(Collection::IfTraffic, 2, false);

        assert!(p.contains(r#"from(bucket: "telegraf/7d")"#));
        assert!(p.contains(r#"|> filter(fn: (r) => r["aggregate"] == "max")"#));
        assert!(p.contains(r#"|> filter(fn: (r) => r["aggregate"] == "min")"#));
        assert!(p.contains(r#"|> filter(fn: (r) => r["aggregate"] == "last")"#));
        assert_eq!(p.matches("|> to(").count(), 3);
        assert!(!p.contains("derivative"));
        assert!(!p.contains("|> set("));
        assert!(p.contains("aggregateWindow(every: 30m, fn: max, createEmpty: false)"));
    }

    #[test]
    fn test_ifstats_head_counter_regex() {
        let p = build(Collection::IfStats, 1, true);

        assert!(p.contains(r"r._field =~ /^if(?:HC)*(?:In|Out)/"));
        assert!(p.contains(r"r._field =~ /^(?:ifAdminStatus|ifOperStatus)$/"));
        assert_eq!(p.matches("|> to(").count(), 4);
    }

    #[test]
    fn test_gencounter_head_derives_all_fields() {
        let p = build(Collection::GenCounter, 1, true);

        // Raw last write reads allData directly.
        assert!(p.contains("\nallData\n    |> aggregateWindow(every: 8m, fn: last"));
        assert_eq!(p.matches("derivative(").count(), 1);
        assert_eq!(p.matches("|> to(").count(), 3);
    }

    #[test]
    fn test_gencounter_tier_matches_counter_recipe() {
        let a = build(Collection::GenCounter, 2, false);
        let b = build(Collection::IfStats, 2, false);
        // Same re-aggregation shape; the binding filter differs.
        assert!(a.contains(r#"r._measurement == "gencounter""#));
        assert!(b.contains(r#"r._measurement == "ifstats""#));
        assert_eq!(
            a.replace("gencounter", "ifstats"),
            b,
        );
    }

    #[test]
    fn test_icingachk_head_excludes_and_writes() {
        let p = build(Collection::IcingaChk, 1, true);

        assert!(p.contains(r#"from(bucket: "icinga2/one_week")"#));
        assert!(p.contains(r#"r["hostname"] == "r1""#));
        assert!(p.contains("current_attempt|max_check_attempts|state|state_type|execution_time"));
        assert!(p.contains(r"r._field =~ /^value$/"));
        assert!(p.contains(r"r._field =~ /^(crit|min|max|warn|unit)$/"));
        assert_eq!(p.matches("|> to(").count(), 4);
        assert!(!p.contains("_measurement =="));
    }

    #[test]
    fn test_icingachk_tier_widens_targets() {
        let p = build(Collection::IcingaChk, 2, false);

        assert!(p.contains(r"r._field !~ /^(current_attempt|max_check_attempts|state|state_type)$/"));
        assert!(p.contains(r"r._field =~ /^(value|execution_time|latency)$/"));
        assert!(p.contains("reachable|acknowledgement|crit|downtime_depth|min|max|warn|unit"));
        // Re-aggregation keeps the label on rewritten rows.
        assert!(p.contains(r#"|> filter(fn: (r) => r["aggregate"] == "mean")"#));
        assert!(p.contains(r#"|> set(key: "aggregate", value: "mean")"#));
        assert_eq!(p.matches("|> to(").count(), 4);
    }

    #[test]
    fn test_window_rendered_as_unix_seconds() {
        let (start, stop) = window();
        let p = build(Collection::GenGauge, 1, true);
        assert!(p.contains(&format!(
            "range(start: {}, stop: {})",
            start.timestamp(),
            stop.timestamp()
        )));
    }
}
