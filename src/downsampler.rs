//! Tier walker: advances the aggregation frontier of one target tier for
//! one instance.
//!
//! The walker derives all progress from the TSDB itself (source and target
//! frontier timestamps), chunks the outstanding window by cardinality, waits
//! on the resource gate between chunks and submits one program per chunk.
//! Re-running an overlapping window is safe because the TSDB deduplicates
//! identical (series, timestamp) points.

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use tracing::{debug, warn};

use crate::bucket::BucketChain;
use crate::collection::Collection;
use crate::db::Gateway;
use crate::monitor::ResourceGate;
use crate::program::build_program;

/// Chunk multiplier for a source-bucket cardinality.
///
/// Small instances batch many aggregation windows per program; heavyweight
/// instances (and unknown cardinality, reported as 0) run one base chunk at
/// a time.
fn chunk_multiplier(card: i64) -> i32 {
    if card > 0 && card < 100 {
        20
    } else if card >= 100 && card < 1000 {
        10
    } else {
        1
    }
}

/// Width of one submitted window.
fn chunk_width(card: i64, aggr_cnt: i32, agg_interval: Duration) -> Duration {
    agg_interval * (chunk_multiplier(card) * aggr_cnt)
}

/// Downsample one instance of a collection into the tier at `tier` (must
/// not be the head), reading from the preceding tier.
///
/// A source-frontier lookup failure is fatal for this (instance, tier) and
/// surfaces to the caller; target-frontier and cardinality failures degrade
/// to safe defaults with a warning.
pub async fn downsample<G: Gateway>(
    gw: &G,
    gate: &ResourceGate,
    chain: &BucketChain,
    tier: usize,
    instance: &str,
    collection: Collection,
    aggr_cnt: i32,
    org: &str,
) -> Result<()> {
    let target = match chain.get(tier) {
        Some(b) => b,
        None => bail!("tier {tier} out of range for {collection}"),
    };
    let source = match chain.source_of(tier) {
        Some(b) => b,
        None => bail!("{}: head tier is never a downsample target", target.name),
    };
    let source_is_head = tier == 1;

    let now = Utc::now();

    let src_last = gw
        .last_timestamp(source, chain.source_of(tier - 1), instance, collection)
        .await
        .with_context(|| {
            format!(
                "{}, {instance}: getting last measurement time; skipping instance",
                source.name
            )
        })?;
    debug!(bucket = %source.name, instance, last = %src_last, "source frontier");

    let tgt_last = match gw
        .last_timestamp(target, Some(source), instance, collection)
        .await
    {
        Ok(t) => t,
        Err(e) => {
            warn!(
                bucket = %target.name, instance, error = %e,
                "error getting last measurement time, assuming no data",
            );
            now - target.retention
        }
    };
    debug!(bucket = %target.name, instance, last = %tgt_last, "target frontier");

    let mut from_ts = tgt_last;
    if from_ts + target.agg_interval >= now {
        debug!(
            bucket = %target.name, instance,
            "nothing to downsample yet, too little time has elapsed since previous aggregation",
        );
        return Ok(());
    }

    let card = match gw
        .cardinality(source, collection.instance_tag(), instance)
        .await
    {
        Ok(c) => c,
        Err(e) => {
            warn!(instance, error = %e, "error getting cardinality, using default");
            0
        }
    };
    debug!(bucket = %source.name, instance, card, "source cardinality");

    let chunk = chunk_width(card, aggr_cnt, target.agg_interval);
    debug!(instance, "aggregate range set to {chunk}");

    while from_ts < src_last - target.agg_interval {
        let mut to_ts = from_ts + chunk;
        // Never extend a chunk past the source frontier.
        while to_ts >= src_last {
            to_ts -= target.agg_interval;
            debug!(
                instance,
                "aggregation range is behind source last record, reducing it by {}",
                target.agg_interval,
            );
        }

        gate.wait().await;

        let program = build_program(
            collection,
            source,
            target,
            source_is_head,
            instance,
            from_ts,
            to_ts,
            org,
        );
        debug!(bucket = %target.name, "downsample program:\n{program}");

        gw.execute(&program)
            .await
            .with_context(|| format!("{}, {instance}: downsample query", target.name))?;

        // The cursor advances by the full chunk even when the submitted
        // window was shrunk; an aggregateWindow over an empty range writes
        // nothing and the next cycle re-covers any remainder.
        from_ts += chunk;
    }

    Ok(())
}
