//! Collection scheduling: one long-lived worker per (collection ×
//! cardinality group).
//!
//! Each worker walks the collection's bucket chain in order, head first.
//! The head tier produces nothing; on later cycles it re-enumerates the
//! group's instances. Every other tier downsamples each instance from its
//! predecessor. A cycle is floored at three hours, and any worker finishing
//! at all is fatal for the process (workers are expected to loop forever).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bucket::{Bucket, BucketChain};
use crate::collection::{CardinalityGroup, Collection};
use crate::config::Config;
use crate::db::Gateway;
use crate::downsampler::downsample;
use crate::monitor::ResourceGate;

/// Minimum wall-clock length of one worker cycle.
pub const CYCLE_FLOOR: Duration = Duration::from_secs(3 * 3600);

/// Pause after a failed downsample before the next instance.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// A worker finishing sooner than this after process start indicates an
/// empty-loop bug rather than an operational failure.
pub const STARTUP_GRACE: Duration = Duration::from_secs(10);

/// Tunables shared by every worker.
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    pub aggr_cnt: i32,
    pub card_medium: i64,
    pub card_hevy: i64,
}

impl Tuning {
    pub fn from_config(cfg: &Config) -> Tuning {
        Tuning {
            aggr_cnt: cfg.aggr_cnt,
            card_medium: cfg.card_medium,
            card_hevy: cfg.card_hevy,
        }
    }
}

/// Enumerate a bucket's instances and shard them by cardinality.
///
/// A failed cardinality probe assigns the instance to the heavy group.
/// Groups without instances are absent from the result.
pub async fn discover_instances<G: Gateway>(
    gw: &G,
    bucket: &Bucket,
    collection: Collection,
    tuning: Tuning,
) -> Result<HashMap<CardinalityGroup, Vec<String>>> {
    let instances = gw.instances(bucket, collection).await?;

    let mut groups: HashMap<CardinalityGroup, Vec<String>> = HashMap::new();
    for inst in instances {
        let group = match gw
            .cardinality(bucket, collection.instance_tag(), &inst)
            .await
        {
            Ok(card) => {
                debug!(instance = %inst, bucket = %bucket.name, card, "instance cardinality");
                CardinalityGroup::classify(card, tuning.card_medium, tuning.card_hevy)
            }
            Err(e) => {
                warn!(
                    instance = %inst, bucket = %bucket.name, error = %e,
                    "error getting cardinality, using highest rank",
                );
                CardinalityGroup::Heavy
            }
        };
        groups.entry(group).or_default().push(inst);
    }

    Ok(groups)
}

/// One long-lived downsampling worker.
pub struct Worker<G> {
    gw: Arc<G>,
    gate: Arc<ResourceGate>,
    collection: Collection,
    group: CardinalityGroup,
    chain: BucketChain,
    tuning: Tuning,
    org: String,
}

impl<G: Gateway> Worker<G> {
    pub fn new(
        gw: Arc<G>,
        gate: Arc<ResourceGate>,
        collection: Collection,
        group: CardinalityGroup,
        chain: BucketChain,
        tuning: Tuning,
        org: String,
    ) -> Worker<G> {
        Worker {
            gw,
            gate,
            collection,
            group,
            chain,
            tuning,
            org,
        }
    }

    /// Run cycles forever. The first cycle works on `instances` as
    /// discovered at startup; later cycles re-enumerate at the head tier.
    /// Only a failed head-tier enumeration returns.
    pub async fn run(self, mut instances: Vec<String>) -> Result<()> {
        let mut first_cycle = true;

        loop {
            let cycle_start = Instant::now();
            info!(
                collection = %self.collection,
                group = %self.group,
                instances = instances.len(),
                "starting cycle",
            );

            for tier in 0..self.chain.len() {
                if tier == 0 {
                    if first_cycle {
                        continue;
                    }
                    let mut groups = discover_instances(
                        self.gw.as_ref(),
                        self.chain.head(),
                        self.collection,
                        self.tuning,
                    )
                    .await?;
                    instances = groups.remove(&self.group).unwrap_or_default();
                    debug!(
                        collection = %self.collection,
                        group = %self.group,
                        instances = instances.len(),
                        "refreshed instances",
                    );
                    continue;
                }

                let bucket = self.chain.get(tier).expect("tier index is in range");
                let total = instances.len();
                for (i, inst) in instances.iter().enumerate() {
                    info!(
                        "{}/{} {} {} {} {} {:?}",
                        i + 1,
                        total,
                        inst,
                        self.collection,
                        self.group,
                        bucket.name,
                        cycle_start.elapsed(),
                    );

                    self.gate.wait().await;

                    if let Err(e) = downsample(
                        self.gw.as_ref(),
                        &self.gate,
                        &self.chain,
                        tier,
                        inst,
                        self.collection,
                        self.tuning.aggr_cnt,
                        &self.org,
                    )
                    .await
                    {
                        error!(error = %e, "error on downsample");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                        continue;
                    }
                }
            }

            let elapsed = cycle_start.elapsed();
            info!(
                collection = %self.collection,
                group = %self.group,
                "cycle done, elapsed: {elapsed:?}",
            );

            if elapsed < CYCLE_FLOOR {
                let sleep_for = CYCLE_FLOOR - elapsed;
                info!("minimum downsample interval is 3h, sleeping {sleep_for:?}");
                tokio::time::sleep(sleep_for).await;
            }
            first_cycle = false;
        }
    }
}

/// Diagnose a worker that came back. Workers loop forever, so any return is
/// fatal; a return within the startup grace period points at an empty-loop
/// bug rather than a DB failure.
fn worker_exit_error(
    collection: Collection,
    group: CardinalityGroup,
    since_start: Duration,
) -> anyhow::Error {
    if since_start < STARTUP_GRACE {
        anyhow!("downsampling of {collection}, {group} ended too fast, interrupting")
    } else {
        anyhow!("downsampling of {collection}, {group} ended, interrupting")
    }
}

/// Discover instances for every configured collection, spawn one worker per
/// non-empty cardinality group, and supervise them. Returns (with an error)
/// as soon as the first worker finishes.
pub async fn run_workers<G: Gateway + 'static>(
    gw: Arc<G>,
    gate: Arc<ResourceGate>,
    collections: &[Collection],
    tuning: Tuning,
    org: &str,
) -> Result<()> {
    let start = Instant::now();
    let mut workers: JoinSet<(Collection, CardinalityGroup, Result<()>)> = JoinSet::new();

    for &collection in collections {
        let chain = BucketChain::for_collection(collection);

        let groups = discover_instances(gw.as_ref(), chain.head(), collection, tuning)
            .await
            .map_err(|e| anyhow!("can't get instances for collection {collection}: {e}"))?;

        for (group, instances) in groups {
            info!(
                collection = %collection,
                group = %group,
                instances = instances.len(),
                "spawning worker",
            );
            let worker = Worker::new(
                Arc::clone(&gw),
                Arc::clone(&gate),
                collection,
                group,
                chain.clone(),
                tuning,
                org.to_string(),
            );
            workers
                .spawn(async move { (collection, group, worker.run(instances).await) });
        }
    }

    if workers.is_empty() {
        bail!("no instances found for any configured collection, interrupting");
    }

    // Workers never finish on their own; the first one to do so takes the
    // process down.
    match workers.join_next().await {
        Some(Ok((collection, group, result))) => {
            if let Err(e) = result {
                error!(collection = %collection, group = %group, error = %e, "worker failed");
            }
            Err(worker_exit_error(collection, group, start.elapsed()))
        }
        Some(Err(e)) => Err(anyhow!("worker panicked: {e}")),
        None => unreachable!("join_next on a non-empty set"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_exit_is_always_fatal() {
        let err = worker_exit_error(
            Collection::IfTraffic,
            CardinalityGroup::Light,
            Duration::from_secs(3600),
        );
        assert!(err.to_string().contains("interrupting"));
        assert!(!err.to_string().contains("too fast"));
    }

    #[test]
    fn test_worker_exit_within_grace_flags_startup_bug() {
        let err = worker_exit_error(
            Collection::IfTraffic,
            CardinalityGroup::Heavy,
            Duration::from_secs(3),
        );
        assert!(err.to_string().contains("ended too fast"));
        assert!(err.to_string().contains("iftraffic"));
        assert!(err.to_string().contains("hevy"));
    }
}
