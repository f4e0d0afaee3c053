use anyhow::{bail, Result};
use chrono::Duration;

use crate::collection::Collection;

/// One retention/aggregation tier in the TSDB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    /// TSDB bucket identifier.
    pub name: String,
    /// Aggregation window width for points produced into this bucket.
    pub agg_interval: Duration,
    /// Data horizon of this bucket.
    pub retention: Duration,
}

impl Bucket {
    pub fn new(name: &str, agg_interval: Duration, retention: Duration) -> Bucket {
        Bucket {
            name: name.to_string(),
            agg_interval,
            retention,
        }
    }

    /// Aggregation interval as a Flux duration literal (e.g. "2m", "180m").
    pub fn flux_interval(&self) -> String {
        flux_duration(self.agg_interval)
    }
}

/// Render a duration as a Flux literal. Whole minutes render as `Nm`,
/// anything finer as `Ns`.
pub fn flux_duration(d: Duration) -> String {
    let secs = d.num_seconds();
    if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Ordered bucket chain for one collection: index 0 is the raw-ingest head,
/// each later bucket aggregates from its predecessor.
#[derive(Debug, Clone)]
pub struct BucketChain {
    buckets: Vec<Bucket>,
}

impl BucketChain {
    /// Build a chain from head to tail, checking the chain invariants:
    /// positive intervals, retention covering the interval, and strictly
    /// increasing interval/retention along the chain.
    pub fn new(buckets: Vec<Bucket>) -> Result<BucketChain> {
        if buckets.is_empty() {
            bail!("bucket chain must not be empty");
        }

        for b in &buckets {
            if b.agg_interval <= Duration::zero() {
                bail!("bucket {}: aggregation interval must be > 0", b.name);
            }
            if b.retention < b.agg_interval {
                bail!(
                    "bucket {}: retention must be >= aggregation interval",
                    b.name
                );
            }
        }

        for pair in buckets.windows(2) {
            if pair[1].agg_interval <= pair[0].agg_interval {
                bail!(
                    "bucket {}: aggregation interval must increase over {}",
                    pair[1].name,
                    pair[0].name
                );
            }
            if pair[1].retention <= pair[0].retention {
                bail!(
                    "bucket {}: retention must increase over {}",
                    pair[1].name,
                    pair[0].name
                );
            }
        }

        Ok(BucketChain { buckets })
    }

    /// The static chain configured for a collection.
    pub fn for_collection(collection: Collection) -> BucketChain {
        let buckets = match collection {
            Collection::IfStats
            | Collection::IfTraffic
            | Collection::GenGauge
            | Collection::GenCounter => vec![
                Bucket::new("telegraf/2d", Duration::minutes(2), Duration::hours(48)),
                Bucket::new("telegraf/7d", Duration::minutes(8), Duration::hours(168)),
                Bucket::new("telegraf/28d", Duration::minutes(30), Duration::hours(672)),
                Bucket::new("telegraf/all", Duration::minutes(180), Duration::hours(17520)),
            ],
            Collection::IcingaChk => vec![
                Bucket::new("icinga2/one_week", Duration::minutes(1), Duration::hours(168)),
                Bucket::new("icinga2/four_weeks", Duration::minutes(30), Duration::hours(672)),
                Bucket::new("icinga2/all", Duration::minutes(180), Duration::hours(17520)),
            ],
        };

        BucketChain::new(buckets).expect("static chains satisfy the chain invariants")
    }

    pub fn head(&self) -> &Bucket {
        &self.buckets[0]
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Bucket> {
        self.buckets.get(idx)
    }

    /// Source bucket feeding tier `idx`; `None` for the head.
    pub fn source_of(&self, idx: usize) -> Option<&Bucket> {
        if idx == 0 {
            None
        } else {
            self.buckets.get(idx - 1)
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Bucket> {
        self.buckets.iter()
    }
}
