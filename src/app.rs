//! Application wiring shared by both binaries.
//!
//! Builds the DB gateway from configuration and exposes the two entry
//! points: the continuous downsampler (`run`) and the one-shot bandwidth
//! histogram job (`store_bw_data`).

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bandwidth::store_bw_usage;
use crate::bucket::BucketChain;
use crate::collection::Collection;
use crate::config::Config;
use crate::db::{Gateway, Influx};
use crate::monitor::{spawn_monitor, ResourceGate};
use crate::scheduler::{run_workers, Tuning};

pub struct App {
    cfg: Config,
    db: Arc<Influx>,
    gate: Arc<ResourceGate>,
    cancel: CancellationToken,
}

impl App {
    pub fn new(cfg: Config) -> Result<App> {
        let db = Arc::new(Influx::new(&cfg).context("creating DB gateway")?);

        Ok(App {
            cfg,
            db,
            gate: Arc::new(ResourceGate::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Run the continuous downsampler: start the resource monitor, spawn
    /// one worker per (collection × cardinality group) and supervise them.
    /// Any worker finishing surfaces as an error; the process has no other
    /// shutdown path besides termination.
    pub async fn run(&self) -> Result<()> {
        let collections = self.cfg.collections()?;

        spawn_monitor(
            Arc::clone(&self.db),
            Arc::clone(&self.gate),
            self.cfg.mem_limit,
            self.cancel.child_token(),
        );
        debug!("resource monitor started");

        let tuning = Tuning::from_config(&self.cfg);

        run_workers(
            Arc::clone(&self.db),
            Arc::clone(&self.gate),
            &collections,
            tuning,
            &self.cfg.org,
        )
        .await
    }

    /// One-shot job: write yesterday's bandwidth-utilization histograms for
    /// every head-tier `ifstats` instance that does not have one yet.
    pub async fn store_bw_data(&self) -> Result<()> {
        if self.cfg.bw_bucket.is_empty() {
            bail!("bw_bucket is required for bandwidth data storage");
        }

        let chain = BucketChain::for_collection(Collection::IfStats);
        let head = chain.head();

        let instances = self
            .db
            .instances(head, Collection::IfStats)
            .await
            .context("getting ifstats instances")?;

        info!(instances = instances.len(), "storing bandwidth usage data");

        for inst in &instances {
            if let Err(e) = store_bw_usage(
                self.db.as_ref(),
                inst,
                head,
                &self.cfg.bw_bucket,
                &self.cfg.org,
            )
            .await
            {
                warn!(instance = %inst, error = %e, "skipping instance");
            }
        }

        Ok(())
    }

    /// Stop background tasks. Termination is the normal shutdown path; this
    /// exists for the signal handler's sake.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
