use crate::{
    source::{self, Source},
    PodInfo, StandaloneCache,
};
use ahash::AHashMap as HashMap;
use std::{net::IpAddr, sync::Arc};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Keeps a [`StandaloneCache`] in sync with the endpoints reported by a [`Source`].
#[derive(Debug)]
pub struct Reconciler<S> {
    source: S,
    cache: Arc<StandaloneCache>,
}

impl<S: Source> Reconciler<S> {
    pub fn new(source: S, cache: Arc<StandaloneCache>) -> Self {
        Self { source, cache }
    }

    /// Applies a single snapshot of running endpoints to the cache.
    ///
    /// Cached addresses that are no longer running are removed; every running address is
    /// upserted, which also refreshes its TTL.
    pub async fn reconcile(&self) -> Result<(), source::Error> {
        let running = self
            .source
            .endpoints()
            .await?
            .iter()
            .filter_map(|ep| Some((ep.primary_ip()?, PodInfo::from(ep))))
            .collect::<HashMap<IpAddr, PodInfo>>();

        for ip in self.cache.all_ips() {
            if !running.contains_key(&ip) {
                self.cache.update(ip, None);
            }
        }

        let count = running.len();
        for (ip, info) in running {
            self.cache.update(ip, Some(info));
        }
        debug!(count, "Reconciled running pods");
        Ok(())
    }

    /// Reconciles every `interval` until `token` is cancelled, then clears the cache.
    pub async fn run(self, token: CancellationToken, interval: Duration) {
        let mut interval = time::interval(interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(error) = self.reconcile().await {
                        warn!(%error, "Failed to reconcile");
                    }
                }
            }
        }

        self.cache.clear();
        info!("Stopped");
    }
}
