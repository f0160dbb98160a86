//! Tracks the addresses of the Kubernetes API server.
//!
//! The API server is usually reached through a DNS name whose addresses may change. The
//! [`Watcher`] periodically resolves it and publishes changes on [`Topic::ApiServer`], where the
//! cache and any lower-level identity tables pick them up independently.

use anyhow::Result;
use flowtag_core::{CacheEvent, Endpoint, EventKind, Object, Topic};
use flowtag_pubsub::SharedPubSub;
use std::{collections::BTreeSet, net::IpAddr};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resolves the API server's current addresses.
#[async_trait::async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self) -> Result<Vec<IpAddr>>;
}

/// Resolves a host name through the system resolver.
#[derive(Clone, Debug)]
pub struct DnsResolver {
    host: String,
    port: u16,
}

pub struct Watcher<R> {
    resolver: R,
    pubsub: SharedPubSub<CacheEvent>,
    current: BTreeSet<IpAddr>,
}

// === impl DnsResolver ===

impl DnsResolver {
    pub fn new(host: impl ToString, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

#[async_trait::async_trait]
impl Resolve for DnsResolver {
    async fn resolve(&self) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
        Ok(addrs.map(|sa| sa.ip()).collect())
    }
}

// === impl Watcher ===

impl<R: Resolve> Watcher<R> {
    pub fn new(resolver: R, pubsub: SharedPubSub<CacheEvent>) -> Self {
        Self {
            resolver,
            pubsub,
            current: BTreeSet::new(),
        }
    }

    /// Resolves the API server once, publishing a removal for addresses that went away and an
    /// addition carrying the full current set whenever it changed.
    pub async fn refresh(&mut self) -> Result<()> {
        let ips = self
            .resolver
            .resolve()
            .await?
            .into_iter()
            .collect::<BTreeSet<_>>();
        if ips.is_empty() {
            warn!("API server resolved to no addresses");
            return Ok(());
        }
        if ips == self.current {
            debug!(ips = ips.len(), "API server addresses unchanged");
            return Ok(());
        }

        let removed = self
            .current
            .difference(&ips)
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if !removed.is_empty() {
            info!(?removed, "API server addresses removed");
            self.publish(EventKind::ApiServerIpsRemoved, &removed);
        }

        let current = ips.iter().map(ToString::to_string).collect::<Vec<_>>();
        info!(?current, "API server addresses updated");
        self.publish(EventKind::ApiServerIpsAdded, &current);

        self.current = ips;
        Ok(())
    }

    pub async fn run(mut self, token: CancellationToken, interval: time::Duration) {
        let mut interval = time::interval(interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("API server watcher stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(error) = self.refresh().await {
                        warn!(%error, "Failed to resolve the API server");
                    }
                }
            }
        }
    }

    fn publish(&self, kind: EventKind, ips: &[String]) {
        let ev = CacheEvent::new(kind, Object::Endpoint(Endpoint::api_server(ips)));
        self.pubsub.publish(Topic::ApiServer, ev);
    }
}
