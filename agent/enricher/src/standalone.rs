use ahash::AHashMap as HashMap;
use flowtag_core::{Endpoint, IpAddresses, Lookup, Object};
use parking_lot::RwLock;
use std::{net::IpAddr, sync::Arc};
use tokio::{
    task::JoinHandle,
    time::{self, Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// An address-to-pod map for nodes without API server access.
///
/// Entries are refreshed by reconciliation and expire once they have not been refreshed for the
/// configured TTL.
#[derive(Debug)]
pub struct StandaloneCache {
    ttl: Duration,
    entries: RwLock<HashMap<IpAddr, Entry>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug)]
struct Entry {
    info: PodInfo,
    last_update: Instant,
}

// === impl StandaloneCache ===

impl StandaloneCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::default()),
        }
    }

    pub fn shared(ttl: Duration) -> Arc<Self> {
        Arc::new(Self::new(ttl))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sets or clears the pod owning `ip`.
    ///
    /// `None` removes the entry. Re-applying the same pod only refreshes its timestamp.
    pub fn update(&self, ip: IpAddr, info: Option<PodInfo>) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let Some(info) = info else {
            if let Some(prev) = entries.remove(&ip) {
                debug!(%ip, namespace = %prev.info.namespace, name = %prev.info.name, "Removed pod");
            }
            return;
        };

        match entries.get_mut(&ip) {
            Some(entry) if entry.info == info => entry.last_update = now,
            _ => {
                debug!(%ip, namespace = %info.namespace, name = %info.name, "Cached pod");
                entries.insert(
                    ip,
                    Entry {
                        info,
                        last_update: now,
                    },
                );
            }
        }
    }

    pub fn get_pod(&self, ip: IpAddr) -> Option<PodInfo> {
        self.entries.read().get(&ip).map(|e| e.info.clone())
    }

    pub fn all_ips(&self) -> Vec<IpAddr> {
        self.entries.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
        info!("Cleared standalone cache");
    }

    /// Removes entries not refreshed within the TTL, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|ip, entry| {
            let fresh = now.saturating_duration_since(entry.last_update) <= self.ttl;
            if !fresh {
                info!(%ip, namespace = %entry.info.namespace, name = %entry.info.name, "Expired pod");
            }
            fresh
        });
        before - entries.len()
    }

    /// Sweeps expired entries every `interval` until `token` is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        token: CancellationToken,
        interval: Duration,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        let task = async move {
            let mut interval = time::interval(interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            debug!(removed, "Swept expired pods");
                        }
                    }
                }
            }
        };
        tokio::spawn(task.instrument(info_span!("sweeper")))
    }
}

impl Lookup for StandaloneCache {
    fn lookup(&self, ip: IpAddr) -> Option<Object> {
        let info = self.get_pod(ip)?;
        Some(Object::Endpoint(Endpoint::new(
            info.name,
            info.namespace,
            IpAddresses::from(ip),
        )))
    }
}

// === impl PodInfo ===

impl PodInfo {
    pub fn new(name: impl ToString, namespace: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

impl From<&Endpoint> for PodInfo {
    fn from(ep: &Endpoint) -> Self {
        Self::new(&ep.name, &ep.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn expires_stale_entries() {
        let cache = StandaloneCache::new(Duration::from_secs(30));
        assert_eq!(cache.ttl(), Duration::from_secs(30));
        cache.update(ip("10.0.0.1"), Some(PodInfo::new("pod-0", "ns-0")));
        cache.update(ip("10.0.0.2"), Some(PodInfo::new("pod-1", "ns-0")));

        time::advance(Duration::from_secs(20)).await;
        // Refreshing with identical info keeps the entry alive.
        cache.update(ip("10.0.0.2"), Some(PodInfo::new("pod-1", "ns-0")));

        time::advance(Duration::from_secs(15)).await;
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.get_pod(ip("10.0.0.1")), None);
        assert_eq!(
            cache.get_pod(ip("10.0.0.2")),
            Some(PodInfo::new("pod-1", "ns-0"))
        );
    }

    #[tokio::test]
    async fn update_replaces_and_deletes() {
        let cache = StandaloneCache::new(Duration::from_secs(30));
        cache.update(ip("10.0.0.1"), Some(PodInfo::new("pod-0", "ns-0")));
        cache.update(ip("10.0.0.1"), Some(PodInfo::new("pod-1", "ns-1")));
        assert_eq!(
            cache.get_pod(ip("10.0.0.1")),
            Some(PodInfo::new("pod-1", "ns-1"))
        );
        assert_eq!(cache.len(), 1);

        cache.update(ip("10.0.0.1"), None);
        assert!(cache.is_empty());
        // Deleting a missing entry is a no-op.
        cache.update(ip("10.0.0.1"), None);
    }

    #[tokio::test]
    async fn resolves_pods_only() {
        let cache = StandaloneCache::new(Duration::from_secs(30));
        cache.update(ip("10.0.0.1"), Some(PodInfo::new("pod-0", "ns-0")));

        let Some(Object::Endpoint(ep)) = cache.lookup(ip("10.0.0.1")) else {
            panic!("expected an endpoint");
        };
        assert_eq!(ep.key(), "ns-0/pod-0");
        assert!(cache.lookup(ip("10.0.0.2")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_cancelled() {
        let cache = StandaloneCache::shared(Duration::from_secs(5));
        cache.update(ip("10.0.0.1"), Some(PodInfo::new("pod-0", "ns-0")));

        let token = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(token.clone(), Duration::from_secs(1));

        time::sleep(Duration::from_secs(7)).await;
        assert!(cache.is_empty());

        token.cancel();
        sweeper.await.unwrap();
    }
}
