use crate::Error;
use ahash::AHashMap as HashMap;
use flowtag_core::{
    CacheEvent, Endpoint, EventKind, Lookup, Node, Object, Service, Topic, UNKNOWN_ZONE,
};
use flowtag_pubsub::SharedPubSub;
use parking_lot::RwLock;
use std::{
    collections::BTreeSet,
    net::IpAddr,
    sync::{Arc, Weak},
};
use tracing::{debug, info, instrument, trace, warn};

pub type SharedCache = Arc<Cache>;

/// The IP ownership registry.
///
/// All records and reverse indexes share one lock so that the one-owner-per-IP invariant can be
/// checked and restored in a single critical section. Events are published after the lock is
/// released.
pub struct Cache {
    state: RwLock<State>,
    namespaces: RwLock<BTreeSet<String>>,
    pubsub: SharedPubSub<CacheEvent>,
    api_server_subscription: String,
}

/// Entry counts, as reported by metrics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Sizes {
    pub endpoints: usize,
    pub services: usize,
    pub nodes: usize,
    pub endpoint_ips: usize,
    pub service_ips: usize,
    pub node_ips: usize,
    pub annotated_namespaces: usize,
}

#[derive(Debug, Default)]
struct State {
    endpoints: HashMap<String, Endpoint>,
    services: HashMap<String, Service>,
    nodes: HashMap<String, Node>,
    ip_to_endpoint: HashMap<IpAddr, String>,
    ip_to_service: HashMap<IpAddr, String>,
    ip_to_node: HashMap<IpAddr, String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Kind {
    Endpoint,
    Service,
    Node,
}

// === impl Cache ===

impl Cache {
    /// Builds a cache that publishes on `pubsub` and follows API server address changes
    /// published on [`Topic::ApiServer`].
    pub fn shared(pubsub: SharedPubSub<CacheEvent>) -> SharedCache {
        Arc::new_cyclic(|cache: &Weak<Self>| {
            let cache = cache.clone();
            let api_server_subscription = pubsub.subscribe(Topic::ApiServer, move |ev| {
                if let Some(cache) = cache.upgrade() {
                    cache.handle_api_server(ev);
                }
            });
            Self {
                state: RwLock::new(State::default()),
                namespaces: RwLock::new(BTreeSet::new()),
                pubsub,
                api_server_subscription,
            }
        })
    }

    #[instrument(skip(self, ep), fields(key = %ep.key()))]
    pub fn update_endpoint(&self, ep: Endpoint) -> Result<(), Error> {
        let key = ep.key();
        let ip = ep.primary_ip().ok_or_else(|| Error::NoPrimaryIp(key.clone()))?;

        let events = {
            let mut state = self.state.write();
            let mut events = state.evict(ip, Kind::Endpoint, &key)?;
            if let Some(prev) = state.endpoints.insert(key.clone(), ep.clone()) {
                unindex_moved(&mut state.ip_to_endpoint, prev.primary_ip(), ip, &key);
            }
            state.ip_to_endpoint.insert(ip, key);
            events.push(CacheEvent::new(EventKind::PodAdded, Object::Endpoint(ep)));
            events
        };

        debug!(%ip, "Updated endpoint");
        self.publish(events);
        Ok(())
    }

    #[instrument(skip(self, svc), fields(key = %svc.key()))]
    pub fn update_service(&self, svc: Service) -> Result<(), Error> {
        let key = svc.key();
        let ip = svc.primary_ip().ok_or_else(|| Error::NoPrimaryIp(key.clone()))?;

        let events = {
            let mut state = self.state.write();
            let mut events = state.evict(ip, Kind::Service, &key)?;
            if let Some(prev) = state.services.insert(key.clone(), svc.clone()) {
                unindex_moved(&mut state.ip_to_service, prev.primary_ip(), ip, &key);
            }
            state.ip_to_service.insert(ip, key);
            events.push(CacheEvent::new(EventKind::ServiceAdded, Object::Service(svc)));
            events
        };

        debug!(%ip, "Updated service");
        self.publish(events);
        Ok(())
    }

    #[instrument(skip(self, node), fields(name = %node.name))]
    pub fn update_node(&self, node: Node) -> Result<(), Error> {
        let key = node.name.clone();
        let ip = node.ip;

        let events = {
            let mut state = self.state.write();
            let mut events = state.evict(ip, Kind::Node, &key)?;
            if let Some(prev) = state.nodes.insert(key.clone(), node.clone()) {
                unindex_moved(&mut state.ip_to_node, Some(prev.ip), ip, &key);
            }
            state.ip_to_node.insert(ip, key);
            events.push(CacheEvent::new(EventKind::NodeAdded, Object::Node(node)));
            events
        };

        debug!(%ip, "Updated node");
        self.publish(events);
        Ok(())
    }

    /// Removes an endpoint. Deleting an unknown endpoint succeeds.
    pub fn delete_endpoint(&self, key: &str) -> Result<(), Error> {
        let event = self.state.write().remove(Kind::Endpoint, key);
        match event {
            Some(ev) => {
                debug!(%key, "Deleted endpoint");
                self.publish(vec![ev]);
            }
            None => trace!(%key, "Endpoint not cached"),
        }
        Ok(())
    }

    pub fn delete_service(&self, key: &str) -> Result<(), Error> {
        let event = self
            .state
            .write()
            .remove(Kind::Service, key)
            .ok_or_else(|| Error::ServiceNotFound(key.to_string()))?;
        debug!(%key, "Deleted service");
        self.publish(vec![event]);
        Ok(())
    }

    pub fn delete_node(&self, name: &str) -> Result<(), Error> {
        let event = self
            .state
            .write()
            .remove(Kind::Node, name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
        debug!(%name, "Deleted node");
        self.publish(vec![event]);
        Ok(())
    }

    pub fn get_pod_by_ip(&self, ip: IpAddr) -> Option<Endpoint> {
        let state = self.state.read();
        let key = state.ip_to_endpoint.get(&ip)?;
        state.endpoints.get(key).cloned()
    }

    pub fn get_svc_by_ip(&self, ip: IpAddr) -> Option<Service> {
        let state = self.state.read();
        let key = state.ip_to_service.get(&ip)?;
        state.services.get(key).cloned()
    }

    pub fn get_node_by_ip(&self, ip: IpAddr) -> Option<Node> {
        let state = self.state.read();
        let key = state.ip_to_node.get(&ip)?;
        state.nodes.get(key).cloned()
    }

    pub fn get_node_by_name(&self, name: &str) -> Option<Node> {
        self.state.read().nodes.get(name).cloned()
    }

    /// Resolves `ip` to its owner, checking endpoints, then services, then nodes.
    pub fn get_obj_by_ip(&self, ip: IpAddr) -> Option<Object> {
        let state = self.state.read();
        if let Some(ep) = state.ip_to_endpoint.get(&ip).and_then(|k| state.endpoints.get(k)) {
            return Some(Object::Endpoint(ep.clone()));
        }
        if let Some(svc) = state.ip_to_service.get(&ip).and_then(|k| state.services.get(k)) {
            return Some(Object::Service(svc.clone()));
        }
        state
            .ip_to_node
            .get(&ip)
            .and_then(|k| state.nodes.get(k))
            .map(|node| Object::Node(node.clone()))
    }

    /// Returns the distinct primary IPs of all endpoints in `namespace`.
    pub fn get_ips_by_namespace(&self, namespace: &str) -> Vec<IpAddr> {
        self.state
            .read()
            .endpoints
            .values()
            .filter(|ep| ep.namespace == namespace)
            .filter_map(Endpoint::primary_ip)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// The zone of the endpoint owning `ip`, or `unknown`.
    pub fn zone_for(&self, ip: IpAddr) -> String {
        self.get_pod_by_ip(ip)
            .map(|ep| ep.zone)
            .unwrap_or_else(|| UNKNOWN_ZONE.to_string())
    }

    pub fn add_annotated_namespace(&self, namespace: &str) {
        if self.namespaces.write().insert(namespace.to_string()) {
            info!(%namespace, "Observing namespace");
            self.publish(vec![CacheEvent::new(
                EventKind::NamespaceAdded,
                Object::Namespace(namespace.to_string()),
            )]);
        }
    }

    pub fn delete_annotated_namespace(&self, namespace: &str) {
        if self.namespaces.write().remove(namespace) {
            info!(%namespace, "No longer observing namespace");
            self.publish(vec![CacheEvent::new(
                EventKind::NamespaceDeleted,
                Object::Namespace(namespace.to_string()),
            )]);
        }
    }

    /// Returns the observed namespaces in sorted order.
    pub fn get_annotated_namespaces(&self) -> Vec<String> {
        self.namespaces.read().iter().cloned().collect()
    }

    pub fn sizes(&self) -> Sizes {
        let state = self.state.read();
        Sizes {
            endpoints: state.endpoints.len(),
            services: state.services.len(),
            nodes: state.nodes.len(),
            endpoint_ips: state.ip_to_endpoint.len(),
            service_ips: state.ip_to_service.len(),
            node_ips: state.ip_to_node.len(),
            annotated_namespaces: self.namespaces.read().len(),
        }
    }

    fn publish(&self, events: Vec<CacheEvent>) {
        for ev in events {
            self.pubsub.publish(ev.topic(), ev);
        }
    }

    fn handle_api_server(&self, ev: CacheEvent) {
        let Object::Endpoint(ep) = ev.object else {
            debug!(kind = ?ev.kind, "Ignoring API server event without an endpoint");
            return;
        };

        match ev.kind {
            EventKind::ApiServerIpsAdded => {
                if let Err(error) = self.update_endpoint(ep) {
                    warn!(%error, "Failed to update API server endpoint");
                }
            }
            EventKind::ApiServerIpsRemoved => self.remove_api_server_ips(&ep),
            kind => debug!(?kind, "Ignoring unexpected event on the API server topic"),
        }
    }

    /// Deletes the API server endpoint only if its primary address is among the removed ones, so
    /// that a removal dispatched after a newer addition does not undo it.
    fn remove_api_server_ips(&self, removed: &Endpoint) {
        let key = removed.key();
        let event = {
            let mut state = self.state.write();
            let stale = state
                .endpoints
                .get(&key)
                .and_then(Endpoint::primary_ip)
                .is_some_and(|ip| removed.ips.iter().any(|r| r == ip));
            if !stale {
                trace!(%key, "API server endpoint already current");
                return;
            }
            state.remove(Kind::Endpoint, &key)
        };
        if let Some(ev) = event {
            debug!(%key, "Deleted API server endpoint");
            self.publish(vec![ev]);
        }
    }
}

impl Lookup for Cache {
    fn lookup(&self, ip: IpAddr) -> Option<Object> {
        self.get_obj_by_ip(ip)
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        let _ = self
            .pubsub
            .unsubscribe(Topic::ApiServer, &self.api_server_subscription);
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("sizes", &self.sizes())
            .finish_non_exhaustive()
    }
}

// === impl State ===

impl State {
    fn owners(&self, ip: IpAddr) -> impl Iterator<Item = (Kind, &String)> {
        [
            (Kind::Endpoint, self.ip_to_endpoint.get(&ip)),
            (Kind::Service, self.ip_to_service.get(&ip)),
            (Kind::Node, self.ip_to_node.get(&ip)),
        ]
        .into_iter()
        .filter_map(|(kind, key)| Some((kind, key?)))
    }

    /// Removes every owner of `ip` other than `(kind, key)`, returning their deletion events.
    ///
    /// All owners are checked before anything is removed, so a failure leaves the state untouched.
    fn evict(&mut self, ip: IpAddr, kind: Kind, key: &str) -> Result<Vec<CacheEvent>, Error> {
        let victims = self
            .owners(ip)
            .filter(|(k, owner)| !(*k == kind && owner.as_str() == key))
            .map(|(k, owner)| (k, owner.clone()))
            .collect::<Vec<_>>();

        for (k, owner) in &victims {
            if !self.contains(*k, owner) {
                return Err(Error::MissingOwner {
                    ip,
                    kind: k.as_str(),
                    key: owner.clone(),
                });
            }
        }

        Ok(victims
            .into_iter()
            .filter_map(|(k, owner)| {
                info!(%ip, kind = k.as_str(), %owner, "Evicting previous owner");
                self.remove(k, &owner)
            })
            .collect())
    }

    fn contains(&self, kind: Kind, key: &str) -> bool {
        match kind {
            Kind::Endpoint => self.endpoints.contains_key(key),
            Kind::Service => self.services.contains_key(key),
            Kind::Node => self.nodes.contains_key(key),
        }
    }

    /// Removes a record and its reverse index entry, returning the deletion event.
    fn remove(&mut self, kind: Kind, key: &str) -> Option<CacheEvent> {
        match kind {
            Kind::Endpoint => {
                let ep = self.endpoints.remove(key)?;
                unindex(&mut self.ip_to_endpoint, ep.primary_ip(), key);
                Some(CacheEvent::new(EventKind::PodDeleted, Object::Endpoint(ep)))
            }
            Kind::Service => {
                let svc = self.services.remove(key)?;
                unindex(&mut self.ip_to_service, svc.primary_ip(), key);
                Some(CacheEvent::new(
                    EventKind::ServiceDeleted,
                    Object::Service(svc),
                ))
            }
            Kind::Node => {
                let node = self.nodes.remove(key)?;
                unindex(&mut self.ip_to_node, Some(node.ip), key);
                Some(CacheEvent::new(EventKind::NodeDeleted, Object::Node(node)))
            }
        }
    }
}

// === impl Kind ===

impl Kind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Endpoint => "endpoint",
            Self::Service => "service",
            Self::Node => "node",
        }
    }
}

/// Drops the reverse entry for `ip` if it still points at `key`.
fn unindex(index: &mut HashMap<IpAddr, String>, ip: Option<IpAddr>, key: &str) {
    if let Some(ip) = ip {
        if index.get(&ip).is_some_and(|k| k == key) {
            index.remove(&ip);
        }
    }
}

/// Drops the reverse entry of a record's previous address when it moved to `ip`.
fn unindex_moved(index: &mut HashMap<IpAddr, String>, prev: Option<IpAddr>, ip: IpAddr, key: &str) {
    if prev != Some(ip) {
        unindex(index, prev, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtag_core::IpAddresses;
    use flowtag_pubsub::PubSub;

    #[tokio::test]
    async fn lookup_prefers_endpoint_over_service_and_node() {
        let cache = Cache::shared(PubSub::shared(tokio::runtime::Handle::current()));
        let ip = "10.0.0.1".parse::<IpAddr>().unwrap();

        // Force overlapping claims, which the public surface never allows.
        {
            let mut state = cache.state.write();
            let node = Node::new("node-0", ip, "zone-a");
            state.nodes.insert("node-0".to_string(), node);
            state.ip_to_node.insert(ip, "node-0".to_string());
        }
        assert!(matches!(cache.get_obj_by_ip(ip), Some(Object::Node(_))));

        {
            let mut state = cache.state.write();
            let svc = Service::new("svc-0", "ns-0", IpAddresses::from(ip));
            state.services.insert(svc.key(), svc);
            state.ip_to_service.insert(ip, "ns-0/svc-0".to_string());
        }
        assert!(matches!(cache.get_obj_by_ip(ip), Some(Object::Service(_))));

        {
            let mut state = cache.state.write();
            let ep = Endpoint::new("pod-0", "ns-0", IpAddresses::from(ip));
            state.endpoints.insert(ep.key(), ep);
            state.ip_to_endpoint.insert(ip, "ns-0/pod-0".to_string());
        }
        assert!(matches!(cache.get_obj_by_ip(ip), Some(Object::Endpoint(_))));
    }

    #[tokio::test]
    async fn dangling_owner_aborts_update() {
        let cache = Cache::shared(PubSub::shared(tokio::runtime::Handle::current()));
        let ip = "10.0.0.1".parse::<IpAddr>().unwrap();
        cache
            .state
            .write()
            .ip_to_service
            .insert(ip, "ns-0/gone".to_string());

        let ep = Endpoint::new("pod-0", "ns-0", IpAddresses::from(ip));
        assert!(matches!(
            cache.update_endpoint(ep),
            Err(Error::MissingOwner { kind: "service", .. })
        ));
        assert!(cache.get_pod_by_ip(ip).is_none());
        assert_eq!(cache.sizes().endpoints, 0);
    }
}
