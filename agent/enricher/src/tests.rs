use crate::{
    source::{self, Source},
    DropReason, Enricher, EnricherMetrics, Error, ExportReader, PodInfo, Reconciler,
    StandaloneCache,
};
use flowtag_core::{
    flow::{self, Event, Flow, IpVersion, Payload},
    CacheEvent, Endpoint, IpAddresses, Lookup, Node, Service,
};
use flowtag_k8s_cache::{Cache, SharedCache};
use flowtag_pubsub::PubSub;
use maplit::{btreemap, convert_args};
use parking_lot::Mutex;
use std::{net::IpAddr, num::NonZeroUsize, sync::Arc};
use tokio::time;
use tokio_util::sync::CancellationToken;

const TIMEOUT: time::Duration = time::Duration::from_secs(1);

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

fn mk_cache() -> SharedCache {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let pubsub = PubSub::<CacheEvent>::shared(tokio::runtime::Handle::current());
    Cache::shared(pubsub)
}

fn mk_enricher(lookup: Arc<dyn Lookup>, cap: usize) -> (Arc<Enricher>, EnricherMetrics) {
    let metrics = EnricherMetrics::default();
    let enricher = Enricher::shared(lookup, capacity(cap), metrics.clone());
    (enricher, metrics)
}

async fn next(reader: &mut ExportReader) -> Arc<Event> {
    time::timeout(TIMEOUT, reader.next())
        .await
        .expect("event must be exported")
        .expect("output must be open")
}

async fn assert_quiet(reader: &mut ExportReader) {
    assert!(
        time::timeout(time::Duration::from_millis(20), reader.next())
            .await
            .is_err(),
        "no event expected"
    );
}

fn flow_of(ev: &Event) -> &Flow {
    match &ev.payload {
        Payload::Flow(flow) => flow,
        payload => panic!("unexpected payload: {payload:?}"),
    }
}

#[tokio::test]
async fn enriches_source_pod() {
    let cache = mk_cache();
    cache
        .update_endpoint(
            Endpoint::new("pod1", "ns1", IpAddresses::from(ip("1.1.1.1"))).with_labels(
                convert_args!(btreemap!(
                    "app" => "app1",
                )),
            ),
        )
        .unwrap();

    let (enricher, metrics) = mk_enricher(cache, 16);
    let mut reader = enricher.export_reader();
    let token = CancellationToken::new();
    let task = enricher.run(token.clone()).unwrap();

    enricher
        .write(Event::flow(Flow::between(
            "1.1.1.1",
            "2.2.2.2",
            IpVersion::Ipv4,
        )))
        .unwrap();

    let ev = next(&mut reader).await;
    let flow = flow_of(&ev);
    assert_eq!(
        flow.source,
        Some(flow::Endpoint {
            namespace: "ns1".to_string(),
            pod_name: "pod1".to_string(),
            labels: vec!["app=app1".to_string()],
            workloads: vec![],
        })
    );
    assert_eq!(flow.destination, None);
    assert_eq!(metrics.enriched_total(), 1);
    assert_eq!(enricher.flow_rate(), 1);

    token.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn resolves_services_and_ignores_nodes() {
    let cache = mk_cache();
    cache
        .update_service(Service::new(
            "svc-0",
            "ns-0",
            IpAddresses::from(ip("10.96.0.10")),
        ))
        .unwrap();
    cache
        .update_node(Node::new("node-0", ip("10.0.0.1"), "zone-a"))
        .unwrap();

    let (enricher, _) = mk_enricher(cache, 16);
    let mut reader = enricher.export_reader();
    let token = CancellationToken::new();
    let task = enricher.run(token.clone()).unwrap();

    enricher
        .write(Event::flow(Flow::between(
            "10.0.0.1",
            "10.96.0.10",
            IpVersion::Ipv4,
        )))
        .unwrap();

    let ev = next(&mut reader).await;
    let flow = flow_of(&ev);
    assert_eq!(flow.source, None);
    assert_eq!(flow.source_service, None);
    assert_eq!(flow.destination, None);
    assert_eq!(
        flow.destination_service,
        Some(flow::ServiceRef {
            namespace: "ns-0".to_string(),
            name: "svc-0".to_string(),
        })
    );

    token.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn drops_malformed_flows() {
    let (enricher, metrics) = mk_enricher(mk_cache(), 16);
    let mut reader = enricher.export_reader();
    let token = CancellationToken::new();
    let task = enricher.run(token.clone()).unwrap();

    enricher.write(Event::flow(Flow::default())).unwrap();
    enricher
        .write(Event::flow(Flow::between("", "2.2.2.2", IpVersion::Ipv4)))
        .unwrap();
    enricher
        .write(Event::flow(Flow::between(
            "fd00::1",
            "fd00::2",
            IpVersion::Ipv6,
        )))
        .unwrap();
    enricher
        .write(Event::now(Payload::Agent(flow::AgentEvent {
            message: "hello".to_string(),
        })))
        .unwrap();
    // An unparsable address is a miss, not a drop.
    enricher
        .write(Event::flow(Flow::between(
            "not-an-ip",
            "2.2.2.2",
            IpVersion::Ipv4,
        )))
        .unwrap();

    let ev = next(&mut reader).await;
    assert_eq!(
        flow_of(&ev).ip.as_ref().map(|ip| ip.source.as_str()),
        Some("not-an-ip")
    );
    assert_quiet(&mut reader).await;

    assert_eq!(metrics.dropped_total(DropReason::MissingIp), 1);
    assert_eq!(metrics.dropped_total(DropReason::EmptyAddress), 1);
    assert_eq!(metrics.dropped_total(DropReason::UnsupportedIpVersion), 1);
    assert_eq!(metrics.dropped_total(DropReason::NotFlow), 1);
    assert_eq!(metrics.enriched_total(), 1);

    token.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn drops_flows_with_empty_destination() {
    let (enricher, metrics) = mk_enricher(mk_cache(), 16);
    let mut reader = enricher.export_reader();
    let token = CancellationToken::new();
    let task = enricher.run(token.clone()).unwrap();

    enricher
        .write(Event::flow(Flow::between("1.1.1.1", "", IpVersion::Ipv4)))
        .unwrap();
    assert_quiet(&mut reader).await;
    assert_eq!(metrics.dropped_total(DropReason::EmptyAddress), 1);
    assert_eq!(metrics.enriched_total(), 0);

    token.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn preserves_order_for_every_reader() {
    let (enricher, _) = mk_enricher(mk_cache(), 64);
    let mut readers = [enricher.export_reader(), enricher.export_reader()];
    let token = CancellationToken::new();
    let task = enricher.run(token.clone()).unwrap();

    for i in 0..10 {
        enricher
            .write(Event::flow(Flow::between(
                format!("10.0.0.{i}"),
                "10.0.1.1",
                IpVersion::Ipv4,
            )))
            .unwrap();
    }

    for reader in &mut readers {
        for i in 0..10 {
            let ev = next(reader).await;
            let src = flow_of(&ev).ip.as_ref().unwrap().source.clone();
            assert_eq!(src, format!("10.0.0.{i}"));
        }
    }

    token.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn runs_once() {
    let (enricher, _) = mk_enricher(mk_cache(), 4);
    let token = CancellationToken::new();
    let task = enricher.run(token.clone()).unwrap();
    assert!(enricher.is_running());
    assert!(matches!(
        enricher.run(token.clone()),
        Err(Error::AlreadyStarted)
    ));

    token.cancel();
    task.await.unwrap();
    assert!(!enricher.is_running());
    assert!(matches!(enricher.run(token), Err(Error::Stopped)));
}

#[tokio::test]
async fn stop_closes_readers() {
    let (enricher, _) = mk_enricher(mk_cache(), 4);
    let mut reader = enricher.export_reader();
    let token = CancellationToken::new();
    let task = enricher.run(token.clone()).unwrap();

    token.cancel();
    task.await.unwrap();

    assert!(time::timeout(TIMEOUT, reader.next()).await.unwrap().is_none());
    assert!(enricher.export_reader().next().await.is_none());
    assert!(matches!(
        enricher.write(Event::flow(Flow::between(
            "1.1.1.1",
            "2.2.2.2",
            IpVersion::Ipv4
        ))),
        Err(Error::Stopped)
    ));
}

#[tokio::test]
async fn drops_when_input_is_full() {
    let (enricher, metrics) = mk_enricher(mk_cache(), 1);
    let ev = Event::flow(Flow::between("1.1.1.1", "2.2.2.2", IpVersion::Ipv4));

    enricher.write(ev.clone()).unwrap();
    assert!(matches!(enricher.write(ev), Err(Error::InputFull)));
    assert_eq!(metrics.dropped_total(DropReason::InputFull), 1);
}

#[tokio::test]
async fn enriches_from_standalone_cache() {
    let cache = StandaloneCache::shared(time::Duration::from_secs(60));
    cache.update(ip("1.1.1.1"), Some(PodInfo::new("pod1", "ns1")));

    let (enricher, _) = mk_enricher(cache, 4);
    let mut reader = enricher.export_reader();
    let token = CancellationToken::new();
    let task = enricher.run(token.clone()).unwrap();

    enricher
        .write(Event::flow(Flow::between(
            "2.2.2.2",
            "1.1.1.1",
            IpVersion::Ipv4,
        )))
        .unwrap();

    let ev = next(&mut reader).await;
    let flow = flow_of(&ev);
    assert_eq!(flow.source, None);
    assert_eq!(
        flow.destination.as_ref().map(|ep| ep.pod_name.as_str()),
        Some("pod1")
    );

    token.cancel();
    task.await.unwrap();
}

// === Reconciler ===

#[derive(Clone, Default)]
struct FakeSource(Arc<Mutex<Vec<Endpoint>>>);

impl FakeSource {
    fn set(&self, endpoints: Vec<Endpoint>) {
        *self.0.lock() = endpoints;
    }
}

#[async_trait::async_trait]
impl Source for FakeSource {
    async fn endpoints(&self) -> Result<Vec<Endpoint>, source::Error> {
        Ok(self.0.lock().clone())
    }
}

fn mk_endpoint(ns: &str, name: &str, addr: &str) -> Endpoint {
    Endpoint::new(name, ns, IpAddresses::from(ip(addr)))
}

#[tokio::test]
async fn reconciles_running_pods() {
    let cache = StandaloneCache::shared(time::Duration::from_secs(60));
    let source = FakeSource::default();
    let reconciler = Reconciler::new(source.clone(), cache.clone());

    source.set(vec![
        mk_endpoint("ns-0", "pod-0", "10.0.0.1"),
        mk_endpoint("ns-0", "pod-1", "10.0.0.2"),
        // Endpoints without an address are ignored.
        Endpoint::new("pod-2", "ns-0", IpAddresses::default()),
    ]);
    reconciler.reconcile().await.unwrap();
    assert_eq!(cache.len(), 2);

    source.set(vec![
        mk_endpoint("ns-0", "pod-1", "10.0.0.2"),
        mk_endpoint("ns-1", "pod-3", "10.0.0.3"),
    ]);
    reconciler.reconcile().await.unwrap();
    assert_eq!(cache.get_pod(ip("10.0.0.1")), None);
    assert_eq!(
        cache.get_pod(ip("10.0.0.2")),
        Some(PodInfo::new("pod-1", "ns-0"))
    );
    assert_eq!(
        cache.get_pod(ip("10.0.0.3")),
        Some(PodInfo::new("pod-3", "ns-1"))
    );
}

#[tokio::test(start_paused = true)]
async fn reconciler_clears_cache_on_shutdown() {
    let cache = StandaloneCache::shared(time::Duration::from_secs(60));
    let source = FakeSource::default();
    source.set(vec![mk_endpoint("ns-0", "pod-0", "10.0.0.1")]);

    let token = CancellationToken::new();
    let task = tokio::spawn(
        Reconciler::new(source, cache.clone()).run(token.clone(), time::Duration::from_secs(10)),
    );

    // The first tick completes immediately.
    time::sleep(time::Duration::from_millis(1)).await;
    assert_eq!(cache.len(), 1);

    token.cancel();
    task.await.unwrap();
    assert!(cache.is_empty());
}
