use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

use crate::SharedCache;

#[derive(Debug)]
struct Instrumented(SharedCache);

pub fn register(reg: &mut Registry, cache: SharedCache) {
    reg.register_collector(Box::new(Instrumented(cache)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let sizes = self.0.sizes();

        let endpoint_encoder = encoder.encode_descriptor(
            "endpoint_index_size",
            "The number of endpoints in the cache",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(sizes.endpoints as i64).encode(endpoint_encoder)?;

        let service_encoder = encoder.encode_descriptor(
            "service_index_size",
            "The number of services in the cache",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(sizes.services as i64).encode(service_encoder)?;

        let node_encoder = encoder.encode_descriptor(
            "node_index_size",
            "The number of nodes in the cache",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(sizes.nodes as i64).encode(node_encoder)?;

        let mut ip_encoder = encoder.encode_descriptor(
            "ip_index_size",
            "The number of indexed IPs by owner kind",
            None,
            MetricType::Gauge,
        )?;
        for (kind, size) in [
            ("endpoint", sizes.endpoint_ips),
            ("service", sizes.service_ips),
            ("node", sizes.node_ips),
        ] {
            let labels = vec![("kind", kind)];
            let ip_encoder = ip_encoder.encode_family(&labels)?;
            ConstGauge::new(size as i64).encode(ip_encoder)?;
        }

        let namespace_encoder = encoder.encode_descriptor(
            "annotated_namespaces",
            "The number of namespaces opted into observation",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(sizes.annotated_namespaces as i64).encode(namespace_encoder)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cache;
    use flowtag_core::{Endpoint, IpAddresses};
    use flowtag_pubsub::PubSub;

    #[tokio::test]
    async fn encodes_cache_sizes() {
        let cache = Cache::shared(PubSub::shared(tokio::runtime::Handle::current()));
        cache
            .update_endpoint(Endpoint::new(
                "pod-0",
                "ns-0",
                IpAddresses::from("10.0.0.1".parse::<std::net::IpAddr>().unwrap()),
            ))
            .unwrap();

        let mut reg = Registry::default();
        register(reg.sub_registry_with_prefix("cache"), cache);
        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &reg).unwrap();

        assert!(out.contains("cache_endpoint_index_size 1"), "{out}");
        assert!(out.contains("cache_ip_index_size{kind=\"endpoint\"} 1"), "{out}");
        assert!(out.contains("cache_service_index_size 0"), "{out}");
    }
}
