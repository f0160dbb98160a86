use crate::{Enricher, StandaloneCache};
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeLabelValue, EncodeMetric},
    metrics::{counter::Counter, family::Family, gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct EnricherMetrics {
    received: Counter,
    enriched: Counter,
    dropped: Family<DropLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DropLabels {
    reason: DropReason,
}

/// Why an event did not make it to the output buffer.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum DropReason {
    InputFull,
    NotFlow,
    MissingIp,
    UnsupportedIpVersion,
    EmptyAddress,
}

// === impl EnricherMetrics ===

impl EnricherMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "events_received",
            "Total number of events read from the input queue",
            metrics.received.clone(),
        );
        reg.register(
            "events_enriched",
            "Total number of events written to the output buffer",
            metrics.enriched.clone(),
        );
        reg.register(
            "events_dropped",
            "Total number of events dropped, by reason",
            metrics.dropped.clone(),
        );
        metrics
    }

    pub(crate) fn received(&self) {
        self.received.inc();
    }

    pub(crate) fn enriched(&self) {
        self.enriched.inc();
    }

    pub(crate) fn dropped(&self, reason: DropReason) {
        self.dropped.get_or_create(&DropLabels { reason }).inc();
    }

    pub fn dropped_total(&self, reason: DropReason) -> u64 {
        self.dropped.get_or_create(&DropLabels { reason }).get()
    }

    pub fn enriched_total(&self) -> u64 {
        self.enriched.get()
    }
}

// === Collectors ===

#[derive(Debug)]
struct FlowsLastMinute(Arc<Enricher>);

#[derive(Debug)]
struct StandaloneSize(Arc<StandaloneCache>);

/// Reports the enricher's flow rate over the last minute.
pub fn register_flow_rate(reg: &mut Registry, enricher: Arc<Enricher>) {
    reg.register_collector(Box::new(FlowsLastMinute(enricher)));
}

pub fn register_standalone(reg: &mut Registry, cache: Arc<StandaloneCache>) {
    reg.register_collector(Box::new(StandaloneSize(cache)));
}

impl Collector for FlowsLastMinute {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let rate_encoder = encoder.encode_descriptor(
            "flows_last_minute",
            "The number of flows enriched during the last minute",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(self.0.flow_rate() as i64).encode(rate_encoder)?;
        Ok(())
    }
}

impl Collector for StandaloneSize {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let size_encoder = encoder.encode_descriptor(
            "standalone_cache_size",
            "The number of pod addresses in the standalone cache",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(self.0.len() as i64).encode(size_encoder)?;
        Ok(())
    }
}
