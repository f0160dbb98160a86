//! Flow enrichment
//!
//! The [`Enricher`] reads raw flow events from a bounded input queue, resolves the source and
//! destination addresses through a [`Lookup`], attaches the owning pod's identity, and broadcasts
//! the result to any number of [`ExportReader`]s.
//!
//! A single worker processes events in the order they were written. Writers never block: when the
//! input queue is full the event is dropped and counted. Readers that fall behind skip the oldest
//! events rather than slowing the worker down.
//!
//! In standalone mode, identities come from a [`StandaloneCache`] that a [`Reconciler`] keeps in
//! sync with a polled [`source::Source`].

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod rate;
mod reader;
mod reconcile;
pub mod source;
mod standalone;

#[cfg(test)]
mod tests;

pub use self::{
    metrics::{DropReason, EnricherMetrics},
    reader::ExportReader,
    reconcile::Reconciler,
    standalone::{PodInfo, StandaloneCache},
};
use self::rate::FlowRate;
use flowtag_core::{
    flow::{self, Event, IpVersion, Payload},
    Lookup, Object,
};
use parking_lot::Mutex;
use std::{net::IpAddr, num::NonZeroUsize, sync::Arc};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, Instrument};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("enricher already started")]
    AlreadyStarted,

    #[error("enricher stopped")]
    Stopped,

    #[error("input queue full; event dropped")]
    InputFull,
}

pub struct Enricher {
    lookup: Arc<dyn Lookup>,
    tx: mpsc::Sender<Event>,
    state: Mutex<State>,
    /// Cleared when the worker stops so that readers observe the end of the stream.
    output: Mutex<Option<broadcast::Sender<Arc<Event>>>>,
    metrics: EnricherMetrics,
    rate: Mutex<FlowRate>,
}

enum State {
    Idle(mpsc::Receiver<Event>),
    Running,
    Stopped,
}

// === impl Enricher ===

impl Enricher {
    /// Creates an idle enricher. `capacity` bounds both the input queue and the output buffer.
    pub fn new(lookup: Arc<dyn Lookup>, capacity: NonZeroUsize, metrics: EnricherMetrics) -> Self {
        let (tx, rx) = mpsc::channel(capacity.get());
        let (output, _) = broadcast::channel(capacity.get());
        Self {
            lookup,
            tx,
            state: Mutex::new(State::Idle(rx)),
            output: Mutex::new(Some(output)),
            metrics,
            rate: Mutex::new(FlowRate::new(Instant::now())),
        }
    }

    pub fn shared(
        lookup: Arc<dyn Lookup>,
        capacity: NonZeroUsize,
        metrics: EnricherMetrics,
    ) -> Arc<Self> {
        Arc::new(Self::new(lookup, capacity, metrics))
    }

    /// Starts the worker. It runs until `token` is cancelled; events still queued at that point
    /// are dropped.
    pub fn run(self: &Arc<Self>, token: CancellationToken) -> Result<JoinHandle<()>, Error> {
        let mut rx = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Running) {
                State::Idle(rx) => rx,
                State::Running => {
                    *state = State::Running;
                    return Err(Error::AlreadyStarted);
                }
                State::Stopped => {
                    *state = State::Stopped;
                    return Err(Error::Stopped);
                }
            }
        };
        let output = self.output.lock().clone().ok_or(Error::Stopped)?;

        let enricher = self.clone();
        let task = async move {
            info!("Started");
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    ev = rx.recv() => match ev {
                        Some(ev) => enricher.process(ev, &output),
                        None => break,
                    },
                }
            }

            *enricher.state.lock() = State::Stopped;
            enricher.output.lock().take();
            info!("Stopped");
        };
        Ok(tokio::spawn(task.instrument(info_span!("enricher"))))
    }

    /// Enqueues a raw event without waiting. The event is dropped if the queue is full.
    pub fn write(&self, ev: Event) -> Result<(), Error> {
        use mpsc::error::TrySendError;

        match self.tx.try_send(ev) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                trace!("Input queue full");
                self.metrics.dropped(DropReason::InputFull);
                Err(Error::InputFull)
            }
            Err(TrySendError::Closed(_)) => Err(Error::Stopped),
        }
    }

    /// Returns a cursor over enriched events written after this call.
    pub fn export_reader(&self) -> ExportReader {
        match self.output.lock().as_ref() {
            Some(tx) => ExportReader::new(tx.subscribe()),
            None => ExportReader::closed(),
        }
    }

    /// The number of flows enriched during the last minute.
    pub fn flow_rate(&self) -> u64 {
        self.rate.lock().total(Instant::now())
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), State::Running)
    }

    fn process(&self, ev: Event, output: &broadcast::Sender<Arc<Event>>) {
        self.metrics.received();
        match self.enrich(ev) {
            Ok(ev) => {
                self.metrics.enriched();
                self.rate.lock().record(Instant::now());
                // No readers is not an error.
                let _ = output.send(Arc::new(ev));
            }
            Err(reason) => self.metrics.dropped(reason),
        }
    }

    fn enrich(&self, mut ev: Event) -> Result<Event, DropReason> {
        let Payload::Flow(flow) = &mut ev.payload else {
            debug!("Dropping event without a flow");
            return Err(DropReason::NotFlow);
        };

        let (src, dst) = {
            let Some(ip) = flow.ip.as_ref() else {
                debug!("Dropping flow without addresses");
                return Err(DropReason::MissingIp);
            };
            if ip.ip_version > IpVersion::Ipv4 {
                debug!(version = ?ip.ip_version, "Dropping flow with unsupported IP version");
                return Err(DropReason::UnsupportedIpVersion);
            }
            if ip.source.is_empty() || ip.destination.is_empty() {
                debug!(src = %ip.source, dst = %ip.destination, "Dropping flow with empty address");
                return Err(DropReason::EmptyAddress);
            }
            (self.resolve(&ip.source), self.resolve(&ip.destination))
        };

        match src {
            Some(Object::Endpoint(ep)) => flow.source = Some(flow::Endpoint::from(&ep)),
            Some(Object::Service(svc)) => flow.source_service = Some(flow::ServiceRef::from(&svc)),
            Some(Object::Node(node)) => trace!(node = %node.name, "Source is a node"),
            _ => {}
        }
        match dst {
            Some(Object::Endpoint(ep)) => flow.destination = Some(flow::Endpoint::from(&ep)),
            Some(Object::Service(svc)) => {
                flow.destination_service = Some(flow::ServiceRef::from(&svc))
            }
            Some(Object::Node(node)) => trace!(node = %node.name, "Destination is a node"),
            _ => {}
        }

        Ok(ev)
    }

    fn resolve(&self, addr: &str) -> Option<Object> {
        match addr.parse::<IpAddr>() {
            Ok(ip) => self.lookup.lookup(ip),
            Err(_) => {
                trace!(%addr, "Unparsable address");
                None
            }
        }
    }
}

impl std::fmt::Debug for Enricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enricher")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
