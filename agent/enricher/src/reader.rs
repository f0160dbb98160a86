use flowtag_core::flow::Event;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// An independent cursor over the enricher's output.
///
/// Each reader sees every event enriched after it was created, unless it falls more than the
/// buffer's capacity behind, in which case the oldest events are skipped.
#[derive(Debug)]
pub struct ExportReader {
    rx: broadcast::Receiver<Arc<Event>>,
}

impl ExportReader {
    pub(crate) fn new(rx: broadcast::Receiver<Arc<Event>>) -> Self {
        Self { rx }
    }

    /// A reader over an output that has already ended.
    pub(crate) fn closed() -> Self {
        let (_, rx) = broadcast::channel(1);
        Self { rx }
    }

    /// Waits for the next enriched event. Returns `None` once the enricher has stopped and every
    /// buffered event has been read.
    pub async fn next(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Export reader fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
