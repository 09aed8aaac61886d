use foodlink_core::events::EventSink;
use foodlink_core::repository::EntityStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::FulfillmentResult;

/// Drains the event outbox into a sink.
///
/// Rows go out in outbox order and the relay stops at the first failed
/// publish, so a donation's events never overtake each other. Only rows the
/// sink accepted are marked, so a row that becomes visible late is still
/// sent. A crash between publish and `mark_published` re-sends the batch.
pub struct OutboxRelay {
    store: Arc<dyn EntityStore>,
    sink: Arc<dyn EventSink>,
    batch_size: usize,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn EntityStore>, sink: Arc<dyn EventSink>, batch_size: usize) -> Self {
        Self {
            store,
            sink,
            batch_size: batch_size.max(1),
        }
    }

    /// Publish one batch. Returns how many rows were published.
    pub async fn relay_once(&self) -> FulfillmentResult<usize> {
        let pending = self.store.pending_events(self.batch_size).await?;
        let mut published = Vec::with_capacity(pending.len());

        for entry in &pending {
            match self.sink.publish(&entry.envelope).await {
                Ok(()) => published.push(entry.position),
                Err(e) => {
                    warn!(
                        position = entry.position,
                        topic = %entry.envelope.event.topic(),
                        error = %e,
                        "Publish failed, holding the rest of the batch"
                    );
                    break;
                }
            }
        }

        if !published.is_empty() {
            self.store.mark_published(&published).await?;
            debug!(
                published = published.len(),
                first = published[0],
                "Outbox batch relayed"
            );
        }
        Ok(published.len())
    }

    /// Relay until `shutdown` flips to true. Full batches are followed up
    /// immediately instead of waiting for the next tick.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(?interval, "Outbox relay started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    loop {
                        match self.relay_once().await {
                            Ok(n) if n == self.batch_size => continue,
                            Ok(_) => break,
                            Err(e) => {
                                warn!(error = %e, "Outbox relay failed");
                                break;
                            }
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Outbox relay stopped");
    }
}
