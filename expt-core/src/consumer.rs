//! Bounded consumer pools draining bus topics.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::events::EngineEvent;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: EngineEvent) -> Result<(), Error>;
}

/// Consumes `rx` with at most `worker_num` handlers in flight.
///
/// Handler errors are logged and the message is acknowledged; redelivery is the handler's
/// job. Returns once `cancel_token` fires (or the channel closes) and in-flight handlers
/// have finished.
pub async fn run_pool(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    handler: Arc<dyn EventHandler>,
    worker_num: usize,
    cancel_token: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(worker_num.max(1)));
    let tracker = TaskTracker::new();
    info!(pool = name, worker_num, "Starting consumer pool");

    loop {
        let payload = tokio::select! {
            () = cancel_token.cancelled() => break,
            payload = rx.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        let event: EngineEvent = match serde_json::from_slice(&payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(pool = name, "Dropping undecodable message: {e}");
                continue;
            }
        };

        let permit = tokio::select! {
            () = cancel_token.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let handler = handler.clone();
        tracker.spawn(async move {
            let topic = event.topic();
            if let Err(e) = handler.handle(event).await {
                debug!(pool = name, topic = %topic, "Handler failed: {e}");
            }
            drop(permit);
        });
    }

    tracker.close();
    tracker.wait().await;
    info!(pool = name, "Consumer pool stopped");
}
