use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use strum::IntoEnumIterator;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{EngineEvent, EventPublisher, Topic};
use crate::error::{Error, ErrorDetails};

/// Bus for single-process deployments and tests.
///
/// Events are JSON-encoded on publish, one unbounded channel per topic. Delayed events are
/// held by tracked tasks; `shutdown` drops the ones that are still waiting.
pub struct InMemoryEventBus {
    senders: HashMap<Topic, mpsc::UnboundedSender<Vec<u8>>>,
    delayed: TaskTracker,
    cancel_token: CancellationToken,
}

/// Receiving halves of the bus, handed to consumers topic by topic.
pub struct BusReceivers {
    receivers: HashMap<Topic, mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl BusReceivers {
    pub fn take(&mut self, topic: Topic) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.receivers.remove(&topic)
    }
}

impl InMemoryEventBus {
    pub fn new() -> (Self, BusReceivers) {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for topic in Topic::iter() {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(topic, tx);
            receivers.insert(topic, rx);
        }
        (
            Self {
                senders,
                delayed: TaskTracker::new(),
                cancel_token: CancellationToken::new(),
            },
            BusReceivers { receivers },
        )
    }

    /// Drops pending delayed deliveries and waits for their tasks to exit.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        self.delayed.close();
        self.delayed.wait().await;
    }

    fn sender(&self, topic: Topic) -> Result<mpsc::UnboundedSender<Vec<u8>>, Error> {
        self.senders.get(&topic).cloned().ok_or_else(|| {
            Error::new(ErrorDetails::MessageBus {
                message: format!("No channel registered for topic `{topic}`"),
            })
        })
    }
}

fn send(
    sender: &mpsc::UnboundedSender<Vec<u8>>,
    topic: Topic,
    payload: Vec<u8>,
) -> Result<(), Error> {
    sender.send(payload).map_err(|_| {
        Error::new(ErrorDetails::MessageBus {
            message: format!("Consumer of topic `{topic}` is gone"),
        })
    })
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, event: EngineEvent, delay: Option<Duration>) -> Result<(), Error> {
        let topic = event.topic();
        let payload = serde_json::to_vec(&event)?;
        let sender = self.sender(topic)?;
        match delay {
            Some(delay) if !delay.is_zero() => {
                let cancel_token = self.cancel_token.clone();
                self.delayed.spawn(async move {
                    tokio::select! {
                        () = cancel_token.cancelled() => {
                            tracing::debug!(topic = %topic, "Dropping delayed event on shutdown");
                        }
                        () = tokio::time::sleep(delay) => {
                            if let Err(e) = send(&sender, topic, payload) {
                                e.log();
                            }
                        }
                    }
                });
                Ok(())
            }
            _ => send(&sender, topic, payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AggrCalculateEvent;

    fn event(experiment_id: i64) -> EngineEvent {
        EngineEvent::AggrCalculate(AggrCalculateEvent::for_evaluator(1, experiment_id, 9))
    }

    #[tokio::test]
    async fn test_publish_and_delayed_publish() {
        let (bus, mut receivers) = InMemoryEventBus::new();
        let mut rx = receivers.take(Topic::AggrCalculate).unwrap();
        assert!(receivers.take(Topic::AggrCalculate).is_none());

        bus.publish(event(2), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        bus.publish(event(1), None).await.unwrap();

        let first: EngineEvent = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        let second: EngineEvent = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first, event(1));
        assert_eq!(second, event(2));
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending_delays() {
        let (bus, mut receivers) = InMemoryEventBus::new();
        let mut rx = receivers.take(Topic::AggrCalculate).unwrap();
        bus.publish(event(1), Some(Duration::from_secs(3_600)))
            .await
            .unwrap();
        bus.shutdown().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_fails_when_consumer_dropped() {
        let (bus, receivers) = InMemoryEventBus::new();
        drop(receivers);
        let err = bus.publish(event(1), None).await.unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::MessageBus { .. }));
    }
}
