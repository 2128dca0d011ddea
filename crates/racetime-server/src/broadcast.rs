use std::sync::Arc;

use tokio::sync::broadcast;

use crate::client::ClientRegistry;
use crate::protocol::RaceBroadcast;

/// Forwards race events from the service's broadcast channel to the
/// registry's race groups.
pub struct EventBridge {
    registry: Arc<ClientRegistry>,
}

impl EventBridge {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    pub fn start(&self, mut rx: broadcast::Receiver<RaceBroadcast>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let delivered = registry.broadcast_to_race(&event.race, &event.message);
                        tracing::trace!(
                            race = %event.race,
                            event = event.message.event_type(),
                            delivered,
                            "race event fanned out"
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event bridge lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("event bridge channel closed");
                        break;
                    }
                }
            }
        })
    }
}

pub fn create_bridge(
    registry: Arc<ClientRegistry>,
    rx: broadcast::Receiver<RaceBroadcast>,
) -> tokio::task::JoinHandle<()> {
    EventBridge::new(registry).start(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerMessage;
    use racetime_core::ids::RaceSlug;

    #[tokio::test]
    async fn bridge_forwards_to_group() {
        let registry = Arc::new(ClientRegistry::new(8));
        let race = RaceSlug::parse("race-one-0001").unwrap();
        let (client, mut rx) = registry.register();
        registry.group_add(&race, &client.id);

        let (tx, brx) = broadcast::channel(16);
        let _handle = create_bridge(Arc::clone(&registry), brx);

        tx.send(RaceBroadcast {
            race: race.clone(),
            message: ServerMessage::error("x"),
        })
        .unwrap();
        tx.send(RaceBroadcast {
            race: RaceSlug::parse("other-race-0002").unwrap(),
            message: ServerMessage::Pong,
        })
        .unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(ServerMessage::error("x")));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bridge_stops_when_channel_closes() {
        let registry = Arc::new(ClientRegistry::new(8));
        let (tx, brx) = broadcast::channel::<RaceBroadcast>(4);
        let handle = create_bridge(registry, brx);
        drop(tx);
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
