use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use racetime_core::ids::{ClientId, RaceSlug};

use crate::protocol::ServerMessage;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// A client silent for this long is considered gone.
pub const DEAD_AFTER: Duration = Duration::from_secs(90);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One connected socket, as seen by the registry.
pub struct Client {
    pub id: ClientId,
    /// Taken on unregister so the socket's outbound queue ends.
    tx: Mutex<Option<mpsc::Sender<ServerMessage>>>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Client {
    fn new(id: ClientId, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id,
            tx: Mutex::new(Some(tx)),
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_millis()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn mark_alive(&self) {
        self.last_pong.store(now_millis(), Ordering::Relaxed);
    }

    fn is_stale(&self, now_ms: u64, dead_after: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_ms.saturating_sub(last) > dead_after.as_millis() as u64
    }

    /// Queue a frame. A full queue drops the frame instead of blocking
    /// everyone else's fan-out.
    pub fn send(&self, msg: ServerMessage) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(tx) = self.tx.lock().clone() else {
            return false;
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(
                    client_id = %self.id,
                    event = msg.event_type(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.connected.store(false, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Connected sockets and the race groups they listen to.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    groups: DashMap<RaceSlug, HashSet<ClientId>>,
    queue_size: usize,
}

impl ClientRegistry {
    pub fn new(queue_size: usize) -> Self {
        Self {
            clients: DashMap::new(),
            groups: DashMap::new(),
            queue_size,
        }
    }

    /// Add a client. The receiver is the socket's outbound queue.
    pub fn register(&self) -> (Arc<Client>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(self.queue_size);
        let client = Arc::new(Client::new(ClientId::new(), tx));
        self.clients.insert(client.id.clone(), Arc::clone(&client));
        debug!(client_id = %client.id, "client registered");
        (client, rx)
    }

    /// Drop a client and its group memberships. Dropping the sender ends
    /// the socket's outbound queue, even while the socket task still holds
    /// the client.
    pub fn unregister(&self, id: &ClientId) {
        if let Some((_, client)) = self.clients.remove(id) {
            client.connected.store(false, Ordering::Relaxed);
            client.tx.lock().take();
        }
        self.groups.retain(|_, members| {
            members.remove(id);
            !members.is_empty()
        });
        debug!(client_id = %id, "client unregistered");
    }

    pub fn group_add(&self, race: &RaceSlug, id: &ClientId) {
        self.groups.entry(race.clone()).or_default().insert(id.clone());
    }

    pub fn group_discard(&self, race: &RaceSlug, id: &ClientId) {
        let now_empty = match self.groups.get_mut(race) {
            Some(mut members) => {
                members.remove(id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.groups.remove_if(race, |_, members| members.is_empty());
        }
    }

    pub fn send_to(&self, id: &ClientId, msg: ServerMessage) -> bool {
        match self.clients.get(id) {
            Some(client) => client.send(msg),
            None => false,
        }
    }

    /// Fan `msg` out to every member of the race group. Returns how many
    /// queues accepted it.
    pub fn broadcast_to_race(&self, race: &RaceSlug, msg: &ServerMessage) -> usize {
        let members: Vec<ClientId> = match self.groups.get(race) {
            Some(members) => members.iter().cloned().collect(),
            None => return 0,
        };
        members
            .iter()
            .filter(|id| self.send_to(id, msg.clone()))
            .count()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn group_size(&self, race: &RaceSlug) -> usize {
        self.groups.get(race).map_or(0, |m| m.len())
    }

    /// Unregister clients that closed or stopped answering pings.
    pub fn cleanup_dead_clients(&self, dead_after: Duration) -> usize {
        let now_ms = now_millis();
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|c| !c.is_connected() || c.is_stale(now_ms, dead_after))
            .map(|c| c.id.clone())
            .collect();
        for id in &dead {
            self.unregister(id);
        }
        if !dead.is_empty() {
            info!(count = dead.len(), "removed dead clients");
        }
        dead.len()
    }
}

pub fn start_cleanup_task(registry: Arc<ClientRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            registry.cleanup_dead_clients(DEAD_AFTER);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slug(s: &str) -> RaceSlug {
        RaceSlug::parse(s).unwrap()
    }

    #[test]
    fn register_and_unregister() {
        let reg = ClientRegistry::new(8);
        let (a, _rx_a) = reg.register();
        let (b, _rx_b) = reg.register();
        assert_eq!(reg.client_count(), 2);
        reg.group_add(&slug("race-one-0001"), &a.id);
        reg.group_add(&slug("race-one-0001"), &b.id);

        reg.unregister(&a.id);
        assert_eq!(reg.client_count(), 1);
        assert_eq!(reg.group_size(&slug("race-one-0001")), 1);
        assert!(!a.is_connected());
    }

    #[tokio::test]
    async fn broadcast_reaches_only_group_members() {
        let reg = ClientRegistry::new(8);
        let race = slug("race-one-0001");
        let (a, mut rx_a) = reg.register();
        let (_b, mut rx_b) = reg.register();
        reg.group_add(&race, &a.id);

        let delivered = reg.broadcast_to_race(&race, &ServerMessage::Pong);
        assert_eq!(delivered, 1);
        assert_eq!(rx_a.recv().await, Some(ServerMessage::Pong));
        assert!(rx_b.try_recv().is_err());

        assert_eq!(reg.broadcast_to_race(&slug("other-race-0002"), &ServerMessage::Pong), 0);
    }

    #[test]
    fn group_discard_removes_empty_groups() {
        let reg = ClientRegistry::new(8);
        let race = slug("race-one-0001");
        let (a, _rx) = reg.register();
        reg.group_add(&race, &a.id);
        reg.group_discard(&race, &a.id);
        assert_eq!(reg.group_size(&race), 0);
        reg.group_discard(&race, &a.id);
    }

    #[test]
    fn full_queue_drops_messages() {
        let reg = ClientRegistry::new(1);
        let (a, _rx) = reg.register();
        assert!(reg.send_to(&a.id, ServerMessage::Pong));
        assert!(!reg.send_to(&a.id, ServerMessage::Pong));
    }

    #[test]
    fn closed_receiver_marks_disconnected() {
        let reg = ClientRegistry::new(4);
        let (a, rx) = reg.register();
        drop(rx);
        assert!(!reg.send_to(&a.id, ServerMessage::Pong));
        assert!(!a.is_connected());
        assert_eq!(reg.cleanup_dead_clients(DEAD_AFTER), 1);
        assert_eq!(reg.client_count(), 0);
    }

    #[test]
    fn stale_clients_are_swept() {
        let reg = ClientRegistry::new(4);
        let (a, _rx) = reg.register();
        a.last_pong.store(now_millis() - 200_000, Ordering::Relaxed);
        let (b, _rx_b) = reg.register();
        b.mark_alive();
        assert_eq!(reg.cleanup_dead_clients(DEAD_AFTER), 1);
        assert_eq!(reg.client_count(), 1);
    }

    #[tokio::test]
    async fn sweeping_a_client_ends_its_queue() {
        let reg = ClientRegistry::new(4);
        let race = slug("race-one-0001");
        let (a, mut rx) = reg.register();
        reg.group_add(&race, &a.id);
        a.last_pong.store(now_millis() - 200_000, Ordering::Relaxed);

        assert_eq!(reg.cleanup_dead_clients(DEAD_AFTER), 1);
        assert_eq!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        );
        assert_eq!(rx.recv().await, None);
        assert!(!a.send(ServerMessage::Pong));
        assert_eq!(reg.group_size(&race), 0);
    }
}
