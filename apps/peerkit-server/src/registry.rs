use std::collections::{HashMap, HashSet};
use std::time::Duration;

use peerkit_protocol::ServerMessage;
use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tokio::time::Instant;
use tracing::debug;

use crate::ids::{self, ClientId};
use crate::offers::OfferPool;

/// One live signaling connection.
#[derive(Debug)]
pub(crate) struct Client {
    pub(crate) id: ClientId,
    /// URLs this client holds; mirrors directory membership.
    pub(crate) resources: HashSet<String>,
    /// URLs reported while their verification is still in flight.
    pub(crate) pending: HashSet<String>,
    pub(crate) offers: OfferPool,
    outbound: mpsc::Sender<ServerMessage>,
    pub(crate) connected_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum SendError {
    #[error("client {0} is gone")]
    Gone(ClientId),
    #[error("outbound queue of client {0} is full")]
    Full(ClientId),
}

impl Client {
    /// Queue a frame for the client's socket without waiting.
    pub(crate) fn send(&self, message: ServerMessage) -> Result<(), SendError> {
        self.outbound.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => SendError::Full(self.id.clone()),
            TrySendError::Closed(_) => SendError::Gone(self.id.clone()),
        })
    }

    /// Claim one outbound slot without waiting.
    pub(crate) fn reserve(&self) -> Result<OwnedPermit<ServerMessage>, SendError> {
        self.outbound
            .clone()
            .try_reserve_owned()
            .map_err(|err| match err {
                TrySendError::Full(_) => SendError::Full(self.id.clone()),
                TrySendError::Closed(_) => SendError::Gone(self.id.clone()),
            })
    }
}

/// Live clients keyed by id.
#[derive(Debug)]
pub(crate) struct ClientRegistry {
    clients: HashMap<ClientId, Client>,
    pool_capacity: usize,
    offer_ttl: Duration,
}

impl ClientRegistry {
    pub(crate) fn new(pool_capacity: usize, offer_ttl: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            pool_capacity,
            offer_ttl,
        }
    }

    pub(crate) fn register(&mut self, outbound: mpsc::Sender<ServerMessage>) -> ClientId {
        let id = ids::generate_unique(|candidate| self.clients.contains_key(candidate));
        let client = Client {
            id: id.clone(),
            resources: HashSet::new(),
            pending: HashSet::new(),
            offers: OfferPool::new(self.pool_capacity, self.offer_ttl),
            outbound,
            connected_at: Instant::now(),
        };
        self.clients.insert(id.clone(), client);
        debug!(client = %id, total = self.clients.len(), "client registered");
        id
    }

    pub(crate) fn get(&self, id: &ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &ClientId) -> Option<&mut Client> {
        self.clients.get_mut(id)
    }

    pub(crate) fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    /// Detach a client record. `None` when it was already removed.
    pub(crate) fn remove(&mut self, id: &ClientId) -> Option<Client> {
        let removed = self.clients.remove(id);
        if removed.is_some() {
            debug!(client = %id, total = self.clients.len(), "client removed");
        }
        removed
    }

    pub(crate) fn send(&self, id: &ClientId, message: ServerMessage) -> Result<(), SendError> {
        match self.clients.get(id) {
            Some(client) => client.send(message),
            None => Err(SendError::Gone(id.clone())),
        }
    }

    pub(crate) fn reserve(&self, id: &ClientId) -> Result<OwnedPermit<ServerMessage>, SendError> {
        match self.clients.get(id) {
            Some(client) => client.reserve(),
            None => Err(SendError::Gone(id.clone())),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(4, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn register_assigns_distinct_ids() {
        let mut reg = registry();
        let (tx, _rx) = mpsc::channel(4);
        let a = reg.register(tx.clone());
        let b = reg.register(tx);
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
        assert!(reg.get(&a).unwrap().resources.is_empty());
    }

    #[tokio::test]
    async fn send_reports_full_and_gone() {
        let mut reg = registry();
        let (tx, mut rx) = mpsc::channel(1);
        let id = reg.register(tx);

        reg.send(&id, ServerMessage::Replenish { count: 1 }).unwrap();
        assert_eq!(
            reg.send(&id, ServerMessage::Replenish { count: 1 }),
            Err(SendError::Full(id.clone()))
        );
        assert_eq!(rx.recv().await, Some(ServerMessage::Replenish { count: 1 }));

        drop(rx);
        assert_eq!(
            reg.send(&id, ServerMessage::Replenish { count: 1 }),
            Err(SendError::Gone(id.clone()))
        );

        assert!(reg.remove(&id).is_some());
        assert!(reg.remove(&id).is_none());
        assert_eq!(
            reg.send(&id, ServerMessage::Replenish { count: 1 }),
            Err(SendError::Gone(id))
        );
    }

    #[tokio::test]
    async fn reserve_holds_a_slot_until_used() {
        let mut reg = registry();
        let (tx, mut rx) = mpsc::channel(1);
        let id = reg.register(tx);

        let permit = reg.reserve(&id).unwrap();
        assert!(matches!(reg.reserve(&id), Err(SendError::Full(_))));
        assert_eq!(
            reg.send(&id, ServerMessage::Replenish { count: 1 }),
            Err(SendError::Full(id.clone()))
        );
        permit.send(ServerMessage::Replenish { count: 2 });
        assert_eq!(rx.recv().await, Some(ServerMessage::Replenish { count: 2 }));

        assert!(matches!(
            reg.reserve(&ClientId::from("ghost")),
            Err(SendError::Gone(_))
        ));
    }
}
