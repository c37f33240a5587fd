//! The signaling core.
//!
//! One task owns the directory, the registry and every offer pool and
//! applies [`HubEvent`]s strictly one at a time. Socket tasks, the polling
//! endpoint and background fetches only talk to it through the queue.
//!
//! The queue is bounded. Producers wait for room, so a socket that floods
//! frames is held back at its own reader instead of growing the queue.

use std::sync::Arc;
use std::time::Duration;

use peerkit_core::SignalingConfig;
use peerkit_protocol::{decode_client_frame, ClientMessage, PollResponse, ServerMessage};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::directory::{ReportOutcome, ResourceDirectory};
use crate::fetcher::{FetchOutcome, ResourceFetcher};
use crate::ids::ClientId;
use crate::registry::{ClientRegistry, SendError};
use crate::selector::{self, Selection};

pub(crate) enum HubEvent {
    Connect {
        outbound: mpsc::Sender<ServerMessage>,
        reply: oneshot::Sender<ClientId>,
    },
    Frame {
        client: ClientId,
        text: String,
    },
    Disconnect {
        client: ClientId,
    },
    FetchDone {
        url: String,
        outcome: FetchOutcome,
    },
    Poll {
        urls: Vec<String>,
        reply: oneshot::Sender<PollResponse>,
    },
    Snapshot {
        reply: oneshot::Sender<HubSnapshot>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("signaling hub has stopped")]
pub(crate) struct HubClosed;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum RelayError {
    #[error("relay destination {0} is gone")]
    DestinationGone(ClientId),
    #[error("outbound queue of {0} is full")]
    OutboundFull(ClientId),
}

impl From<SendError> for RelayError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Gone(id) => RelayError::DestinationGone(id),
            SendError::Full(id) => RelayError::OutboundFull(id),
        }
    }
}

/// Point-in-time view of hub state for diagnostics and health checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct HubSnapshot {
    pub(crate) clients: Vec<ClientSummary>,
    pub(crate) resources: Vec<ResourceSummary>,
    pub(crate) fetches_in_flight: usize,
    pub(crate) served: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ClientSummary {
    pub(crate) id: String,
    pub(crate) resources: usize,
    pub(crate) offers: usize,
    pub(crate) connected_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ResourceSummary {
    pub(crate) url: String,
    pub(crate) holders: usize,
}

/// Cloneable sender side of the hub queue.
#[derive(Clone)]
pub(crate) struct HubHandle {
    events: mpsc::Sender<HubEvent>,
}

impl HubHandle {
    /// Waits while the queue is full.
    async fn post(&self, event: HubEvent) -> Result<(), HubClosed> {
        self.events.send(event).await.map_err(|_| HubClosed)
    }

    /// Register a connection whose outbound frames go to `outbound`.
    pub(crate) async fn connect(
        &self,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<ClientId, HubClosed> {
        let (reply, rx) = oneshot::channel();
        self.post(HubEvent::Connect { outbound, reply }).await?;
        rx.await.map_err(|_| HubClosed)
    }

    pub(crate) async fn frame(&self, client: &ClientId, text: String) -> Result<(), HubClosed> {
        self.post(HubEvent::Frame {
            client: client.clone(),
            text,
        })
        .await
    }

    pub(crate) async fn disconnect(&self, client: &ClientId) -> Result<(), HubClosed> {
        self.post(HubEvent::Disconnect {
            client: client.clone(),
        })
        .await
    }

    pub(crate) async fn poll(&self, urls: Vec<String>) -> Result<PollResponse, HubClosed> {
        let (reply, rx) = oneshot::channel();
        self.post(HubEvent::Poll { urls, reply }).await?;
        rx.await.map_err(|_| HubClosed)
    }

    pub(crate) async fn snapshot(&self) -> Result<HubSnapshot, HubClosed> {
        let (reply, rx) = oneshot::channel();
        self.post(HubEvent::Snapshot { reply }).await?;
        rx.await.map_err(|_| HubClosed)
    }

    /// A handle that does not keep the hub running.
    pub(crate) fn downgrade(&self) -> WeakHubHandle {
        WeakHubHandle {
            events: self.events.downgrade(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct WeakHubHandle {
    events: mpsc::WeakSender<HubEvent>,
}

impl WeakHubHandle {
    pub(crate) fn upgrade(&self) -> Option<HubHandle> {
        self.events.upgrade().map(|events| HubHandle { events })
    }
}

pub(crate) fn channel(capacity: usize) -> (HubHandle, mpsc::Receiver<HubEvent>) {
    let (events, rx) = mpsc::channel(capacity.max(1));
    (HubHandle { events }, rx)
}

#[derive(Debug, Clone)]
pub(crate) struct HubSettings {
    pub(crate) multiplicity: usize,
    pub(crate) conn_expiry: Duration,
    pub(crate) peer_max_conns: usize,
}

impl From<&SignalingConfig> for HubSettings {
    fn from(cfg: &SignalingConfig) -> Self {
        Self {
            multiplicity: cfg.multiplicity,
            conn_expiry: cfg.conn_expiry(),
            peer_max_conns: cfg.peer_max_conns,
        }
    }
}

pub(crate) struct Hub {
    settings: HubSettings,
    directory: ResourceDirectory,
    clients: ClientRegistry,
    fetcher: Arc<dyn ResourceFetcher>,
    /// Weak so background fetches never keep the hub alive.
    events: mpsc::WeakSender<HubEvent>,
    rng: StdRng,
    served: u64,
}

impl Hub {
    pub(crate) fn new(
        settings: HubSettings,
        fetcher: Arc<dyn ResourceFetcher>,
        handle: &HubHandle,
    ) -> Self {
        Self {
            clients: ClientRegistry::new(settings.peer_max_conns, settings.conn_expiry),
            settings,
            directory: ResourceDirectory::default(),
            fetcher,
            events: handle.events.downgrade(),
            rng: StdRng::from_os_rng(),
            served: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Process events until every [`HubHandle`] is dropped.
    pub(crate) async fn run(mut self, mut events: mpsc::Receiver<HubEvent>) {
        info!(
            multiplicity = self.settings.multiplicity,
            conn_expiry_secs = self.settings.conn_expiry.as_secs(),
            peer_max_conns = self.settings.peer_max_conns,
            "signaling hub started"
        );
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        info!(clients = self.clients.len(), "signaling hub stopped");
    }

    fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connect { outbound, reply } => {
                let id = self.clients.register(outbound);
                if reply.send(id.clone()).is_err() {
                    // The socket task went away before learning its id.
                    self.teardown(&id);
                }
            }
            HubEvent::Frame { client, text } => self.on_frame(&client, &text),
            HubEvent::Disconnect { client } => {
                self.teardown(&client);
            }
            HubEvent::FetchDone { url, outcome } => self.on_fetch_done(&url, outcome),
            HubEvent::Poll { urls, reply } => {
                let _ = reply.send(self.poll(urls));
            }
            HubEvent::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn on_frame(&mut self, id: &ClientId, text: &str) {
        if !self.clients.contains(id) {
            debug!(client = %id, "ignoring frame from departed client");
            return;
        }
        let message = match decode_client_frame(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(client = %id, %err, "dropping malformed frame");
                return;
            }
        };
        debug!(client = %id, kind = message.kind(), "frame");
        match message {
            ClientMessage::Report { url } => self.on_report(id, url),
            ClientMessage::Request { url } => {
                // Claim the reply slot first so offers are only popped for a
                // requester that can receive them.
                let permit = match self.clients.reserve(id) {
                    Ok(permit) => permit,
                    Err(err) => {
                        warn!(client = %id, url = %url, %err, "request dropped; offers left pooled");
                        return;
                    }
                };
                let Selection { view, replenish } = self.select(&url);
                permit.send(ServerMessage::Resource(view));
                self.replenish(replenish);
            }
            ClientMessage::Conn { conn } => self.on_conn(id, conn),
            ClientMessage::Response { id: dest, data } => {
                if let Err(err) = self.relay(&ClientId::from(dest), data) {
                    debug!(client = %id, %err, "relay dropped");
                }
            }
            ClientMessage::Invalid { id: accused, url } => {
                let accused = ClientId::from(accused);
                warn!(
                    reporter = %id,
                    accused = %accused,
                    url = url.as_deref().unwrap_or(""),
                    "peer reported for serving invalid data"
                );
                self.teardown(&accused);
            }
            ClientMessage::Served {} => {
                self.served += 1;
                info!(client = %id, served = self.served, "peer served a resource");
            }
            ClientMessage::Unrecognized(kind) => {
                debug!(client = %id, kind = %kind, "ignoring unknown message type");
            }
        }
    }

    fn on_report(&mut self, id: &ClientId, url: String) {
        match self.directory.report(&mut self.clients, id, &url) {
            ReportOutcome::FetchNeeded => self.spawn_fetch(url),
            outcome => debug!(client = %id, url = %url, ?outcome, "report"),
        }
    }

    fn spawn_fetch(&self, url: String) {
        let fetcher = Arc::clone(&self.fetcher);
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = fetcher.fetch(&url).await;
            if let Some(events) = events.upgrade() {
                let _ = events.send(HubEvent::FetchDone { url, outcome }).await;
            }
        });
    }

    fn on_fetch_done(&mut self, url: &str, outcome: FetchOutcome) {
        let settled = self.directory.settle(&mut self.clients, url, &outcome);
        match &outcome {
            Ok(_) => debug!(url, holders = settled.joined.len(), "resource registered"),
            Err(err) => info!(
                url,
                %err,
                rolled_back = settled.rolled_back.len(),
                "report rejected"
            ),
        }
    }

    fn on_conn(&mut self, id: &ClientId, conn: Value) {
        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        if !client.offers.push(conn, Instant::now()) {
            debug!(client = %id, pooled = client.offers.len(), "offer pool full, dropping offer");
        }
    }

    fn select(&mut self, url: &str) -> Selection {
        selector::select(
            &self.directory,
            &mut self.clients,
            url,
            self.settings.multiplicity,
            Instant::now(),
            &mut self.rng,
        )
    }

    fn replenish(&self, holders: Vec<ClientId>) {
        for holder in holders {
            if let Err(err) = self.clients.send(&holder, ServerMessage::Replenish { count: 1 }) {
                debug!(client = %holder, %err, "replenish not delivered");
            }
        }
    }

    /// Best effort: forward `data` to `dest` without acknowledgement.
    pub(crate) fn relay(&self, dest: &ClientId, data: Value) -> Result<(), RelayError> {
        self.clients
            .send(dest, ServerMessage::Response { data })
            .map_err(RelayError::from)
    }

    /// Remove a client and every reference to it. Returns `false` when the
    /// id was unknown or already removed.
    pub(crate) fn teardown(&mut self, id: &ClientId) -> bool {
        let Some(client) = self.clients.remove(id) else {
            return false;
        };
        self.directory.remove_client(&client);
        info!(
            client = %id,
            resources = client.resources.len(),
            clients = self.clients.len(),
            "client torn down"
        );
        // Dropping `client` closes its outbound queue, which ends the socket.
        true
    }

    fn poll(&mut self, urls: Vec<String>) -> PollResponse {
        let mut response = PollResponse::new();
        for url in urls {
            if url.is_empty() || response.contains_key(&url) {
                continue;
            }
            let Selection { view, replenish } = self.select(&url);
            self.replenish(replenish);
            response.insert(url, view);
        }
        response
    }

    fn snapshot(&self) -> HubSnapshot {
        let now = Instant::now();
        let mut clients: Vec<ClientSummary> = self
            .clients
            .iter()
            .map(|client| ClientSummary {
                id: client.id.to_string(),
                resources: client.resources.len(),
                offers: client.offers.len(),
                connected_secs: now.duration_since(client.connected_at).as_secs(),
            })
            .collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        let mut resources: Vec<ResourceSummary> = self
            .directory
            .iter()
            .map(|(url, entry)| ResourceSummary {
                url: url.clone(),
                holders: entry.holders.len(),
            })
            .collect();
        resources.sort_by(|a, b| a.url.cmp(&b.url));
        HubSnapshot {
            clients,
            resources,
            fetches_in_flight: self.directory.in_flight_len(),
            served: self.served,
        }
    }
}
