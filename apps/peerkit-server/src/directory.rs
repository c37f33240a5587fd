//! URL → manifest + holders, kept in lock-step with each client's own
//! `resources` set: `u ∈ c.resources ⇔ c.id ∈ entries[u].holders`.

use std::collections::HashMap;
use std::sync::Arc;

use peerkit_protocol::{ChunkManifest, ResourceFile};

use crate::fetcher::FetchOutcome;
use crate::ids::ClientId;
use crate::registry::{Client, ClientRegistry};

#[derive(Debug)]
pub(crate) struct ResourceEntry {
    pub(crate) manifest: Arc<ChunkManifest>,
    /// Distinct holder ids in announcement order.
    pub(crate) holders: Vec<ClientId>,
}

impl ResourceEntry {
    fn add_holder(&mut self, id: &ClientId) {
        if !self.holders.contains(id) {
            self.holders.push(id.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReportOutcome {
    /// The client already holds the URL or is waiting on it.
    Duplicate,
    /// The resource was already verified; the client now holds it.
    Joined,
    /// A verification is running; the client waits on it.
    Attached,
    /// First report of an unknown URL; the caller must start a fetch.
    FetchNeeded,
    UnknownClient,
}

/// Waiters affected by a finished verification.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Settled {
    pub(crate) joined: Vec<ClientId>,
    pub(crate) rolled_back: Vec<ClientId>,
}

#[derive(Debug, Default)]
pub(crate) struct ResourceDirectory {
    entries: HashMap<String, ResourceEntry>,
    /// URLs under verification and the clients waiting on each.
    in_flight: HashMap<String, Vec<ClientId>>,
}

impl ResourceDirectory {
    pub(crate) fn report(
        &mut self,
        clients: &mut ClientRegistry,
        id: &ClientId,
        url: &str,
    ) -> ReportOutcome {
        let Some(client) = clients.get_mut(id) else {
            return ReportOutcome::UnknownClient;
        };
        if client.resources.contains(url) || client.pending.contains(url) {
            return ReportOutcome::Duplicate;
        }
        if let Some(entry) = self.entries.get_mut(url) {
            entry.add_holder(id);
            client.resources.insert(url.to_string());
            return ReportOutcome::Joined;
        }
        client.pending.insert(url.to_string());
        match self.in_flight.get_mut(url) {
            Some(waiters) => {
                waiters.push(id.clone());
                ReportOutcome::Attached
            }
            None => {
                self.in_flight.insert(url.to_string(), vec![id.clone()]);
                ReportOutcome::FetchNeeded
            }
        }
    }

    /// Apply the outcome of a verification to every client waiting on `url`.
    pub(crate) fn settle(
        &mut self,
        clients: &mut ClientRegistry,
        url: &str,
        outcome: &FetchOutcome,
    ) -> Settled {
        let waiters = self.in_flight.remove(url).unwrap_or_default();
        let mut settled = Settled::default();
        match outcome {
            Ok(manifest) => {
                let entry = self
                    .entries
                    .entry(url.to_string())
                    .or_insert_with(|| ResourceEntry {
                        manifest: Arc::clone(manifest),
                        holders: Vec::new(),
                    });
                for waiter in waiters {
                    let Some(client) = clients.get_mut(&waiter) else {
                        continue;
                    };
                    if client.pending.remove(url) {
                        client.resources.insert(url.to_string());
                        entry.add_holder(&waiter);
                        settled.joined.push(waiter);
                    }
                }
            }
            Err(_) => {
                for waiter in waiters {
                    if let Some(client) = clients.get_mut(&waiter) {
                        if client.pending.remove(url) {
                            settled.rolled_back.push(waiter);
                        }
                    }
                }
            }
        }
        settled
    }

    /// Manifest (or `{url}` placeholder) and ordered holder ids for `url`.
    pub(crate) fn holders(&self, url: &str) -> (ResourceFile, Vec<ClientId>) {
        match self.entries.get(url) {
            Some(entry) => (
                ResourceFile::from(entry.manifest.as_ref()),
                entry.holders.clone(),
            ),
            None => (ResourceFile::placeholder(url), Vec::new()),
        }
    }

    /// Drop every trace of a departing client. Emptied entries stay as
    /// placeholders so a later report reuses the verified manifest.
    pub(crate) fn remove_client(&mut self, client: &Client) {
        for url in &client.resources {
            if let Some(entry) = self.entries.get_mut(url) {
                entry.holders.retain(|holder| holder != &client.id);
            }
        }
        for url in &client.pending {
            if let Some(waiters) = self.in_flight.get_mut(url) {
                waiters.retain(|waiter| waiter != &client.id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn entry(&self, url: &str) -> Option<&ResourceEntry> {
        self.entries.get(url)
    }

    #[cfg(test)]
    pub(crate) fn is_in_flight(&self, url: &str) -> bool {
        self.in_flight.contains_key(url)
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &ResourceEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fetcher::FetchError;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Both directions of the holder/resources mirror.
    pub(crate) fn assert_consistent(dir: &ResourceDirectory, clients: &ClientRegistry) {
        for client in clients.iter() {
            for url in &client.resources {
                let entry = dir.entry(url).expect("held url has an entry");
                assert!(
                    entry.holders.contains(&client.id),
                    "{} holds {url} but is not listed",
                    client.id
                );
            }
        }
        for (url, entry) in dir.iter() {
            for holder in &entry.holders {
                let client = clients.get(holder).expect("holder is a live client");
                assert!(client.resources.contains(url));
            }
        }
    }

    fn manifest(url: &str) -> Arc<ChunkManifest> {
        Arc::new(ChunkManifest {
            url: url.into(),
            size: 10,
            chunks: Vec::new(),
        })
    }

    fn setup(n: usize) -> (ResourceDirectory, ClientRegistry, Vec<ClientId>) {
        let mut clients = ClientRegistry::new(4, Duration::from_secs(30));
        let ids = (0..n)
            .map(|_| {
                let (tx, _rx) = mpsc::channel(4);
                clients.register(tx)
            })
            .collect();
        (ResourceDirectory::default(), clients, ids)
    }

    #[test]
    fn first_report_requests_fetch_and_others_attach() {
        let (mut dir, mut clients, ids) = setup(3);
        assert_eq!(dir.report(&mut clients, &ids[0], "u"), ReportOutcome::FetchNeeded);
        assert_eq!(dir.report(&mut clients, &ids[1], "u"), ReportOutcome::Attached);
        assert_eq!(dir.report(&mut clients, &ids[0], "u"), ReportOutcome::Duplicate);
        assert!(dir.is_in_flight("u"));
        assert!(dir.entry("u").is_none());
        assert_consistent(&dir, &clients);

        let settled = dir.settle(&mut clients, "u", &Ok(manifest("u")));
        assert_eq!(settled.joined, vec![ids[0].clone(), ids[1].clone()]);
        assert_eq!(dir.holders("u").1, vec![ids[0].clone(), ids[1].clone()]);
        assert_consistent(&dir, &clients);

        assert_eq!(dir.report(&mut clients, &ids[2], "u"), ReportOutcome::Joined);
        assert_eq!(dir.report(&mut clients, &ids[2], "u"), ReportOutcome::Duplicate);
        assert_eq!(dir.holders("u").1.len(), 3);
        assert_consistent(&dir, &clients);
    }

    #[test]
    fn failed_fetch_rolls_back_and_allows_retry() {
        let (mut dir, mut clients, ids) = setup(2);
        dir.report(&mut clients, &ids[0], "u");
        dir.report(&mut clients, &ids[1], "u");
        let settled = dir.settle(
            &mut clients,
            "u",
            &Err(FetchError::FetchFailed("status 500".into())),
        );
        assert_eq!(settled.rolled_back.len(), 2);
        assert!(dir.entry("u").is_none());
        assert!(clients.get(&ids[0]).unwrap().pending.is_empty());
        let (file, holders) = dir.holders("u");
        assert!(file.is_placeholder());
        assert!(holders.is_empty());

        assert_eq!(dir.report(&mut clients, &ids[0], "u"), ReportOutcome::FetchNeeded);
    }

    #[test]
    fn removal_clears_holders_and_waiters() {
        let (mut dir, mut clients, ids) = setup(2);
        dir.report(&mut clients, &ids[0], "held");
        dir.settle(&mut clients, "held", &Ok(manifest("held")));
        dir.report(&mut clients, &ids[0], "waiting");
        dir.report(&mut clients, &ids[1], "waiting");

        let gone = clients.remove(&ids[0]).unwrap();
        dir.remove_client(&gone);
        assert!(dir.holders("held").1.is_empty());
        assert!(dir.entry("held").is_some());
        assert_consistent(&dir, &clients);

        let settled = dir.settle(&mut clients, "waiting", &Ok(manifest("waiting")));
        assert_eq!(settled.joined, vec![ids[1].clone()]);
        assert_consistent(&dir, &clients);
    }

    #[test]
    fn unknown_client_is_rejected() {
        let (mut dir, mut clients, _) = setup(0);
        assert_eq!(
            dir.report(&mut clients, &ClientId::from("ghost"), "u"),
            ReportOutcome::UnknownClient
        );
        assert!(!dir.is_in_flight("u"));
        assert_eq!(dir.len(), 0);
    }
}
