use peerkit_protocol::{PeerOffer, ResourceView};
use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use crate::directory::ResourceDirectory;
use crate::ids::ClientId;
use crate::offers::Pop;
use crate::registry::ClientRegistry;

/// Peers chosen for one resource request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Selection {
    pub(crate) view: ResourceView,
    /// Holders whose pool was drained and should be sent `REPLENISH`.
    pub(crate) replenish: Vec<ClientId>,
}

/// Index range of the holders to consider out of `holders`.
///
/// With more holders than `multiplicity` this is one contiguous window at a
/// uniformly random offset. Holders adjacent in announcement order are
/// picked or skipped together. The window costs one random draw.
pub(crate) fn window<R: Rng + ?Sized>(
    holders: usize,
    multiplicity: usize,
    rng: &mut R,
) -> std::ops::Range<usize> {
    if holders <= multiplicity {
        return 0..holders;
    }
    let start = rng.random_range(0..=holders - multiplicity);
    start..start + multiplicity
}

/// Resolve `url` to its manifest and up to `multiplicity` fresh offers.
pub(crate) fn select<R: Rng + ?Sized>(
    directory: &ResourceDirectory,
    clients: &mut ClientRegistry,
    url: &str,
    multiplicity: usize,
    now: Instant,
    rng: &mut R,
) -> Selection {
    let (file, holders) = directory.holders(url);
    let mut peers = Vec::new();
    let mut replenish = Vec::new();
    for holder in &holders[window(holders.len(), multiplicity, rng)] {
        let Some(client) = clients.get_mut(holder) else {
            continue;
        };
        let pop = client.offers.pop_fresh(now);
        if pop.wants_replenish() {
            replenish.push(holder.clone());
        }
        match pop {
            Pop::Fresh(data) => peers.push(PeerOffer {
                data,
                id: holder.to_string(),
            }),
            Pop::Expired { dropped } => {
                debug!(client = %holder, url, dropped, "discarded stale offers");
            }
            Pop::Empty => {}
        }
    }
    Selection {
        view: ResourceView { file, peers },
        replenish,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ReportOutcome;
    use peerkit_protocol::ChunkManifest;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const TTL: Duration = Duration::from_secs(30);

    fn populated(holders: usize) -> (ResourceDirectory, ClientRegistry, Vec<ClientId>) {
        let mut dir = ResourceDirectory::default();
        let mut clients = ClientRegistry::new(4, TTL);
        let ids: Vec<ClientId> = (0..holders)
            .map(|_| {
                let (tx, _rx) = mpsc::channel(4);
                clients.register(tx)
            })
            .collect();
        for (i, id) in ids.iter().enumerate() {
            let outcome = dir.report(&mut clients, id, "u");
            if i == 0 {
                assert_eq!(outcome, ReportOutcome::FetchNeeded);
            }
        }
        let manifest = Arc::new(ChunkManifest {
            url: "u".into(),
            size: 1,
            chunks: Vec::new(),
        });
        dir.settle(&mut clients, "u", &Ok(manifest));
        (dir, clients, ids)
    }

    proptest! {
        #[test]
        fn window_stays_in_bounds(holders in 0usize..200, multiplicity in 1usize..20, seed in any::<u64>()) {
            let mut rng = StdRng::seed_from_u64(seed);
            let range = window(holders, multiplicity, &mut rng);
            prop_assert!(range.end <= holders);
            prop_assert_eq!(range.len(), holders.min(multiplicity));
        }
    }

    #[test]
    fn unknown_url_yields_placeholder() {
        let mut clients = ClientRegistry::new(4, TTL);
        let mut rng = StdRng::seed_from_u64(1);
        let selection = select(
            &ResourceDirectory::default(),
            &mut clients,
            "nowhere",
            5,
            Instant::now(),
            &mut rng,
        );
        assert_eq!(selection.view, ResourceView::unknown("nowhere"));
        assert!(selection.replenish.is_empty());
    }

    #[test]
    fn holders_without_offers_are_skipped() {
        let (dir, mut clients, _) = populated(3);
        let mut rng = StdRng::seed_from_u64(2);
        let selection = select(&dir, &mut clients, "u", 5, Instant::now(), &mut rng);
        assert_eq!(selection.view.file.size, Some(1));
        assert!(selection.view.peers.is_empty());
        assert!(selection.replenish.is_empty());
    }

    #[test]
    fn picks_one_contiguous_window() {
        let (dir, mut clients, ids) = populated(12);
        let now = Instant::now();
        for id in &ids {
            let client = clients.get_mut(id).unwrap();
            client.offers.push(json!({ "from": id.as_str() }), now);
        }
        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut window_rng = StdRng::seed_from_u64(seed);
            let expected = window(12, 5, &mut window_rng);
            let selection = select(&dir, &mut clients, "u", 5, now, &mut rng);
            let picked: Vec<&str> = selection.view.peers.iter().map(|p| p.id.as_str()).collect();
            let window_ids: Vec<&str> = ids[expected].iter().map(ClientId::as_str).collect();
            assert_eq!(picked, window_ids);
            assert_eq!(selection.replenish.len(), 5);
            for id in &ids {
                clients.get_mut(id).unwrap().offers.push(json!(1), now);
            }
        }
    }

    #[test]
    fn stale_offers_are_dropped_but_replenished() {
        let (dir, mut clients, ids) = populated(1);
        let start = Instant::now();
        clients
            .get_mut(&ids[0])
            .unwrap()
            .offers
            .push(json!("sdp"), start);
        let mut rng = StdRng::seed_from_u64(3);
        let later = start + TTL + Duration::from_secs(1);
        let selection = select(&dir, &mut clients, "u", 5, later, &mut rng);
        assert!(selection.view.peers.is_empty());
        assert_eq!(selection.replenish, vec![ids[0].clone()]);
    }
}
