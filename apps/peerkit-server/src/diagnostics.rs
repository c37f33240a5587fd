use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::hub::{HubSnapshot, WeakHubHandle};
use crate::tasks::{self, TaskHandle};

/// Periodically log hub state at debug level until the hub goes away.
pub(crate) fn spawn(hub: WeakHubHandle, every: Duration) -> TaskHandle {
    tasks::spawn_supervised("diagnostics", move || run(hub.clone(), every))
}

async fn run(hub: WeakHubHandle, every: Duration) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(handle) = hub.upgrade() else {
            break;
        };
        match handle.snapshot().await {
            Ok(snapshot) => log_snapshot(&snapshot),
            Err(_) => break,
        }
    }
}

fn log_snapshot(snapshot: &HubSnapshot) {
    debug!(
        clients = snapshot.clients.len(),
        resources = snapshot.resources.len(),
        fetches_in_flight = snapshot.fetches_in_flight,
        served = snapshot.served,
        "hub state"
    );
    for resource in &snapshot.resources {
        debug!(url = %resource.url, holders = resource.holders, "resource");
    }
    for client in &snapshot.clients {
        debug!(
            client = %client.id,
            resources = client.resources,
            offers = client.offers,
            connected_secs = client.connected_secs,
            "client"
        );
    }
}
