use crate::hub::HubHandle;

/// Shared by every handler; cloning is cheap.
#[derive(Clone)]
pub(crate) struct AppState {
    hub: HubHandle,
    outbound_queue: usize,
}

impl AppState {
    pub(crate) fn new(hub: HubHandle, outbound_queue: usize) -> Self {
        Self {
            hub,
            outbound_queue: outbound_queue.max(1),
        }
    }

    pub(crate) fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Depth of the per-connection outbound queue.
    pub(crate) fn outbound_queue(&self) -> usize {
        self.outbound_queue
    }
}
