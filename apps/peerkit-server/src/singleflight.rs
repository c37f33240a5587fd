use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

/// Coalesces concurrent calls that share a key into one execution whose
/// result every caller receives. Keys are forgotten once the flight lands, so
/// the next call after completion runs the work again.
pub(crate) struct Singleflight<T> {
    flights: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T> Default for Singleflight<T> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

/// Outcome of [`Singleflight::run`].
pub(crate) struct Landed<T> {
    pub(crate) value: T,
    /// Whether this caller executed the work rather than joining another.
    pub(crate) leader: bool,
}

impl<T: Clone> Singleflight<T> {
    pub(crate) async fn run<F, Fut>(&self, key: &str, work: F) -> Landed<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.join(key);
        let mut leader = false;
        let value = guard
            .cell
            .get_or_init(|| {
                leader = true;
                work()
            })
            .await
            .clone();
        Landed { value, leader }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }

    fn join(&self, key: &str) -> FlightGuard<'_, T> {
        let mut map = self.flights.lock();
        let cell = map
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        FlightGuard {
            singleflight: self,
            key: key.to_string(),
            cell,
        }
    }

    fn release(&self, key: &str, cell: &Arc<OnceCell<T>>) {
        let mut map = self.flights.lock();
        if let Some(existing) = map.get(key) {
            // strong_count 2: the map entry plus the guard being dropped
            let abandoned = Arc::strong_count(cell) <= 2;
            if Arc::ptr_eq(existing, cell) && (cell.initialized() || abandoned) {
                map.remove(key);
            }
        }
    }
}

struct FlightGuard<'a, T: Clone> {
    singleflight: &'a Singleflight<T>,
    key: String,
    cell: Arc<OnceCell<T>>,
}

impl<T: Clone> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        self.singleflight.release(&self.key, &self.cell);
    }
}
