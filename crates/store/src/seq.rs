//! Global sequence assignment and the committed horizon.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out ranges of global positions and tracks which ranges are still
/// in flight.
///
/// Every committed event in the store carries a position drawn from this
/// counter, which is what makes the merged order total. Reservation is a
/// single counter bump plus a ledger insert; no I/O ever happens while the
/// ledger is locked.
///
/// ## Horizon
///
/// The **horizon** is the lowest global position that may still change.
/// Everything below it is either committed or permanently abandoned (a
/// reservation released without a commit), so merged readers can surface any
/// event below the horizon without risking a lower-positioned event appearing
/// later. Positions are therefore strictly increasing but not contiguous.
#[derive(Debug, Default)]
pub struct GlobalSequencer {
    next: AtomicU64,
    in_flight: Mutex<BTreeMap<u64, u64>>,
}

/// A reserved range of global positions, not yet released.
///
/// Hold it across the durability write; release it once the records are
/// visible (or the write failed and the range is abandoned).
#[must_use]
#[derive(Debug)]
pub struct Reservation {
    start: u64,
    end: u64,
}

impl Reservation {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Positions in this reservation, in order.
    pub fn positions(&self) -> std::ops::Range<u64> {
        self.start..self.end
    }
}

impl GlobalSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after recovery: the next reservation starts at `next`.
    pub fn starting_at(next: u64) -> Self {
        Self {
            next: AtomicU64::new(next),
            in_flight: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reserve `count` consecutive global positions.
    ///
    /// The counter bump happens under the ledger lock so that `horizon` can
    /// never observe the bumped counter before the reservation is visible.
    pub fn reserve(&self, count: u64) -> Reservation {
        let mut in_flight = self.in_flight.lock().unwrap();
        let start = self.next.fetch_add(count, Ordering::SeqCst);
        if count > 0 {
            in_flight.insert(start, start + count);
        }
        Reservation {
            start,
            end: start + count,
        }
    }

    /// Release a reservation, committed or abandoned.
    pub fn release(&self, reservation: Reservation) {
        if reservation.is_empty() {
            return;
        }
        let mut in_flight = self.in_flight.lock().unwrap();
        in_flight.remove(&reservation.start);
    }

    /// Lowest global position that may still change.
    pub fn horizon(&self) -> u64 {
        let in_flight = self.in_flight.lock().unwrap();
        in_flight
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.next.load(Ordering::SeqCst))
    }
}
