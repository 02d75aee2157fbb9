//! Counting gate bounding the number of in-flight command units

use crate::error::{EngineError, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Counters {
    in_flight: usize,
    peak: usize,
}

/// Blocks submitters once `capacity` units are in flight.
///
/// A [`GatePermit`] is taken before a unit is encoded and moved into its
/// completion handler; dropping the permit frees the slot.
#[derive(Debug)]
pub struct InFlightGate {
    capacity: usize,
    counters: Mutex<Counters>,
    released: Condvar,
}

impl InFlightGate {
    pub fn new(capacity: usize) -> Result<Arc<Self>> {
        if capacity == 0 {
            return Err(EngineError::config("in-flight capacity must be positive"));
        }
        Ok(Arc::new(Self {
            capacity,
            counters: Mutex::new(Counters::default()),
            released: Condvar::new(),
        }))
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a slot, waiting for one to free up if the gate is full.
    pub fn acquire(self: &Arc<Self>) -> GatePermit {
        let mut counters = self.counters();
        while counters.in_flight >= self.capacity {
            counters = self
                .released
                .wait(counters)
                .unwrap_or_else(PoisonError::into_inner);
        }
        counters.in_flight += 1;
        counters.peak = counters.peak.max(counters.in_flight);
        GatePermit {
            gate: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut counters = self.counters();
        counters.in_flight = counters.in_flight.saturating_sub(1);
        self.released.notify_all();
    }

    /// Block until every permit has been returned.
    pub fn wait_idle(&self) {
        let mut counters = self.counters();
        while counters.in_flight > 0 {
            counters = self
                .released
                .wait(counters)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.counters().in_flight
    }

    /// Highest number of simultaneously held permits so far.
    pub fn peak_in_flight(&self) -> usize {
        self.counters().peak
    }
}

/// One occupied slot of an [`InFlightGate`], released on drop.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<InFlightGate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}
