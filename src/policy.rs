//! Where proposed congestion windows come from.
//!
//! An external program decides the cwnd it wants and publishes it into a
//! small slot map. The decision engine only ever performs one bounded,
//! non-blocking read per tick; anything that would wait is reported as
//! "unavailable" instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, TryLockError};

use anyhow::{bail, Result};
use tracing::info;

use crate::state::FlowStats;

/// Single-key lookup of a proposed cwnd.
pub trait PolicySource {
    /// Sees the flow as it stands on each tick, before `get`.
    ///
    /// `stats` carries the tick's rate sample and congestion state along
    /// with the qwindow history. Sources that only serve stored values
    /// ignore it.
    fn observe(&self, _key: u32, _stats: &FlowStats, _prev_cwnd: u32) {}

    /// `None` when no value can be produced right now.
    fn get(&self, key: u32) -> Option<u32>;
}

impl<P: PolicySource + ?Sized> PolicySource for &P {
    fn observe(&self, key: u32, stats: &FlowStats, prev_cwnd: u32) {
        (**self).observe(key, stats, prev_cwnd)
    }

    fn get(&self, key: u32) -> Option<u32> {
        (**self).get(key)
    }
}

impl<P: PolicySource + ?Sized> PolicySource for Arc<P> {
    fn observe(&self, key: u32, stats: &FlowStats, prev_cwnd: u32) {
        (**self).observe(key, stats, prev_cwnd)
    }

    fn get(&self, key: u32) -> Option<u32> {
        (**self).get(key)
    }
}

impl<P: PolicySource + ?Sized> PolicySource for Box<P> {
    fn observe(&self, key: u32, stats: &FlowStats, prev_cwnd: u32) {
        (**self).observe(key, stats, prev_cwnd)
    }

    fn get(&self, key: u32) -> Option<u32> {
        (**self).get(key)
    }
}

// Upper half of a slot flags presence, lower half carries the value.
const PRESENT: u64 = 1 << 32;

/// Fixed array of cwnd slots shared between a writer and the engine.
///
/// Each slot is a single atomic word, so readers never see a torn value
/// and the most recent write wins.
#[derive(Debug)]
pub struct CwndMap {
    slots: Box<[AtomicU64]>,
}

impl CwndMap {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: (0..slots).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Publish `cwnd` under `key`.
    pub fn set(&self, key: u32, cwnd: u32) -> Result<()> {
        let Some(slot) = self.slot(key) else {
            bail!("cwnd map key {} out of range (size {})", key, self.len());
        };
        slot.store(PRESENT | u64::from(cwnd), Ordering::Release);
        Ok(())
    }

    /// Withdraw the value under `key`; reads become unavailable.
    pub fn clear(&self, key: u32) -> Result<()> {
        let Some(slot) = self.slot(key) else {
            bail!("cwnd map key {} out of range (size {})", key, self.len());
        };
        slot.store(0, Ordering::Release);
        Ok(())
    }

    fn slot(&self, key: u32) -> Option<&AtomicU64> {
        usize::try_from(key).ok().and_then(|k| self.slots.get(k))
    }
}

impl Default for CwndMap {
    fn default() -> Self {
        Self::new(1)
    }
}

impl PolicySource for CwndMap {
    fn get(&self, key: u32) -> Option<u32> {
        let word = self.slot(key)?.load(Ordering::Acquire);
        (word & PRESENT != 0).then_some(word as u32)
    }
}

/// Registration point for the writer's map.
///
/// Starts empty. Lookups go through `try_read`, so a lookup racing a
/// register/unregister reports unavailable rather than waiting.
#[derive(Debug, Default)]
pub struct CwndStore {
    map: RwLock<Option<Arc<CwndMap>>>,
}

impl CwndStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `map`, returning the one it replaces.
    pub fn register(&self, map: Arc<CwndMap>) -> Option<Arc<CwndMap>> {
        let slots = map.len();
        let previous = self
            .map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(map);
        info!(slots, replaced = previous.is_some(), "cwnd map registered");
        previous
    }

    pub fn unregister(&self) -> Option<Arc<CwndMap>> {
        let previous = self
            .map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            info!("cwnd map unregistered");
        }
        previous
    }

    pub fn is_registered(&self) -> bool {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl PolicySource for CwndStore {
    fn get(&self, key: u32) -> Option<u32> {
        let guard = match self.map.try_read() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        let map = guard.as_ref()?;
        map.get(key)
    }
}
