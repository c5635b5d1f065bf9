// Fixed set of backend routing subjects; one per live session.
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::AdmissionDenied;

// -----------------------------------------------------------------------------
// ----- Slot ------------------------------------------------------------------

/// Opaque routing identifier, e.g. `voice-3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Slot(Arc<str>);

impl Slot {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// -----------------------------------------------------------------------------
// ----- SlotManager -----------------------------------------------------------

#[derive(Debug)]
pub struct SlotManager {
    prefix: String,
    known: HashSet<Slot>,
    free: Mutex<VecDeque<Slot>>,
}

// -----------------------------------------------------------------------------
// ----- SlotManager: Static ---------------------------------------------------

impl SlotManager {
    pub fn new(prefix: impl Into<String>, size: usize) -> Self {
        let prefix = prefix.into();
        let slots: VecDeque<Slot> = (0..size)
            .map(|i| Slot(Arc::from(format!("{prefix}-{i}"))))
            .collect();

        debug!(
            "slots: {}",
            slots.iter().map(Slot::as_str).collect::<Vec<_>>().join(", ")
        );

        Self {
            prefix,
            known: slots.iter().cloned().collect(),
            free: Mutex::new(slots),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SlotManager: Public ---------------------------------------------------

impl SlotManager {
    /// Never waits. An empty free set is the only admission-control signal.
    pub fn checkout(&self) -> Result<Slot, AdmissionDenied> {
        let slot = self.free.lock().pop_front();
        match slot {
            Some(slot) => {
                debug!(%slot, "slot checked out");
                Ok(slot)
            }
            None => {
                warn!("no free slot under prefix {}", self.prefix);
                Err(AdmissionDenied {
                    capacity: self.capacity(),
                })
            }
        }
    }

    /// Returns `false` for a slot this manager never issued or one that is
    /// already free. Both mean a caller checked in twice.
    pub fn checkin(&self, slot: Slot) -> bool {
        if !self.known.contains(&slot) {
            warn!(%slot, "refusing checkin of unknown slot");
            return false;
        }

        let mut free = self.free.lock();
        if free.len() >= self.known.len() || free.contains(&slot) {
            drop(free);
            warn!(%slot, "refusing duplicate slot checkin");
            return false;
        }

        free.push_back(slot.clone());
        drop(free);

        debug!(%slot, "slot checked in");
        true
    }

    /// Advisory only.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.known.len()
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_prefixed_slots_in_order() {
        let manager = SlotManager::new("voice", 3);
        let names: Vec<_> = (0..3)
            .map(|_| manager.checkout().unwrap().to_string())
            .collect();
        assert_eq!(names, ["voice-0", "voice-1", "voice-2"]);
    }

    #[test]
    fn busy_once_every_slot_is_out() {
        let manager = SlotManager::new("voice", 2);
        let a = manager.checkout().unwrap();
        let _b = manager.checkout().unwrap();

        assert_eq!(manager.checkout(), Err(AdmissionDenied { capacity: 2 }));

        assert!(manager.checkin(a));
        assert_eq!(manager.checkout().unwrap().as_str(), "voice-0");
    }

    #[test]
    fn checkout_then_checkin_restores_free_count() {
        let manager = SlotManager::new("voice", 4);
        let before = manager.available();

        let slot = manager.checkout().unwrap();
        assert_eq!(manager.available(), before - 1);
        assert!(manager.checkin(slot));
        assert_eq!(manager.available(), before);
    }

    #[test]
    fn double_checkin_is_refused() {
        let manager = SlotManager::new("voice", 2);
        let slot = manager.checkout().unwrap();

        assert!(manager.checkin(slot.clone()));
        assert!(!manager.checkin(slot));
        assert_eq!(manager.available(), 2);
    }

    #[test]
    fn foreign_slot_is_refused() {
        let manager = SlotManager::new("voice", 1);
        let other = SlotManager::new("music", 1).checkout().unwrap();

        assert!(!manager.checkin(other));
        assert_eq!(manager.available(), 1);
    }

    #[test]
    fn zero_sized_manager_always_busy() {
        let manager = SlotManager::new("voice", 0);
        assert!(manager.checkout().is_err());
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
