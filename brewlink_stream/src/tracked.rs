//! The appliances the connection must stay registered for

use std::sync::{Mutex, MutexGuard};

use crate::{SerialNumber, SerialNumberRef};

/// A tracked appliance
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Tracked {
    /// The appliance's serial number
    pub(crate) serial_number: SerialNumber,
    /// The appliance model announced when registering
    pub(crate) model: String,
}

/// The set of tracked appliances, kept in the order they were added
///
/// Consumers mutate the set while the supervisor reads snapshots of it. The
/// lock is held only for the duration of each call, never across I/O.
#[derive(Debug, Default)]
pub(crate) struct TrackedSet {
    entries: Mutex<Vec<Tracked>>,
}

impl TrackedSet {
    fn lock(&self) -> MutexGuard<'_, Vec<Tracked>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds an appliance, returning `false` if it was already tracked
    ///
    /// An appliance that is already tracked keeps its position.
    pub(crate) fn insert(&self, tracked: Tracked) -> bool {
        let mut entries = self.lock();
        if entries
            .iter()
            .any(|t| t.serial_number == tracked.serial_number)
        {
            return false;
        }

        entries.push(tracked);
        true
    }

    /// Removes an appliance, returning `false` if it was not tracked
    pub(crate) fn remove(&self, serial_number: &SerialNumberRef) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|t| *t.serial_number != *serial_number);
        entries.len() != before
    }

    pub(crate) fn get(&self, serial_number: &SerialNumberRef) -> Option<Tracked> {
        self.lock()
            .iter()
            .find(|t| *t.serial_number == *serial_number)
            .cloned()
    }

    pub(crate) fn contains(&self, serial_number: &SerialNumberRef) -> bool {
        self.get(serial_number).is_some()
    }

    /// The tracked appliances in the order they were added
    pub(crate) fn snapshot(&self) -> Vec<Tracked> {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(serial: &'static str) -> Tracked {
        Tracked {
            serial_number: SerialNumber::from_static(serial),
            model: "BES995".into(),
        }
    }

    fn serials(set: &TrackedSet) -> Vec<String> {
        set.snapshot()
            .into_iter()
            .map(|t| t.serial_number.as_str().to_owned())
            .collect()
    }

    #[test]
    fn snapshots_keep_insertion_order() {
        let set = TrackedSet::default();
        for serial in ["C", "A", "B"] {
            assert!(set.insert(tracked(serial)));
        }

        assert_eq!(serials(&set), ["C", "A", "B"]);
    }

    #[test]
    fn re_adding_keeps_the_original_position() {
        let set = TrackedSet::default();
        set.insert(tracked("A"));
        set.insert(tracked("B"));

        assert!(!set.insert(tracked("A")));
        assert_eq!(serials(&set), ["A", "B"]);
    }

    #[test]
    fn removed_appliances_leave_later_snapshots() {
        let set = TrackedSet::default();
        set.insert(tracked("A"));
        set.insert(tracked("B"));
        let before = set.snapshot();

        assert!(set.remove(SerialNumberRef::from_static("A")));
        assert!(!set.remove(SerialNumberRef::from_static("A")));

        assert_eq!(before.len(), 2);
        assert_eq!(serials(&set), ["B"]);
        assert!(!set.contains(SerialNumberRef::from_static("A")));
    }
}
