//! Process-scoped registry of available drivers and their last-known
//! locations.
//!
//! Created at service start, cleared at shutdown. Nothing here is
//! persisted: entries are lost on process restart, and a driver re-enters
//! the pool through registration before location reports are accepted.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{GeoPoint, Identity};

#[derive(Default)]
pub struct DriverRegistry {
    entries: RwLock<HashMap<Identity, Option<GeoPoint>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a driver to the pool with no known location yet. Idempotent.
    pub fn add(&self, driver: Identity) {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .entry(driver)
            .or_insert(None);
    }

    /// Record a location report. Returns false when the driver is not in
    /// the pool.
    pub fn update_location(&self, driver: &Identity, location: GeoPoint) -> bool {
        match self
            .entries
            .write()
            .expect("registry lock poisoned")
            .get_mut(driver)
        {
            Some(entry) => {
                *entry = Some(location);
                true
            }
            None => false,
        }
    }

    pub fn location_of(&self, driver: &Identity) -> Option<GeoPoint> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(driver)
            .copied()
            .flatten()
    }

    pub fn contains(&self, driver: &Identity) -> bool {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .contains_key(driver)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().expect("registry lock poisoned").clear();
    }
}
