//! Destination well usage
//!
//! Tracks which destination wells a run has touched. A well is `Reserved`
//! while a transfer into it is in flight and `Used` once the dispense
//! completed. Wells never seen are `Available`.

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WellUsage {
    #[default]
    Available,
    Reserved,
    Used,
}

/// Concurrent (plate, well) -> usage map
#[derive(Debug, Default)]
pub struct DestinationWellMap {
    wells: DashMap<(String, String), WellUsage>,
}

impl DestinationWellMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark wells as in flight. A `Used` well stays `Used`.
    pub fn reserve(&self, plate: &str, wells: &[String]) {
        for well in wells {
            self.wells
                .entry((plate.to_string(), well.clone()))
                .and_modify(|u| {
                    if *u == WellUsage::Available {
                        *u = WellUsage::Reserved;
                    }
                })
                .or_insert(WellUsage::Reserved);
        }
    }

    pub fn mark_used(&self, plate: &str, wells: &[String]) {
        for well in wells {
            self.wells
                .insert((plate.to_string(), well.clone()), WellUsage::Used);
        }
    }

    /// Return reserved wells of a failed transfer to `Available`.
    pub fn release(&self, plate: &str, wells: &[String]) {
        for well in wells {
            let key = (plate.to_string(), well.clone());
            self.wells.remove_if(&key, |_, u| *u == WellUsage::Reserved);
        }
    }

    pub fn usage(&self, plate: &str, well: &str) -> WellUsage {
        self.wells
            .get(&(plate.to_string(), well.to_string()))
            .map(|u| *u)
            .unwrap_or_default()
    }

    /// Wells of `plate` in the given state, sorted by name
    pub fn wells_in(&self, plate: &str, usage: WellUsage) -> Vec<String> {
        let mut wells: Vec<String> = self
            .wells
            .iter()
            .filter(|e| e.key().0 == plate && *e.value() == usage)
            .map(|e| e.key().1.clone())
            .collect();
        wells.sort();
        wells
    }

    pub fn used_count(&self, plate: &str) -> usize {
        self.wells
            .iter()
            .filter(|e| e.key().0 == plate && *e.value() == WellUsage::Used)
            .count()
    }
}
