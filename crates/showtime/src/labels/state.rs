//! Per-PR state projected from labels.

use super::codec::is_circus_label;
use super::trigger::Trigger;
use crate::show::Show;

/// Everything showtime knows about one PR, decoded from its labels.
///
/// This is a disposable read projection: it is recomputed from the label
/// store on every operation and never written back directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestState {
    pub pr_number: u64,
    /// Raw labels as read from the store.
    pub labels: Vec<String>,
    current: Option<Show>,
    building: Option<Show>,
}

impl PullRequestState {
    pub(crate) fn new(
        pr_number: u64,
        labels: Vec<String>,
        current: Option<Show>,
        building: Option<Show>,
    ) -> Self {
        Self {
            pr_number,
            labels,
            current,
            building,
        }
    }

    /// The show whose SHA matches the active marker.
    #[must_use]
    pub fn current_show(&self) -> Option<&Show> {
        self.current.as_ref()
    }

    /// The show whose SHA matches the building marker.
    #[must_use]
    pub fn building_show(&self) -> Option<&Show> {
        self.building.as_ref()
    }

    /// All decoded shows, current first.
    #[must_use]
    pub fn shows(&self) -> Vec<&Show> {
        self.current.iter().chain(self.building.iter()).collect()
    }

    #[must_use]
    pub fn has_shows(&self) -> bool {
        self.current.is_some() || self.building.is_some()
    }

    /// All showtime-prefixed labels, triggers included.
    #[must_use]
    pub fn circus_labels(&self) -> Vec<&str> {
        self.labels
            .iter()
            .map(String::as_str)
            .filter(|l| is_circus_label(l))
            .collect()
    }

    /// Pending triggers, in label order.
    #[must_use]
    pub fn triggers(&self) -> Vec<Trigger> {
        self.labels
            .iter()
            .filter_map(|l| Trigger::from_label(l))
            .collect()
    }
}
