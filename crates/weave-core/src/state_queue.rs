//! Bounded journal of component state changes
//!
//! Each component gets its own queue; the component manager drains them all
//! into one timestamp-sorted snapshot for the cloud state flush.

use std::collections::VecDeque;

use serde_json::{Map, Value};

use crate::types::Timestamp;

/// Upper bound on buffered state updates per component.
pub const MAX_STATE_CHANGE_QUEUE_SIZE: usize = 100;

/// One recorded delta: the property values that changed at `timestamp`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub timestamp: Timestamp,
    pub changed_properties: Map<String, Value>,
}

/// FIFO of state deltas. On overflow the oldest record is dropped; the
/// merged current state lives in the component itself, so only the journal
/// entry is lost.
#[derive(Debug)]
pub struct StateChangeQueue {
    capacity: usize,
    changes: VecDeque<StateChange>,
}

impl StateChangeQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "state change queue capacity must be positive");
        Self {
            capacity,
            changes: VecDeque::new(),
        }
    }

    pub fn notify_properties_updated(
        &mut self,
        timestamp: Timestamp,
        changed_properties: Map<String, Value>,
    ) {
        if self.changes.len() >= self.capacity {
            self.changes.pop_front();
        }
        self.changes.push_back(StateChange {
            timestamp,
            changed_properties,
        });
    }

    pub fn get_and_clear_recorded_state_changes(&mut self) -> Vec<StateChange> {
        self.changes.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: u64) -> Map<String, Value> {
        json!({ "power": { "battery_level": value } })
            .as_object()
            .unwrap()
            .clone()
    }

    #[test]
    fn records_in_order() {
        let mut queue = StateChangeQueue::new(10);
        queue.notify_properties_updated(Timestamp::from_secs(1), props(10));
        queue.notify_properties_updated(Timestamp::from_secs(2), props(20));
        let changes = queue.get_and_clear_recorded_state_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].timestamp, Timestamp::from_secs(1));
        assert_eq!(changes[1].changed_properties, props(20));
        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut queue = StateChangeQueue::new(3);
        for i in 0..5 {
            queue.notify_properties_updated(Timestamp::from_secs(i), props(i));
        }
        let changes = queue.get_and_clear_recorded_state_changes();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].timestamp, Timestamp::from_secs(2));
        assert_eq!(changes[2].timestamp, Timestamp::from_secs(4));
    }

    #[test]
    fn clear_resets_queue() {
        let mut queue = StateChangeQueue::new(3);
        queue.notify_properties_updated(Timestamp::from_secs(1), props(1));
        assert_eq!(queue.len(), 1);
        queue.get_and_clear_recorded_state_changes();
        assert!(queue.is_empty());
        queue.notify_properties_updated(Timestamp::from_secs(2), props(2));
        assert_eq!(queue.len(), 1);
    }
}
