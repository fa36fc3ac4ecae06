use std::collections::VecDeque;

use super::ServiceEvent;
use crate::constants::MAX_EVENTS_TO_KEEP;

/// Bounded history of service events, oldest first.
#[derive(Debug, Clone)]
pub struct ServiceEvents {
    events: VecDeque<ServiceEvent>,
    discarded: u64,
}

impl Default for ServiceEvents {
    fn default() -> Self {
        Self {
            events: VecDeque::with_capacity(MAX_EVENTS_TO_KEEP),
            discarded: 0,
        }
    }
}

impl ServiceEvents {
    /// Appends an event, overwriting the oldest once the buffer is full.
    pub fn push(&mut self, event: ServiceEvent) {
        if self.events.len() == MAX_EVENTS_TO_KEEP {
            self.events.pop_front();
            self.discarded += 1;
        }
        self.events.push_back(event);
    }

    /// Returns up to `count` of the most recent events in chronological order.
    pub fn get(&self, count: usize) -> Vec<ServiceEvent> {
        let skip = self.events.len().saturating_sub(count);
        self.events.iter().skip(skip).cloned().collect()
    }

    /// Number of events overwritten so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
