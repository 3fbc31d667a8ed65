//! Window aggregation over the ring buffer
//!
//! Aggregation is a read-only scan: events are counted, never removed or
//! marked, so an unsent window can simply be aggregated again later.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::buffer::RingBuffer;
use crate::error::Result;
use crate::types::{CategoryId, Timestamp};

/// Number of per-category slots (index 0 is never counted)
pub const CATEGORY_SLOTS: usize = 256;

/// Per-category histogram of one aggregation window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    /// Machine the window belongs to
    pub machine_id: u32,
    /// Inclusive window start
    pub period_start: Timestamp,
    /// Inclusive window end
    pub period_end: Timestamp,
    /// Events inside the window
    pub total_events: u32,
    /// Count per category id; slot 0 stays zero
    pub category_counts: [u32; CATEGORY_SLOTS],
}

impl Aggregate {
    /// An empty histogram for the given window
    pub fn empty(machine_id: u32, period_start: Timestamp, period_end: Timestamp) -> Self {
        Self {
            machine_id,
            period_start,
            period_end,
            total_events: 0,
            category_counts: [0; CATEGORY_SLOTS],
        }
    }

    /// Whether the window has anything worth sending
    pub fn is_empty(&self) -> bool {
        self.total_events == 0
    }

    /// Count recorded for one category
    pub fn count(&self, category: CategoryId) -> u32 {
        self.category_counts[category as usize]
    }

    /// Categories with a nonzero count, in ascending id order
    pub fn nonzero_categories(&self) -> impl Iterator<Item = (CategoryId, u32)> + '_ {
        self.category_counts
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, count)| **count > 0)
            .map(|(id, count)| (id as CategoryId, *count))
    }

    /// Encode the sparse JSON payload sent to the sink
    ///
    /// ```text
    /// {"machine_id":1,"period_start":10,"period_end":20,"total_events":3,"products":{"1":2,"7":1}}
    /// ```
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let payload = AggregatePayload {
            machine_id: self.machine_id,
            period_start: self.period_start,
            period_end: self.period_end,
            total_events: self.total_events,
            products: self.nonzero_categories().collect(),
        };
        Ok(serde_json::to_vec(&payload)?)
    }
}

/// Wire shape of an aggregate; integer map keys serialize as JSON strings
#[derive(Serialize)]
struct AggregatePayload {
    machine_id: u32,
    period_start: Timestamp,
    period_end: Timestamp,
    total_events: u32,
    products: BTreeMap<CategoryId, u32>,
}

/// Summarize buffered events whose timestamp lies in `[window_start, window_end]`
pub fn aggregate(
    buffer: &RingBuffer,
    machine_id: u32,
    window_start: Timestamp,
    window_end: Timestamp,
) -> Aggregate {
    let mut result = Aggregate::empty(machine_id, window_start, window_end);

    for event in buffer {
        if event.timestamp < window_start || event.timestamp > window_end {
            continue;
        }
        result.total_events += 1;
        // Category 0 is never accepted, but keep the histogram clean regardless
        if event.category != 0 {
            result.category_counts[event.category as usize] += 1;
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Event;

    fn buffer_with(events: &[(Timestamp, CategoryId)]) -> RingBuffer {
        let mut buffer = RingBuffer::with_capacity(16).unwrap();
        for (ts, category) in events {
            buffer.append(Event::new(*ts, 42, *category));
        }
        buffer
    }

    #[test]
    fn test_window_is_inclusive() {
        let buffer = buffer_with(&[(99, 1), (100, 1), (150, 2), (200, 3), (201, 4)]);

        let agg = aggregate(&buffer, 42, 100, 200);

        assert_eq!(agg.total_events, 3);
        assert_eq!(agg.count(1), 1);
        assert_eq!(agg.count(2), 1);
        assert_eq!(agg.count(3), 1);
        assert_eq!(agg.count(4), 0);
        assert_eq!(agg.period_start, 100);
        assert_eq!(agg.period_end, 200);
    }

    #[test]
    fn test_empty_window() {
        let buffer = buffer_with(&[(10, 1), (20, 2)]);
        let agg = aggregate(&buffer, 42, 100, 200);
        assert!(agg.is_empty());
        assert_eq!(agg.nonzero_categories().count(), 0);
    }

    #[test]
    fn test_aggregation_is_non_destructive() {
        let buffer = buffer_with(&[(100, 5), (101, 5)]);
        let first = aggregate(&buffer, 42, 0, 1000);
        let second = aggregate(&buffer, 42, 0, 1000);
        assert_eq!(first, second);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_zero_category_counts_only_in_total() {
        let mut buffer = RingBuffer::with_capacity(4).unwrap();
        buffer.append(Event::new(100, 42, 0));
        buffer.append(Event::new(100, 42, 9));

        let agg = aggregate(&buffer, 42, 0, 1000);
        assert_eq!(agg.total_events, 2);
        assert_eq!(agg.count(0), 0);
        assert_eq!(agg.nonzero_categories().collect::<Vec<_>>(), vec![(9, 1)]);
    }

    #[test]
    fn test_payload_format() {
        let buffer = buffer_with(&[(100, 10), (101, 2), (102, 2), (103, 255)]);
        let agg = aggregate(&buffer, 42, 100, 200);

        let payload = String::from_utf8(agg.to_payload().unwrap()).unwrap();
        assert_eq!(
            payload,
            r#"{"machine_id":42,"period_start":100,"period_end":200,"total_events":4,"products":{"2":2,"10":1,"255":1}}"#
        );
    }

    #[test]
    fn test_payload_parses_as_json() {
        let buffer = buffer_with(&[(150, 7)]);
        let agg = aggregate(&buffer, 42, 100, 200);

        let value: serde_json::Value = serde_json::from_slice(&agg.to_payload().unwrap()).unwrap();
        assert_eq!(value["total_events"], 1);
        assert_eq!(value["products"]["7"], 1);
        assert!(value["products"].get("1").is_none());
    }
}
