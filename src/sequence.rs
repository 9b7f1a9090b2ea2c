//! Monotonic identifier generators.
//!
//! Call ids and worker ids are drawn from process-wide sequences so that ids
//! stay unique across every pool living in the same process.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of call ids, shared by every pool in the process.
pub static TASK_SERIAL: Sequence = Sequence::new(1);

/// Source of worker ids, shared by every pool in the process.
pub static WORKER_SERIAL: Sequence = Sequence::new(1);

/// Lock-free counter yielding strictly increasing values.
///
/// With a `max` bound the counter wraps back to its start value once `max`
/// has been handed out.
#[derive(Debug)]
pub struct Sequence {
    start: u64,
    max: Option<u64>,
    next: AtomicU64,
}

impl Sequence {
    pub const fn new(start: u64) -> Self {
        Self {
            start,
            max: None,
            next: AtomicU64::new(start),
        }
    }

    pub const fn with_max(start: u64, max: u64) -> Self {
        Self {
            start,
            max: Some(max),
            next: AtomicU64::new(start),
        }
    }

    /// Return the current value and advance the counter.
    pub fn next_value(&self) -> u64 {
        let Some(max) = self.max else {
            return self.next.fetch_add(1, Ordering::Relaxed);
        };
        let start = self.start;
        let previous = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(if current >= max { start } else { current + 1 })
            })
            .unwrap_or(start);
        previous.min(max)
    }

    /// Peek at the value the next call to [`Self::next_value`] returns.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_increments_from_start() {
        let sequence = Sequence::new(5);
        assert_eq!(sequence.next_value(), 5);
        assert_eq!(sequence.next_value(), 6);
        assert_eq!(sequence.peek(), 7);
    }

    #[test]
    fn bounded_sequence_wraps_to_start() {
        let sequence = Sequence::with_max(1, 3);
        let values: Vec<u64> = (0..5).map(|_| sequence.next_value()).collect();
        assert_eq!(values, vec![1, 2, 3, 1, 2]);
    }

    #[test]
    fn concurrent_callers_receive_distinct_values() {
        let sequence = std::sync::Arc::new(Sequence::new(1));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sequence = sequence.clone();
                std::thread::spawn(move || {
                    (0..250).map(|_| sequence.next_value()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }
}
