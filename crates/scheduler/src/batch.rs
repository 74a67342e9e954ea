//! Block-level bookkeeping for one selected request.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// The blocks of one sendable request, held in memory until every block
/// has finished.
///
/// Each block is in exactly one of `not_started`, `started` or `finished`.
/// The batch completes once, when nothing is left to start or in flight.
#[derive(Debug)]
pub struct ChosenRequestBatch<B, O> {
    size: usize,
    not_started: HashSet<B>,
    started: HashSet<B>,
    finished: HashMap<B, O>,
    dumped: bool,
    completed: bool,
}

impl<B: Eq + Hash + Clone, O> ChosenRequestBatch<B, O> {
    pub fn new(blocks: impl IntoIterator<Item = B>) -> Self {
        let not_started: HashSet<B> = blocks.into_iter().collect();
        Self {
            size: not_started.len(),
            not_started,
            started: HashSet::new(),
            finished: HashMap::new(),
            dumped: false,
            completed: false,
        }
    }

    /// Blocks in the batch when it was created.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn not_started_count(&self) -> usize {
        self.not_started.len()
    }

    pub fn started_count(&self) -> usize {
        self.started.len()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn was_dumped(&self) -> bool {
        self.dumped
    }

    /// Take any block that has not started and mark it started.
    pub fn grab_not_started(&mut self) -> Option<B> {
        let block = self.not_started.iter().next().cloned()?;
        self.not_started.remove(&block);
        self.started.insert(block.clone());
        Some(block)
    }

    /// Mark a specific block as started.
    pub fn on_started(&mut self, block: &B) -> bool {
        if self.not_started.remove(block) {
            self.started.insert(block.clone());
            true
        } else {
            false
        }
    }

    /// Record a block's outcome. Returns true exactly once, when this was
    /// the last outstanding block.
    pub fn on_finished(&mut self, block: B, outcome: O) -> bool {
        if self.finished.contains_key(&block) {
            return false;
        }
        let known = self.started.remove(&block) || self.not_started.remove(&block);
        if !known {
            return false;
        }
        self.finished.insert(block, outcome);
        self.check_complete()
    }

    /// Drop every block that has not started. Returns true if this
    /// completes the batch, i.e. nothing was in flight.
    pub fn on_dumped(&mut self) -> bool {
        self.dumped = true;
        self.not_started.clear();
        self.check_complete()
    }

    fn check_complete(&mut self) -> bool {
        if self.completed || !self.not_started.is_empty() || !self.started.is_empty() {
            return false;
        }
        self.completed = true;
        true
    }

    /// Consume the batch, yielding each finished block with its outcome.
    pub fn into_finished(self) -> Vec<(B, O)> {
        self.finished.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;

    fn run_to_completion(order: &[u32]) -> usize {
        let mut batch = ChosenRequestBatch::new(0..5u32);
        while batch.grab_not_started().is_some() {}
        assert_eq!(batch.started_count(), 5);
        let mut fired = 0;
        for (i, block) in order.iter().enumerate() {
            let total = batch.started_count() + batch.finished_count();
            assert_eq!(total, 5);
            if batch.on_finished(*block, ()) {
                fired += 1;
                assert_eq!(i, order.len() - 1, "completed before the last block");
            }
        }
        assert_eq!(batch.finished_count(), 5);
        fired
    }

    #[test]
    fn test_completes_once_in_reverse_order() {
        assert_eq!(run_to_completion(&[4, 3, 2, 1, 0]), 1);
    }

    #[test]
    fn test_completes_once_in_random_order() {
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..20 {
            let mut order: Vec<u32> = (0..5).collect();
            order.shuffle(&mut rng);
            assert_eq!(run_to_completion(&order), 1);
        }
    }

    #[test]
    fn test_duplicate_and_unknown_finishes_ignored() {
        let mut batch = ChosenRequestBatch::new(["a", "b"]);
        batch.on_started(&"a");
        assert!(!batch.on_finished("a", 1));
        assert!(!batch.on_finished("a", 2));
        assert!(!batch.on_finished("zzz", 3));
        assert!(batch.on_finished("b", 4));
        assert!(!batch.on_finished("b", 5));

        let mut outcomes = batch.into_finished();
        outcomes.sort();
        assert_eq!(outcomes, vec![("a", 1), ("b", 4)]);
    }

    #[test]
    fn test_dump_with_nothing_started_completes_immediately() {
        let mut batch: ChosenRequestBatch<u32, ()> = ChosenRequestBatch::new(0..3);
        assert!(batch.on_dumped());
        assert!(batch.is_completed());
        assert!(batch.grab_not_started().is_none());
    }

    #[test]
    fn test_dump_waits_for_in_flight_blocks() {
        let mut batch = ChosenRequestBatch::new(0..4u32);
        let first = batch.grab_not_started().unwrap();
        let second = batch.grab_not_started().unwrap();
        assert!(!batch.on_dumped());
        assert_eq!(batch.not_started_count(), 0);

        assert!(!batch.on_finished(first, ()));
        assert!(batch.on_finished(second, ()));
        assert!(batch.was_dumped());
        assert_eq!(batch.into_finished().len(), 2);
    }
}
