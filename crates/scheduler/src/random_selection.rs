//! Uniform random selection among same-priority candidates.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::hash::Hash;

/// Backing storage never shrinks below this many slots.
pub const MIN_SIZE: usize = 32;

/// An item that can sit in a [`RandomSelectionSet`].
pub trait Selectable: Eq + Hash + Clone {
    /// Item has finished or been cancelled and must never be selected.
    fn is_terminal(&self) -> bool;

    /// Item's owner has moved on; drop it instead of selecting it.
    fn is_superseded(&self) -> bool {
        false
    }
}

/// Set with O(1) add and O(1) amortized uniform random removal.
///
/// Items live in a dense vector for random indexing and in a hash set for
/// membership. Both always hold the same items.
pub struct RandomSelectionSet<T: Selectable> {
    items: Vec<T>,
    members: HashSet<T>,
    rng: StdRng,
}

impl<T: Selectable> RandomSelectionSet<T> {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_rng(&mut rand::rng()))
    }

    /// Deterministic selection order for a given seed.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            items: Vec::with_capacity(MIN_SIZE),
            members: HashSet::new(),
            rng,
        }
    }

    /// Add an item. Returns false if it is terminal or already present.
    pub fn add(&mut self, item: T) -> bool {
        if item.is_terminal() || self.members.contains(&item) {
            return false;
        }
        self.members.insert(item.clone());
        self.items.push(item);
        true
    }

    /// Remove and return a uniformly random item, skipping terminal and
    /// superseded ones.
    pub fn remove_random(&mut self) -> Option<T> {
        loop {
            if self.items.is_empty() {
                return None;
            }
            let index = self.rng.random_range(0..self.items.len());
            let item = self.items.swap_remove(index);
            self.members.remove(&item);
            self.maybe_shrink();
            if item.is_terminal() || item.is_superseded() {
                continue;
            }
            return Some(item);
        }
    }

    /// Remove a specific item if present.
    pub fn remove(&mut self, item: &T) -> bool {
        if !self.members.remove(item) {
            return false;
        }
        if let Some(index) = self.items.iter().position(|i| i == item) {
            self.items.swap_remove(index);
        }
        self.maybe_shrink();
        true
    }

    pub fn contains(&self, item: &T) -> bool {
        self.members.contains(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    fn maybe_shrink(&mut self) {
        let capacity = self.items.capacity();
        if capacity > MIN_SIZE && self.items.len() < capacity / 4 {
            self.items
                .shrink_to((self.items.len() * 2).max(MIN_SIZE));
        }
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        self.items.len() == self.members.len()
            && self.items.iter().all(|i| self.members.contains(i))
    }
}

impl<T: Selectable> Default for RandomSelectionSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Item(u32);

    impl Selectable for Item {
        fn is_terminal(&self) -> bool {
            false
        }
    }

    #[derive(Clone, Debug)]
    struct Flagged {
        id: u32,
        terminal: Rc<Cell<bool>>,
    }

    impl PartialEq for Flagged {
        fn eq(&self, other: &Self) -> bool {
            self.id == other.id
        }
    }

    impl Eq for Flagged {}

    impl Hash for Flagged {
        fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
            self.id.hash(state);
        }
    }

    impl Selectable for Flagged {
        fn is_terminal(&self) -> bool {
            self.terminal.get()
        }
    }

    #[test]
    fn test_empty_returns_none() {
        let mut set: RandomSelectionSet<Item> = RandomSelectionSet::with_seed(1);
        assert!(set.remove_random().is_none());
    }

    #[test]
    fn test_duplicate_add_ignored() {
        let mut set = RandomSelectionSet::with_seed(1);
        assert!(set.add(Item(1)));
        assert!(!set.add(Item(1)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_terminal_items_rejected_and_skipped() {
        let mut set = RandomSelectionSet::with_seed(7);
        let done = Flagged {
            id: 1,
            terminal: Rc::new(Cell::new(true)),
        };
        assert!(!set.add(done));

        let later = Flagged {
            id: 2,
            terminal: Rc::new(Cell::new(false)),
        };
        let live = Flagged {
            id: 3,
            terminal: Rc::new(Cell::new(false)),
        };
        set.add(later.clone());
        set.add(live.clone());
        later.terminal.set(true);

        assert_eq!(set.remove_random().map(|f| f.id), Some(3));
        assert!(set.remove_random().is_none());
        assert!(set.is_consistent());
    }

    #[test]
    fn test_membership_matches_backing_after_mixed_ops() {
        let mut set = RandomSelectionSet::with_seed(42);
        for i in 0..200 {
            set.add(Item(i));
            if i % 3 == 0 {
                set.remove(&Item(i / 2));
            }
            if i % 5 == 0 {
                set.remove_random();
            }
            assert!(set.is_consistent());
        }
        assert!(!set.remove(&Item(10_000)));
        while set.remove_random().is_some() {
            assert!(set.is_consistent());
        }
        assert!(set.is_empty());
    }

    #[test]
    fn test_shrinks_but_not_below_floor() {
        let mut set = RandomSelectionSet::with_seed(3);
        for i in 0..1000 {
            set.add(Item(i));
        }
        let grown = set.capacity();
        while set.len() > 10 {
            set.remove_random();
        }
        assert!(set.capacity() < grown);
        assert!(set.capacity() >= MIN_SIZE);
        while set.remove_random().is_some() {}
        assert!(set.capacity() >= MIN_SIZE);
    }

    #[test]
    fn test_selection_is_uniform() {
        const ITEMS: u32 = 10;
        const TRIALS: usize = 10_000;
        let mut set = RandomSelectionSet::with_seed(0x5eed);
        for i in 0..ITEMS {
            set.add(Item(i));
        }

        let mut counts = [0usize; ITEMS as usize];
        for _ in 0..TRIALS {
            let item = set.remove_random().unwrap();
            counts[item.0 as usize] += 1;
            set.add(item);
        }

        let expected = TRIALS as f64 / ITEMS as f64;
        let chi_square: f64 = counts
            .iter()
            .map(|&c| (c as f64 - expected).powi(2) / expected)
            .sum();
        // 9 degrees of freedom, p = 0.001
        assert!(chi_square < 27.88, "chi-square {chi_square}, counts {counts:?}");
    }
}
