// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin selection over a service's active connections.
///
/// Each service owns one selector. The selector holds nothing but a counter;
/// the pool it selects from is passed in on every call, so selection always
/// walks the pool as it is at that moment. With a stable pool of `k` entries,
/// `k` consecutive selections visit every entry exactly once.
#[derive(Debug, Default)]
pub struct PollingSelector {
    counter: AtomicUsize,
}

impl PollingSelector {
    pub fn new() -> Self {
        PollingSelector {
            counter: AtomicUsize::new(0),
        }
    }

    /// Advance the counter and reduce it modulo `pool_size`. Returns `None`
    /// for an empty pool, in which case the counter is left untouched.
    pub fn next_index(&self, pool_size: usize) -> Option<usize> {
        if pool_size == 0 {
            return None;
        }
        // fetch_add wraps on overflow
        Some(self.counter.fetch_add(1, Ordering::Relaxed) % pool_size)
    }

    /// Pick the next entry of `pool` in its current iteration order.
    pub fn select<'a, K, V>(
        &self,
        pool: &'a HashMap<K, V>,
    ) -> Option<(&'a K, &'a V)>
    where
        K: Eq + Hash,
    {
        self.next_index(pool.len())
            .and_then(|index| pool.iter().nth(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_index_cycles_through_every_position() {
        let selector = PollingSelector::new();
        let indexes: Vec<usize> =
            (0..6).filter_map(|_| selector.next_index(3)).collect();
        assert_eq!(indexes, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn next_index_empty_pool() {
        let selector = PollingSelector::new();
        assert_eq!(selector.next_index(0), None);
        // An empty pool must not consume a turn
        assert_eq!(selector.next_index(2), Some(0));
    }

    #[test]
    fn select_is_uniform_over_stable_pool() {
        let selector = PollingSelector::new();
        let pool: HashMap<&str, u32> =
            vec![("a", 1), ("b", 2), ("c", 3), ("d", 4)]
                .into_iter()
                .collect();

        let mut counts: HashMap<&str, u32> = HashMap::new();
        for _ in 0..400 {
            let (key, _) = selector.select(&pool).unwrap();
            *counts.entry(*key).or_insert(0) += 1;
        }

        assert_eq!(counts.len(), 4);
        counts.values().for_each(|count| assert_eq!(*count, 100));
    }

    #[test]
    fn select_follows_pool_changes() {
        let selector = PollingSelector::new();
        let mut pool: HashMap<u32, u32> = HashMap::new();
        assert!(selector.select(&pool).is_none());

        pool.insert(1, 10);
        assert_eq!(selector.select(&pool), Some((&1, &10)));

        pool.insert(2, 20);
        let picked: Vec<u32> =
            (0..2).map(|_| *selector.select(&pool).unwrap().0).collect();
        assert!(picked.contains(&1));
        assert!(picked.contains(&2));
    }
}
