//! Associative, commutative merge of partial aggregation results.
//!
//! Every report producer (bucket counts, crash ranking) folds partial results
//! through this one trait. Counts add; keyed maps merge entry-wise.

use std::collections::BTreeMap;

pub trait Merge {
  fn merge(&mut self, other: Self);
}

impl Merge for u64 {
  fn merge(&mut self, other: Self) {
    *self += other;
  }
}

impl Merge for f64 {
  fn merge(&mut self, other: Self) {
    *self += other;
  }
}

impl<K: Ord, V: Merge> Merge for BTreeMap<K, V> {
  fn merge(&mut self, other: Self) {
    for (key, value) in other {
      match self.get_mut(&key) {
        Some(existing) => existing.merge(value),
        None => {
          self.insert(key, value);
        }
      }
    }
  }
}

/// Fold any number of partials into one, starting from `Default`.
pub fn merge_all<T: Merge + Default>(parts: impl IntoIterator<Item = T>) -> T {
  parts.into_iter().fold(T::default(), |mut acc, part| {
    Merge::merge(&mut acc, part);
    acc
  })
}
