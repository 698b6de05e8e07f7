use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::iter::FromIterator;

const WORD_BITS: usize = u64::BITS as usize;

/// A set of small indices (trips or blocks) backed by a word array.
///
/// The word array never has trailing zero words, so two sets with the same members compare and
/// hash equal regardless of how large they once grew.  This is what makes covers usable as
/// column-pool keys.
#[derive(Clone, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CoverSet {
  words: SmallVec<[u64; 4]>,
}

impl CoverSet {
  pub fn new() -> Self {
    Self::default()
  }

  #[inline]
  fn locate(i: usize) -> (usize, u64) {
    (i / WORD_BITS, 1 << (i % WORD_BITS))
  }

  fn normalise(&mut self) {
    while self.words.last() == Some(&0) {
      self.words.pop();
    }
  }

  /// Returns `true` if `i` was not already a member.
  pub fn insert(&mut self, i: usize) -> bool {
    let (w, mask) = Self::locate(i);
    if w >= self.words.len() {
      self.words.resize(w + 1, 0);
    }
    let fresh = self.words[w] & mask == 0;
    self.words[w] |= mask;
    fresh
  }

  /// Returns `true` if `i` was a member.
  pub fn remove(&mut self, i: usize) -> bool {
    let (w, mask) = Self::locate(i);
    match self.words.get_mut(w) {
      Some(word) if *word & mask != 0 => {
        *word &= !mask;
        self.normalise();
        true
      }
      _ => false,
    }
  }

  #[inline]
  pub fn contains(&self, i: usize) -> bool {
    let (w, mask) = Self::locate(i);
    self.words.get(w).map_or(false, |word| word & mask != 0)
  }

  pub fn len(&self) -> usize {
    self.words.iter().map(|w| w.count_ones() as usize).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.words.is_empty()
  }

  pub fn is_disjoint(&self, other: &CoverSet) -> bool {
    self.words.iter().zip(&other.words).all(|(a, b)| a & b == 0)
  }

  /// Members in ascending order.
  pub fn iter(&self) -> impl Iterator<Item=usize> + '_ {
    self.words.iter().enumerate().flat_map(|(w, &word)| {
      let mut bits = word;
      std::iter::from_fn(move || {
        if bits == 0 {
          return None;
        }
        let b = bits.trailing_zeros() as usize;
        bits &= bits - 1;
        Some(w * WORD_BITS + b)
      })
    })
  }
}

impl FromIterator<usize> for CoverSet {
  fn from_iter<T: IntoIterator<Item=usize>>(iter: T) -> Self {
    let mut s = CoverSet::new();
    s.extend(iter);
    s
  }
}

impl Extend<usize> for CoverSet {
  fn extend<T: IntoIterator<Item=usize>>(&mut self, iter: T) {
    for i in iter {
      self.insert(i);
    }
  }
}

impl fmt::Debug for CoverSet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_set().entries(self.iter()).finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;
  use std::collections::BTreeSet;

  #[test]
  fn trailing_zeros_do_not_affect_equality() {
    let mut a: CoverSet = [1, 3, 200].iter().copied().collect();
    let b: CoverSet = [3, 1].iter().copied().collect();
    assert_ne!(a, b);
    assert!(a.remove(200));
    assert_eq!(a, b);

    let mut hashes = crate::Set::default();
    hashes.insert(a);
    assert!(hashes.contains(&b));
  }

  #[test]
  fn membership() {
    let mut s = CoverSet::new();
    assert!(s.is_empty());
    assert!(s.insert(64));
    assert!(!s.insert(64));
    assert!(s.contains(64));
    assert!(!s.contains(63));
    assert!(!s.contains(100_000));
    assert!(!s.remove(5));
    assert_eq!(s.len(), 1);
  }

  proptest! {
    #[test]
    fn behaves_like_a_set(members in proptest::collection::vec(0usize..500, 0..40)) {
      let cover: CoverSet = members.iter().copied().collect();
      let reference: BTreeSet<usize> = members.iter().copied().collect();
      prop_assert_eq!(cover.len(), reference.len());
      prop_assert_eq!(cover.iter().collect::<Vec<_>>(), reference.into_iter().collect::<Vec<_>>());
    }
  }
}
