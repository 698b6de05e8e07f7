//! Duplicate-free column storage shared by the vehicle and crew sides.
//!
//! A column's position in the pool is its index, and external vectors (LP variables, selections,
//! reduced costs) are aligned with it.  Any operation which moves columns returns a [`Remap`] that
//! callers must apply to those vectors.
use crate::{Map, Result};
use anyhow::bail;
use std::cmp::Ordering;
use std::hash::Hash;
use tracing::{trace, warn};

pub trait Column {
  /// Structural identity; two columns with equal keys are duplicates.
  type Key: Eq + Hash + Clone;

  fn key(&self) -> Self::Key;

  fn cost(&self) -> f64;

  fn index(&self) -> usize;

  fn set_index(&mut self, i: usize);

  /// Unit columns are part of the best known integral solution and are never evicted.
  fn is_unit(&self) -> bool;

  fn set_unit(&mut self, unit: bool);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Registration {
  Inserted(usize),
  /// Strictly cheaper than the column with the same key, which it replaced in place
  Replaced(usize),
  /// Index of the existing, no more expensive, column
  RejectedDuplicate(usize),
}

impl Registration {
  pub fn index(&self) -> usize {
    match *self {
      Registration::Inserted(i) | Registration::Replaced(i) | Registration::RejectedDuplicate(i) => i,
    }
  }
}

/// Old-to-new index mapping produced by an eviction pass.  Survivors keep their relative order.
#[derive(Debug, Clone)]
pub struct Remap {
  new_index: Vec<Option<usize>>,
  len_after: usize,
}

impl Remap {
  pub fn new_index(&self, old: usize) -> Option<usize> {
    self.new_index.get(old).copied().flatten()
  }

  pub fn len_before(&self) -> usize {
    self.new_index.len()
  }

  pub fn len_after(&self) -> usize {
    self.len_after
  }

  pub fn removed(&self) -> usize {
    self.len_before() - self.len_after
  }

  /// Drops the entries of an index-aligned vector whose column was evicted.
  pub fn apply<T>(&self, values: Vec<T>) -> Vec<T> {
    debug_assert_eq!(values.len(), self.new_index.len());
    values.into_iter()
      .zip(&self.new_index)
      .filter_map(|(v, i)| i.map(|_| v))
      .collect()
  }
}

#[derive(Debug, Clone)]
pub struct ColumnPool<C: Column> {
  columns: Vec<C>,
  by_key: Map<C::Key, usize>,
}

impl<C: Column> Default for ColumnPool<C> {
  fn default() -> Self {
    ColumnPool { columns: Vec::new(), by_key: Map::default() }
  }
}

impl<C: Column> ColumnPool<C> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Adopts columns produced elsewhere.  Each column's stored index must equal its position; a
  /// mismatch means the columns were corrupted upstream and is reported as an error.
  pub fn from_existing(columns: Vec<C>) -> Result<Self> {
    let mut by_key: Map<C::Key, usize> = Map::default();
    for (i, c) in columns.iter().enumerate() {
      if c.index() != i {
        bail!("column at position {} has index {}", i, c.index());
      }
      match by_key.get(&c.key()) {
        Some(&j) => {
          warn!(i, j, "existing columns share a cover key");
          if c.cost() < columns[j].cost() {
            by_key.insert(c.key(), i);
          }
        }
        None => { by_key.insert(c.key(), i); }
      }
    }
    Ok(ColumnPool { columns, by_key })
  }

  pub fn register_or_update(&mut self, mut column: C) -> Registration {
    let key = column.key();
    match self.by_key.get(&key) {
      Some(&i) => {
        let existing = &self.columns[i];
        if column.cost() < existing.cost() {
          trace!(i, old = existing.cost(), new = column.cost(), "replacing column");
          column.set_index(i);
          column.set_unit(existing.is_unit());
          self.columns[i] = column;
          Registration::Replaced(i)
        } else {
          Registration::RejectedDuplicate(i)
        }
      }
      None => {
        let i = self.columns.len();
        column.set_index(i);
        self.by_key.insert(key, i);
        self.columns.push(column);
        Registration::Inserted(i)
      }
    }
  }

  /// Shrinks the pool towards `max_size` by removing the columns with the largest reduced cost.
  ///
  /// Only columns ranked beyond `max_size` are candidates, and unit or `protected` columns are
  /// skipped, so the pool may remain larger than `max_size`.  Returns `None` if nothing was
  /// removed.
  pub fn evict_worst(&mut self, max_size: usize, reduced_costs: &[f64], protected: &[bool]) -> Option<Remap> {
    let n = self.columns.len();
    debug_assert_eq!(reduced_costs.len(), n);
    debug_assert_eq!(protected.len(), n);
    if n <= max_size {
      return None;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| reduced_costs[a].partial_cmp(&reduced_costs[b]).unwrap_or(Ordering::Equal));

    let mut keep = vec![true; n];
    let mut removed = 0;
    for &i in &order[max_size..] {
      if !self.columns[i].is_unit() && !protected[i] {
        keep[i] = false;
        removed += 1;
      }
    }
    if removed == 0 {
      return None;
    }

    let mut new_index = vec![None; n];
    let old = std::mem::take(&mut self.columns);
    for (i, mut c) in old.into_iter().enumerate() {
      if keep[i] {
        new_index[i] = Some(self.columns.len());
        c.set_index(self.columns.len());
        self.columns.push(c);
      }
    }
    self.rebuild_keys();
    Some(Remap { new_index, len_after: self.columns.len() })
  }

  /// Recomputes the key map from scratch, e.g. after keys changed through [`Self::columns_mut`].
  pub fn rebuild_keys(&mut self) {
    self.by_key.clear();
    for (i, c) in self.columns.iter().enumerate() {
      match self.by_key.get(&c.key()) {
        Some(&j) if self.columns[j].cost() <= c.cost() => {}
        _ => { self.by_key.insert(c.key(), i); }
      }
    }
  }

  pub fn index_of(&self, key: &C::Key) -> Option<usize> {
    self.by_key.get(key).copied()
  }

  pub fn set_unit(&mut self, i: usize, unit: bool) {
    self.columns[i].set_unit(unit);
  }

  pub fn clear_units(&mut self) {
    for c in &mut self.columns {
      c.set_unit(false);
    }
  }

  pub fn get(&self, i: usize) -> Option<&C> {
    self.columns.get(i)
  }

  pub fn len(&self) -> usize {
    self.columns.len()
  }

  pub fn is_empty(&self) -> bool {
    self.columns.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, C> {
    self.columns.iter()
  }

  pub fn as_slice(&self) -> &[C] {
    &self.columns
  }

  /// Callers changing a column's key must call [`Self::rebuild_keys`] afterwards.
  pub fn columns_mut(&mut self) -> &mut [C] {
    &mut self.columns
  }

  pub fn into_columns(self) -> Vec<C> {
    self.columns
  }
}

impl<C: Column> std::ops::Index<usize> for ColumnPool<C> {
  type Output = C;

  fn index(&self, i: usize) -> &C {
    &self.columns[i]
  }
}
