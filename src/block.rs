//! Blocks are the unit of work handed from vehicles to crew.
//!
//! A block is a maximal stretch of a vehicle task between two points where a driver may be
//! relieved.  Blocks are identified by their [`Descriptor`] alone, so identical blocks produced
//! by different vehicle tasks are one and the same block.
use crate::cover::CoverSet;
use crate::instance::{Instance, LocIdx, TripIdx};
use crate::vehicle::{ElementKind, VehicleElement, VehicleTask};
use crate::{Map, Result, Time};
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct DescriptorHalf {
  pub loc: LocIdx,
  pub time: Time,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Descriptor {
  pub start_loc: LocIdx,
  pub start_time: Time,
  pub end_loc: LocIdx,
  pub end_time: Time,
}

impl Descriptor {
  pub fn new(start_loc: LocIdx, start_time: Time, end_loc: LocIdx, end_time: Time) -> Self {
    Descriptor { start_loc, start_time, end_loc, end_time }
  }

  pub fn start(&self) -> DescriptorHalf {
    DescriptorHalf { loc: self.start_loc, time: self.start_time }
  }

  pub fn end(&self) -> DescriptorHalf {
    DescriptorHalf { loc: self.end_loc, time: self.end_time }
  }

  pub fn duration(&self) -> Time {
    self.end_time - self.start_time
  }
}

impl fmt::Display for Descriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}#{}#{}", self.start_loc, self.start_time, self.end_loc, self.end_time)
  }
}

impl fmt::Display for DescriptorHalf {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.loc, self.time)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
  pub descriptor: Descriptor,
  /// Empty for blocks synthesised from a descriptor
  pub elements: Vec<VehicleElement>,
  pub index: usize,
}

impl Block {
  pub fn from_descriptor(descriptor: Descriptor) -> Self {
    Block { descriptor, elements: Vec::new(), index: 0 }
  }

  fn from_elements(elements: Vec<VehicleElement>) -> Option<Self> {
    let first = elements.first()?;
    let last = elements.last()?;
    let descriptor = Descriptor::new(first.start_loc, first.start_time, last.end_loc, last.end_time);
    if descriptor.duration() <= 0 {
      return None;
    }
    Some(Block { descriptor, elements, index: 0 })
  }

  /// Cuts a sequence of vehicle elements into blocks.  A cut happens at every idle or charge
  /// element at a handover location which lasts at least the location's handover time; the
  /// idle element itself belongs to no block.  Self-loop deadheads of zero length are dropped and
  /// zero-duration blocks are discarded.
  pub fn split(elements: &[VehicleElement], inst: &Instance) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();

    for e in elements {
      if e.is_stationary() {
        let loc = inst.location(e.start_loc);
        if loc.handover_allowed && e.duration() >= loc.handover_time() {
          blocks.extend(Block::from_elements(std::mem::take(&mut current)));
          continue;
        }
      }
      if e.kind == ElementKind::Deadhead && e.duration() == 0 {
        continue;
      }
      current.push(e.clone());
    }
    blocks.extend(Block::from_elements(current));
    blocks
  }

  pub fn from_vehicle_task(task: &VehicleTask, inst: &Instance) -> Vec<Block> {
    Block::split(&task.elements, inst)
  }

  /// Distinct blocks driven by `tasks`, with the number of tasks driving each.  Blocks are indexed
  /// in order of first appearance.
  pub fn from_vehicle_tasks<'a>(tasks: impl IntoIterator<Item=&'a VehicleTask>, inst: &Instance) -> Vec<(Block, u32)> {
    let mut counts: Vec<(Block, u32)> = Vec::new();
    let mut seen: Map<Descriptor, usize> = Map::default();
    for task in tasks {
      for mut b in Block::from_vehicle_task(task, inst) {
        match seen.get(&b.descriptor) {
          Some(&i) => counts[i].1 += 1,
          None => {
            b.index = counts.len();
            seen.insert(b.descriptor, b.index);
            counts.push((b, 1));
          }
        }
      }
    }
    counts
  }

  pub fn start_time(&self) -> Time { self.descriptor.start_time }

  pub fn end_time(&self) -> Time { self.descriptor.end_time }

  pub fn start_loc(&self) -> LocIdx { self.descriptor.start_loc }

  pub fn end_loc(&self) -> LocIdx { self.descriptor.end_loc }

  pub fn duration(&self) -> Time { self.descriptor.duration() }

  pub fn trips(&self) -> impl Iterator<Item=TripIdx> + '_ {
    self.elements.iter().filter_map(|e| match e.kind {
      ElementKind::Trip(t) => Some(t),
      _ => None,
    })
  }

  /// True if the block may be lengthened at its start, i.e. it begins with driving.
  pub fn extendable_at_start(&self) -> bool {
    self.elements.first().map_or(false, |e| matches!(e.kind, ElementKind::Trip(_) | ElementKind::Deadhead))
  }

  pub fn extendable_at_end(&self) -> bool {
    self.elements.last().map_or(false, |e| matches!(e.kind, ElementKind::Trip(_) | ElementKind::Deadhead))
  }

  pub fn starts_with_trip(&self) -> bool {
    self.elements.first().map_or(false, |e| matches!(e.kind, ElementKind::Trip(_)))
  }

  pub fn ends_with_trip(&self) -> bool {
    self.elements.last().map_or(false, |e| matches!(e.kind, ElementKind::Trip(_)))
  }
}

/// Every block seen during a run.  Blocks are only ever appended, so a block's index is stable
/// for the whole run.
#[derive(Debug, Clone, Default)]
pub struct BlockPool {
  blocks: Vec<Block>,
  by_descriptor: Map<Descriptor, usize>,
}

impl BlockPool {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the block's index and whether it was new.
  pub fn register(&mut self, mut block: Block) -> (usize, bool) {
    if let Some(&i) = self.by_descriptor.get(&block.descriptor) {
      return (i, false);
    }
    let i = self.blocks.len();
    block.index = i;
    self.by_descriptor.insert(block.descriptor, i);
    self.blocks.push(block);
    (i, true)
  }

  pub fn get(&self, d: &Descriptor) -> Option<usize> {
    self.by_descriptor.get(d).copied()
  }

  pub fn contains(&self, d: &Descriptor) -> bool {
    self.by_descriptor.contains_key(d)
  }

  pub fn len(&self) -> usize {
    self.blocks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.blocks.is_empty()
  }

  pub fn as_slice(&self) -> &[Block] {
    &self.blocks
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Block> {
    self.blocks.iter()
  }

  /// Index cover of a descriptor list; fails on blocks which were never registered.
  pub fn cover_of(&self, descriptors: &[Descriptor]) -> Result<CoverSet> {
    descriptors.iter()
      .map(|d| match self.get(d) {
        Some(i) => Ok(i),
        None => bail!("unknown block {}", d),
      })
      .collect()
  }
}

impl std::ops::Index<usize> for BlockPool {
  type Output = Block;

  fn index(&self, i: usize) -> &Block {
    &self.blocks[i]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test::*;
  use crate::vehicle::TaskBuilder;

  fn chain(inst: &Instance, trips: &[usize]) -> VehicleTask {
    let mut b = TaskBuilder::new(inst);
    for &t in trips {
      b.trip(t).unwrap();
    }
    b.finish(&test_config()).unwrap()
  }

  #[test]
  fn no_handover_gives_one_block() {
    let inst = line_instance(3, LineOptions { handover: false, ..LineOptions::default() });
    let task = chain(&inst, &[0, 1, 2]);
    let blocks = Block::from_vehicle_task(&task, &inst);
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].trips().count(), 3);
    assert_eq!(blocks[0].start_time(), task.start_time());
    assert_eq!(task.blocks, vec![blocks[0].descriptor]);
  }

  #[test]
  fn handover_splits_blocks() {
    let inst = line_instance(3, LineOptions { handover: true, ..LineOptions::default() });
    let task = chain(&inst, &[0, 1, 2]);
    let blocks = Block::from_vehicle_task(&task, &inst);
    assert_eq!(blocks.len(), 3);
    for w in blocks.windows(2) {
      assert!(w[0].end_time() < w[1].start_time());
    }
  }

  #[test]
  fn short_idle_does_not_split() {
    let inst = line_instance(3, LineOptions { handover: true, gap: 2 * crate::constants::MINUTE, ..LineOptions::default() });
    let task = chain(&inst, &[0, 1, 2]);
    assert_eq!(Block::from_vehicle_task(&task, &inst).len(), 1);
  }

  #[test]
  fn shared_blocks_are_counted() {
    let inst = line_instance(2, LineOptions { handover: true, ..LineOptions::default() });
    let a = chain(&inst, &[0, 1]);
    let b = VehicleTask::unit(0, &inst, &test_config()).unwrap();
    let blocks = Block::from_vehicle_tasks(vec![&a, &b], &inst);
    let total: u32 = blocks.iter().map(|(_, c)| c).sum();
    assert_eq!(total as usize, a.blocks.len() + b.blocks.len());
    for (i, (b, _)) in blocks.iter().enumerate() {
      assert_eq!(b.index, i);
    }
  }

  #[test]
  fn pool_indices_are_stable() {
    let mut pool = BlockPool::new();
    let d1 = Descriptor::new(0, 10, 1, 20);
    let d2 = Descriptor::new(1, 30, 0, 40);
    assert_eq!(pool.register(Block::from_descriptor(d1)), (0, true));
    assert_eq!(pool.register(Block::from_descriptor(d2)), (1, true));
    assert_eq!(pool.register(Block::from_descriptor(d1)), (0, false));
    assert_eq!(pool.cover_of(&[d2, d1]).unwrap(), [0, 1].iter().copied().collect());
    assert!(pool.cover_of(&[Descriptor::new(5, 5, 5, 6)]).is_err());
    assert_eq!(format!("{}", d1), "0#10#1#20");
  }
}
