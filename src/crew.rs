use crate::block::{Block, BlockPool, Descriptor};
use crate::config::Config;
use crate::constants::*;
use crate::cover::CoverSet;
use crate::instance::{Instance, LocIdx};
use crate::pool::Column;
use crate::{Result, Time};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum DutyType {
  /// Ends before 16:30
  Early,
  /// Ends between 16:30 and 18:15
  Day,
  /// Begins at or after 13:00, ends at or before 26:30
  Late,
  /// Begins before 24:00, ends at or after 26:30, at most 7 hours
  Night,
  /// Begins before 13:00, ends after 18:15
  Between,
  /// Has a long unpaid rest; begins after 5:30, ends before 19:30
  Broken,
  /// A single block, only used to seed the pool
  Single,
}

impl DutyType {
  /// Duty type for a duty spanning `[start, end]`, `None` if no type admits it.
  pub fn classify(start: Time, end: Time, has_long_idle: bool) -> Option<DutyType> {
    if has_long_idle {
      return if start >= 5 * HOUR + 30 * MINUTE && end <= 19 * HOUR + 30 * MINUTE {
        Some(DutyType::Broken)
      } else {
        None
      };
    }
    let late_end = 26 * HOUR + 30 * MINUTE;
    if end <= 16 * HOUR + 30 * MINUTE {
      Some(DutyType::Early)
    } else if end <= 18 * HOUR + 15 * MINUTE {
      Some(DutyType::Day)
    } else if start >= 13 * HOUR && end <= late_end {
      Some(DutyType::Late)
    } else if start < 13 * HOUR && end <= late_end {
      Some(DutyType::Between)
    } else if start < 24 * HOUR && end - start <= 7 * HOUR {
      Some(DutyType::Night)
    } else {
      None
    }
  }
}

impl fmt::Display for DutyType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum CrewElementKind {
  /// Index into the block list the duty was built against
  Block(usize),
  Idle,
  Break,
  Travel,
  SignOnOff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrewElement {
  pub kind: CrewElementKind,
  pub start_loc: LocIdx,
  pub end_loc: LocIdx,
  pub start_time: Time,
  pub end_time: Time,
}

impl CrewElement {
  pub fn duration(&self) -> Time {
    self.end_time - self.start_time
  }
}

/// Normalised excess of a duty against each crew regulation.  Summing a term over the selected
/// duties gives a value which must not be positive in a compliant schedule.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct RegulationTerms {
  pub avg_length: f64,
  pub long: f64,
  pub broken: f64,
  pub between: f64,
}

/// A crew-side column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrewDuty {
  pub duty_type: DutyType,
  pub elements: Vec<CrewElement>,
  pub blocks: Vec<Descriptor>,
  #[serde(skip)]
  pub block_cover: CoverSet,
  pub cost: f64,
  pub paid_duration: Time,
  pub is_long: bool,
  pub index: usize,
  pub is_unit: bool,
}

fn sign_element(loc: LocIdx, start: Time, end: Time) -> CrewElement {
  CrewElement { kind: CrewElementKind::SignOnOff, start_loc: loc, end_loc: loc, start_time: start, end_time: end }
}

impl CrewDuty {
  /// Builds a duty from its working elements (blocks and whatever lies between them).  Sign-on
  /// and sign-off elements are added here.
  pub fn new(duty_type: DutyType, mut elements: Vec<CrewElement>, blocks: &[Block], inst: &Instance, cfg: &Config) -> Self {
    debug_assert!(!elements.is_empty());
    let first = &elements[0];
    let last = &elements[elements.len() - 1];
    let start_loc = inst.location(first.start_loc);
    let end_loc = inst.location(last.end_loc);
    let sign_on = sign_element(first.start_loc, first.start_time - start_loc.sign_on_time, first.start_time);
    let sign_off = sign_element(last.end_loc, last.end_time, last.end_time + end_loc.sign_off_time);
    elements.insert(0, sign_on);
    elements.push(sign_off);

    let span = elements[elements.len() - 1].end_time - elements[0].start_time;
    let unpaid = if duty_type == DutyType::Broken {
      elements.iter()
        .filter(|e| e.kind == CrewElementKind::Idle && e.duration() >= cfg.cr_min_long_idle_time)
        .map(|e| e.duration())
        .max()
        .unwrap_or(0)
    } else {
      0
    };
    let paid_duration = span - unpaid;

    let mut cost = cfg.cr_shift_cost + paid_duration as f64 / HOUR as f64 * cfg.cr_hourly_cost;
    match duty_type {
      DutyType::Broken => cost += cfg.cr_broken_shift_cost,
      DutyType::Single => cost += cfg.cr_single_shift_cost,
      _ => {}
    }

    let block_indices: Vec<_> = elements.iter()
      .filter_map(|e| match e.kind {
        CrewElementKind::Block(b) => Some(b),
        _ => None,
      })
      .collect();
    let block_cover = block_indices.iter().copied().collect();
    let blocks = block_indices.iter().map(|&b| blocks[b].descriptor).collect();

    CrewDuty {
      duty_type,
      elements,
      blocks,
      block_cover,
      cost,
      paid_duration,
      is_long: paid_duration > CR_LONG_SHIFT_LENGTH,
      index: 0,
      is_unit: false,
    }
  }

  /// The seeding duty which drives exactly one block.
  pub fn single(block: &Block, blocks: &[Block], inst: &Instance, cfg: &Config) -> Self {
    let d = &block.descriptor;
    let element = CrewElement {
      kind: CrewElementKind::Block(block.index),
      start_loc: d.start_loc,
      end_loc: d.end_loc,
      start_time: d.start_time,
      end_time: d.end_time,
    };
    CrewDuty::new(DutyType::Single, vec![element], blocks, inst, cfg)
  }

  /// One single duty per block, indexed by block.
  pub fn trivial_cover(blocks: &[Block], inst: &Instance, cfg: &Config) -> Vec<Self> {
    blocks.iter()
      .map(|b| {
        let mut d = CrewDuty::single(b, blocks, inst, cfg);
        d.index = b.index;
        d
      })
      .collect()
  }

  pub fn is_broken(&self) -> bool {
    self.duty_type == DutyType::Broken
  }

  pub fn is_between(&self) -> bool {
    self.duty_type == DutyType::Between
  }

  pub fn start_time(&self) -> Time {
    self.elements.first().map_or(0, |e| e.start_time)
  }

  pub fn end_time(&self) -> Time {
    self.elements.last().map_or(0, |e| e.end_time)
  }

  pub fn regulation_terms(&self) -> RegulationTerms {
    let ind = |b: bool| if b { 1.0 } else { 0.0 };
    RegulationTerms {
      avg_length: self.paid_duration as f64 / CR_TARGET_SHIFT_LENGTH as f64 - 1.0,
      long: ind(self.is_long) - CR_MAX_OVER_LONG_DUTY,
      broken: ind(self.is_broken()) - CR_MAX_BROKEN_SHIFTS,
      between: ind(self.is_between()) - CR_MAX_BETWEEN_SHIFTS,
    }
  }

  /// Recomputes the block cover against `pool`, e.g. after the duty was built against another
  /// block list.
  pub fn rebind(&mut self, pool: &BlockPool) -> Result<()> {
    self.block_cover = pool.cover_of(&self.blocks)?;
    let mut descriptors = self.blocks.iter();
    for e in &mut self.elements {
      if let CrewElementKind::Block(b) = &mut e.kind {
        if let Some(i) = descriptors.next().and_then(|d| pool.get(d)) {
          *b = i;
        }
      }
    }
    Ok(())
  }
}

impl Column for CrewDuty {
  type Key = (CoverSet, DutyType);

  fn key(&self) -> Self::Key {
    (self.block_cover.clone(), self.duty_type)
  }

  fn cost(&self) -> f64 { self.cost }

  fn index(&self) -> usize { self.index }

  fn set_index(&mut self, i: usize) { self.index = i; }

  /// Single duties are kept as well, so every known block stays coverable.
  fn is_unit(&self) -> bool { self.is_unit || self.duty_type == DutyType::Single }

  fn set_unit(&mut self, unit: bool) { self.is_unit = unit; }
}
