use crate::block::{Block, BlockPool, Descriptor};
use crate::config::Config;
use crate::constants::{KWH_COST, VH_M_COST};
use crate::cover::CoverSet;
use crate::instance::{Instance, LocIdx, TripIdx};
use crate::pool::Column;
use crate::{Result, Time};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
  Trip(TripIdx),
  Deadhead,
  Idle,
  Charge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleElement {
  pub kind: ElementKind,
  pub start_loc: LocIdx,
  pub end_loc: LocIdx,
  pub start_time: Time,
  pub end_time: Time,
  pub distance: f64,
  pub cost: f64,
  pub start_soc: f64,
  pub end_soc: f64,
}

impl VehicleElement {
  #[inline]
  pub fn duration(&self) -> Time {
    self.end_time - self.start_time
  }

  #[inline]
  pub fn is_stationary(&self) -> bool {
    matches!(self.kind, ElementKind::Idle | ElementKind::Charge)
  }
}

/// A vehicle-side column: one vehicle's day, leaving and returning to the depot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleTask {
  pub elements: Vec<VehicleElement>,
  pub cost: f64,
  pub trip_cover: CoverSet,
  /// Blocks driven by this task, in order
  pub blocks: Vec<Descriptor>,
  /// Indices of `blocks` in the block pool; only valid once bound to a pool
  #[serde(skip)]
  pub block_cover: CoverSet,
  pub index: usize,
  pub is_unit: bool,
}

impl VehicleTask {
  /// Computes the derived attributes of a task.  The block cover is left empty until the task is
  /// bound to a block pool.
  pub fn from_elements(elements: Vec<VehicleElement>, inst: &Instance, cfg: &Config) -> Self {
    let vt = &inst.vehicle_type;
    let trip_cover = elements.iter()
      .filter_map(|e| match e.kind {
        ElementKind::Trip(t) => Some(t),
        _ => None,
      })
      .collect();

    let end_soc = elements.last().map_or(vt.start_soc, |e| e.end_soc);
    let recharge_cost = (vt.start_soc - end_soc).max(0.0) * vt.capacity / 100.0 * KWH_COST;
    let cost = cfg.vh_pullout_cost + elements.iter().map(|e| e.cost).sum::<f64>() + recharge_cost;

    let blocks = Block::split(&elements, inst).into_iter().map(|b| b.descriptor).collect();

    VehicleTask {
      elements,
      cost,
      trip_cover,
      blocks,
      block_cover: CoverSet::new(),
      index: 0,
      is_unit: false,
    }
  }

  /// The depot-trip-depot task for a single trip.
  pub fn unit(trip: TripIdx, inst: &Instance, cfg: &Config) -> Result<Self> {
    let mut b = TaskBuilder::new(inst);
    b.trip(trip)?;
    b.finish(cfg).with_context(|| format!("no unit task for trip {}", inst.trips[trip].id))
  }

  /// One unit task per trip, indexed by trip.
  pub fn trivial_cover(inst: &Instance, cfg: &Config) -> Result<Vec<Self>> {
    inst.trips.iter()
      .map(|t| {
        let mut task = VehicleTask::unit(t.index, inst, cfg)?;
        task.index = t.index;
        Ok(task)
      })
      .collect()
  }

  pub fn trips(&self) -> impl Iterator<Item=TripIdx> + '_ {
    self.trip_cover.iter()
  }

  pub fn start_time(&self) -> Time {
    self.elements.first().map_or(0, |e| e.start_time)
  }

  pub fn end_time(&self) -> Time {
    self.elements.last().map_or(0, |e| e.end_time)
  }

  /// Binds the task's blocks to their indices in `pool`.
  pub fn rebind(&mut self, pool: &BlockPool) -> Result<()> {
    self.block_cover = pool.cover_of(&self.blocks)?;
    Ok(())
  }
}

impl Column for VehicleTask {
  type Key = (CoverSet, CoverSet);

  fn key(&self) -> Self::Key {
    (self.trip_cover.clone(), self.block_cover.clone())
  }

  fn cost(&self) -> f64 { self.cost }

  fn index(&self) -> usize { self.index }

  fn set_index(&mut self, i: usize) { self.index = i; }

  fn is_unit(&self) -> bool { self.is_unit }

  fn set_unit(&mut self, unit: bool) { self.is_unit = unit; }
}

/// Appends elements to a task while tracking time, position and state of charge.
///
/// Waiting happens where the vehicle currently is: at a charger it becomes a charge element,
/// anywhere else an idle element.  Repositioning deadheads depart as late as possible.
pub struct TaskBuilder<'a> {
  inst: &'a Instance,
  elements: Vec<VehicleElement>,
  loc: LocIdx,
  time: Option<Time>,
  soc: f64,
  min_soc: f64,
}

impl<'a> TaskBuilder<'a> {
  pub fn new(inst: &'a Instance) -> Self {
    let soc = inst.vehicle_type.start_soc;
    TaskBuilder { inst, elements: Vec::new(), loc: inst.depot, time: None, soc, min_soc: soc }
  }

  pub fn soc(&self) -> f64 { self.soc }

  pub fn location(&self) -> LocIdx { self.loc }

  pub fn time(&self) -> Option<Time> { self.time }

  fn push(&mut self, kind: ElementKind, end_loc: LocIdx, start: Time, end: Time, distance: f64, soc_delta: f64, cost: f64) {
    let inst = self.inst;
    let vt = &inst.vehicle_type;
    let end_soc = (self.soc + soc_delta).min(vt.max_soc);
    self.elements.push(VehicleElement {
      kind,
      start_loc: self.loc,
      end_loc,
      start_time: start,
      end_time: end,
      distance,
      cost,
      start_soc: self.soc,
      end_soc,
    });
    self.soc = end_soc;
    self.min_soc = self.min_soc.min(end_soc);
    self.loc = end_loc;
    self.time = Some(end);
  }

  /// Stay at the current location until `t`.
  pub fn wait_until(&mut self, t: Time) -> Result<&mut Self> {
    let now = match self.time {
      None => {
        self.time = Some(t);
        return Ok(self);
      }
      Some(now) => now,
    };
    if t < now {
      bail!("cannot wait until {} at time {}", t, now);
    }
    if t == now {
      return Ok(self);
    }

    let inst = self.inst;
    let vt = &inst.vehicle_type;
    let dur = (t - now) as f64;
    if inst.location(self.loc).can_charge && vt.charge_rate > 0.0 {
      let gained = (dur * vt.charge_rate).min(vt.max_soc - self.soc).max(0.0);
      let cost = gained / 100.0 * vt.capacity * KWH_COST;
      self.push(ElementKind::Charge, self.loc, now, t, 0.0, gained, cost);
    } else {
      self.push(ElementKind::Idle, self.loc, now, t, 0.0, -dur * vt.idle_usage, 0.0);
    }
    Ok(self)
  }

  /// Drive empty to `to`, departing at `depart`.
  pub fn deadhead(&mut self, to: LocIdx, depart: Time) -> Result<&mut Self> {
    let (duration, distance) = match self.inst.travel(self.loc, to) {
      Some(t) => t,
      None => bail!("no deadhead from location {} to {}", self.loc, to),
    };
    self.wait_until(depart)?;
    let usage = distance * self.inst.vehicle_type.drive_usage;
    self.push(ElementKind::Deadhead, to, depart, depart + duration, distance, -usage, distance * VH_M_COST);
    Ok(self)
  }

  /// Drive `trip`, repositioning first if needed.
  pub fn trip(&mut self, trip: TripIdx) -> Result<&mut Self> {
    let inst = self.inst;
    let t = &inst.trips[trip];
    if self.loc != t.from {
      let (duration, _) = match inst.travel(self.loc, t.from) {
        Some(x) => x,
        None => bail!("no deadhead from location {} to trip {}", self.loc, t.id),
      };
      self.deadhead(t.from, t.start_time - duration)?;
    }
    self.wait_until(t.start_time)?;
    let usage = t.distance * inst.vehicle_type.drive_usage;
    self.push(ElementKind::Trip(trip), t.to, t.start_time, t.end_time, t.distance, -usage, t.distance * VH_M_COST);
    Ok(self)
  }

  /// Return to the depot and compute the task's attributes.
  pub fn finish(mut self, cfg: &Config) -> Result<VehicleTask> {
    if self.loc != self.inst.depot {
      let now = self.time.unwrap_or(0);
      self.deadhead(self.inst.depot, now)?;
    }
    let min_soc = self.inst.vehicle_type.min_soc;
    if self.min_soc < min_soc - crate::constants::EPS {
      bail!("task drops to {:.2}% SoC, below the minimum of {:.2}%", self.min_soc, min_soc);
    }
    Ok(VehicleTask::from_elements(self.elements, self.inst, cfg))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test::*;

  #[test]
  fn unit_task_cost() {
    let inst = line_instance(3, LineOptions::default());
    let cfg = test_config();
    let task = VehicleTask::unit(1, &inst, &cfg).unwrap();
    assert_eq!(task.trips().collect::<Vec<_>>(), vec![1]);
    let driving = inst.trips[1].distance * VH_M_COST;
    assert!((task.cost - cfg.vh_pullout_cost - driving).abs() < 1e-9);
    assert_eq!(task.elements.first().unwrap().start_loc, inst.depot);
    assert_eq!(task.elements.last().unwrap().end_loc, inst.depot);
  }

  #[test]
  fn chained_task_covers_all_trips() {
    let inst = line_instance(3, LineOptions::default());
    let cfg = test_config();
    let mut b = TaskBuilder::new(&inst);
    for t in 0..3 {
      b.trip(t).unwrap();
    }
    let task = b.finish(&cfg).unwrap();
    assert_eq!(task.trip_cover.len(), 3);
    assert!(task.elements.windows(2).all(|w| w[0].end_time <= w[1].start_time));
    assert!(task.elements.iter().any(|e| e.kind == ElementKind::Idle));
  }

  #[test]
  fn overlapping_trips_rejected() {
    let inst = line_instance(2, LineOptions { overlapping: true, ..LineOptions::default() });
    let mut b = TaskBuilder::new(&inst);
    b.trip(0).unwrap();
    assert!(b.trip(1).is_err());
  }

  #[test]
  fn battery_limit_rejected() {
    let inst = line_instance(3, LineOptions { drive_usage: 0.002, ..LineOptions::default() });
    let cfg = test_config();
    let mut b = TaskBuilder::new(&inst);
    for t in 0..3 {
      b.trip(t).unwrap();
    }
    assert!(b.finish(&cfg).is_err());
  }

  #[test]
  fn overnight_recharge_is_charged() {
    let inst = line_instance(1, LineOptions { drive_usage: 0.001, ..LineOptions::default() });
    let cfg = test_config();
    let task = VehicleTask::unit(0, &inst, &cfg).unwrap();
    let used = inst.vehicle_type.start_soc - task.elements.last().unwrap().end_soc;
    assert!(used > 0.0);
    let expected = cfg.vh_pullout_cost
      + task.elements.iter().map(|e| e.cost).sum::<f64>()
      + used * inst.vehicle_type.capacity / 100.0 * KWH_COST;
    assert!((task.cost - expected).abs() < 1e-9);
  }
}
