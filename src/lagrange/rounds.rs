use super::relaxation::{block_coverage, GradientSummary};
use super::Coordinator;
use crate::block::{Block, Descriptor};
use crate::colgen::MergeCounts;
use crate::constants::{EPS, MAX_STEERING_TIME};
use crate::crew::CrewDuty;
use crate::pool::Registration;
use crate::pricing::{CrewDuals, VehicleDuals};
use crate::vehicle::VehicleTask;
use crate::{Map, Result};
use std::sync::Arc;
use tracing::{debug, info, trace};

impl<'a> Coordinator<'a> {
  /// Registers a block, adding a single duty and a zero multiplier if it is new.
  pub(super) fn register_block(&mut self, block: Block) -> usize {
    let (i, new) = self.blocks.register(block);
    if new {
      self.multipliers.push_block();
      self.add_single_duty(i);
    }
    i
  }

  /// Adds the duty driving block `b` alone, unless the pool already has it.
  pub(super) fn add_single_duty(&mut self, b: usize) -> Registration {
    let duty = CrewDuty::single(&self.blocks[b], self.blocks.as_slice(), self.inst, self.cfg);
    self.register_duty(duty)
  }

  fn register_duty(&mut self, duty: CrewDuty) -> Registration {
    let r = self.duties.register_or_update(duty);
    if let Registration::Inserted(_) = r {
      self.selection.duties.push(0);
      self.incumbent.duties.push(0);
      self.duty_rc.push(0.0);
    }
    r
  }

  fn register_task(&mut self, task: VehicleTask) -> Registration {
    let r = self.tasks.register_or_update(task);
    if let Registration::Inserted(_) = r {
      self.selection.tasks.push(false);
      self.incumbent.tasks.push(false);
      self.task_rc.push(0.0);
    }
    r
  }

  pub(super) fn merge_tasks(&mut self, columns: Vec<(f64, VehicleTask)>) -> Result<MergeCounts> {
    let mut counts = MergeCounts::default();
    for (_, mut task) in columns {
      for block in Block::split(&task.elements, self.inst) {
        self.register_block(block);
      }
      task.rebind(&self.blocks)?;
      match self.register_task(task) {
        Registration::Inserted(_) => counts.inserted += 1,
        Registration::Replaced(_) => counts.replaced += 1,
        Registration::RejectedDuplicate(_) => counts.discarded += 1,
      }
    }
    Ok(counts)
  }

  pub(super) fn merge_duties(&mut self, columns: Vec<(f64, CrewDuty)>) -> Result<MergeCounts> {
    let mut counts = MergeCounts::default();
    for (_, mut duty) in columns {
      duty.rebind(&self.blocks)?;
      match self.register_duty(duty) {
        Registration::Inserted(_) => counts.inserted += 1,
        Registration::Replaced(_) => counts.replaced += 1,
        Registration::RejectedDuplicate(_) => counts.discarded += 1,
      }
    }
    Ok(counts)
  }

  /// Moves the multipliers so that no selected task has negative reduced cost: the reduced cost
  /// of each such task is spread evenly over the multipliers of its trips and blocks.
  pub(super) fn stabilize_vehicles(&mut self) {
    let mut adjusted = 0;
    for (i, task) in self.tasks.iter().enumerate() {
      if !self.selection.tasks[i] || self.task_rc[i] >= 0.0 {
        continue;
      }
      let n = task.trip_cover.len() + task.block_cover.len();
      if n == 0 {
        continue;
      }
      let delta = self.task_rc[i] / n as f64;
      for t in task.trips() {
        self.multipliers.trips[t] += delta;
      }
      for b in task.block_cover.iter() {
        self.multipliers.blocks[b] += delta;
      }
      adjusted += 1;
    }
    self.multipliers.project();
    trace!(adjusted, "stabilized vehicle multipliers");
  }

  /// Crew counterpart of [`Self::stabilize_vehicles`], spreading over block and regulation
  /// multipliers.
  pub(super) fn stabilize_crew(&mut self) {
    let mut adjusted = 0;
    for (j, duty) in self.duties.iter().enumerate() {
      if self.selection.duties[j] == 0 || self.duty_rc[j] >= 0.0 {
        continue;
      }
      let t = duty.regulation_terms();
      let s = duty.block_cover.len() as f64 + t.avg_length + t.long + t.broken + t.between;
      if s.abs() < EPS {
        continue;
      }
      let delta = self.duty_rc[j] / -s;
      for b in duty.block_cover.iter() {
        self.multipliers.blocks[b] += delta;
      }
      self.multipliers.shift_regulation(delta);
      adjusted += 1;
    }
    self.multipliers.project();
    trace!(adjusted, "stabilized crew multipliers");
  }

  fn vehicle_duals(&self) -> VehicleDuals {
    let blocks: Map<Descriptor, f64> = self.blocks.iter()
      .map(|b| (b.descriptor, self.multipliers.blocks[b.index]))
      .collect();
    VehicleDuals::new(self.multipliers.trips.clone(), blocks, 0.0)
  }

  fn crew_duals(&self) -> CrewDuals {
    let m = &self.multipliers;
    let blocks = Arc::new(self.blocks.as_slice().to_vec());
    let mut duals = CrewDuals::new(blocks, m.blocks.iter().map(|&mu| -mu).collect());
    duals.block_counts = block_coverage(self.tasks.as_slice(), &self.selection.tasks, self.blocks.len());
    duals.avg_length = m.avg_length;
    duals.long_duties = m.long;
    duals.broken_duties = m.broken;
    duals.between_duties = m.between;
    duals
  }

  /// One vehicle pricing iteration followed by a descent.  Disruption rounds keep every column.
  pub fn vehicle_iteration(&mut self, disrupt: bool) -> Result<GradientSummary> {
    if self.cfg.vcsp_nonnegative_rc_vsp {
      self.stabilize_vehicles();
    }
    if disrupt {
      self.multipliers.disrupt(&mut self.rng, self.cfg.lagrange_disrupt_lwr, self.cfg.lagrange_disrupt_upr);
    }
    let duals = self.vehicle_duals();
    let round = self.vehicle_portfolio.run(&duals)?;
    let blocks_before = self.blocks.len();
    let counts = self.merge_tasks(round.columns)?;
    debug!(
      strategy = self.vehicle_portfolio.strategy_name(round.strategy),
      new = counts.inserted,
      improved = counts.replaced,
      discarded = counts.discarded,
      new_blocks = self.blocks.len() - blocks_before,
      "vehicle pricing"
    );
    self.gradient_descent(!disrupt)
  }

  /// One crew pricing iteration followed by a descent.
  pub fn crew_iteration(&mut self, disrupt: bool) -> Result<GradientSummary> {
    if self.cfg.vcsp_nonnegative_rc_csp {
      self.stabilize_crew();
    }
    if disrupt {
      self.multipliers.disrupt(&mut self.rng, self.cfg.lagrange_disrupt_lwr, self.cfg.lagrange_disrupt_upr);
    }
    let added = self.add_random_blocks();
    let duals = self.crew_duals();
    let round = self.crew_portfolio.run(&duals)?;
    let counts = self.merge_duties(round.columns)?;
    debug!(
      strategy = self.crew_portfolio.strategy_name(round.strategy),
      new = counts.inserted,
      improved = counts.replaced,
      discarded = counts.discarded,
      extended_blocks = added,
      "crew pricing"
    );
    self.gradient_descent(!disrupt)
  }

  /// Candidate extensions of block `i` by one trip or deadhead at either end, with their
  /// estimated reduced cost.  Trips must start where crews may be relieved and follow on with
  /// less idle than a handover needs.  Deadheads only extend a block ending in a trip and must
  /// leave from a handover location.
  fn block_extensions(&self, i: usize) -> Vec<(f64, Descriptor)> {
    let inst = self.inst;
    let min_wait = self.cfg.cr_min_short_idle_time;
    let base = &self.blocks[i];
    let d = base.descriptor;
    let handover_at = |l: usize| inst.location(l).handover_allowed;
    let mut candidates = Vec::new();

    if base.extendable_at_start() {
      let handover = inst.location(d.start_loc).handover_time();
      for trip in inst.trips.iter().filter(|t| t.to == d.start_loc && handover_at(t.from)) {
        let wait = d.start_time - trip.end_time;
        if min_wait <= wait && wait < handover && trip.duration() + wait + d.duration() <= MAX_STEERING_TIME {
          let ext = Descriptor::new(trip.from, trip.start_time, d.end_loc, d.end_time);
          candidates.push((-self.multipliers.trips[trip.index], ext));
        }
      }
      if base.starts_with_trip() {
        for dh in inst.deadheads.iter().filter(|dh| dh.to == d.start_loc && dh.from != dh.to && handover_at(dh.from)) {
          candidates.push((0.0, Descriptor::new(dh.from, d.start_time - dh.duration, d.end_loc, d.end_time)));
        }
      }
    }

    if base.extendable_at_end() {
      let handover = inst.location(d.end_loc).handover_time();
      for trip in inst.trips.iter().filter(|t| t.from == d.end_loc && handover_at(t.from)) {
        let wait = trip.start_time - d.end_time;
        if min_wait <= wait && wait <= handover && trip.duration() + wait + d.duration() <= MAX_STEERING_TIME {
          let ext = Descriptor::new(d.start_loc, d.start_time, trip.to, trip.end_time);
          candidates.push((-self.multipliers.trips[trip.index], ext));
        }
      }
      if base.ends_with_trip() {
        for dh in inst.deadheads.iter().filter(|dh| dh.from == d.end_loc && dh.from != dh.to && handover_at(dh.from)) {
          candidates.push((0.0, Descriptor::new(d.start_loc, d.start_time, dh.to, d.end_time + dh.duration)));
        }
      }
    }
    candidates
  }

  /// Adds, for every `vcsp_block_per_x_add`-th known block, its cheapest unknown extension.
  /// Returns the number of blocks added.
  pub(super) fn add_random_blocks(&mut self) -> usize {
    let stride = self.cfg.vcsp_block_per_x_add;
    if stride == 0 {
      return 0;
    }
    let n = self.blocks.len();
    let mut added = 0;
    for i in (0..n).step_by(stride) {
      if self.blocks[i].elements.is_empty() {
        continue;
      }
      let best = self.block_extensions(i)
        .into_iter()
        .filter(|(_, d)| !self.blocks.contains(d))
        .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
      if let Some((estimate, d)) = best {
        trace!(base = %self.blocks[i].descriptor, ext = %d, estimate, "block extension");
        self.register_block(Block::from_descriptor(d));
        added += 1;
      }
    }
    if added > 0 {
      info!(added, blocks = self.blocks.len(), "added block extensions");
    }
    added
  }
}

#[cfg(test)]
mod tests {
  use super::super::tests::coordinator;
  use super::super::{Coordinator, IntegralCover};
  use crate::block::{Block, Descriptor};
  use crate::config::Config;
  use crate::constants::MINUTE;
  use crate::crew::CrewDuty;
  use crate::instance::Instance;
  use crate::test::*;
  use crate::vehicle::ElementKind;

  #[test]
  fn stabilization_zeroes_selected_reduced_costs() {
    let inst = line_instance(2, LineOptions::default());
    let cfg = test_config();
    let mut c = coordinator(&inst, &cfg);
    for m in &mut c.multipliers.trips {
      *m = 1_000.0;
    }
    c.update_reduced_costs();
    c.selection = c.solve_subproblem();
    assert!(c.selection.tasks.iter().all(|&x| x));
    c.stabilize_vehicles();
    c.update_reduced_costs();
    for rc in &c.task_rc {
      assert!(rc.abs() < 1e-6, "rc = {}", rc);
    }
  }

  #[test]
  fn crew_stabilization_respects_projection() {
    let inst = line_instance(2, LineOptions::default());
    let cfg = test_config();
    let mut c = coordinator(&inst, &cfg);
    for m in &mut c.multipliers.blocks {
      *m = -5_000.0;
    }
    c.update_reduced_costs();
    c.selection = c.solve_subproblem();
    assert!(c.selection.duties.iter().all(|&n| n > 0));
    let before = c.multipliers.clone();
    c.stabilize_crew();
    let m = &c.multipliers;
    assert!(m.avg_length >= 0.0 && m.long >= 0.0 && m.broken >= 0.0 && m.between >= 0.0);
    assert_eq!(m.blocks.len(), before.blocks.len());
    assert_ne!(m.blocks, before.blocks);
  }

  /// The chained task over a line and one single duty per block it drives.
  fn chained_cover(inst: &Instance, cfg: &Config) -> IntegralCover {
    let task = chained_task(inst, cfg);
    let blocks: Vec<Block> = Block::from_vehicle_tasks(std::iter::once(&task), inst)
      .into_iter()
      .map(|(b, _)| b)
      .collect();
    let duties = CrewDuty::trivial_cover(&blocks, inst, cfg);
    IntegralCover {
      tasks: vec![task],
      task_selection: vec![(0, 1)],
      duty_selection: (0..duties.len()).map(|j| (j, 1)).collect(),
      duties,
    }
  }

  fn chained_coordinator<'a>(inst: &'a Instance, cfg: &'a Config) -> Coordinator<'a> {
    Coordinator::new(inst, cfg, chained_cover(inst, cfg), test_output_dir()).unwrap()
  }

  /// Registers the block made of trip `t` of the chained task alone.
  fn register_trip_block(c: &mut Coordinator, t: usize) -> usize {
    let task = chained_task(c.inst, c.cfg);
    let pos = task.elements.iter().position(|e| e.kind == ElementKind::Trip(t)).unwrap();
    let mut blocks = Block::split(&task.elements[pos..=pos], c.inst);
    assert_eq!(blocks.len(), 1);
    c.register_block(blocks.pop().unwrap())
  }

  #[test]
  fn block_extension_adds_a_single_duty() {
    let inst = line_instance(3, LineOptions::default());
    let mut cfg = test_config();
    cfg.vcsp_block_per_x_add = 1;
    let mut c = chained_coordinator(&inst, &cfg);
    assert_eq!(c.blocks.len(), 3);
    let blocks_before = c.blocks.len();
    let duties_before = c.duties.len();
    let added = c.add_random_blocks();
    assert_eq!(added, 3);
    assert_eq!(c.blocks.len(), blocks_before + added);
    assert_eq!(c.duties.len(), duties_before + added);
    assert_eq!(c.multipliers.blocks.len(), c.blocks.len());
    assert_eq!(c.selection.duties.len(), c.duties.len());
    assert!(c.blocks.iter().skip(blocks_before).all(|b| b.elements.is_empty()));
    let base: Vec<Descriptor> = c.blocks.iter().take(blocks_before).map(|b| b.descriptor).collect();
    for b in c.blocks.iter().skip(blocks_before) {
      assert!(base.iter().any(|d| d.end_time == b.descriptor.end_time || d.start_time == b.descriptor.start_time));
    }
  }

  #[test]
  fn blocks_bounded_by_deadheads_are_not_extended() {
    let inst = line_instance(3, LineOptions::default());
    let mut cfg = test_config();
    cfg.vcsp_block_per_x_add = 1;
    // unit tasks give depot-to-depot blocks, and no trip ends at the depot
    let mut c = coordinator(&inst, &cfg);
    for i in 0..c.blocks.len() {
      assert!(c.block_extensions(i).is_empty());
    }
    assert_eq!(c.add_random_blocks(), 0);
  }

  #[test]
  fn deadhead_extensions_leave_from_handover_locations() {
    let mut inst = line_instance(3, LineOptions::default());
    inst.locations[inst.depot].handover_allowed = false;
    let mut cfg = test_config();
    cfg.vcsp_block_per_x_add = 1;
    let mut c = chained_coordinator(&inst, &cfg);
    let base: Vec<Descriptor> = c.blocks.iter().map(|b| b.descriptor).collect();
    assert_eq!(c.add_random_blocks(), 2);
    for b in c.blocks.iter().skip(base.len()) {
      let d = b.descriptor;
      assert!(base.iter().any(|x| x.start_loc == d.start_loc && x.start_time == d.start_time),
        "{} starts with a deadhead from the depot", d);
    }
  }

  #[test]
  fn trip_extensions_respect_handover_rules() {
    let opts = LineOptions { gap: 2 * MINUTE, ..LineOptions::default() };
    let inst = line_instance(3, opts);
    let cfg = test_config();
    let mut c = chained_coordinator(&inst, &cfg);
    let i = register_trip_block(&mut c, 1);
    let (t0, t2) = (&inst.trips[0], &inst.trips[2]);
    let d = c.blocks[i].descriptor;
    let front = Descriptor::new(t0.from, t0.start_time, d.end_loc, d.end_time);
    let back = Descriptor::new(d.start_loc, d.start_time, t2.to, t2.end_time);
    let ext: Vec<Descriptor> = c.block_extensions(i).into_iter().map(|(_, d)| d).collect();
    assert!(ext.contains(&front));
    assert!(ext.contains(&back));

    let mut inst = line_instance(3, opts);
    inst.locations[1].handover_allowed = false;
    let mut c = chained_coordinator(&inst, &cfg);
    let i = register_trip_block(&mut c, 1);
    let ext: Vec<Descriptor> = c.block_extensions(i).into_iter().map(|(_, d)| d).collect();
    assert!(!ext.contains(&front));
    assert!(!ext.contains(&back));
    // only the deadhead in from the depot remains
    assert_eq!(ext.len(), 1);
    assert_eq!(ext[0].start_loc, inst.depot);
  }

  #[test]
  fn trip_extension_at_the_end_allows_exact_handover_time() {
    let inst = line_instance(3, LineOptions { gap: 5 * MINUTE, ..LineOptions::default() });
    let cfg = test_config();
    assert_eq!(inst.locations[1].handover_time(), 5 * MINUTE);
    let mut c = chained_coordinator(&inst, &cfg);
    let i = register_trip_block(&mut c, 1);
    let (t0, t2) = (&inst.trips[0], &inst.trips[2]);
    let d = c.blocks[i].descriptor;
    let ext: Vec<Descriptor> = c.block_extensions(i).into_iter().map(|(_, d)| d).collect();
    assert!(!ext.contains(&Descriptor::new(t0.from, t0.start_time, d.end_loc, d.end_time)));
    assert!(ext.contains(&Descriptor::new(d.start_loc, d.start_time, t2.to, t2.end_time)));
  }
}
