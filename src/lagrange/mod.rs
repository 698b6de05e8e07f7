//! Integrated vehicle and crew scheduling by Lagrangian relaxation.
//!
//! Trip cover, the vehicle/crew block linking and the crew regulations are relaxed into the
//! objective.  The coordinator alternates vehicle pricing, crew pricing and subgradient descents
//! over one task pool and one duty pool, then solves the integral problem over both pools.
mod ilp;
pub mod multipliers;
pub mod relaxation;
mod rounds;

use crate::block::{Block, BlockPool};
use crate::colgen;
use crate::config::Config;
use crate::crew::CrewDuty;
use crate::instance::Instance;
use crate::model::GurobiInfo;
use crate::pool::ColumnPool;
use crate::pricing::{crew_portfolio, vehicle_portfolio, CrewDuals, Portfolio, VehicleDuals};
use crate::run::stopwatch::Stopwatch;
use crate::solution::Solution;
use crate::vehicle::VehicleTask;
use crate::Result;
use anyhow::bail;
use grb::Env;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{error, info, info_span};

pub use self::multipliers::{Multipliers, Subgradient};
pub use self::relaxation::{GradientSummary, Selection};

/// Where the coordinator is in its run.  Phases only ever move forward.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum Phase {
  Bootstrap,
  SubgradientWarmup,
  VehicleRound(usize),
  CrewRound(usize),
  Disruption(usize),
  FinalExactSolve,
  Done,
  Failed,
}

impl Phase {
  fn rank(&self) -> (u8, usize, u8) {
    match *self {
      Phase::Bootstrap => (0, 0, 0),
      Phase::SubgradientWarmup => (1, 0, 0),
      Phase::VehicleRound(r) => (2, r, 0),
      Phase::CrewRound(r) => (2, r, 1),
      Phase::Disruption(d) => (3, d, 0),
      Phase::FinalExactSolve => (4, 0, 0),
      Phase::Done => (5, 0, 0),
      Phase::Failed => (6, 0, 0),
    }
  }

  /// `Failed` may follow any phase, every other phase must come strictly later.
  pub fn can_advance_to(&self, next: Phase) -> bool {
    next == Phase::Failed || next.rank() > self.rank()
  }
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Phase::VehicleRound(r) => write!(f, "vehicle_round_{}", r),
      Phase::CrewRound(r) => write!(f, "crew_round_{}", r),
      Phase::Disruption(d) => write!(f, "disruption_{}", d),
      other => fmt::Debug::fmt(other, f),
    }
  }
}

/// An integral vehicle and crew schedule over explicit column lists.  Column indices must match
/// their positions; selections list `(column, multiplicity)`.
#[derive(Debug, Clone, Default)]
pub struct IntegralCover {
  pub tasks: Vec<VehicleTask>,
  pub task_selection: Vec<(usize, u32)>,
  pub duties: Vec<CrewDuty>,
  pub duty_selection: Vec<(usize, u32)>,
}

impl IntegralCover {
  /// One unit task per trip and one single duty per block of those tasks, all selected.
  pub fn trivial(inst: &Instance, cfg: &Config) -> Result<Self> {
    let tasks = VehicleTask::trivial_cover(inst, cfg)?;
    let blocks: Vec<Block> = Block::from_vehicle_tasks(&tasks, inst).into_iter().map(|(b, _)| b).collect();
    let duties = CrewDuty::trivial_cover(&blocks, inst, cfg);
    Ok(IntegralCover {
      task_selection: (0..tasks.len()).map(|i| (i, 1)).collect(),
      duty_selection: (0..duties.len()).map(|j| (j, 1)).collect(),
      tasks,
      duties,
    })
  }

  /// Cost of the schedule, including fleet and duty overage.
  pub fn cost(&self, cfg: &Config) -> f64 {
    let vehicles: u32 = self.task_selection.iter().map(|&(_, n)| n).sum();
    let duties: u32 = self.duty_selection.iter().map(|&(_, n)| n).sum();
    let task_cost: f64 = self.task_selection.iter().map(|&(i, n)| self.tasks[i].cost * n as f64).sum();
    let duty_cost: f64 = self.duty_selection.iter().map(|&(j, n)| self.duties[j].cost * n as f64).sum();
    task_cost
      + (vehicles as usize).saturating_sub(cfg.max_vehicles) as f64 * cfg.vh_over_max_cost
      + duty_cost
      + (duties as usize).saturating_sub(cfg.max_duties) as f64 * cfg.cr_over_max_cost
  }
}

pub enum Bootstrap {
  Existing(IntegralCover),
  /// Vehicle column generation, then crew column generation over its blocks
  Sequential,
}

pub struct Coordinator<'a> {
  inst: &'a Instance,
  cfg: &'a Config,
  output_dir: PathBuf,
  phase: Phase,
  blocks: BlockPool,
  tasks: ColumnPool<VehicleTask>,
  duties: ColumnPool<CrewDuty>,
  multipliers: Multipliers,
  task_rc: Vec<f64>,
  duty_rc: Vec<f64>,
  selection: Selection,
  /// Column counts of the best known integral schedule, indexed like the pools
  incumbent: Selection,
  upper_bound: f64,
  last_bound: Option<f64>,
  vehicle_portfolio: Portfolio<'a, VehicleDuals, VehicleTask>,
  crew_portfolio: Portfolio<'a, CrewDuals, CrewDuty>,
  rng: SmallRng,
  stopwatch: Stopwatch,
  final_info: Option<GurobiInfo>,
}

impl<'a> Coordinator<'a> {
  /// Takes over an integral cover, whose cost becomes the upper bound.  Every block gets a
  /// single duty, so the crew side can always cover whatever the vehicles drive.
  pub fn new(inst: &'a Instance, cfg: &'a Config, cover: IntegralCover, output_dir: &Path) -> Result<Self> {
    let mut stopwatch = Stopwatch::new();
    stopwatch.start(Phase::Bootstrap.to_string());
    let upper_bound = cover.cost(cfg);
    let IntegralCover { mut tasks, task_selection, mut duties, duty_selection } = cover;

    let mut blocks = BlockPool::new();
    for task in &tasks {
      for b in Block::split(&task.elements, inst) {
        blocks.register(b);
      }
    }
    for duty in &duties {
      for d in &duty.blocks {
        if !blocks.contains(d) {
          blocks.register(Block::from_descriptor(*d));
        }
      }
    }
    for task in &mut tasks {
      task.rebind(&blocks)?;
    }
    for duty in &mut duties {
      duty.rebind(&blocks)?;
    }

    let mut tasks = ColumnPool::from_existing(tasks)?;
    let mut duties = ColumnPool::from_existing(duties)?;
    tasks.clear_units();
    duties.clear_units();
    let mut incumbent = Selection::empty(tasks.len(), duties.len());
    for &(i, n) in &task_selection {
      if i >= tasks.len() {
        bail!("selected task {} is not in the cover", i);
      }
      tasks.set_unit(i, true);
      incumbent.tasks[i] = n > 0;
    }
    for &(j, n) in &duty_selection {
      if j >= duties.len() {
        bail!("selected duty {} is not in the cover", j);
      }
      duties.set_unit(j, true);
      incumbent.duties[j] = n;
    }
    incumbent.value = upper_bound;

    let mut c = Coordinator {
      inst,
      cfg,
      output_dir: output_dir.to_path_buf(),
      phase: Phase::Bootstrap,
      multipliers: Multipliers::zeros(inst.trips.len(), blocks.len()),
      task_rc: vec![0.0; tasks.len()],
      duty_rc: vec![0.0; duties.len()],
      blocks,
      tasks,
      duties,
      selection: incumbent.clone(),
      incumbent,
      upper_bound,
      last_bound: None,
      vehicle_portfolio: vehicle_portfolio(inst, cfg, cfg.seed)?,
      crew_portfolio: crew_portfolio(inst, cfg, cfg.seed.wrapping_add(1))?,
      rng: SmallRng::seed_from_u64(cfg.seed.wrapping_add(2)),
      stopwatch,
      final_info: None,
    };
    for b in 0..c.blocks.len() {
      c.add_single_duty(b);
    }

    info!(upper_bound, tasks = c.tasks.len(), duties = c.duties.len(), blocks = c.blocks.len(), "coordinator initialised");
    Ok(c)
  }

  /// Builds the starting cover, sequentially with column generation if asked to.
  pub fn bootstrap(env: &Env, inst: &'a Instance, cfg: &'a Config, bootstrap: Bootstrap, output_dir: &Path) -> Result<Self> {
    let _s = info_span!("bootstrap").entered();
    let cover = match bootstrap {
      Bootstrap::Existing(cover) => cover,
      Bootstrap::Sequential => {
        let seq = colgen::sequential(env, inst, cfg, output_dir)?;
        IntegralCover {
          task_selection: seq.vehicles.selection,
          tasks: seq.vehicles.pool.into_columns(),
          duty_selection: seq.crew.selection,
          duties: seq.crew.pool.into_columns(),
        }
      }
    };
    Coordinator::new(inst, cfg, cover, output_dir)
  }

  pub fn phase(&self) -> Phase {
    self.phase
  }

  pub fn upper_bound(&self) -> f64 {
    self.upper_bound
  }

  pub fn last_bound(&self) -> Option<f64> {
    self.last_bound
  }

  pub fn n_tasks(&self) -> usize {
    self.tasks.len()
  }

  pub fn n_duties(&self) -> usize {
    self.duties.len()
  }

  pub fn n_blocks(&self) -> usize {
    self.blocks.len()
  }

  pub fn final_info(&self) -> Option<&GurobiInfo> {
    self.final_info.as_ref()
  }

  pub fn advance(&mut self, next: Phase) -> Result<()> {
    if !self.phase.can_advance_to(next) {
      bail!("cannot move from phase {} back to {}", self.phase, next);
    }
    info!(from = %self.phase, to = %next, "phase");
    self.phase = next;
    match next {
      Phase::Done | Phase::Failed => self.stopwatch.stop(),
      _ => self.stopwatch.lap(next.to_string()),
    }
    Ok(())
  }

  /// Vehicle and crew pricing iterations of a round phase.  Disruption rounds continue the
  /// round numbering, so only the very first round uses the initial counts.
  pub fn round_iterations(phase: Phase, cfg: &Config) -> (usize, usize) {
    let vehicle = |r: usize| if r == 0 { cfg.vcsp_vh_its_init } else { cfg.vcsp_vh_its_round };
    let crew = |r: usize| if r == 0 { cfg.vcsp_cr_its_init } else { cfg.vcsp_cr_its_round };
    match phase {
      Phase::VehicleRound(r) => (vehicle(r), 0),
      Phase::CrewRound(r) => (0, crew(r)),
      Phase::Disruption(d) => {
        let r = cfg.vcsp_rounds + d;
        (vehicle(r), crew(r))
      }
      _ => (0, 0),
    }
  }

  /// Enters `phase` and runs its pricing iterations, vehicles first.  Returns the number of
  /// vehicle and crew iterations done.
  fn run_round(&mut self, phase: Phase) -> Result<(usize, usize)> {
    self.advance(phase)?;
    let disrupt = matches!(phase, Phase::Disruption(_));
    let (vehicle_its, crew_its) = Coordinator::round_iterations(phase, self.cfg);
    for _ in 0..vehicle_its {
      self.vehicle_iteration(disrupt)?;
    }
    for _ in 0..crew_its {
      self.crew_iteration(disrupt)?;
    }
    Ok((vehicle_its, crew_its))
  }

  fn run_phases(&mut self, env: &Env) -> Result<Solution> {
    let cfg = self.cfg;
    self.advance(Phase::SubgradientWarmup)?;
    self.gradient_descent(true)?;

    for r in 0..cfg.vcsp_rounds {
      let _s = info_span!("round", r).entered();
      self.run_round(Phase::VehicleRound(r))?;
      self.run_round(Phase::CrewRound(r))?;
      info!(round = r, upper_bound = self.upper_bound, bound = ?self.last_bound, tasks = self.tasks.len(),
        duties = self.duties.len(), "round finished");
    }

    for d in 0..cfg.lagrange_disrupt_rounds {
      let _s = info_span!("disruption", d).entered();
      self.run_round(Phase::Disruption(d))?;
    }

    self.advance(Phase::FinalExactSolve)?;
    self.final_solve(env)
  }

  /// Runs every phase after bootstrap.  Any error moves the coordinator to [`Phase::Failed`].
  pub fn solve(&mut self, env: &Env) -> Result<Solution> {
    match self.run_phases(env) {
      Ok(solution) => {
        self.advance(Phase::Done)?;
        Ok(solution)
      }
      Err(e) => {
        error!(phase = %self.phase, err = %e, "integrated solve failed");
        if self.phase != Phase::Failed {
          self.advance(Phase::Failed)?;
        }
        Err(e)
      }
    }
  }

  /// Time spent per phase, in milliseconds.  Only available once the run has finished.
  pub fn into_timings(self) -> Vec<(String, u128)> {
    self.stopwatch.into_laps()
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::crew::{CrewElement, CrewElementKind, DutyType};
  use crate::test::*;

  pub(crate) fn coordinator<'a>(inst: &'a Instance, cfg: &'a Config) -> Coordinator<'a> {
    let cover = IntegralCover::trivial(inst, cfg).unwrap();
    Coordinator::new(inst, cfg, cover, test_output_dir()).unwrap()
  }

  #[test]
  fn phases_only_move_forward() {
    assert!(Phase::Bootstrap.can_advance_to(Phase::SubgradientWarmup));
    assert!(Phase::VehicleRound(0).can_advance_to(Phase::CrewRound(0)));
    assert!(Phase::CrewRound(0).can_advance_to(Phase::VehicleRound(1)));
    assert!(Phase::CrewRound(3).can_advance_to(Phase::Disruption(0)));
    assert!(Phase::Disruption(1).can_advance_to(Phase::FinalExactSolve));
    assert!(Phase::FinalExactSolve.can_advance_to(Phase::Done));
    assert!(!Phase::CrewRound(1).can_advance_to(Phase::VehicleRound(1)));
    assert!(!Phase::Disruption(0).can_advance_to(Phase::CrewRound(5)));
    assert!(!Phase::Done.can_advance_to(Phase::Bootstrap));
    assert!(!Phase::SubgradientWarmup.can_advance_to(Phase::SubgradientWarmup));
    assert!(Phase::VehicleRound(2).can_advance_to(Phase::Failed));

    let inst = line_instance(1, LineOptions::default());
    let cfg = test_config();
    let mut c = coordinator(&inst, &cfg);
    c.advance(Phase::SubgradientWarmup).unwrap();
    assert!(c.advance(Phase::Bootstrap).is_err());
    assert_eq!(c.phase(), Phase::SubgradientWarmup);
  }

  #[test]
  fn bootstrap_registers_all_blocks() {
    let inst = line_instance(3, LineOptions::default());
    let cfg = test_config();
    let c = coordinator(&inst, &cfg);
    assert_eq!(c.n_blocks(), 3);
    assert_eq!(c.n_tasks(), 3);
    assert_eq!(c.n_duties(), 3);
    assert_eq!(c.multipliers.blocks.len(), 3);
    assert!(c.tasks.iter().all(|t| t.is_unit && t.block_cover.len() == 1));
    let expected = c.tasks.iter().map(|t| t.cost).sum::<f64>() + c.duties.iter().map(|d| d.cost).sum::<f64>();
    assert!((c.upper_bound() - expected).abs() < 1e-9);
  }

  #[test]
  fn every_block_gets_a_single_duty() {
    let inst = line_instance(3, LineOptions { handover: false, ..LineOptions::default() });
    let cfg = test_config();
    let task = chained_task(&inst, &cfg);
    let mut blocks = Block::from_vehicle_task(&task, &inst);
    assert_eq!(blocks.len(), 1);
    blocks[0].index = 0;
    let d = blocks[0].descriptor;
    let element = CrewElement { kind: CrewElementKind::Block(0), start_loc: d.start_loc, end_loc: d.end_loc,
      start_time: d.start_time, end_time: d.end_time };
    let duty = CrewDuty::new(DutyType::Early, vec![element], &blocks, &inst, &cfg);
    let cover = IntegralCover { tasks: vec![task], task_selection: vec![(0, 1)], duties: vec![duty], duty_selection: vec![(0, 1)] };

    let c = Coordinator::new(&inst, &cfg, cover, test_output_dir()).unwrap();
    assert_eq!(c.n_blocks(), 1);
    assert_eq!(c.n_duties(), 2);
    assert_eq!(c.duty_rc.len(), 2);
    assert_eq!(c.selection.duties, vec![1, 0]);
    let single = &c.duties[1];
    assert_eq!(single.duty_type, DutyType::Single);
    assert!(!single.is_unit);
    assert_eq!(single.block_cover, [0].iter().copied().collect());
  }

  #[test]
  fn warm_start_follows_the_incumbent() {
    let inst = line_instance(2, LineOptions::default());
    let cfg = test_config();
    let mut cover = IntegralCover::trivial(&inst, &cfg).unwrap();
    cover.duty_selection = vec![(0, 2), (1, 1)];
    let mut c = Coordinator::new(&inst, &cfg, cover, test_output_dir()).unwrap();
    let (x, y) = c.warm_start();
    assert_eq!(x, vec![1.0, 1.0]);
    assert_eq!(y, vec![2.0, 1.0]);

    c.gradient_descent(true).unwrap();
    c.vehicle_iteration(false).unwrap();
    c.crew_iteration(false).unwrap();
    let (x, y) = c.warm_start();
    assert_eq!(x.len(), c.n_tasks());
    assert_eq!(y.len(), c.n_duties());
    assert_eq!(x.iter().sum::<f64>(), 2.0);
    assert_eq!(y.iter().sum::<f64>(), 3.0);
  }

  #[test]
  fn misindexed_cover_is_rejected() {
    let inst = line_instance(2, LineOptions::default());
    let cfg = test_config();
    let mut cover = IntegralCover::trivial(&inst, &cfg).unwrap();
    cover.tasks.swap(0, 1);
    assert!(Coordinator::new(&inst, &cfg, cover, test_output_dir()).is_err());
  }

  #[test]
  fn bound_is_exact_on_trivial_instance() {
    let inst = line_instance(2, LineOptions::default());
    let cfg = test_config();
    let mut c = coordinator(&inst, &cfg);
    let summary = c.gradient_descent(false).unwrap();
    assert!((summary.best_bound - c.upper_bound()).abs() < 1e-6,
      "bound {} vs upper bound {}", summary.best_bound, c.upper_bound());
    assert_eq!(c.last_bound(), Some(summary.best_bound));
  }

  #[test]
  fn best_bound_never_decreases() {
    let inst = line_instance(3, LineOptions::default());
    let mut cfg = test_config();
    cfg.lagrange_pi_start = 0.5;
    let mut c = coordinator(&inst, &cfg);
    let summary = c.gradient_descent(true).unwrap();
    assert!(summary.iterations > 0);
    assert!(summary.history.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(summary.history.last().copied(), Some(summary.best_bound));
  }

  #[test]
  fn disruption_keeps_a_valid_bound() {
    let inst = line_instance(3, LineOptions { handover: false, ..LineOptions::default() });
    let cfg = test_config();
    let optimum = chained_schedule_cost(&inst, &cfg);
    let mut c = coordinator(&inst, &cfg);
    c.gradient_descent(true).unwrap();
    for _ in 0..3 {
      let summary = c.vehicle_iteration(true).unwrap();
      assert!(summary.best_bound <= c.upper_bound() + 1e-6);
      assert!(summary.best_bound <= optimum + 1e-6, "bound {} above optimum {}", summary.best_bound, optimum);
      let summary = c.crew_iteration(true).unwrap();
      assert!(summary.best_bound <= c.upper_bound() + 1e-6);
      assert!(summary.best_bound <= optimum + 1e-6, "bound {} above optimum {}", summary.best_bound, optimum);
      assert_eq!(c.task_rc.len(), c.n_tasks());
      assert_eq!(c.selection.duties.len(), c.n_duties());
      assert_eq!(c.multipliers.blocks.len(), c.n_blocks());
    }
    assert!(c.last_bound().unwrap() <= optimum + 1e-6);
  }

  #[test]
  fn round_iteration_counts() {
    let mut cfg = test_config();
    cfg.vcsp_rounds = 2;
    cfg.vcsp_vh_its_init = 5;
    cfg.vcsp_vh_its_round = 3;
    cfg.vcsp_cr_its_init = 7;
    cfg.vcsp_cr_its_round = 4;
    assert_eq!(Coordinator::round_iterations(Phase::VehicleRound(0), &cfg), (5, 0));
    assert_eq!(Coordinator::round_iterations(Phase::CrewRound(0), &cfg), (0, 7));
    assert_eq!(Coordinator::round_iterations(Phase::VehicleRound(1), &cfg), (3, 0));
    assert_eq!(Coordinator::round_iterations(Phase::CrewRound(1), &cfg), (0, 4));
    assert_eq!(Coordinator::round_iterations(Phase::Disruption(0), &cfg), (3, 4));
    assert_eq!(Coordinator::round_iterations(Phase::Disruption(1), &cfg), (3, 4));
    assert_eq!(Coordinator::round_iterations(Phase::FinalExactSolve, &cfg), (0, 0));

    cfg.vcsp_rounds = 0;
    assert_eq!(Coordinator::round_iterations(Phase::Disruption(0), &cfg), (5, 7));
    assert_eq!(Coordinator::round_iterations(Phase::Disruption(1), &cfg), (3, 4));
  }

  #[test]
  fn disruption_round_runs_both_sides() {
    let inst = line_instance(3, LineOptions::default());
    let mut cfg = test_config();
    cfg.vcsp_vh_its_round = 2;
    cfg.vcsp_cr_its_round = 3;
    let mut c = coordinator(&inst, &cfg);
    c.advance(Phase::SubgradientWarmup).unwrap();
    c.gradient_descent(true).unwrap();
    assert_eq!(c.run_round(Phase::Disruption(0)).unwrap(), (2, 3));
    assert_eq!(c.phase(), Phase::Disruption(0));
    assert!(c.last_bound().unwrap() <= c.upper_bound() + 1e-6);
  }

  #[test]
  fn pricing_rounds_keep_pools_aligned() {
    let inst = line_instance(3, LineOptions::default());
    let cfg = test_config();
    let mut c = coordinator(&inst, &cfg);
    c.gradient_descent(true).unwrap();
    let tasks_before = c.n_tasks();
    c.vehicle_iteration(false).unwrap();
    assert!(c.n_tasks() >= tasks_before);
    assert_eq!(c.task_rc.len(), c.n_tasks());
    assert_eq!(c.selection.tasks.len(), c.n_tasks());
    for (i, t) in c.tasks.iter().enumerate() {
      assert_eq!(t.index, i);
      assert_eq!(t.block_cover.len(), t.blocks.len());
    }
  }
}
