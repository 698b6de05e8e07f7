//! Restricted master / pricing loop, shared by the vehicle and crew sides.
//!
//! The loop itself knows nothing about vehicles or crews: a [`Side`] supplies the master rows, the
//! coefficients of a column and the dual snapshot handed to the oracles.
pub mod crew;
pub mod vehicle;

use crate::block::Block;
use crate::config::Config;
use crate::constants::EPS;
use crate::crew::CrewDuty;
use crate::instance::Instance;
use crate::model::{self, GurobiInfo};
use crate::pool::{Column, ColumnPool, Registration};
use crate::pricing::{crew_portfolio, vehicle_portfolio, Portfolio};
use crate::vehicle::VehicleTask;
use crate::Result;
use anyhow::bail;
use grb::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, info_span};

pub use self::crew::CrewSide;
pub use self::vehicle::VehicleSide;

pub trait Side {
  type Column: Column + Send;
  type Duals: Sync;

  const NAME: &'static str;

  /// Type of the column variables in the final integral solve.
  const INTEGRAL_TYPE: VarType;

  fn max_iterations(&self) -> usize;

  /// Consecutive non-improving iterations after which the loop stops.
  fn non_improving_limit(&self) -> usize;

  fn time_limit(&self) -> f64;

  /// Adds the master rows.  `vars` are the variables of `columns`, already in the model.
  fn add_rows(&mut self, model: &mut Model, columns: &[Self::Column], vars: &[Var]) -> Result<()>;

  fn coefficients(&self, column: &Self::Column) -> Vec<(Constr, f64)>;

  fn duals(&self, model: &Model) -> Result<Self::Duals>;

  /// Called once before the column variables are made integral.
  fn before_integral_solve(&mut self, _model: &mut Model) -> Result<()> { Ok(()) }

  /// Logs how well the integral selection covers the rows.
  fn report_cover(&self, columns: &[Self::Column], selection: &[(usize, u32)]);
}

#[derive(Debug, Default, Copy, Clone)]
pub struct MergeCounts {
  pub inserted: usize,
  pub replaced: usize,
  pub discarded: usize,
}

impl MergeCounts {
  pub fn changed(&self) -> usize {
    self.inserted + self.replaced
  }
}

/// Counts consecutive master solves that fail to improve on the best objective seen.
#[derive(Debug, Clone)]
pub struct Stagnation {
  best: f64,
  non_improving: usize,
  limit: usize,
}

impl Stagnation {
  pub fn new(limit: usize) -> Self {
    Stagnation { best: f64::INFINITY, non_improving: 0, limit }
  }

  pub fn best(&self) -> f64 { self.best }

  /// Records a master objective.  Returns `true` once more than `limit` consecutive solves
  /// have not improved.
  pub fn observe(&mut self, obj: f64) -> bool {
    if obj < self.best - EPS {
      self.best = obj;
      self.non_improving = 0;
      false
    } else {
      self.non_improving += 1;
      self.non_improving > self.limit
    }
  }
}

pub struct Outcome<C: Column> {
  pub pool: ColumnPool<C>,
  /// Selected columns with multiplicity
  pub selection: Vec<(usize, u32)>,
  pub lp_bound: f64,
  pub iterations: usize,
  pub info: GurobiInfo,
}

impl<C: Column> Outcome<C> {
  pub fn selected(&self) -> impl Iterator<Item=(&C, u32)> + '_ {
    self.selection.iter().map(move |&(i, n)| (&self.pool[i], n))
  }
}

pub struct ColumnGeneration<'a, S: Side> {
  side: S,
  cfg: &'a Config,
  model: Model,
  pool: ColumnPool<S::Column>,
  vars: Vec<Var>,
  portfolio: Portfolio<'a, S::Duals, S::Column>,
  output_dir: PathBuf,
}

fn var_name(side: &str, i: usize) -> String {
  format!("{}[{}]", side, i)
}

impl<'a, S: Side> ColumnGeneration<'a, S> {
  /// Builds the master over `columns`, whose indices must match their positions.
  pub fn new(
    env: &Env,
    mut side: S,
    columns: Vec<S::Column>,
    portfolio: Portfolio<'a, S::Duals, S::Column>,
    cfg: &'a Config,
    output_dir: &Path,
  ) -> Result<Self> {
    let pool = ColumnPool::from_existing(columns)?;
    let mut model = Model::with_env(S::NAME, env)?;
    let mut vars = Vec::with_capacity(pool.len());
    for c in pool.iter() {
      vars.push(model.add_var(&var_name(S::NAME, c.index()), Continuous, c.cost(), 0.0, INFINITY, std::iter::empty())?);
    }
    side.add_rows(&mut model, pool.as_slice(), &vars)?;
    model.update()?;
    Ok(ColumnGeneration { side, cfg, model, pool, vars, portfolio, output_dir: output_dir.to_path_buf() })
  }

  pub fn merge(&mut self, columns: Vec<(f64, S::Column)>) -> Result<MergeCounts> {
    let mut counts = MergeCounts::default();
    for (_, column) in columns {
      match self.pool.register_or_update(column) {
        Registration::Inserted(i) => {
          let c = &self.pool[i];
          let coeffs = self.side.coefficients(c);
          let var = self.model.add_var(&var_name(S::NAME, i), Continuous, c.cost(), 0.0, INFINITY, coeffs)?;
          self.vars.push(var);
          counts.inserted += 1;
        }
        Registration::Replaced(i) => {
          let c = &self.pool[i];
          let var = self.vars[i];
          self.model.set_obj_attr(attr::Obj, &var, c.cost())?;
          for (constr, val) in self.side.coefficients(c) {
            self.model.set_coeff(&var, &constr, val)?;
          }
          counts.replaced += 1;
        }
        Registration::RejectedDuplicate(_) => counts.discarded += 1,
      }
    }
    Ok(counts)
  }

  fn generate(&mut self) -> Result<(f64, usize)> {
    let max_its = self.side.max_iterations();
    let progress_every = (max_its / 10).max(1);
    let mut stagnation = Stagnation::new(self.side.non_improving_limit());
    let mut iterations = 0;

    while iterations < max_its {
      let obj = match model::solve_lp(&mut self.model, S::NAME, &self.output_dir)? {
        Some(obj) => obj,
        None => bail!("{} relaxation is infeasible", S::NAME),
      };
      if iterations == 0 {
        self.model.set_param(param::Presolve, 0)?;
      }
      iterations += 1;

      if stagnation.observe(obj) {
        info!(iterations, obj, "no improvement, stopping");
        break;
      }

      let duals = self.side.duals(&self.model)?;
      let round = self.portfolio.run(&duals)?;
      let strategy = self.portfolio.strategy_name(round.strategy).to_string();
      let counts = self.merge(round.columns)?;

      if iterations % progress_every == 0 {
        info!(iterations, obj, pool = self.pool.len(), new = counts.inserted, improved = counts.replaced,
          discarded = counts.discarded, %strategy, "column generation");
      } else {
        debug!(iterations, obj, pool = self.pool.len(), new = counts.inserted, improved = counts.replaced,
          discarded = counts.discarded, %strategy, "column generation");
      }
    }
    Ok((stagnation.best(), iterations))
  }

  /// Runs the pricing loop, then solves the master once more with integral columns.
  pub fn run(mut self) -> Result<Outcome<S::Column>> {
    let _s = info_span!("colgen", side = S::NAME).entered();
    let (lp_bound, iterations) = self.generate()?;

    self.side.before_integral_solve(&mut self.model)?;
    self.model.set_obj_attr_batch(attr::VType, self.vars.iter().map(|&v| (v, S::INTEGRAL_TYPE)))?;
    model::set_upper_bound_params(&mut self.model, self.side.time_limit())?;
    let info = model::solve_mip(&mut self.model, S::NAME, self.side.time_limit(), self.cfg, &self.output_dir)?;

    let values = self.model.get_obj_attr_batch(attr::X, self.vars.iter().copied())?;
    let selection: Vec<(usize, u32)> = values.into_iter()
      .enumerate()
      .filter(|(_, v)| *v > 0.5)
      .map(|(i, v)| (i, v.round() as u32))
      .collect();

    self.pool.clear_units();
    for &(i, _) in &selection {
      self.pool.set_unit(i, true);
    }
    self.side.report_cover(self.pool.as_slice(), &selection);
    for (s, n) in self.portfolio.generated.iter().enumerate() {
      info!(strategy = self.portfolio.strategy_name(s), columns = n, "pricing summary");
    }
    info!(lp_bound, iterations, selected = selection.len(), pool = self.pool.len(), objective = info.objective, "column generation finished");

    Ok(Outcome { pool: self.pool, selection, lp_bound, iterations, info })
  }
}

/// Vehicle column generation from the one-task-per-trip cover.
pub fn solve_vehicles(env: &Env, inst: &Instance, cfg: &Config, output_dir: &Path) -> Result<Outcome<VehicleTask>> {
  let columns = VehicleTask::trivial_cover(inst, cfg)?;
  let portfolio = vehicle_portfolio(inst, cfg, cfg.seed)?;
  ColumnGeneration::new(env, VehicleSide::new(inst, cfg), columns, portfolio, cfg, output_dir)?.run()
}

/// Crew column generation over `blocks`, each driven the given number of times, starting from
/// one single duty per block.
pub fn solve_crew(env: &Env, inst: &Instance, cfg: &Config, blocks: Vec<(Block, u32)>, output_dir: &Path) -> Result<Outcome<CrewDuty>> {
  let side = CrewSide::new(cfg, blocks);
  let columns = CrewDuty::trivial_cover(side.blocks(), inst, cfg);
  let portfolio = crew_portfolio(inst, cfg, cfg.seed.wrapping_add(1))?;
  ColumnGeneration::new(env, side, columns, portfolio, cfg, output_dir)?.run()
}

pub struct Sequential {
  pub vehicles: Outcome<VehicleTask>,
  /// Blocks of the selected tasks with the number of tasks driving each
  pub blocks: Vec<(Block, u32)>,
  pub crew: Outcome<CrewDuty>,
}

/// Vehicle schedule first, then crew over the blocks it drives.
pub fn sequential(env: &Env, inst: &Instance, cfg: &Config, output_dir: &Path) -> Result<Sequential> {
  let vehicles = solve_vehicles(env, inst, cfg, output_dir)?;
  let mut tasks = Vec::new();
  for (task, n) in vehicles.selected() {
    for _ in 0..n {
      tasks.push(task);
    }
  }
  let blocks = Block::from_vehicle_tasks(tasks, inst);
  info!(blocks = blocks.len(), "crew scheduling over vehicle blocks");
  let crew = solve_crew(env, inst, cfg, blocks.clone(), output_dir)?;
  Ok(Sequential { vehicles, blocks, crew })
}
