//! The Lagrangian subproblem and the subgradient method over it.
//!
//! Relaxing trip cover, vehicle/crew linking and the crew regulations leaves a problem which
//! decomposes into independent column choices: every task and every copy of a duty is taken
//! iff its reduced cost is negative, subject to the fleet and duty ceilings.
use super::multipliers::{Multipliers, Subgradient};
use super::Coordinator;
use crate::config::Config;
use crate::constants::EPS;
use crate::crew::CrewDuty;
use crate::vehicle::VehicleTask;
use crate::Result;
use rayon::prelude::*;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, info, trace};

/// Smallest number of columns priced by one rayon job.
const MIN_CHUNK: usize = 256;

pub fn task_reduced_cost(task: &VehicleTask, m: &Multipliers) -> f64 {
  let trips: f64 = task.trips().map(|t| m.trips[t]).sum();
  let blocks: f64 = task.block_cover.iter().map(|b| m.blocks[b]).sum();
  task.cost - trips - blocks
}

pub fn duty_reduced_cost(duty: &CrewDuty, m: &Multipliers) -> f64 {
  let blocks: f64 = duty.block_cover.iter().map(|b| m.blocks[b]).sum();
  duty.cost + blocks + m.regulation_price(&duty.regulation_terms())
}

pub fn task_reduced_costs(tasks: &[VehicleTask], m: &Multipliers) -> Vec<f64> {
  tasks.par_iter().with_min_len(MIN_CHUNK).map(|t| task_reduced_cost(t, m)).collect()
}

pub fn duty_reduced_costs(duties: &[CrewDuty], m: &Multipliers) -> Vec<f64> {
  duties.par_iter().with_min_len(MIN_CHUNK).map(|d| duty_reduced_cost(d, m)).collect()
}

/// Solution of the Lagrangian subproblem.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
  /// Indexed like the task pool
  pub tasks: Vec<bool>,
  /// Copies of each duty, indexed like the duty pool
  pub duties: Vec<u32>,
  /// Lagrangian function value, a lower bound
  pub value: f64,
}

impl Selection {
  pub fn empty(n_tasks: usize, n_duties: usize) -> Self {
    Selection { tasks: vec![false; n_tasks], duties: vec![0; n_duties], value: f64::NEG_INFINITY }
  }

  pub fn n_tasks(&self) -> usize {
    self.tasks.iter().filter(|&&x| x).count()
  }

  pub fn n_duties(&self) -> u32 {
    self.duties.iter().sum()
  }
}

fn ascending(values: &[f64]) -> Vec<usize> {
  let mut order: Vec<usize> = (0..values.len()).collect();
  order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap_or(Ordering::Equal));
  order
}

/// How many selected tasks drive each block.
pub fn block_coverage(tasks: &[VehicleTask], selected: &[bool], n_blocks: usize) -> Vec<u32> {
  let mut cov = vec![0; n_blocks];
  for (task, _) in tasks.iter().zip(selected).filter(|&(_, &x)| x) {
    for b in task.block_cover.iter() {
      cov[b] += 1;
    }
  }
  cov
}

/// Upper bound on the copies of each duty: the largest number of selected tasks driving one of
/// its blocks, and at least one.
pub fn duty_bounds(duties: &[CrewDuty], coverage: &[u32]) -> Vec<u32> {
  duties.iter()
    .map(|d| d.block_cover.iter().map(|b| coverage[b]).max().unwrap_or(0).max(1))
    .collect()
}

/// Closed-form solution of the subproblem.  Columns are taken cheapest first while they have
/// negative reduced cost; past the fleet (duty) ceiling a column must also pay the overage cost,
/// and only if slack is allowed.
pub fn solve_subproblem(
  tasks: &[VehicleTask],
  duties: &[CrewDuty],
  task_rc: &[f64],
  duty_rc: &[f64],
  m: &Multipliers,
  n_blocks: usize,
  cfg: &Config,
) -> Selection {
  let mut value: f64 = m.trips.iter().sum();

  let mut x = vec![false; tasks.len()];
  let mut count = 0;
  for i in ascending(task_rc) {
    let rc = task_rc[i];
    if count < cfg.max_vehicles && rc < 0.0 {
      value += rc;
    } else if cfg.vcsp_vh_cstr_slack && rc + cfg.vh_over_max_cost < 0.0 {
      value += rc + cfg.vh_over_max_cost;
    } else {
      break;
    }
    x[i] = true;
    count += 1;
  }

  let bounds = duty_bounds(duties, &block_coverage(tasks, &x, n_blocks));
  let mut y = vec![0; duties.len()];
  let mut count = 0;
  'duties: for j in ascending(duty_rc) {
    let rc = duty_rc[j];
    for _ in 0..bounds[j] {
      if count < cfg.max_duties && rc < 0.0 {
        value += rc;
      } else if cfg.vcsp_cr_max_cstr_slack && rc + cfg.cr_over_max_cost < 0.0 {
        value += rc + cfg.cr_over_max_cost;
      } else {
        break 'duties;
      }
      y[j] += 1;
      count += 1;
    }
  }

  Selection { tasks: x, duties: y, value }
}

/// Violation of each relaxed row under `sel`.  Components of non-negative multipliers sitting at
/// zero are clamped so a step cannot push them negative.
pub fn subgradient(tasks: &[VehicleTask], duties: &[CrewDuty], sel: &Selection, m: &Multipliers) -> Subgradient {
  let mut trips = vec![1.0; m.trips.len()];
  let mut blocks = vec![0.0; m.blocks.len()];
  for (task, _) in tasks.iter().zip(&sel.tasks).filter(|&(_, &x)| x) {
    for t in task.trips() {
      trips[t] -= 1.0;
    }
    for b in task.block_cover.iter() {
      blocks[b] -= 1.0;
    }
  }

  let (mut avg_length, mut long, mut broken, mut between) = (0.0, 0.0, 0.0, 0.0);
  for (duty, &n) in duties.iter().zip(&sel.duties).filter(|&(_, &n)| n > 0) {
    let n = n as f64;
    for b in duty.block_cover.iter() {
      blocks[b] += n;
    }
    let t = duty.regulation_terms();
    avg_length += n * t.avg_length;
    long += n * t.long;
    broken += n * t.broken;
    between += n * t.between;
  }

  let clamp = |g: f64, m: f64| if m <= 0.0 && g < 0.0 { 0.0 } else { g };
  for (g, &m) in trips.iter_mut().zip(&m.trips) {
    *g = clamp(*g, m);
  }
  Subgradient {
    trips,
    blocks,
    avg_length: clamp(avg_length, m.avg_length),
    long: clamp(long, m.long),
    broken: clamp(broken, m.broken),
    between: clamp(between, m.between),
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct GradientSummary {
  pub best_bound: f64,
  pub iterations: usize,
  /// Best bound after each iteration
  pub history: Vec<f64>,
}

impl<'a> Coordinator<'a> {
  /// Recomputes every reduced cost on the rayon pool.
  pub(super) fn update_reduced_costs(&mut self) {
    let (tasks, duties, multipliers) = (self.tasks.as_slice(), self.duties.as_slice(), &self.multipliers);
    let (task_rc, duty_rc) = rayon::join(
      || task_reduced_costs(tasks, multipliers),
      || duty_reduced_costs(duties, multipliers),
    );
    self.task_rc = task_rc;
    self.duty_rc = duty_rc;
  }

  pub(super) fn solve_subproblem(&self) -> Selection {
    solve_subproblem(
      self.tasks.as_slice(),
      self.duties.as_slice(),
      &self.task_rc,
      &self.duty_rc,
      &self.multipliers,
      self.blocks.len(),
      self.cfg,
    )
  }

  /// True if the bound of the last descent can seed the next one.
  fn last_bound_is_valid(&self) -> bool {
    matches!(self.last_bound, Some(z) if z.is_finite() && z >= 0.0 && z <= self.upper_bound + EPS)
  }

  /// Subgradient ascent on the Lagrangian function, ending at the best multipliers found.
  ///
  /// With `allow_discard`, the pools are then shrunk to their configured sizes, keeping unit
  /// columns and the columns of the final selection.
  pub fn gradient_descent(&mut self, allow_discard: bool) -> Result<GradientSummary> {
    let cfg = self.cfg;
    let ub = self.upper_bound;
    if !self.last_bound_is_valid() {
      debug!(last_bound = ?self.last_bound, ub, "resetting multipliers");
      self.multipliers.reset();
    }

    let mut pi = cfg.lagrange_pi_start;
    let mut best: Option<f64> = None;
    let mut best_multipliers = self.multipliers.clone();
    let mut non_improving = 0;
    let mut history = Vec::new();

    while pi >= cfg.lagrange_pi_end {
      self.update_reduced_costs();
      let sel = self.solve_subproblem();
      let z = sel.value;

      match best {
        Some(b) if z <= b + EPS * b.abs().max(1.0) => {
          non_improving += 1;
          if non_improving >= cfg.lagrange_n {
            pi *= cfg.lagrange_pi_cooling;
            non_improving = 0;
            trace!(pi, "cooling");
          }
        }
        _ => {
          best = Some(z);
          best_multipliers = self.multipliers.clone();
          non_improving = 0;
        }
      }
      history.push(best.unwrap_or(z));

      let g = subgradient(self.tasks.as_slice(), self.duties.as_slice(), &sel, &self.multipliers);
      let norm_sq = g.norm_sq();
      let gap = ub - z;
      trace!(z, gap, norm_sq, pi, "subgradient iteration");
      if norm_sq <= 0.0 || gap <= EPS {
        break;
      }
      self.multipliers.step(&g, pi * gap / norm_sq);
      self.multipliers.project();
    }

    self.multipliers = best_multipliers;
    self.update_reduced_costs();
    self.selection = self.solve_subproblem();
    let best_bound = best.unwrap_or(self.selection.value);
    self.last_bound = Some(best_bound);

    if allow_discard {
      self.evict()?;
    }

    info!(
      bound = best_bound,
      ub,
      iterations = history.len(),
      vehicles = self.selection.n_tasks(),
      duties = self.selection.n_duties(),
      tasks = self.tasks.len(),
      duty_pool = self.duties.len(),
      "gradient descent"
    );
    Ok(GradientSummary { best_bound, iterations: history.len(), history })
  }

  /// Shrinks both pools, remapping every index-aligned vector.
  fn evict(&mut self) -> Result<()> {
    let protected: Vec<bool> = self.selection.tasks.iter().zip(&self.incumbent.tasks).map(|(&a, &b)| a || b).collect();
    if let Some(remap) = self.tasks.evict_worst(self.cfg.vcsp_max_tasks_during, &self.task_rc, &protected) {
      debug!(removed = remap.removed(), size = remap.len_after(), "evicted tasks");
      self.task_rc = remap.apply(std::mem::take(&mut self.task_rc));
      self.selection.tasks = remap.apply(std::mem::take(&mut self.selection.tasks));
      self.incumbent.tasks = remap.apply(std::mem::take(&mut self.incumbent.tasks));
    }
    let protected: Vec<bool> = self.selection.duties.iter().zip(&self.incumbent.duties).map(|(&a, &b)| a + b > 0).collect();
    if let Some(remap) = self.duties.evict_worst(self.cfg.vcsp_max_duties_during, &self.duty_rc, &protected) {
      debug!(removed = remap.removed(), size = remap.len_after(), "evicted duties");
      self.duty_rc = remap.apply(std::mem::take(&mut self.duty_rc));
      self.selection.duties = remap.apply(std::mem::take(&mut self.selection.duties));
      self.incumbent.duties = remap.apply(std::mem::take(&mut self.incumbent.duties));
    }
    anyhow::ensure!(self.task_rc.len() == self.tasks.len() && self.duty_rc.len() == self.duties.len(),
      "reduced costs out of step with the pools");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::Block;
  use crate::test::*;

  #[test]
  fn subproblem_respects_fleet_ceiling() {
    let inst = line_instance(3, LineOptions::default());
    let mut cfg = test_config();
    cfg.max_vehicles = 2;
    cfg.vcsp_vh_cstr_slack = false;
    let tasks = VehicleTask::trivial_cover(&inst, &cfg).unwrap();
    let m = Multipliers::zeros(3, 0);
    let sel = solve_subproblem(&tasks, &[], &[-3.0, -1.0, -2.0], &[], &m, 0, &cfg);
    assert_eq!(sel.tasks, vec![true, false, true]);
    assert_eq!(sel.value, -5.0);

    cfg.vcsp_vh_cstr_slack = true;
    cfg.vh_over_max_cost = 0.5;
    let sel = solve_subproblem(&tasks, &[], &[-3.0, -1.0, -2.0], &[], &m, 0, &cfg);
    assert_eq!(sel.tasks, vec![true, true, true]);
    assert_eq!(sel.value, -5.5);
  }

  #[test]
  fn duty_copies_follow_vehicle_coverage() {
    let inst = line_instance(1, LineOptions::default());
    let cfg = test_config();
    let mut a = VehicleTask::unit(0, &inst, &cfg).unwrap();
    let mut b = a.clone();
    let blocks: Vec<Block> = Block::from_vehicle_tasks(vec![&a, &b], &inst).into_iter().map(|(b, _)| b).collect();
    a.block_cover = std::iter::once(0).collect();
    b.block_cover = std::iter::once(0).collect();
    let duty = CrewDuty::single(&blocks[0], &blocks, &inst, &cfg);
    let tasks = vec![a, b];
    let duties = vec![duty];

    let m = Multipliers::zeros(1, 1);
    let sel = solve_subproblem(&tasks, &duties, &[-1.0, -1.0], &[-4.0], &m, 1, &cfg);
    assert_eq!(sel.duties, vec![2]);
    assert_eq!(sel.value, -10.0);

    let g = subgradient(&tasks, &duties, &sel, &m);
    assert_eq!(g.trips, vec![0.0]);
    assert_eq!(g.blocks, vec![0.0]);
    // single duties are short, so every regulation term is negative and clamped
    assert_eq!((g.avg_length, g.long, g.broken, g.between), (0.0, 0.0, 0.0, 0.0));
  }

  #[test]
  fn uncovered_trips_push_multipliers_up() {
    let inst = line_instance(2, LineOptions::default());
    let cfg = test_config();
    let tasks = VehicleTask::trivial_cover(&inst, &cfg).unwrap();
    let m = Multipliers::zeros(2, 0);
    let sel = Selection { tasks: vec![true, false], duties: vec![], value: 0.0 };
    let g = subgradient(&tasks, &[], &sel, &m);
    assert_eq!(g.trips, vec![0.0, 1.0]);
  }
}
