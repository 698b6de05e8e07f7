//! The contract between the master problems and the column generators.
//!
//! An oracle owns all of its search state.  Each round it receives an immutable dual snapshot,
//! searches on whatever worker thread rayon hands it, and returns candidate columns with their
//! reduced costs.  The caller merges the candidates after every instance has finished.
pub mod crew;
pub mod local_search;
pub mod vehicle;

use crate::block::{Block, Descriptor, DescriptorHalf};
use crate::config::Config;
use crate::crew::CrewDuty;
use crate::instance::Instance;
use crate::vehicle::VehicleTask;
use crate::{Map, Result};
use anyhow::Context;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, trace};

pub use self::crew::CrewLabeling;
pub use self::local_search::CrewLocalSearch;
pub use self::vehicle::VehicleLabeling;

pub trait PricingOracle: Send {
  type Duals: Sync;
  type Column: Send;

  fn name(&self) -> &str;

  fn update_dual_costs(&mut self, duals: &Self::Duals);

  /// Candidate columns paired with their reduced cost under the last dual snapshot.
  fn generate_columns(&mut self) -> Result<Vec<(f64, Self::Column)>>;
}

/// Dual prices seen by vehicle oracles.
#[derive(Debug, Clone, Default)]
pub struct VehicleDuals {
  pub trips: Vec<f64>,
  pub blocks: Map<Descriptor, f64>,
  /// Block duals grouped by where and when the block starts
  pub blocks_by_start: Map<DescriptorHalf, Vec<f64>>,
  pub max_vehicles: f64,
  pub scale: f64,
}

impl VehicleDuals {
  pub fn new(trips: Vec<f64>, blocks: Map<Descriptor, f64>, max_vehicles: f64) -> Self {
    let mut blocks_by_start: Map<_, Vec<f64>> = Map::default();
    for (d, &v) in &blocks {
      blocks_by_start.entry(d.start()).or_default().push(v);
    }
    VehicleDuals { trips, blocks, blocks_by_start, max_vehicles, scale: 1.0 }
  }

  pub fn block_dual(&self, d: &Descriptor) -> f64 {
    self.blocks.get(d).copied().unwrap_or(0.0)
  }

  /// Largest dual of a block starting at `half`, zero if there is none or all are negative.
  pub fn best_block_start(&self, half: &DescriptorHalf) -> f64 {
    self.blocks_by_start.get(half)
      .map_or(0.0, |v| v.iter().copied().fold(0.0, f64::max))
  }

  pub fn reduced_cost(&self, task: &VehicleTask) -> f64 {
    let trips: f64 = task.trips().map(|t| self.trips[t]).sum();
    let blocks: f64 = task.blocks.iter().map(|d| self.block_dual(d)).sum();
    task.cost - self.scale * (trips + blocks + self.max_vehicles)
  }
}

/// Dual prices seen by crew oracles, together with the blocks they price.
#[derive(Debug, Clone)]
pub struct CrewDuals {
  pub blocks: Arc<Vec<Block>>,
  /// Indexed like `blocks`
  pub block_duals: Vec<f64>,
  /// Number of vehicles driving each block
  pub block_counts: Vec<u32>,
  pub max_duties: f64,
  /// Prices of the regulation rows, charged per unit of a duty's regulation term
  pub avg_length: f64,
  pub long_duties: f64,
  pub broken_duties: f64,
  pub between_duties: f64,
  pub scale: f64,
}

impl CrewDuals {
  pub fn new(blocks: Arc<Vec<Block>>, block_duals: Vec<f64>) -> Self {
    debug_assert_eq!(blocks.len(), block_duals.len());
    let block_counts = vec![1; blocks.len()];
    CrewDuals {
      blocks,
      block_duals,
      block_counts,
      max_duties: 0.0,
      avg_length: 0.0,
      long_duties: 0.0,
      broken_duties: 0.0,
      between_duties: 0.0,
      scale: 1.0,
    }
  }

  pub fn reduced_cost(&self, duty: &CrewDuty) -> f64 {
    let blocks: f64 = duty.block_cover.iter().map(|b| self.block_duals[b]).sum();
    let t = duty.regulation_terms();
    let regulation = self.avg_length * t.avg_length
      + self.long_duties * t.long
      + self.broken_duties * t.broken
      + self.between_duties * t.between;
    duty.cost - self.scale * (blocks + self.max_duties) + self.scale * regulation
  }
}

pub type BoxedOracle<'a, D, C> = Box<dyn PricingOracle<Duals=D, Column=C> + 'a>;

/// A named group of oracle instances which always run together.
pub struct Strategy<'a, D, C> {
  pub name: String,
  pub weight: f64,
  pub instances: Vec<BoxedOracle<'a, D, C>>,
}

pub struct PricingRound<C> {
  pub strategy: usize,
  pub columns: Vec<(f64, C)>,
}

/// Weighted choice between strategies.  Every call to [`Portfolio::run`] draws one strategy and
/// runs all of its instances in parallel.
pub struct Portfolio<'a, D, C> {
  strategies: Vec<Strategy<'a, D, C>>,
  dist: WeightedIndex<f64>,
  rng: SmallRng,
  /// Columns returned per strategy
  pub generated: Vec<usize>,
}

impl<'a, D: Sync, C: Send> Portfolio<'a, D, C> {
  pub fn new(strategies: Vec<Strategy<'a, D, C>>, seed: u64) -> Result<Self> {
    let dist = WeightedIndex::new(strategies.iter().map(|s| s.weight))
      .context("pricing strategies need non-negative weights, not all zero")?;
    let generated = vec![0; strategies.len()];
    Ok(Portfolio { strategies, dist, rng: SmallRng::seed_from_u64(seed), generated })
  }

  pub fn strategy_name(&self, i: usize) -> &str {
    &self.strategies[i].name
  }

  pub fn run(&mut self, duals: &D) -> Result<PricingRound<C>> {
    let s = self.dist.sample(&mut self.rng);
    let strategy = &mut self.strategies[s];
    debug!(strategy = %strategy.name, instances = strategy.instances.len(), "pricing");

    let results: Vec<Result<Vec<(f64, C)>>> = strategy.instances
      .par_iter_mut()
      .map(|oracle| {
        trace!(oracle = oracle.name(), "running oracle");
        oracle.update_dual_costs(duals);
        oracle.generate_columns()
      })
      .collect();

    let mut columns = Vec::new();
    for r in results {
      columns.extend(r?);
    }
    trace!(count = columns.len(), "oracle columns");
    self.generated[s] += columns.len();
    Ok(PricingRound { strategy: s, columns })
  }
}

pub fn vehicle_portfolio<'a>(inst: &'a Instance, cfg: &'a Config, seed: u64) -> Result<Portfolio<'a, VehicleDuals, VehicleTask>> {
  let instances = (0..cfg.vsp_instances_per_it)
    .map(|i| Box::new(VehicleLabeling::new(inst, cfg, i)) as BoxedOracle<'a, _, _>)
    .collect();
  let labeling = Strategy { name: "labeling".to_string(), weight: cfg.vsp_lb_weight, instances };
  Portfolio::new(vec![labeling], seed)
}

pub fn crew_portfolio<'a>(inst: &'a Instance, cfg: &'a Config, seed: u64) -> Result<Portfolio<'a, CrewDuals, CrewDuty>> {
  let instances = (0..cfg.csp_instances_per_it)
    .map(|i| Box::new(CrewLabeling::new(inst, cfg, i)) as BoxedOracle<'a, _, _>)
    .collect();
  let labeling = Strategy { name: "labeling".to_string(), weight: cfg.csp_lb_weight, instances };
  let instances = (0..cfg.csp_instances_per_it)
    .map(|i| Box::new(CrewLocalSearch::new(inst, cfg, i, seed)) as BoxedOracle<'a, _, _>)
    .collect();
  let local_search = Strategy { name: "local-search".to_string(), weight: cfg.csp_ls_global_weight, instances };
  Portfolio::new(vec![labeling, local_search], seed)
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Fixed {
    name: String,
    shift: f64,
    values: Vec<f64>,
  }

  impl PricingOracle for Fixed {
    type Duals = f64;
    type Column = f64;

    fn name(&self) -> &str { &self.name }

    fn update_dual_costs(&mut self, duals: &f64) {
      self.shift = *duals;
    }

    fn generate_columns(&mut self) -> Result<Vec<(f64, f64)>> {
      Ok(self.values.iter().map(|&v| (v - self.shift, v)).collect())
    }
  }

  fn fixed(values: Vec<f64>) -> BoxedOracle<'static, f64, f64> {
    Box::new(Fixed { name: "fixed".into(), shift: 0.0, values })
  }

  #[test]
  fn all_instances_run_on_the_same_duals() {
    let strategies = vec![
      Strategy { name: "never".into(), weight: 0.0, instances: vec![fixed(vec![100.0])] },
      Strategy { name: "always".into(), weight: 1.0, instances: vec![fixed(vec![1.0, 2.0]), fixed(vec![3.0])] },
    ];
    let mut p = Portfolio::new(strategies, 0).unwrap();
    for _ in 0..5 {
      let round = p.run(&1.0).unwrap();
      assert_eq!(round.strategy, 1);
      let mut rc: Vec<_> = round.columns.iter().map(|(rc, _)| *rc).collect();
      rc.sort_by(|a, b| a.partial_cmp(b).unwrap());
      assert_eq!(rc, vec![0.0, 1.0, 2.0]);
    }
    assert_eq!(p.generated, vec![0, 15]);
    assert_eq!(p.strategy_name(1), "always");
  }

  #[test]
  fn crew_portfolio_offers_local_search() {
    let inst = crate::test::line_instance(2, crate::test::LineOptions::default());
    let mut cfg = crate::test::test_config();
    cfg.csp_lb_weight = 0.0;
    let p = crew_portfolio(&inst, &cfg, 0).unwrap();
    assert_eq!(p.strategies.len(), 2);
    assert_eq!(p.strategy_name(0), "labeling");
    assert_eq!(p.strategy_name(1), "local-search");

    drop(p);
    cfg.csp_ls_global_weight = 0.0;
    assert!(crew_portfolio(&inst, &cfg, 0).is_err());
  }

  #[test]
  fn zero_weights_rejected() {
    let strategies = vec![Strategy { name: "never".into(), weight: 0.0, instances: vec![fixed(vec![])] }];
    assert!(Portfolio::new(strategies, 0).is_err());
  }
}
