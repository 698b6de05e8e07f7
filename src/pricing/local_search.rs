//! Crew oracle by simulated annealing over a partition of the driven blocks into duties.
//!
//! The search starts from one duty per block and moves blocks between duties.  A move which
//! would leave some duty unworkable is rejected outright, so every duty of the working partition
//! can be turned into a column.  The value of a partition is the sum of its duties' reduced costs.
use super::crew::{build_duty, classify_gap, Gap};
use super::{CrewDuals, PricingOracle};
use crate::block::Block;
use crate::config::Config;
use crate::constants::*;
use crate::crew::CrewDuty;
use crate::instance::Instance;
use crate::{Result, Time};
use anyhow::Context;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Outcome {
  Invalid,
  Declined,
  Accepted,
  Improved,
}

/// A duty of the working partition: its blocks in time order and its reduced cost.
#[derive(Debug, Clone)]
struct Piece {
  path: Vec<usize>,
  value: f64,
}

pub struct CrewLocalSearch<'a> {
  name: String,
  inst: &'a Instance,
  cfg: &'a Config,
  rng: SmallRng,
  duals: Option<CrewDuals>,
}

impl<'a> CrewLocalSearch<'a> {
  pub fn new(inst: &'a Instance, cfg: &'a Config, instance: usize, seed: u64) -> Self {
    CrewLocalSearch {
      name: format!("csp-local-search-{}", instance),
      inst,
      cfg,
      rng: SmallRng::seed_from_u64(seed.wrapping_add(instance as u64)),
      duals: None,
    }
  }

  /// Checks gaps, steering time and paid length along `path`.  Returns whether the duty takes a
  /// long idle.
  fn joinable(&self, blocks: &[Block], path: &[usize]) -> Option<bool> {
    let first = &blocks[*path.first()?];
    let last = &blocks[*path.last()?];
    let mut steering = first.duration();
    let mut long_idle: Time = 0;
    if steering > MAX_STEERING_TIME {
      return None;
    }
    for w in path.windows(2) {
      let (from, to) = (&blocks[w[0]], &blocks[w[1]]);
      let (travel, _) = self.inst.travel(from.end_loc(), to.start_loc())?;
      match classify_gap(self.inst, self.cfg, from, to, travel)? {
        Gap::Short => steering += to.duration(),
        Gap::Break => steering = to.duration(),
        Gap::Long => {
          if long_idle > 0 {
            return None;
          }
          long_idle = to.start_time() - from.end_time() - travel;
          steering = to.duration();
        }
      }
      if steering > MAX_STEERING_TIME {
        return None;
      }
    }
    let start = first.start_time() - self.inst.location(first.start_loc()).sign_on_time;
    let end = last.end_time() + self.inst.location(last.end_loc()).sign_off_time;
    if end - start - long_idle > CR_MAX_SHIFT_LENGTH {
      return None;
    }
    Some(long_idle > 0)
  }

  /// The duty driving `path`.  A lone block which fits no regular duty gets a single duty.
  fn duty(&self, blocks: &[Block], path: &[usize]) -> Option<CrewDuty> {
    let joined = self.joinable(blocks, path)
      .and_then(|long_idle| build_duty(self.inst, self.cfg, blocks, path, long_idle));
    match path {
      [b] => Some(joined.unwrap_or_else(|| CrewDuty::single(&blocks[*b], blocks, self.inst, self.cfg))),
      _ => joined,
    }
  }

  fn value(&self, duals: &CrewDuals, path: &[usize]) -> Option<f64> {
    if path.is_empty() {
      return Some(0.0);
    }
    self.duty(&duals.blocks, path).map(|d| duals.reduced_cost(&d))
  }

  fn pick_pair(&mut self, n: usize) -> Option<(usize, usize)> {
    if n < 2 {
      return None;
    }
    let a = self.rng.gen_range(0..n);
    let mut b = self.rng.gen_range(0..n - 1);
    if b >= a {
      b += 1;
    }
    Some((a, b))
  }

  /// Replaces pieces `a` and `b` if the annealing criterion at temperature `t` accepts it.
  fn replace(&mut self, duals: &CrewDuals, pieces: &mut [Piece], (a, b): (usize, usize), new_a: Vec<usize>, new_b: Vec<usize>, t: f64) -> Outcome {
    let (va, vb) = match (self.value(duals, &new_a), self.value(duals, &new_b)) {
      (Some(va), Some(vb)) => (va, vb),
      _ => return Outcome::Invalid,
    };
    let delta = va + vb - pieces[a].value - pieces[b].value;
    if delta >= 0.0 && (-delta / t).exp() <= self.rng.gen::<f64>() {
      return Outcome::Declined;
    }
    pieces[a] = Piece { path: new_a, value: va };
    pieces[b] = Piece { path: new_b, value: vb };
    if delta < 0.0 { Outcome::Improved } else { Outcome::Accepted }
  }

  /// Moves a run of at most `max_len` consecutive blocks from one duty into another.
  fn move_range(&mut self, duals: &CrewDuals, pieces: &mut [Piece], max_len: usize, t: f64) -> Outcome {
    let (a, b) = match self.pick_pair(pieces.len()) {
      Some(p) => p,
      None => return Outcome::Invalid,
    };
    let blocks = &duals.blocks;
    let src = &pieces[b].path;
    let start = self.rng.gen_range(0..src.len());
    let len = self.rng.gen_range(1..=max_len.min(src.len() - start));
    let range = &src[start..start + len];
    let lo = blocks[range[0]].start_time();
    let hi = blocks[range[len - 1]].end_time();

    let dst = &pieces[a].path;
    if dst.iter().any(|&x| blocks[x].start_time() < hi && blocks[x].end_time() > lo) {
      return Outcome::Invalid;
    }
    let pos = dst.iter().position(|&x| blocks[x].start_time() >= hi).unwrap_or(dst.len());
    let new_a: Vec<_> = dst[..pos].iter().chain(range).chain(&dst[pos..]).copied().collect();
    let new_b: Vec<_> = src[..start].iter().chain(&src[start + len..]).copied().collect();
    self.replace(duals, pieces, (a, b), new_a, new_b, t)
  }

  /// Cuts two duties at a common time and exchanges their tails.
  fn swap_tails(&mut self, duals: &CrewDuals, pieces: &mut [Piece], t: f64) -> Outcome {
    let (a, b) = match self.pick_pair(pieces.len()) {
      Some(p) => p,
      None => return Outcome::Invalid,
    };
    let blocks = &duals.blocks;
    let (pa, pb) = (&pieces[a].path, &pieces[b].path);
    let spans: Vec<(Time, Time)> = pa.iter().chain(pb)
      .map(|&x| (blocks[x].start_time(), blocks[x].end_time()))
      .collect();
    // times at which neither duty is driving
    let mut cuts: Vec<Time> = spans.iter()
      .flat_map(|&(s, e)| std::iter::once(s).chain(std::iter::once(e)))
      .filter(|&c| spans.iter().all(|&(s, e)| c <= s || c >= e))
      .collect();
    cuts.sort_unstable();
    cuts.dedup();
    if cuts.is_empty() {
      return Outcome::Invalid;
    }
    let cut = cuts[self.rng.gen_range(0..cuts.len())];
    let split = |p: &[usize]| p.iter().position(|&x| blocks[x].start_time() >= cut).unwrap_or(p.len());
    let (ka, kb) = (split(pa), split(pb));
    if (ka == pa.len() && kb == pb.len()) || (ka == 0 && kb == 0) {
      return Outcome::Invalid;
    }
    let new_a: Vec<_> = pa[..ka].iter().chain(&pb[kb..]).copied().collect();
    let new_b: Vec<_> = pb[..kb].iter().chain(&pa[ka..]).copied().collect();
    self.replace(duals, pieces, (a, b), new_a, new_b, t)
  }

  /// Number of iterations between two cooling steps.
  fn cooling_period(&self) -> usize {
    let cfg = self.cfg;
    let steps = (cfg.csp_ls_g_starting_t / cfg.csp_ls_g_ending_t).ln() / (1.0 / cfg.csp_ls_g_cooling_rate).ln();
    ((cfg.csp_ls_g_iterations as f64 / steps.max(1.0)).round() as usize).max(1)
  }

  fn search(&mut self, duals: &CrewDuals) -> Result<Vec<(f64, CrewDuty)>> {
    let moves = WeightedIndex::new(&[self.cfg.csp_ls_g_move_range, self.cfg.csp_ls_g_move_single, self.cfg.csp_ls_g_swap_tails])
      .context("local search moves need non-negative weights, not all zero")?;
    let mut pieces: Vec<Piece> = (0..duals.blocks.len())
      .filter(|&b| duals.block_counts[b] > 0)
      .filter_map(|b| {
        let path = vec![b];
        self.value(duals, &path).map(|value| Piece { path, value })
      })
      .collect();

    let period = self.cooling_period();
    let mut t = self.cfg.csp_ls_g_starting_t;
    let mut outcomes = [0usize; 4];
    for it in 1..=self.cfg.csp_ls_g_iterations {
      if it % period == 0 {
        t = (t * self.cfg.csp_ls_g_cooling_rate).max(self.cfg.csp_ls_g_ending_t);
      }
      let outcome = match moves.sample(&mut self.rng) {
        0 => self.move_range(duals, &mut pieces, usize::MAX, t),
        1 => self.move_range(duals, &mut pieces, 1, t),
        _ => self.swap_tails(duals, &mut pieces, t),
      };
      outcomes[outcome as usize] += 1;
      if outcome != Outcome::Invalid && outcome != Outcome::Declined {
        pieces.retain(|p| !p.path.is_empty());
      }
    }
    trace!(
      oracle = %self.name,
      invalid = outcomes[Outcome::Invalid as usize],
      declined = outcomes[Outcome::Declined as usize],
      accepted = outcomes[Outcome::Accepted as usize],
      improved = outcomes[Outcome::Improved as usize],
      duties = pieces.len(),
      "annealing finished"
    );

    let columns = pieces.iter()
      .filter_map(|p| self.duty(&duals.blocks, &p.path))
      .map(|d| (duals.reduced_cost(&d), d))
      .collect();
    Ok(columns)
  }
}

impl<'a> PricingOracle for CrewLocalSearch<'a> {
  type Duals = CrewDuals;
  type Column = CrewDuty;

  fn name(&self) -> &str {
    &self.name
  }

  fn update_dual_costs(&mut self, duals: &CrewDuals) {
    self.duals = Some(duals.clone());
  }

  fn generate_columns(&mut self) -> Result<Vec<(f64, CrewDuty)>> {
    let duals = match self.duals.take() {
      Some(d) => d,
      None => return Ok(Vec::new()),
    };
    let columns = self.search(&duals);
    self.duals = Some(duals);
    columns
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::Descriptor;
  use crate::crew::DutyType;
  use crate::test::*;
  use std::sync::Arc;

  fn blocks() -> Arc<Vec<Block>> {
    let mut blocks = vec![
      Block::from_descriptor(Descriptor::new(1, 8 * HOUR, 1, 10 * HOUR)),
      Block::from_descriptor(Descriptor::new(1, 10 * HOUR + 20 * MINUTE, 1, 12 * HOUR)),
      Block::from_descriptor(Descriptor::new(1, 12 * HOUR + 10 * MINUTE, 1, 14 * HOUR)),
    ];
    for (i, b) in blocks.iter_mut().enumerate() {
      b.index = i;
    }
    Arc::new(blocks)
  }

  fn config() -> Config {
    let mut cfg = test_config();
    cfg.csp_ls_g_iterations = 2000;
    cfg.csp_ls_g_starting_t = 1.0;
    cfg
  }

  #[test]
  fn merges_blocks_into_one_duty() {
    let inst = line_instance(1, LineOptions { breaks: true, ..LineOptions::default() });
    let cfg = config();
    let mut oracle = CrewLocalSearch::new(&inst, &cfg, 0, 7);
    oracle.update_dual_costs(&CrewDuals::new(blocks(), vec![1000.0; 3]));
    let cols = oracle.generate_columns().unwrap();
    assert_eq!(cols.len(), 1);
    let (rc, duty) = &cols[0];
    assert_eq!(duty.block_cover.len(), 3);
    assert_eq!(duty.duty_type, DutyType::Early);
    assert!((*rc - (duty.cost - 3000.0)).abs() < 1e-6);
  }

  #[test]
  fn idle_blocks_are_left_out() {
    let inst = line_instance(1, LineOptions { breaks: true, ..LineOptions::default() });
    let cfg = config();
    let mut oracle = CrewLocalSearch::new(&inst, &cfg, 0, 7);
    let mut duals = CrewDuals::new(blocks(), vec![1000.0; 3]);
    duals.block_counts = vec![1, 0, 1];
    oracle.update_dual_costs(&duals);
    let cols = oracle.generate_columns().unwrap();
    assert!(!cols.is_empty());
    assert!(cols.iter().all(|(_, d)| !d.block_cover.contains(1)));
  }

  #[test]
  fn steering_limit_keeps_blocks_apart() {
    let inst = line_instance(1, LineOptions::default());
    let cfg = config();
    let mut oracle = CrewLocalSearch::new(&inst, &cfg, 0, 7);
    oracle.update_dual_costs(&CrewDuals::new(blocks(), vec![1000.0; 3]));
    let cols = oracle.generate_columns().unwrap();
    let covered: usize = cols.iter().map(|(_, d)| d.block_cover.len()).sum();
    assert_eq!(covered, 3);
    assert!(cols.iter().all(|(_, d)| d.block_cover.len() < 3));
  }

  #[test]
  fn same_seed_same_columns() {
    let inst = line_instance(1, LineOptions { breaks: true, ..LineOptions::default() });
    let cfg = config();
    let duals = CrewDuals::new(blocks(), vec![10.0, 500.0, 10.0]);
    let run = || {
      let mut oracle = CrewLocalSearch::new(&inst, &cfg, 1, 3);
      oracle.update_dual_costs(&duals);
      oracle.generate_columns().unwrap().into_iter().map(|(rc, _)| rc).collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
  }
}
