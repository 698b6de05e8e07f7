//! Reference crew oracle: forward labeling over blocks sorted by start time.
use super::{CrewDuals, PricingOracle};
use crate::block::Block;
use crate::config::Config;
use crate::constants::*;
use crate::crew::{CrewDuty, CrewElement, CrewElementKind, DutyType};
use crate::instance::Instance;
use crate::{Map, Result, Time};
use std::sync::Arc;
use tracing::trace;

/// How the gap between two consecutive blocks of a duty is spent.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum Gap {
  Short,
  Break,
  Long,
}

#[derive(Debug, Clone)]
struct Label {
  value: f64,
  start: Time,
  /// Driving since the last break
  steering: Time,
  long_idle: Time,
  path: Vec<usize>,
}

pub struct CrewLabeling<'a> {
  name: String,
  inst: &'a Instance,
  cfg: &'a Config,
  duals: Option<CrewDuals>,
}

impl<'a> CrewLabeling<'a> {
  pub fn new(inst: &'a Instance, cfg: &'a Config, instance: usize) -> Self {
    CrewLabeling { name: format!("csp-labeling-{}", instance), inst, cfg, duals: None }
  }

  fn paid_span(&self, label: &Label, end: Time, end_loc: usize) -> Time {
    end + self.inst.location(end_loc).sign_off_time - label.start - label.long_idle
  }
}

/// Classifies the idle time between `from` and `to`, after `travel` between their locations.
pub(super) fn classify_gap(inst: &Instance, cfg: &Config, from: &Block, to: &Block, travel: Time) -> Option<Gap> {
  let gap = to.start_time() - from.end_time() - travel;
  if gap < 0 {
    return None;
  }
  let loc = inst.location(to.start_loc());
  let net_break = gap - loc.brutto_netto;
  if loc.break_allowed && net_break >= cfg.cr_min_break_time && gap <= cfg.cr_max_break_time {
    Some(Gap::Break)
  } else if gap >= cfg.cr_min_short_idle_time && gap <= cfg.cr_max_short_idle_time {
    Some(Gap::Short)
  } else if gap >= cfg.cr_min_long_idle_time && gap <= cfg.cr_max_long_idle_time {
    Some(Gap::Long)
  } else {
    None
  }
}

/// The duty driving the blocks of `path` in order, with travel and idle elements in between.
/// `None` if no duty type admits its span or two blocks cannot follow each other.
pub(super) fn build_duty(inst: &Instance, cfg: &Config, blocks: &[Block], path: &[usize], long_idle: bool) -> Option<CrewDuty> {
  let first = &blocks[*path.first()?];
  let last = &blocks[*path.last()?];
  let start = first.start_time() - inst.location(first.start_loc()).sign_on_time;
  let end = last.end_time() + inst.location(last.end_loc()).sign_off_time;
  let duty_type = DutyType::classify(start, end, long_idle)?;

  let mut elements = Vec::with_capacity(path.len() * 3);
  let mut prev: Option<&Block> = None;
  for &b in path {
    let block = &blocks[b];
    if let Some(p) = prev {
      let mut t = p.end_time();
      if p.end_loc() != block.start_loc() {
        let (duration, _) = inst.travel(p.end_loc(), block.start_loc())?;
        elements.push(CrewElement {
          kind: CrewElementKind::Travel,
          start_loc: p.end_loc(),
          end_loc: block.start_loc(),
          start_time: t,
          end_time: t + duration,
        });
        t += duration;
      }
      if t < block.start_time() {
        let kind = match classify_gap(inst, cfg, p, block, t - p.end_time())? {
          Gap::Break => CrewElementKind::Break,
          Gap::Short | Gap::Long => CrewElementKind::Idle,
        };
        elements.push(CrewElement {
          kind,
          start_loc: block.start_loc(),
          end_loc: block.start_loc(),
          start_time: t,
          end_time: block.start_time(),
        });
      }
    }
    elements.push(CrewElement {
      kind: CrewElementKind::Block(b),
      start_loc: block.start_loc(),
      end_loc: block.end_loc(),
      start_time: block.start_time(),
      end_time: block.end_time(),
    });
    prev = Some(block);
  }
  debug_assert_eq!(first.start_time(), elements[0].start_time);
  Some(CrewDuty::new(duty_type, elements, blocks, inst, cfg))
}

impl<'a> PricingOracle for CrewLabeling<'a> {
  type Duals = CrewDuals;
  type Column = CrewDuty;

  fn name(&self) -> &str {
    &self.name
  }

  fn update_dual_costs(&mut self, duals: &CrewDuals) {
    self.duals = Some(duals.clone());
  }

  fn generate_columns(&mut self) -> Result<Vec<(f64, CrewDuty)>> {
    let duals = match &self.duals {
      Some(d) => d,
      None => return Ok(Vec::new()),
    };
    let blocks: Arc<Vec<Block>> = duals.blocks.clone();
    let hourly = self.cfg.cr_hourly_cost / HOUR as f64;

    let mut order: Vec<usize> = (0..blocks.len()).collect();
    order.sort_by_key(|&b| blocks[b].start_time());

    // keyed by (cover, type), cheapest reduced cost wins
    let mut best: Map<_, (f64, CrewDuty)> = Map::default();

    for (k, &s) in order.iter().enumerate() {
      let first = &blocks[s];
      if first.duration() > MAX_STEERING_TIME {
        continue;
      }
      let start = first.start_time() - self.inst.location(first.start_loc()).sign_on_time;
      let mut labels: Vec<Option<[Option<Label>; 2]>> = vec![None; blocks.len()];
      labels[s] = Some([Some(Label {
        value: -duals.scale * duals.block_duals[s],
        start,
        steering: first.duration(),
        long_idle: 0,
        path: vec![s],
      }), None]);

      for &c in &order[k..] {
        let here = match labels[c].take() {
          Some(l) => l,
          None => continue,
        };
        for label in here.iter().flatten() {
          let paid = self.paid_span(label, blocks[c].end_time(), blocks[c].end_loc());
          if paid > CR_MAX_SHIFT_LENGTH {
            continue;
          }
          if let Some(duty) = build_duty(self.inst, self.cfg, &blocks, &label.path, label.long_idle > 0) {
            let rc = duals.reduced_cost(&duty);
            if rc < -EPS {
              let key = (duty.block_cover.clone(), duty.duty_type);
              if best.get(&key).map_or(true, |(r, _)| rc < *r) {
                best.insert(key, (rc, duty));
              }
            }
          }

          let from = &blocks[c];
          for &n in &order[k..] {
            let next = &blocks[n];
            if next.start_time() < from.end_time() {
              continue;
            }
            let travel = if from.end_loc() == next.start_loc() {
              0
            } else {
              match self.inst.travel(from.end_loc(), next.start_loc()) {
                Some((d, _)) => d,
                None => continue,
              }
            };
            let gap = match classify_gap(self.inst, self.cfg, from, next, travel) {
              Some(g) => g,
              None => continue,
            };
            if gap == Gap::Long && label.long_idle > 0 {
              continue;
            }
            let steering = match gap {
              Gap::Short => label.steering + next.duration(),
              Gap::Break | Gap::Long => next.duration(),
            };
            if steering > MAX_STEERING_TIME {
              continue;
            }
            let long_idle = match gap {
              Gap::Long => next.start_time() - from.end_time() - travel,
              _ => label.long_idle,
            };
            let mut path = label.path.clone();
            path.push(n);
            let value = label.value - duals.scale * duals.block_duals[n]
              + hourly * (next.end_time() - from.end_time() - (long_idle - label.long_idle)) as f64;
            let new = Label { value, start: label.start, steering, long_idle, path };
            let slot = &mut labels[n].get_or_insert([None, None])[(long_idle > 0) as usize];
            if slot.as_ref().map_or(true, |l| new.value < l.value) {
              *slot = Some(new);
            }
          }
        }
      }
    }

    let mut columns: Vec<_> = best.into_iter().map(|(_, v)| v).collect();
    columns.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    columns.truncate(self.cfg.csp_lb_max_cols);
    trace!(oracle = %self.name, count = columns.len(), "generated duties");
    Ok(columns)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::Descriptor;
  use crate::test::*;

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

  #[test]
  fn joins_blocks_into_one_duty() {
    let inst = line_instance(1, LineOptions { breaks: true, ..LineOptions::default() });
    let cfg = test_config();
    let mut oracle = CrewLabeling::new(&inst, &cfg, 0);
    oracle.update_dual_costs(&CrewDuals::new(blocks(), vec![1000.0; 3]));
    let cols = oracle.generate_columns().unwrap();
    let (rc, duty) = &cols[0];
    assert_eq!(duty.block_cover.len(), 3);
    assert_eq!(duty.duty_type, DutyType::Early);
    assert!((*rc - (duty.cost - 3000.0)).abs() < 1e-6);
    // first and last element sign on and off
    assert_eq!(duty.elements.first().unwrap().kind, CrewElementKind::SignOnOff);
    assert_eq!(duty.elements.last().unwrap().kind, CrewElementKind::SignOnOff);
  }

  #[test]
  fn steering_limit_needs_a_break() {
    let inst = line_instance(1, LineOptions::default());
    let cfg = test_config();
    let mut oracle = CrewLabeling::new(&inst, &cfg, 0);
    oracle.update_dual_costs(&CrewDuals::new(blocks(), vec![1000.0; 3]));
    // location 1 allows no breaks, so 6 hours of driving cannot be joined
    let cols = oracle.generate_columns().unwrap();
    assert!(cols.iter().all(|(_, d)| d.block_cover.len() < 3));
  }
}
