//! Reference vehicle oracle: a shortest path over the trip connection DAG.
use super::{PricingOracle, VehicleDuals};
use crate::block::DescriptorHalf;
use crate::config::Config;
use crate::constants::{EPS, VH_M_COST};
use crate::instance::{Instance, TripIdx};
use crate::vehicle::{TaskBuilder, VehicleTask};
use crate::{Result, Set};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

#[derive(Debug, Copy, Clone)]
struct Label {
  value: f64,
  /// Battery left after driving the trip, ignoring charging
  soc: f64,
  pred: Option<TripIdx>,
}

/// One label per trip: the cheapest known chain from the depot ending with that trip.  Every
/// trip yields a candidate task which is then built and priced exactly.
pub struct VehicleLabeling<'a> {
  name: String,
  inst: &'a Instance,
  cfg: &'a Config,
  duals: VehicleDuals,
  /// Trips sorted by departure
  order: Vec<TripIdx>,
  skip_chance: f64,
  rng: SmallRng,
}

impl<'a> VehicleLabeling<'a> {
  pub fn new(inst: &'a Instance, cfg: &'a Config, instance: usize) -> Self {
    let mut order: Vec<_> = (0..inst.trips.len()).collect();
    order.sort_by_key(|&t| (inst.trips[t].start_time, inst.trips[t].end_time));
    // the first instance searches the whole network, the others a random part of it
    let skip_chance = if instance == 0 { 0.0 } else { cfg.vsp_lb_trip_skip_chance };
    VehicleLabeling {
      name: format!("vsp-labeling-{}", instance),
      inst,
      cfg,
      duals: VehicleDuals::default(),
      order,
      skip_chance,
      rng: SmallRng::seed_from_u64(cfg.seed.wrapping_add(instance as u64)),
    }
  }

  fn trip_dual(&self, t: TripIdx) -> f64 {
    self.duals.trips.get(t).copied().unwrap_or(0.0) * self.duals.scale
  }

  fn pullout(&self, t: TripIdx) -> Option<Label> {
    let inst = self.inst;
    let trip = &inst.trips[t];
    let (_, dist) = inst.travel(inst.depot, trip.from)?;
    let usage = (dist + trip.distance) * inst.vehicle_type.drive_usage;
    let soc = inst.vehicle_type.start_soc - usage;
    if soc < inst.vehicle_type.min_soc {
      return None;
    }
    let value = self.cfg.vh_pullout_cost + (dist + trip.distance) * VH_M_COST - self.trip_dual(t);
    Some(Label { value, soc, pred: None })
  }

  fn connect(&self, from: TripIdx, label: &Label, to: TripIdx) -> Option<Label> {
    let inst = self.inst;
    let vt = &inst.vehicle_type;
    let a = &inst.trips[from];
    let b = &inst.trips[to];
    let (duration, dist) = inst.travel(a.to, b.from)?;
    let wait = b.start_time - a.end_time - duration;
    if wait < 0 {
      return None;
    }
    let soc = label.soc - (dist + b.distance) * vt.drive_usage - wait as f64 * vt.idle_usage;
    if soc < vt.min_soc {
      return None;
    }
    let mut value = label.value + (dist + b.distance) * VH_M_COST - self.trip_dual(to);
    let loc = inst.location(b.from);
    if dist == 0.0 && loc.handover_allowed && wait >= loc.handover_time() {
      // a block ends here; credit the best block that could start with this trip
      value -= self.duals.scale * self.duals.best_block_start(&DescriptorHalf { loc: b.from, time: b.start_time });
    }
    Some(Label { value, soc, pred: Some(from) })
  }

  fn chain(labels: &[Option<Label>], last: TripIdx) -> Vec<TripIdx> {
    let mut trips = vec![last];
    let mut t = last;
    while let Some(p) = labels[t].and_then(|l| l.pred) {
      trips.push(p);
      t = p;
    }
    trips.reverse();
    trips
  }

  fn build(&self, trips: &[TripIdx]) -> Result<VehicleTask> {
    let mut b = TaskBuilder::new(self.inst);
    for &t in trips {
      b.trip(t)?;
    }
    b.finish(self.cfg)
  }
}

impl<'a> PricingOracle for VehicleLabeling<'a> {
  type Duals = VehicleDuals;
  type Column = VehicleTask;

  fn name(&self) -> &str {
    &self.name
  }

  fn update_dual_costs(&mut self, duals: &VehicleDuals) {
    self.duals = duals.clone();
  }

  fn generate_columns(&mut self) -> Result<Vec<(f64, VehicleTask)>> {
    let n = self.inst.trips.len();
    let mut labels: Vec<Option<Label>> = vec![None; n];
    let mut active = Vec::with_capacity(n);

    for k in 0..self.order.len() {
      let t = self.order[k];
      if self.skip_chance > 0.0 && self.rng.gen_bool(self.skip_chance.min(1.0)) {
        continue;
      }
      let mut best = self.pullout(t);
      for &p in &active {
        if let Some(lp) = &labels[p] {
          if let Some(l) = self.connect(p, lp, t) {
            if best.map_or(true, |b| l.value < b.value) {
              best = Some(l);
            }
          }
        }
      }
      if best.is_some() {
        labels[t] = best;
        active.push(t);
      }
    }

    let mut seen = Set::default();
    let mut columns = Vec::new();
    for &t in &active {
      let trips = Self::chain(&labels, t);
      if !seen.insert(trips.clone()) {
        continue;
      }
      match self.build(&trips) {
        Ok(task) => {
          let rc = self.duals.reduced_cost(&task);
          if rc < -EPS {
            columns.push((rc, task));
          }
        }
        Err(e) => trace!(?trips, err = %e, "discarding chain"),
      }
    }

    columns.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    columns.truncate(self.cfg.vsp_lb_max_cols);
    trace!(oracle = %self.name, count = columns.len(), "generated tasks");
    Ok(columns)
  }
}
