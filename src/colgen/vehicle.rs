use super::Side;
use crate::config::Config;
use crate::constants::*;
use crate::instance::Instance;
use crate::pricing::VehicleDuals;
use crate::vehicle::VehicleTask;
use crate::{Map, Result};
use grb::prelude::*;
use tracing::{info, warn};

/// Trip cover rows and the fleet ceiling.
pub struct VehicleSide<'a> {
  inst: &'a Instance,
  cfg: &'a Config,
  trip_rows: Vec<Constr>,
  max_vehicles: Option<(Constr, Var)>,
}

impl<'a> VehicleSide<'a> {
  pub fn new(inst: &'a Instance, cfg: &'a Config) -> Self {
    VehicleSide { inst, cfg, trip_rows: Vec::new(), max_vehicles: None }
  }
}

impl<'a> Side for VehicleSide<'a> {
  type Column = VehicleTask;
  type Duals = VehicleDuals;

  const NAME: &'static str = "vsp";
  const INTEGRAL_TYPE: VarType = Binary;

  fn max_iterations(&self) -> usize { self.cfg.vsp_max_col_gen_its }

  fn non_improving_limit(&self) -> usize { self.cfg.vsp_opt_it_threshold }

  fn time_limit(&self) -> f64 { self.cfg.vsp_solver_timeout_sec }

  fn add_rows(&mut self, model: &mut Model, columns: &[VehicleTask], vars: &[Var]) -> Result<()> {
    let mut covering = vec![Vec::new(); self.inst.trips.len()];
    for (task, &x) in columns.iter().zip(vars) {
      for t in task.trips() {
        covering[t].push(x);
      }
    }

    self.trip_rows = Vec::with_capacity(covering.len());
    for (t, xs) in covering.into_iter().enumerate() {
      if xs.is_empty() {
        warn!(trip = %self.inst.trips[t].id, "trip has no covering column");
      }
      let name = format!("{}[{}]", CSTR_TRIP_COVER, t);
      let lhs = xs.into_iter().grb_sum();
      let row = if self.cfg.vsp_allow_overcover {
        model.add_constr(&name, c!(lhs >= 1.0))?
      } else {
        model.add_constr(&name, c!(lhs == 1.0))?
      };
      self.trip_rows.push(row);
    }

    let slack = model.add_var("vsp_over_max", Continuous, self.cfg.vh_over_max_cost, 0.0, INFINITY, std::iter::empty())?;
    let n = vars.iter().copied().grb_sum();
    let row = model.add_constr(CSTR_MAX_VEHICLES, c!(n - slack <= self.cfg.max_vehicles as f64))?;
    self.max_vehicles = Some((row, slack));
    Ok(())
  }

  fn coefficients(&self, task: &VehicleTask) -> Vec<(Constr, f64)> {
    let mut coeffs: Vec<_> = task.trips().map(|t| (self.trip_rows[t], 1.0)).collect();
    if let Some((row, _)) = self.max_vehicles {
      coeffs.push((row, 1.0));
    }
    coeffs
  }

  fn duals(&self, model: &Model) -> Result<VehicleDuals> {
    let trips = model.get_obj_attr_batch(attr::Pi, self.trip_rows.iter().copied())?;
    let max_vehicles = match &self.max_vehicles {
      Some((row, _)) => model.get_obj_attr(attr::Pi, row)?,
      None => 0.0,
    };
    Ok(VehicleDuals::new(trips, Map::default(), max_vehicles))
  }

  fn before_integral_solve(&mut self, model: &mut Model) -> Result<()> {
    if !self.cfg.vsp_allow_slack_final_solve {
      if let Some((_, slack)) = &self.max_vehicles {
        model.set_obj_attr(attr::UB, slack, 0.0)?;
      }
    }
    Ok(())
  }

  fn report_cover(&self, columns: &[VehicleTask], selection: &[(usize, u32)]) {
    let mut count = vec![0u32; self.inst.trips.len()];
    for &(i, n) in selection {
      for t in columns[i].trips() {
        count[t] += n;
      }
    }
    let uncovered = count.iter().filter(|&&c| c == 0).count();
    let overcovered = count.iter().filter(|&&c| c > 1).count();
    let vehicles: u32 = selection.iter().map(|&(_, n)| n).sum();
    if uncovered > 0 || overcovered > 0 {
      warn!(uncovered, overcovered, "vehicle schedule does not partition the trips");
    }
    info!(vehicles, over_max = (vehicles as usize).saturating_sub(self.cfg.max_vehicles), "vehicle cover");
  }
}
