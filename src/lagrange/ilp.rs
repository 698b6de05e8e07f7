use super::{Coordinator, Selection};
use crate::constants::*;
use crate::crew::RegulationTerms;
use crate::model;
use crate::solution::{SelectedDuty, Solution};
use crate::Result;
use grb::prelude::*;
use tracing::info;

impl<'a> Coordinator<'a> {
  /// MIP start values of the task and duty variables: the incumbent's column counts.
  pub(super) fn warm_start(&self) -> (Vec<f64>, Vec<f64>) {
    let x = self.incumbent.tasks.iter().map(|&s| if s { 1.0 } else { 0.0 }).collect();
    let y = self.incumbent.duties.iter().map(|&n| n as f64).collect();
    (x, y)
  }

  /// Integral vehicle and crew scheduling over both pools, started from the incumbent.
  ///
  /// The selected columns become the new unit columns.
  pub(super) fn final_solve(&mut self, env: &Env) -> Result<Solution> {
    let cfg = self.cfg;
    let mut model = Model::with_env("vcsp", env)?;

    let mut x = Vec::with_capacity(self.tasks.len());
    for task in self.tasks.iter() {
      x.push(model.add_var(&format!("x[{}]", task.index), Binary, task.cost, 0.0, 1.0, std::iter::empty())?);
    }
    let mut y = Vec::with_capacity(self.duties.len());
    for duty in self.duties.iter() {
      y.push(model.add_var(&format!("y[{}]", duty.index), Integer, duty.cost, 0.0, INFINITY, std::iter::empty())?);
    }

    let slack_obj = |cost: f64| if cfg.vcsp_slack_in_final_obj { cost } else { 0.0 };

    let vh_slack = model.add_var("vh_over_max", Continuous, slack_obj(cfg.vh_over_max_cost), 0.0,
      cfg.vehicle_slack_ub(), std::iter::empty())?;
    let n = x.iter().copied().grb_sum();
    model.add_constr(CSTR_MAX_VEHICLES, c!(n - vh_slack <= cfg.max_vehicles as f64))?;

    let cr_slack = model.add_var("cr_over_max", Continuous, slack_obj(cfg.cr_over_max_cost), 0.0,
      cfg.duty_slack_ub(), std::iter::empty())?;
    let n = y.iter().copied().grb_sum();
    model.add_constr(CSTR_MAX_DUTIES, c!(n - cr_slack <= cfg.max_duties as f64))?;

    let mut trip_cover = vec![Vec::new(); self.inst.trips.len()];
    let mut block_link = vec![Vec::new(); self.blocks.len()];
    for (task, &v) in self.tasks.iter().zip(&x) {
      for t in task.trips() {
        trip_cover[t].push(v);
      }
      for b in task.block_cover.iter() {
        block_link[b].push((1.0, v));
      }
    }
    for (duty, &v) in self.duties.iter().zip(&y) {
      for b in duty.block_cover.iter() {
        block_link[b].push((-1.0, v));
      }
    }
    for (t, vars) in trip_cover.into_iter().enumerate() {
      let lhs = vars.into_iter().grb_sum();
      let name = format!("{}[{}]", CSTR_TRIP_COVER, t);
      if cfg.vsp_allow_overcover {
        model.add_constr(&name, c!(lhs >= 1.0))?;
      } else {
        model.add_constr(&name, c!(lhs == 1.0))?;
      }
    }
    for (b, terms) in block_link.into_iter().enumerate() {
      let lhs = terms.into_iter().map(|(a, v)| a * v).grb_sum();
      model.add_constr(&format!("{}[{}]", CSTR_BLOCK_COVER, b), c!(lhs <= 0.0))?;
    }

    let terms: Vec<_> = self.duties.iter().map(|d| d.regulation_terms()).collect();
    let regulations: [(&str, fn(&RegulationTerms) -> f64); 4] = [
      (CSTR_CR_AVG_TIME, |t| t.avg_length),
      (CSTR_CR_LONG_DUTIES, |t| t.long),
      (CSTR_CR_BROKEN_DUTIES, |t| t.broken),
      (CSTR_CR_BETWEEN_DUTIES, |t| t.between),
    ];
    for (name, term) in regulations.iter() {
      let s = model.add_var(&format!("{}_slack", name), Continuous, CR_HARD_CONSTR_PENALTY, 0.0,
        cfg.regulation_slack_ub(), std::iter::empty())?;
      let lhs = terms.iter().zip(&y).map(|(t, &v)| term(t) * v).grb_sum();
      model.add_constr(name, c!(lhs - s <= 0.0))?;
    }

    model.update()?;
    let (start_x, start_y) = self.warm_start();
    model.set_obj_attr_batch(attr::Start, x.iter().copied().zip(start_x))?;
    model.set_obj_attr_batch(attr::Start, y.iter().copied().zip(start_y))?;

    model::set_upper_bound_params(&mut model, cfg.vcsp_solver_timeout_sec)?;
    let info = model::solve_mip(&mut model, "vcsp", cfg.vcsp_solver_timeout_sec, cfg, &self.output_dir)?;

    let x_val = model.get_obj_attr_batch(attr::X, x.iter().copied())?;
    let y_val = model.get_obj_attr_batch(attr::X, y.iter().copied())?;

    self.tasks.clear_units();
    self.duties.clear_units();
    let mut incumbent = Selection::empty(self.tasks.len(), self.duties.len());
    let mut tasks = Vec::new();
    for (i, v) in x_val.into_iter().enumerate() {
      if v > 0.5 {
        self.tasks.set_unit(i, true);
        incumbent.tasks[i] = true;
        tasks.push(self.tasks[i].clone());
      }
    }
    let mut duties = Vec::new();
    for (j, v) in y_val.into_iter().enumerate() {
      let count = v.round() as u32;
      if count > 0 {
        self.duties.set_unit(j, true);
        incumbent.duties[j] = count;
        duties.push(SelectedDuty { duty: self.duties[j].clone(), count });
      }
    }
    incumbent.value = info.objective;
    self.incumbent = incumbent;

    let solution = Solution::new(self.inst, cfg, tasks, duties, info.objective, info.gap);
    solution.log_diagnostics();
    info!(vehicles = solution.tasks.len(), duties = solution.n_duties(), objective = info.objective, "final solve");
    self.final_info = Some(info);
    Ok(solution)
  }
}
