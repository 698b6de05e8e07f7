//! Glue around the Gurobi bindings shared by every master problem.
pub mod callback;

use crate::config::Config;
use crate::Result;
use anyhow::{bail, Context};
use grb::prelude::*;
use serde::Serialize;
use std::path::Path;
use tracing::{error, info, warn};

use self::callback::{relative_gap, GapTimeExtender};

/// A started environment logging to `log_file` only.
pub fn build_env(log_file: Option<&Path>, cfg: &Config) -> Result<Env> {
  let ctx_msg = "create Gurobi environment";
  let mut env = Env::empty().context(ctx_msg)?;
  env.set(param::LogToConsole, 0)
    .and_then(|e| e.set(param::Threads, cfg.threads as i32))
    .and_then(|e| e.set(param::Seed, (cfg.seed % i32::MAX as u64) as i32))
    .context(ctx_msg)?;
  if let Some(p) = log_file {
    env.set(param::LogFile, p.to_string_lossy().into_owned()).context(ctx_msg)?;
  }
  Ok(env.start()?)
}

/// Parameters of the final integral solves, which favour finding good incumbents early.
pub fn set_upper_bound_params(model: &mut Model, time_limit: f64) -> Result<()> {
  model.set_param(param::MIPFocus, 1)?;
  model.set_param(param::Heuristics, 0.8)?;
  model.set_param(param::RINS, 10)?;
  model.set_param(param::SubMIPNodes, 5000)?;
  model.set_param(param::PumpPasses, 20)?;
  model.set_param(param::NoRelHeurTime, time_limit / 4.0)?;
  model.set_param(param::ImproveStartTime, time_limit / 4.0)?;
  model.set_param(param::Cuts, 1)?;
  model.set_param(param::Presolve, 2)?;
  model.set_param(param::Symmetry, 2)?;
  Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct GurobiInfo {
  pub status: String,
  pub objective: f64,
  pub bound: Option<f64>,
  pub gap: Option<f64>,
  pub solutions: i32,
  pub extensions: usize,
}

/// Computes an IIS, writes it to `path` and logs its rows.
pub fn write_iis(model: &mut Model, path: &Path) -> Result<Vec<String>> {
  model.compute_iis()?;
  model.write(&path.to_string_lossy())
    .with_context(|| format!("unable to write IIS to {:?}", path))?;

  let constrs = model.get_constrs()?.to_vec();
  let iis_constrs: Vec<_> = constrs.iter()
    .copied()
    .zip(model.get_obj_attr_batch(attr::IISConstr, constrs.iter().copied())?)
    .filter(|(_, is_iis)| *is_iis > 0)
    .map(|(c, _)| c)
    .collect();
  let names = model.get_obj_attr_batch(attr::ConstrName, iis_constrs)?;
  for name in &names {
    error!(constr = %name, "iis constr");
  }
  Ok(names)
}

/// Solves an integral model under `time_limit` seconds, extending the limit while the gap is
/// large if configured.  Stopping at a limit with an incumbent is a success; infeasibility or
/// stopping without an incumbent is an error, after the IIS (if any) was written to `iis_dir`.
pub fn solve_mip(model: &mut Model, name: &str, time_limit: f64, cfg: &Config, iis_dir: &Path) -> Result<GurobiInfo> {
  let mut cb = GapTimeExtender::new(time_limit, cfg);
  model.set_param(param::TimeLimit, cb.hard_limit())?;
  model.optimize_with_callback(&mut cb)?;

  let status = model.status()?;
  let solutions = model.get_attr(attr::SolCount)?;
  match status {
    Status::Optimal => {}
    Status::TimeLimit | Status::Interrupted if solutions > 0 => {
      warn!(?status, terminated = cb.terminated, "integral solve stopped early, using incumbent");
    }
    Status::Infeasible | Status::InfOrUnbd => {
      let path = iis_dir.join(format!("{}_infeasible.ilp", name));
      write_iis(model, &path)?;
      bail!("{} model is infeasible, IIS written to {:?}", name, path);
    }
    status => {
      let runtime = model.get_attr(attr::Runtime)?;
      return Err(stopped_without_solution(name, status, runtime, cb.terminated));
    }
  }

  let objective = model.get_attr(attr::ObjVal)?;
  let bound = Some(model.get_attr(attr::ObjBound)?).filter(|b| b.abs() < grb::INFINITY);
  let gap = bound.and_then(|b| relative_gap(objective, b));
  info!(name, objective, ?bound, ?gap, extensions = cb.extensions, "integral solve finished");
  Ok(GurobiInfo {
    status: format!("{:?}", status),
    objective,
    bound,
    gap,
    solutions,
    extensions: cb.extensions,
  })
}

/// Logs an integral solve which ended without an incumbent and returns the matching error.
fn stopped_without_solution(name: &str, status: Status, runtime: f64, terminated: bool) -> anyhow::Error {
  error!(name, ?status, runtime, terminated, "integral solve stopped without a solution");
  anyhow::anyhow!("{} model stopped with status {:?} after {:.1}s and no solution", name, status, runtime)
}

/// Re-solves a relaxation.  Returns `None` if it is infeasible, after writing the IIS.
pub fn solve_lp(model: &mut Model, name: &str, iis_dir: &Path) -> Result<Option<f64>> {
  model.optimize()?;
  match model.status()? {
    Status::Optimal => Ok(Some(model.get_attr(attr::ObjVal)?)),
    Status::Infeasible | Status::InfOrUnbd => {
      let path = iis_dir.join(format!("{}_infeasible.ilp", name));
      write_iis(model, &path)?;
      Ok(None)
    }
    status => bail!("{} relaxation stopped with status {:?}", name, status),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn interrupted_without_solution_reports_status_and_time() {
    let err = stopped_without_solution("vcsp", Status::Interrupted, 12.34, true);
    let msg = err.to_string();
    assert!(msg.contains("vcsp"));
    assert!(msg.contains("Interrupted"));
    assert!(msg.contains("12.3s"));
  }
}
