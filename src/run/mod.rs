//! One solver run: its output directory, the dispatch on the solve mode and the `info.json`
//! summary written at the end.
pub mod stopwatch;

use crate::colgen;
use crate::config::Config;
use crate::instance::Instance;
use crate::lagrange::{Bootstrap, Coordinator};
use crate::model::GurobiInfo;
use crate::solution::{SelectedDuty, Solution};
use crate::Result;
use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

use self::stopwatch::Stopwatch;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, clap::ArgEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
  /// Vehicle scheduling only
  Vsp,
  /// Vehicle scheduling, then crew scheduling over its blocks
  Sequential,
  /// Sequential start, then the Lagrangian coordinator
  Integrated,
}

#[derive(Debug, Clone, Serialize)]
pub struct Info {
  pub mode: Mode,
  pub objective: f64,
  /// Upper bound the integrated solve started from
  pub initial_upper_bound: Option<f64>,
  /// Best Lagrangian bound of the integrated solve
  pub lower_bound: Option<f64>,
  pub gurobi: Vec<(String, GurobiInfo)>,
  /// Milliseconds per phase
  pub time: Vec<(String, u128)>,
}

impl Info {
  pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = std::fs::File::create(path).with_context(|| format!("unable to create {:?}", path))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
    Ok(())
  }
}

/// Creates a fresh `<root>/<unix seconds>` directory, suffixed if that name is taken.
pub fn create_run_dir(root: impl AsRef<Path>) -> Result<PathBuf> {
  let root = root.as_ref();
  std::fs::create_dir_all(root).with_context(|| format!("unable to create {:?}", root))?;
  let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
  let mut dir = root.join(timestamp.to_string());
  let mut suffix = 0;
  while dir.exists() {
    suffix += 1;
    dir = root.join(format!("{}-{}", timestamp, suffix));
  }
  std::fs::create_dir(&dir).with_context(|| format!("unable to create run directory {:?}", &dir))?;
  Ok(dir)
}

fn repeat_selected<'a, C: Clone + 'a>(selected: impl Iterator<Item=(&'a C, u32)>) -> Vec<C> {
  selected.flat_map(|(c, n)| std::iter::repeat(c).take(n as usize).cloned()).collect()
}

/// Solves `inst` in the given mode, writing solver artefacts into `output_dir`.
pub fn execute(env: &grb::Env, inst: &Instance, cfg: &Config, mode: Mode, output_dir: &Path) -> Result<(Solution, Info)> {
  let mut stopwatch = Stopwatch::new();
  let mut gurobi = Vec::new();

  let result = match mode {
    Mode::Vsp => {
      stopwatch.start("vsp".to_string());
      let vehicles = colgen::solve_vehicles(env, inst, cfg, output_dir)?;
      let tasks = repeat_selected(vehicles.selected());
      gurobi.push(("vsp".to_string(), vehicles.info.clone()));
      let solution = Solution::new(inst, cfg, tasks, Vec::new(), vehicles.info.objective, vehicles.info.gap);
      (solution, None, None, stopwatch.into_laps())
    }
    Mode::Sequential => {
      stopwatch.start("sequential".to_string());
      let seq = colgen::sequential(env, inst, cfg, output_dir)?;
      let tasks = repeat_selected(seq.vehicles.selected());
      let duties = seq.crew.selected().map(|(d, count)| SelectedDuty { duty: d.clone(), count }).collect();
      let objective = seq.vehicles.info.objective + seq.crew.info.objective;
      gurobi.push(("vsp".to_string(), seq.vehicles.info.clone()));
      gurobi.push(("csp".to_string(), seq.crew.info.clone()));
      let solution = Solution::new(inst, cfg, tasks, duties, objective, None);
      (solution, None, None, stopwatch.into_laps())
    }
    Mode::Integrated => {
      let mut coordinator = Coordinator::bootstrap(env, inst, cfg, Bootstrap::Sequential, output_dir)?;
      let initial_upper_bound = coordinator.upper_bound();
      let solution = coordinator.solve(env)?;
      if let Some(i) = coordinator.final_info() {
        gurobi.push(("vcsp".to_string(), i.clone()));
      }
      let lower_bound = coordinator.last_bound();
      (solution, Some(initial_upper_bound), lower_bound, coordinator.into_timings())
    }
  };

  let (solution, initial_upper_bound, lower_bound, time) = result;
  info!(?mode, objective = solution.objective, ?lower_bound, "run finished");
  let info = Info { mode, objective: solution.objective, initial_upper_bound, lower_bound, gurobi, time };
  Ok((solution, info))
}
