use crate::block::Descriptor;
use crate::config::Config;
use crate::crew::CrewDuty;
use crate::instance::{Instance, TripIdx};
use crate::vehicle::VehicleTask;
use crate::Result;
use anyhow::Context;
use itertools::Itertools;
use prettytable::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// A cover defect of a selected schedule.  These are reported, never treated as failures.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum Diagnostic {
  TripUncovered { trip: TripIdx },
  TripOvercovered { trip: TripIdx, count: u32 },
  BlockWithoutCrew { block: Descriptor, vehicles: u32 },
  BlockWithoutVehicle { block: Descriptor, duties: u32 },
  BlockCountMismatch { block: Descriptor, vehicles: u32, duties: u32 },
}

impl fmt::Display for Diagnostic {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Diagnostic::TripUncovered { trip } => write!(f, "trip {} is not covered", trip),
      Diagnostic::TripOvercovered { trip, count } => write!(f, "trip {} is covered {} times", trip, count),
      Diagnostic::BlockWithoutCrew { block, vehicles } =>
        write!(f, "block {} is driven by {} vehicle(s) but no duty", block, vehicles),
      Diagnostic::BlockWithoutVehicle { block, duties } =>
        write!(f, "block {} is covered by {} duty(s) but no vehicle", block, duties),
      Diagnostic::BlockCountMismatch { block, vehicles, duties } =>
        write!(f, "block {} is driven {} times but covered {} times", block, vehicles, duties),
    }
  }
}

pub fn trip_diagnostics<'a>(n_trips: usize, tasks: impl IntoIterator<Item=&'a VehicleTask>) -> Vec<Diagnostic> {
  let mut count = vec![0u32; n_trips];
  for task in tasks {
    for t in task.trips() {
      count[t] += 1;
    }
  }
  count.into_iter()
    .enumerate()
    .filter_map(|(trip, count)| match count {
      0 => Some(Diagnostic::TripUncovered { trip }),
      1 => None,
      count => Some(Diagnostic::TripOvercovered { trip, count }),
    })
    .collect()
}

/// Compares how often each block is driven with how often it is staffed.
pub fn block_diagnostics<'a>(
  tasks: impl IntoIterator<Item=&'a VehicleTask>,
  duties: impl IntoIterator<Item=(&'a CrewDuty, u32)>,
) -> Vec<Diagnostic> {
  let mut counts: BTreeMap<Descriptor, (u32, u32)> = BTreeMap::new();
  for task in tasks {
    for d in &task.blocks {
      counts.entry(*d).or_default().0 += 1;
    }
  }
  for (duty, n) in duties {
    for d in &duty.blocks {
      counts.entry(*d).or_default().1 += n;
    }
  }
  counts.into_iter()
    .filter_map(|(block, (vehicles, duties))| match (vehicles, duties) {
      (v, d) if v == d => None,
      (vehicles, 0) => Some(Diagnostic::BlockWithoutCrew { block, vehicles }),
      (0, duties) => Some(Diagnostic::BlockWithoutVehicle { block, duties }),
      (vehicles, duties) => Some(Diagnostic::BlockCountMismatch { block, vehicles, duties }),
    })
    .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectedDuty {
  pub duty: CrewDuty,
  pub count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Solution {
  pub tasks: Vec<VehicleTask>,
  pub duties: Vec<SelectedDuty>,
  pub objective: f64,
  pub mip_gap: Option<f64>,
  /// Vehicles beyond the fleet ceiling
  pub vehicle_slack: usize,
  /// Duties beyond the duty ceiling
  pub duty_slack: usize,
  pub diagnostics: Vec<Diagnostic>,
}

impl Solution {
  /// Collects the selected columns and checks their cover.  Block checks are skipped for
  /// vehicle-only schedules.
  pub fn new(
    inst: &Instance,
    cfg: &Config,
    tasks: Vec<VehicleTask>,
    duties: Vec<SelectedDuty>,
    objective: f64,
    mip_gap: Option<f64>,
  ) -> Self {
    let mut diagnostics = trip_diagnostics(inst.trips.len(), &tasks);
    if !duties.is_empty() {
      diagnostics.extend(block_diagnostics(&tasks, duties.iter().map(|d| (&d.duty, d.count))));
    }
    let n_duties: u32 = duties.iter().map(|d| d.count).sum();
    Solution {
      vehicle_slack: tasks.len().saturating_sub(cfg.max_vehicles),
      duty_slack: (n_duties as usize).saturating_sub(cfg.max_duties),
      tasks,
      duties,
      objective,
      mip_gap,
      diagnostics,
    }
  }

  pub fn n_duties(&self) -> u32 {
    self.duties.iter().map(|d| d.count).sum()
  }

  pub fn vehicle_cost(&self) -> f64 {
    self.tasks.iter().map(|t| t.cost).sum()
  }

  pub fn crew_cost(&self) -> f64 {
    self.duties.iter().map(|d| d.duty.cost * d.count as f64).sum()
  }

  pub fn log_diagnostics(&self) {
    for d in &self.diagnostics {
      warn!(diagnostic = %d, "cover defect");
    }
    info!(
      vehicles = self.tasks.len(),
      duties = self.n_duties(),
      objective = self.objective,
      defects = self.diagnostics.len(),
      "solution"
    );
  }

  pub fn breakdown_table(&self, cfg: &Config) -> Table {
    let types = self.duties.iter()
      .map(|d| (d.duty.duty_type, d.count))
      .into_grouping_map()
      .sum()
      .into_iter()
      .sorted();

    let mut table = table!(
      ["Vehicles", self.tasks.len(), format!("{:.2}", self.vehicle_cost())],
      ["Over max vehicles", self.vehicle_slack, format!("{:.2}", self.vehicle_slack as f64 * cfg.vh_over_max_cost)],
      ["Duties", self.n_duties(), format!("{:.2}", self.crew_cost())],
      ["Over max duties", self.duty_slack, format!("{:.2}", self.duty_slack as f64 * cfg.cr_over_max_cost)]
    );
    for (ty, n) in types {
      table.add_row(row![format!("  {}", ty), n, ""]);
    }
    table.add_row(row!["Objective", "", format!("{:.2}", self.objective)]);
    if let Some(gap) = self.mip_gap {
      table.add_row(row!["Gap", "", format!("{:.4}", gap)]);
    }
    table.set_format(*format::consts::FORMAT_CLEAN);
    for cell in table.column_iter_mut(1) {
      cell.align(format::Alignment::RIGHT);
    }
    for cell in table.column_iter_mut(2) {
      cell.align(format::Alignment::RIGHT);
    }
    table
  }

  pub fn print_breakdown(&self, cfg: &Config) {
    self.breakdown_table(cfg).printstd();
  }

  pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = std::fs::File::create(path).with_context(|| format!("unable to create {:?}", path))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
    Ok(())
  }
}
