use crate::block::Block;
use crate::config::Config;
use crate::constants::*;
use crate::crew::{CrewDuty, CrewElement, CrewElementKind, DutyType};
use crate::instance::*;
use crate::vehicle::{TaskBuilder, VehicleTask};
use crate::Time;
use std::path::Path;

pub fn test_data_dir() -> &'static Path {
  Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/"))
}

pub fn test_output_dir() -> &'static Path {
  Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/outputs/"))
}

#[derive(Debug, Copy, Clone)]
pub struct LineOptions {
  /// Crews may be swapped at the terminus
  pub handover: bool,
  /// Idle time between consecutive trips
  pub gap: Time,
  /// Trips run for longer than their headway
  pub overlapping: bool,
  pub drive_usage: f64,
  /// Crews may take breaks at the terminus
  pub breaks: bool,
}

impl Default for LineOptions {
  fn default() -> Self {
    LineOptions {
      handover: true,
      gap: 10 * MINUTE,
      overlapping: false,
      drive_usage: 0.0,
      breaks: false,
    }
  }
}

/// A depot (location 0) and one terminus (location 1) with `n` hourly round trips from 8:00,
/// each starting and ending at the terminus.
pub fn line_instance(n: usize, opts: LineOptions) -> Instance {
  let locations = vec![
    Location {
      id: "depot".to_string(),
      index: 0,
      sign_on_time: 0,
      sign_off_time: 0,
      handover_allowed: true,
      break_allowed: false,
      brutto_netto: 0,
      is_depot: true,
      can_charge: true,
    },
    Location {
      id: "terminus".to_string(),
      index: 0,
      sign_on_time: 5 * MINUTE,
      sign_off_time: 5 * MINUTE,
      handover_allowed: opts.handover,
      break_allowed: opts.breaks,
      brutto_netto: 0,
      is_depot: false,
      can_charge: false,
    },
  ];

  let duration = if opts.overlapping { HOUR + 30 * MINUTE } else { HOUR - opts.gap };
  let trips = (0..n)
    .map(|k| {
      let start_time = 8 * HOUR + k as Time * HOUR;
      Trip {
        id: format!("t{}", k),
        index: 0,
        from: 1,
        to: 1,
        start_time,
        end_time: start_time + duration,
        distance: 20_000.0,
      }
    })
    .collect();

  let deadheads = vec![
    DeadheadTemplate { from: 0, to: 1, duration: 5 * MINUTE, distance: 0.0 },
    DeadheadTemplate { from: 1, to: 0, duration: 5 * MINUTE, distance: 0.0 },
  ];

  let vehicle_type = VehicleType {
    id: "e-bus".to_string(),
    capacity: 300.0,
    drive_usage: opts.drive_usage,
    idle_usage: 0.0,
    charge_rate: 0.01,
    min_soc: 20.0,
    max_soc: 100.0,
    start_soc: 100.0,
  };

  // the fixture is well formed by construction
  Instance::new(locations, trips, deadheads, vehicle_type).unwrap()
}

/// One vehicle driving every trip of a line in order.
pub fn chained_task(inst: &Instance, cfg: &Config) -> VehicleTask {
  let mut b = TaskBuilder::new(inst);
  for t in 0..inst.trips.len() {
    b.trip(t).unwrap();
  }
  b.finish(cfg).unwrap()
}

/// Pullout plus driving cost of every trip, the cheapest possible vehicle side of a line
/// without deadhead distances.
pub fn line_vehicle_cost(inst: &Instance, cfg: &Config) -> f64 {
  cfg.vh_pullout_cost + inst.trips.iter().map(|t| t.distance * VH_M_COST).sum::<f64>()
}

/// Cost of the chained task plus one early duty driving it, on a line without handovers at the
/// terminus.  An upper bound on the optimum of such a line.
pub fn chained_schedule_cost(inst: &Instance, cfg: &Config) -> f64 {
  let task = chained_task(inst, cfg);
  let mut blocks = Block::from_vehicle_task(&task, inst);
  assert_eq!(blocks.len(), 1);
  blocks[0].index = 0;
  let d = blocks[0].descriptor;
  let element = CrewElement {
    kind: CrewElementKind::Block(0),
    start_loc: d.start_loc,
    end_loc: d.end_loc,
    start_time: d.start_time,
    end_time: d.end_time,
  };
  let duty = CrewDuty::new(DutyType::Early, vec![element], &blocks, inst, cfg);
  task.cost + duty.cost
}

/// Defaults with short solver time limits and a quickly cooling subgradient method.
pub fn test_config() -> Config {
  let mut cfg = Config::default();
  cfg.threads = 2;
  cfg.lagrange_n = 5;
  cfg.lagrange_disrupt_rounds = 1;
  cfg.vcsp_rounds = 2;
  cfg.vcsp_vh_its_init = 2;
  cfg.vcsp_vh_its_round = 1;
  cfg.vcsp_cr_its_init = 2;
  cfg.vcsp_cr_its_round = 1;
  cfg.vsp_solver_timeout_sec = 30.0;
  cfg.csp_solver_timeout_sec = 30.0;
  cfg.vcsp_solver_timeout_sec = 30.0;
  cfg
}

/// Full runs of every mode on a three-trip line.  Needs a Gurobi licence.
#[cfg(feature = "gurobi-tests")]
mod gurobi {
  use super::*;
  use crate::model::build_env;
  use crate::run::{execute, Mode};
  use crate::solution::Solution;

  /// Three trips, one depot, free deadheads and no battery drain.  Crews can only be relieved at
  /// the depot, so one vehicle and one duty drive the whole line.
  fn scenario() -> Instance {
    line_instance(3, LineOptions { handover: false, ..LineOptions::default() })
  }

  /// Writes to `tests/outputs/<test>/<mode>/`.
  fn run(inst: &Instance, mode: Mode, test: &str) -> Solution {
    crate::logging::init_test_logging();
    let cfg = test_config();
    let dir = test_output_dir().join(test).join(format!("{:?}", mode).to_lowercase());
    std::fs::create_dir_all(&dir).unwrap();
    let env = build_env(Some(&dir.join("gurobi.log")), &cfg).unwrap();
    let (solution, info) = execute(&env, inst, &cfg, mode, &dir).unwrap();
    assert_eq!(info.mode, mode);
    solution
  }

  fn assert_one_vehicle_one_duty(inst: &Instance, sol: &Solution) {
    let cfg = test_config();
    assert!(sol.diagnostics.is_empty(), "{:?}", sol.diagnostics);
    assert_eq!(sol.tasks.len(), 1);
    assert_eq!(sol.tasks[0].trip_cover.len(), 3);
    assert_eq!(sol.n_duties(), 1);
    assert!((sol.vehicle_cost() - line_vehicle_cost(inst, &cfg)).abs() < 1e-6);
    assert!((sol.objective - line_vehicle_cost(inst, &cfg) - sol.crew_cost()).abs() < 1e-4,
      "objective {} vs vehicle {} + crew {}", sol.objective, sol.vehicle_cost(), sol.crew_cost());
    assert!(sol.objective <= chained_schedule_cost(inst, &cfg) + 1e-4);
  }

  #[test]
  fn vehicle_schedule_chains_the_line() {
    let inst = scenario();
    let sol = run(&inst, Mode::Vsp, "vehicle_schedule_chains_the_line");
    assert!(sol.diagnostics.is_empty());
    assert_eq!(sol.tasks.len(), 1);
    assert_eq!(sol.tasks[0].trip_cover.len(), 3);
    let expected = line_vehicle_cost(&inst, &test_config());
    assert!((sol.objective - expected).abs() < 1e-4, "objective {} vs {}", sol.objective, expected);
  }

  #[test]
  fn sequential_schedule_is_one_vehicle_one_duty() {
    let inst = scenario();
    let sol = run(&inst, Mode::Sequential, "sequential_schedule_is_one_vehicle_one_duty");
    assert_one_vehicle_one_duty(&inst, &sol);
  }

  #[test]
  fn integrated_schedule_is_one_vehicle_one_duty() {
    let inst = scenario();
    let seq = run(&inst, Mode::Sequential, "integrated_schedule_is_one_vehicle_one_duty");
    let int = run(&inst, Mode::Integrated, "integrated_schedule_is_one_vehicle_one_duty");
    assert_one_vehicle_one_duty(&inst, &int);
    assert!(int.objective <= seq.objective + 1e-6);
  }

  #[test]
  fn integrated_schedule_with_handovers_is_consistent() {
    let inst = line_instance(3, LineOptions::default());
    let sol = run(&inst, Mode::Integrated, "integrated_schedule_with_handovers_is_consistent");
    assert!(sol.diagnostics.is_empty(), "{:?}", sol.diagnostics);
    assert_eq!(sol.tasks.len(), 1);
    assert!(sol.n_duties() >= 1);
  }
}
