//! Run parameters.
//!
//! Every tunable of the solver lives in [`Config`], which is built once per run and handed to each
//! component by reference.  The struct is generated by the `config!` macro below, which also
//! produces the plain-text `Field: Value` snapshot format used for the per-run `config.txt` dump
//! and for partially reloading a previous run's parameters.
use crate::constants::*;
use crate::{Result, Time};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::Path;
use tracing::{debug, warn};

macro_rules! config {
  (
    $(
      $(#[doc = $doc:literal])*
      $field:ident : $ty:ty = $default:expr
    ),* $(,)?
  ) => {
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Config {
      $(
        $(#[doc = $doc])*
        pub $field: $ty,
      )*
    }

    impl Default for Config {
      fn default() -> Self {
        Config { $( $field: $default, )* }
      }
    }

    impl Config {
      /// Names of all fields, in dump order.
      pub const FIELDS: &'static [&'static str] = &[ $( stringify!($field) ),* ];

      /// One `Field: Value` line per field.
      pub fn dump(&self) -> String {
        let mut s = String::new();
        $(
          // writing to a String cannot fail
          let _ = writeln!(s, "{}: {}", stringify!($field), self.$field);
        )*
        s
      }

      /// Returns `Ok(false)` if `name` is not a field.
      fn set_field(&mut self, name: &str, value: &str) -> std::result::Result<bool, String> {
        match name {
          $(
            stringify!($field) => {
              self.$field = value.parse::<$ty>().map_err(|e| e.to_string())?;
              Ok(true)
            }
          )*
          _ => Ok(false),
        }
      }
    }
  };
}

config! {
  /// Worker threads used for pricing and reduced-cost updates
  threads: usize = num_cpus::get().saturating_sub(1).max(1),
  seed: u64 = 0,

  // Gurobi
  /// Keep solving past the time limit while the gap is above `grb_target_gap`
  grb_extend_time: bool = false,
  grb_max_extended_time: f64 = 2.0 * 3600.0,
  grb_extension_step: f64 = 60.0,
  grb_target_gap: f64 = 0.005,

  // Costs and fleet/crew ceilings
  vh_pullout_cost: f64 = 200.0,
  cr_shift_cost: f64 = 100.0,
  /// Penalty for the single-block duties used for initialisation
  cr_single_shift_cost: f64 = 1_000.0,
  cr_hourly_cost: f64 = CR_HOURLY_COST,
  cr_broken_shift_cost: f64 = CR_BROKEN_SHIFT_COST,
  max_vehicles: usize = 99,
  /// Cost per vehicle over `max_vehicles`
  vh_over_max_cost: f64 = 0.0,
  max_duties: usize = 99,
  /// Cost per duty over `max_duties`
  cr_over_max_cost: f64 = 0.0,

  // Vehicle column generation
  vsp_solver_timeout_sec: f64 = 450.0,
  /// Trip cover rows are `>= 1` instead of `== 1`
  vsp_allow_overcover: bool = true,
  vsp_allow_slack_final_solve: bool = true,
  vsp_instances_per_it: usize = 1,
  vsp_max_col_gen_its: usize = 250,
  /// Consecutive non-improving iterations before stopping
  vsp_opt_it_threshold: usize = 2,
  vsp_lb_weight: f64 = 1.0,
  vsp_lb_max_cols: usize = 50,
  /// Fraction of trips each additional labeling instance ignores
  vsp_lb_trip_skip_chance: f64 = 0.1,

  // Crew column generation
  csp_solver_timeout_sec: f64 = 300.0,
  csp_opt_it_threshold: usize = 2,
  csp_allow_overcover: bool = true,
  csp_instances_per_it: usize = 1,
  csp_max_col_gen_its: usize = 1000,
  csp_lb_weight: f64 = 1.0,
  csp_lb_max_cols: usize = 50,
  /// Weight of the annealing local search in the crew pricing portfolio
  csp_ls_global_weight: f64 = 0.25,
  csp_ls_g_iterations: usize = 20_000,
  csp_ls_g_starting_t: f64 = 50.0,
  csp_ls_g_ending_t: f64 = 0.01,
  /// Temperature factor applied at every cooling step
  csp_ls_g_cooling_rate: f64 = 0.98,
  csp_ls_g_move_range: f64 = 2.0,
  csp_ls_g_move_single: f64 = 5.0,
  csp_ls_g_swap_tails: f64 = 5.0,
  cr_min_break_time: Time = 15 * MINUTE,
  cr_max_break_time: Time = HOUR,
  cr_min_short_idle_time: Time = 0,
  cr_max_short_idle_time: Time = 30 * MINUTE,
  /// Minimum idle time which splits a broken duty
  cr_min_long_idle_time: Time = 90 * MINUTE,
  cr_max_long_idle_time: Time = 5 * HOUR,

  // Integrated solver
  vcsp_solver_timeout_sec: f64 = 900.0,
  vcsp_rounds: usize = 10,
  vcsp_vh_its_init: usize = 10,
  vcsp_vh_its_round: usize = 10,
  vcsp_cr_its_init: usize = 10,
  vcsp_cr_its_round: usize = 10,
  vcsp_max_tasks_during: usize = 40_000,
  vcsp_max_duties_during: usize = 40_000,
  vcsp_vh_cstr_slack: bool = true,
  vcsp_cr_max_cstr_slack: bool = true,
  /// Makes the crew regulation rows of the final solve hard.  Unset, they take unbounded
  /// penalised slack.
  vcsp_cr_oth_cstr_slack: bool = false,
  /// Every n-th known block is used as the base of a block extension, 0 disables
  vcsp_block_per_x_add: usize = 10,
  vcsp_nonnegative_rc_vsp: bool = true,
  vcsp_nonnegative_rc_csp: bool = true,
  vcsp_slack_in_final_obj: bool = false,

  // Subgradient method
  lagrange_pi_start: f64 = 2.0,
  lagrange_pi_end: f64 = 0.001,
  lagrange_pi_cooling: f64 = 0.5,
  /// Non-improving iterations before `pi` is cooled
  lagrange_n: usize = 30,
  lagrange_disrupt_rounds: usize = 2,
  lagrange_disrupt_lwr: f64 = 0.8,
  lagrange_disrupt_upr: f64 = 1.2,
}

impl Config {
  /// Applies every recognised `Field: Value` line of `dump` on top of `self`.
  ///
  /// Unknown fields and malformed lines are skipped, values that fail to parse are logged and
  /// leave the field untouched.  Returns the number of fields which were set.
  pub fn load_partial_dump(&mut self, dump: &str) -> usize {
    let mut applied = 0;
    for line in dump.lines() {
      let (name, value) = match line.split_once(':') {
        Some((n, v)) => (n.trim(), v.trim()),
        None => continue,
      };
      match self.set_field(name, value) {
        Ok(true) => applied += 1,
        Ok(false) => debug!(field = name, "unknown config field, skipping"),
        Err(e) => warn!(field = name, value, err = %e, "unable to parse config value, skipping"),
      }
    }
    applied
  }

  pub fn from_dump_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
      .with_context(|| format!("unable to read config file {:?}", path))?;
    let mut cfg = Config::default();
    cfg.load_partial_dump(&contents);
    cfg.validate()?;
    Ok(cfg)
  }

  pub fn write_dump(&self, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    std::fs::write(path, self.dump()).with_context(|| format!("unable to write config dump {:?}", path))?;
    Ok(())
  }

  /// Upper bound of the slack on the fleet ceiling in the final solve.
  pub fn vehicle_slack_ub(&self) -> f64 {
    if self.vcsp_vh_cstr_slack { f64::INFINITY } else { 0.0 }
  }

  /// Upper bound of the slack on the duty ceiling in the final solve.
  pub fn duty_slack_ub(&self) -> f64 {
    if self.vcsp_cr_max_cstr_slack { f64::INFINITY } else { 0.0 }
  }

  /// Upper bound of the slack on each crew regulation row in the final solve.
  pub fn regulation_slack_ub(&self) -> f64 {
    if self.vcsp_cr_oth_cstr_slack { 0.0 } else { f64::INFINITY }
  }

  pub fn validate(&self) -> Result<()> {
    anyhow::ensure!(self.lagrange_pi_end > 0.0 && self.lagrange_pi_end <= self.lagrange_pi_start,
      "lagrange_pi_end must be in (0, lagrange_pi_start]");
    anyhow::ensure!((0.0..1.0).contains(&self.lagrange_pi_cooling), "lagrange_pi_cooling must be in [0, 1)");
    anyhow::ensure!(self.lagrange_disrupt_lwr < self.lagrange_disrupt_upr, "disruption band is empty");
    anyhow::ensure!(self.threads > 0, "at least one thread is required");
    anyhow::ensure!(self.vsp_instances_per_it > 0 && self.csp_instances_per_it > 0, "at least one pricing instance per iteration is required");
    anyhow::ensure!(self.grb_target_gap >= 0.0, "grb_target_gap must be non-negative");
    anyhow::ensure!(self.csp_ls_g_ending_t > 0.0 && self.csp_ls_g_ending_t <= self.csp_ls_g_starting_t,
      "csp_ls_g_ending_t must be in (0, csp_ls_g_starting_t]");
    anyhow::ensure!(self.csp_ls_g_cooling_rate > 0.0 && self.csp_ls_g_cooling_rate < 1.0, "csp_ls_g_cooling_rate must be in (0, 1)");
    anyhow::ensure!(self.csp_ls_g_move_range + self.csp_ls_g_move_single + self.csp_ls_g_swap_tails > 0.0,
      "local search needs at least one move with positive weight");
    Ok(())
  }
}
