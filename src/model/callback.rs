use crate::config::Config;
use grb::callback::{Callback, CbResult, Where};
use std::time::Instant;
use tracing::{debug, info};

/// Relative gap as Gurobi reports it, `None` while either value is infinite.
pub fn relative_gap(best: f64, bound: f64) -> Option<f64> {
  if best.abs() >= grb::INFINITY || bound.abs() >= grb::INFINITY || !best.is_finite() || !bound.is_finite() {
    return None;
  }
  if best == 0.0 {
    return if bound == 0.0 { Some(0.0) } else { None };
  }
  Some((best - bound).abs() / best.abs())
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Decision {
  Continue,
  Extend(f64),
  Stop,
}

/// Stops the MIP at a soft time limit, unless the gap is still above target, in which case the
/// limit is pushed back in steps up to a hard ceiling.  The model's own time limit should be set
/// to the ceiling.
pub struct GapTimeExtender {
  start: Instant,
  soft_limit: f64,
  max_limit: f64,
  step: f64,
  target_gap: f64,
  extend: bool,
  pub best: f64,
  pub bound: f64,
  pub extensions: usize,
  pub terminated: bool,
}

impl GapTimeExtender {
  pub fn new(time_limit: f64, cfg: &Config) -> Self {
    GapTimeExtender {
      start: Instant::now(),
      soft_limit: time_limit,
      max_limit: cfg.grb_max_extended_time.max(time_limit),
      step: cfg.grb_extension_step,
      target_gap: cfg.grb_target_gap,
      extend: cfg.grb_extend_time,
      best: grb::INFINITY,
      bound: -grb::INFINITY,
      extensions: 0,
      terminated: false,
    }
  }

  /// Hard ceiling for the solver's own time limit.
  pub fn hard_limit(&self) -> f64 {
    if self.extend { self.max_limit } else { self.soft_limit }
  }

  pub fn decide(&mut self, runtime: f64, best: f64, bound: f64) -> Decision {
    if best.abs() < grb::INFINITY {
      self.best = best;
    }
    if bound.abs() < grb::INFINITY {
      self.bound = bound;
    }
    if runtime < self.soft_limit {
      return Decision::Continue;
    }
    match relative_gap(self.best, self.bound) {
      Some(gap) if self.extend && gap > self.target_gap && self.soft_limit < self.max_limit => {
        self.soft_limit = (self.soft_limit + self.step).min(self.max_limit);
        self.extensions += 1;
        Decision::Extend(self.soft_limit)
      }
      _ => Decision::Stop,
    }
  }
}

impl Callback for GapTimeExtender {
  fn callback(&mut self, w: Where) -> CbResult {
    match w {
      Where::MIP(ctx) => {
        let runtime = self.start.elapsed().as_secs_f64();
        match self.decide(runtime, ctx.obj_best()?, ctx.obj_bnd()?) {
          Decision::Continue => {}
          Decision::Extend(limit) => info!(limit, gap = ?relative_gap(self.best, self.bound), "extending time limit"),
          Decision::Stop => {
            if !self.terminated {
              debug!(runtime, "time limit reached, terminating");
              self.terminated = true;
              ctx.terminate();
            }
          }
        }
      }
      Where::Message(ctx) => {
        let msg = ctx.message()?;
        let msg = msg.trim_end();
        if !msg.is_empty() {
          debug!(target: "gurobi", "{}", msg);
        }
      }
      _ => {}
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn gap_skips_infinite_values() {
    assert_eq!(relative_gap(grb::INFINITY, 10.0), None);
    assert_eq!(relative_gap(10.0, -grb::INFINITY), None);
    assert_eq!(relative_gap(f64::NAN, 1.0), None);
    assert!((relative_gap(100.0, 90.0).unwrap() - 0.1).abs() < 1e-12);
  }

  #[test]
  fn extends_while_gap_is_large() {
    let mut cfg = Config::default();
    cfg.grb_extend_time = true;
    cfg.grb_extension_step = 10.0;
    cfg.grb_max_extended_time = 25.0;
    cfg.grb_target_gap = 0.01;
    let mut cb = GapTimeExtender::new(10.0, &cfg);
    assert_eq!(cb.hard_limit(), 25.0);
    assert_eq!(cb.decide(5.0, 100.0, 50.0), Decision::Continue);
    assert_eq!(cb.decide(10.0, 100.0, 50.0), Decision::Extend(20.0));
    assert_eq!(cb.decide(20.0, 100.0, 50.0), Decision::Extend(25.0));
    assert_eq!(cb.decide(25.0, 100.0, 50.0), Decision::Stop);
    assert_eq!(cb.extensions, 2);
  }

  #[test]
  fn stops_without_incumbent_or_when_gap_closed() {
    let mut cfg = Config::default();
    cfg.grb_extend_time = true;
    let mut cb = GapTimeExtender::new(10.0, &cfg);
    assert_eq!(cb.decide(11.0, grb::INFINITY, 3.0), Decision::Stop);
    assert_eq!(cb.decide(11.0, 100.0, 99.99), Decision::Stop);

    cfg.grb_extend_time = false;
    let mut cb = GapTimeExtender::new(10.0, &cfg);
    assert_eq!(cb.hard_limit(), 10.0);
    assert_eq!(cb.decide(11.0, 100.0, 10.0), Decision::Stop);
  }
}
