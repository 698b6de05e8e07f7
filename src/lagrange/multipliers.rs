use crate::crew::RegulationTerms;
use rand::Rng;

/// Lagrange multipliers of the relaxed linking rows.
///
/// Trip multipliers price the `>= 1` trip cover rows and stay non-negative.  Block multipliers
/// price the vehicle/crew linking rows and are free.  The four regulation multipliers price the
/// crew regulations and stay non-negative.
#[derive(Debug, Clone, PartialEq)]
pub struct Multipliers {
  pub trips: Vec<f64>,
  pub blocks: Vec<f64>,
  pub avg_length: f64,
  pub long: f64,
  pub broken: f64,
  pub between: f64,
}

impl Multipliers {
  pub fn zeros(n_trips: usize, n_blocks: usize) -> Self {
    Multipliers {
      trips: vec![0.0; n_trips],
      blocks: vec![0.0; n_blocks],
      avg_length: 0.0,
      long: 0.0,
      broken: 0.0,
      between: 0.0,
    }
  }

  pub fn reset(&mut self) {
    *self = Multipliers::zeros(self.trips.len(), self.blocks.len());
  }

  /// Multiplier of a newly registered block.
  pub fn push_block(&mut self) {
    self.blocks.push(0.0);
  }

  /// Regulation price of a duty with terms `t`.
  #[inline]
  pub fn regulation_price(&self, t: &RegulationTerms) -> f64 {
    self.avg_length * t.avg_length + self.long * t.long + self.broken * t.broken + self.between * t.between
  }

  /// Adds `delta` to every regulation multiplier.
  pub fn shift_regulation(&mut self, delta: f64) {
    self.avg_length += delta;
    self.long += delta;
    self.broken += delta;
    self.between += delta;
  }

  pub fn step(&mut self, g: &Subgradient, t: f64) {
    debug_assert_eq!(g.trips.len(), self.trips.len());
    debug_assert_eq!(g.blocks.len(), self.blocks.len());
    for (m, g) in self.trips.iter_mut().zip(&g.trips) {
      *m += t * g;
    }
    for (m, g) in self.blocks.iter_mut().zip(&g.blocks) {
      *m += t * g;
    }
    self.avg_length += t * g.avg_length;
    self.long += t * g.long;
    self.broken += t * g.broken;
    self.between += t * g.between;
  }

  /// Clamps the multipliers of `>=`-type rows at zero.  Block multipliers are left alone.
  pub fn project(&mut self) {
    for m in &mut self.trips {
      *m = m.max(0.0);
    }
    self.avg_length = self.avg_length.max(0.0);
    self.long = self.long.max(0.0);
    self.broken = self.broken.max(0.0);
    self.between = self.between.max(0.0);
  }

  /// Scales every trip and block multiplier by its own factor drawn uniformly from `[lwr, upr)`.
  pub fn disrupt(&mut self, rng: &mut impl Rng, lwr: f64, upr: f64) {
    for m in self.trips.iter_mut().chain(self.blocks.iter_mut()) {
      *m *= rng.gen_range(lwr..upr);
    }
  }
}

/// A subgradient of the Lagrangian function, laid out like [`Multipliers`].
#[derive(Debug, Clone, PartialEq)]
pub struct Subgradient {
  pub trips: Vec<f64>,
  pub blocks: Vec<f64>,
  pub avg_length: f64,
  pub long: f64,
  pub broken: f64,
  pub between: f64,
}

impl Subgradient {
  pub fn norm_sq(&self) -> f64 {
    let sq = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>();
    sq(&self.trips)
      + sq(&self.blocks)
      + self.avg_length * self.avg_length
      + self.long * self.long
      + self.broken * self.broken
      + self.between * self.between
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::rngs::SmallRng;
  use rand::SeedableRng;

  fn grad() -> Subgradient {
    Subgradient {
      trips: vec![1.0, -2.0],
      blocks: vec![-1.0],
      avg_length: -1.0,
      long: 2.0,
      broken: 0.0,
      between: 0.0,
    }
  }

  #[test]
  fn step_then_project() {
    let mut m = Multipliers::zeros(2, 1);
    m.step(&grad(), 0.5);
    m.project();
    assert_eq!(m.trips, vec![0.5, 0.0]);
    assert_eq!(m.blocks, vec![-0.5]);
    assert_eq!(m.avg_length, 0.0);
    assert_eq!(m.long, 1.0);
    assert_eq!(grad().norm_sq(), 11.0);
  }

  #[test]
  fn disruption_stays_in_band() {
    let mut m = Multipliers::zeros(50, 50);
    m.trips.iter_mut().for_each(|x| *x = 10.0);
    m.blocks.iter_mut().for_each(|x| *x = -10.0);
    m.long = 3.0;
    let mut rng = SmallRng::seed_from_u64(7);
    m.disrupt(&mut rng, 0.8, 1.2);
    assert!(m.trips.iter().all(|&x| (8.0..12.0).contains(&x)));
    assert!(m.blocks.iter().all(|&x| (-12.0..=-8.0).contains(&x)));
    assert_eq!(m.long, 3.0);
  }
}
