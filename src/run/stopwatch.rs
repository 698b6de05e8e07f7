use std::time::Instant;

#[derive(Debug, Clone)]
enum State {
  Stopped,
  Running(String, Instant),
}

/// Named, back-to-back laps of wall-clock time.
#[derive(Debug, Clone)]
pub struct Stopwatch {
  // lap times in milliseconds
  laps: Vec<(String, u128)>,
  state: State,
}

impl Default for Stopwatch {
  fn default() -> Self {
    Stopwatch::new()
  }
}

impl Stopwatch {
  pub fn new() -> Self {
    Stopwatch {
      laps: Default::default(),
      state: State::Stopped,
    }
  }

  pub fn is_running(&self) -> bool {
    matches!(self.state, State::Running(..))
  }

  /// Starts a lap, closing the running one if there is one.
  pub fn start(&mut self, name: String) {
    self.lap(name)
  }

  /// Closes the running lap.  Does nothing if the stopwatch is stopped.
  pub fn stop(&mut self) {
    if let State::Running(name, start) = std::mem::replace(&mut self.state, State::Stopped) {
      self.laps.push((name, start.elapsed().as_millis()));
    }
  }

  pub fn lap(&mut self, new_lap_name: String) {
    let t = Instant::now();
    let old_state = std::mem::replace(&mut self.state, State::Running(new_lap_name, t));
    if let State::Running(name, start_t) = old_state {
      self.laps.push((name, t.duration_since(start_t).as_millis()));
    }
  }

  /// Returns all laps in milliseconds, closing the running one.
  pub fn into_laps(mut self) -> Vec<(String, u128)> {
    self.stop();
    self.laps
  }

  pub fn laps(&self) -> &[(String, u128)] {
    &self.laps
  }
}

/// Prints a lap table to stdout.
pub fn print_laps(laps: &[(String, u128)]) {
  let mut total = 0.0;
  println!("{:>20}  {:>12}", "Component", "Time (s)");
  for (name, time) in laps {
    let t = (*time as f64) / 1_000.0;
    total += t;
    println!("{:>20}  {:12.2}", name, t);
  }
  println!("{:>20}  {:>12.2}", "[total]", total);
}
