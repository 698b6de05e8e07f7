//! Column generation and Lagrangian relaxation for integrated electric vehicle and crew
//! scheduling.
pub use anyhow::Result;
pub use fnv::FnvHashMap as Map;
pub use fnv::FnvHashSet as Set;

/// Seconds since midnight of the planning day.  Times after midnight of the next day exceed
/// `24 * HOUR`.
pub type Time = i64;

pub mod block;
pub mod colgen;
pub mod config;
pub mod constants;
pub mod cover;
pub mod crew;
pub mod instance;
pub mod lagrange;
pub mod logging;
pub mod model;
pub mod pool;
pub mod pricing;
pub mod run;
pub mod solution;
pub mod vehicle;

#[cfg(test)]
mod test;
