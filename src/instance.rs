//! The immutable problem data: locations, the timetable, deadhead templates and the vehicle type.
//!
//! Reading operator files is not this crate's business; an [`Instance`] is built from already
//! parsed vectors (or from the JSON form accepted by the binary) and validated once.
use crate::{Map, Result, Time};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub type LocIdx = usize;
pub type TripIdx = usize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
  pub id: String,
  #[serde(default)]
  pub index: LocIdx,
  #[serde(default)]
  pub sign_on_time: Time,
  #[serde(default)]
  pub sign_off_time: Time,
  #[serde(default)]
  pub handover_allowed: bool,
  #[serde(default)]
  pub break_allowed: bool,
  /// Part of an idle period at this location which does not count as break time
  #[serde(default)]
  pub brutto_netto: Time,
  #[serde(default)]
  pub is_depot: bool,
  #[serde(default)]
  pub can_charge: bool,
}

impl Location {
  /// Minimum idle time at this location for a crew handover.
  #[inline]
  pub fn handover_time(&self) -> Time {
    self.sign_on_time.max(self.sign_off_time)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
  pub id: String,
  #[serde(default)]
  pub index: TripIdx,
  pub from: LocIdx,
  pub to: LocIdx,
  pub start_time: Time,
  pub end_time: Time,
  /// Metres
  pub distance: f64,
}

impl Trip {
  #[inline]
  pub fn duration(&self) -> Time {
    self.end_time - self.start_time
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadheadTemplate {
  pub from: LocIdx,
  pub to: LocIdx,
  pub duration: Time,
  pub distance: f64,
}

/// Battery quantities are percentages of `capacity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleType {
  pub id: String,
  /// kWh
  pub capacity: f64,
  /// SoC used per metre driven
  pub drive_usage: f64,
  /// SoC used per second idle
  #[serde(default)]
  pub idle_usage: f64,
  /// SoC gained per second spent charging
  #[serde(default)]
  pub charge_rate: f64,
  #[serde(default)]
  pub min_soc: f64,
  #[serde(default = "full_soc")]
  pub max_soc: f64,
  #[serde(default = "full_soc")]
  pub start_soc: f64,
}

fn full_soc() -> f64 { 100.0 }

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstanceData {
  locations: Vec<Location>,
  trips: Vec<Trip>,
  deadheads: Vec<DeadheadTemplate>,
  vehicle_type: VehicleType,
}

#[derive(Debug, Clone)]
pub struct Instance {
  pub locations: Vec<Location>,
  pub trips: Vec<Trip>,
  pub deadheads: Vec<DeadheadTemplate>,
  pub vehicle_type: VehicleType,
  pub depot: LocIdx,
  deadhead_lookup: Map<(LocIdx, LocIdx), usize>,
}

impl Instance {
  /// Assigns every location and trip its position as index, and checks references and times.
  pub fn new(
    mut locations: Vec<Location>,
    mut trips: Vec<Trip>,
    deadheads: Vec<DeadheadTemplate>,
    vehicle_type: VehicleType,
  ) -> Result<Self> {
    for (i, l) in locations.iter_mut().enumerate() {
      l.index = i;
    }
    for (i, t) in trips.iter_mut().enumerate() {
      t.index = i;
      if t.from >= locations.len() || t.to >= locations.len() {
        bail!("trip {} references an unknown location", t.id);
      }
      if t.end_time < t.start_time {
        bail!("trip {} ends before it starts", t.id);
      }
    }

    let depot = match locations.iter().position(|l| l.is_depot) {
      Some(d) => d,
      None => bail!("instance has no depot"),
    };

    let mut deadhead_lookup = Map::default();
    for (i, dh) in deadheads.iter().enumerate() {
      if dh.from >= locations.len() || dh.to >= locations.len() {
        bail!("deadhead template {} references an unknown location", i);
      }
      deadhead_lookup.insert((dh.from, dh.to), i);
    }

    if vehicle_type.min_soc > vehicle_type.start_soc || vehicle_type.start_soc > vehicle_type.max_soc {
      bail!("vehicle type {} has inconsistent SoC limits", vehicle_type.id);
    }

    Ok(Instance { locations, trips, deadheads, vehicle_type, depot, deadhead_lookup })
  }

  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).with_context(|| format!("unable to open instance {:?}", path))?;
    let data: InstanceData = serde_json::from_reader(std::io::BufReader::new(file))
      .with_context(|| format!("unable to parse instance {:?}", path))?;
    Instance::new(data.locations, data.trips, data.deadheads, data.vehicle_type)
  }

  pub fn deadhead(&self, from: LocIdx, to: LocIdx) -> Option<&DeadheadTemplate> {
    self.deadhead_lookup.get(&(from, to)).map(|&i| &self.deadheads[i])
  }

  /// Travel duration and distance between two locations.  Staying put is free even without an
  /// explicit self-loop template.
  pub fn travel(&self, from: LocIdx, to: LocIdx) -> Option<(Time, f64)> {
    match self.deadhead(from, to) {
      Some(dh) => Some((dh.duration, dh.distance)),
      None if from == to => Some((0, 0.0)),
      None => None,
    }
  }

  pub fn location(&self, l: LocIdx) -> &Location {
    &self.locations[l]
  }
}
