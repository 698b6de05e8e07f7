use crate::Time;

pub const MINUTE: Time = 60;
pub const HOUR: Time = 60 * MINUTE;

/// Tolerance used when comparing reduced costs and bounds.
pub const EPS: f64 = 1e-6;

// Vehicle costs
pub const KWH_COST: f64 = 0.32;
/// Driving cost per metre.
pub const VH_M_COST: f64 = 0.000_05;
pub const MAX_STEERING_TIME: Time = 4 * HOUR;

// Crew costs
pub const CR_HOURLY_COST: f64 = 65.0;
pub const CR_BROKEN_SHIFT_COST: f64 = 20.0;
pub const CR_HARD_CONSTR_PENALTY: f64 = 100_000.0;

// Crew regulations, as fractions of all duties
pub const CR_MAX_BROKEN_SHIFTS: f64 = 0.3;
pub const CR_MAX_BETWEEN_SHIFTS: f64 = 0.1;
pub const CR_MAX_OVER_LONG_DUTY: f64 = 0.15;

pub const CR_TARGET_SHIFT_LENGTH: Time = 8 * HOUR;
pub const CR_LONG_SHIFT_LENGTH: Time = 8 * HOUR + 30 * MINUTE;
pub const CR_MAX_SHIFT_LENGTH: Time = 9 * HOUR;

// Constraint names
pub const CSTR_MAX_VEHICLES: &str = "max_vehicles";
pub const CSTR_MAX_DUTIES: &str = "max_duties";
pub const CSTR_TRIP_COVER: &str = "cover_trip";
pub const CSTR_BLOCK_COVER: &str = "cover_block";
pub const CSTR_CR_AVG_TIME: &str = "cr_overall_limited_average_length";
pub const CSTR_CR_LONG_DUTIES: &str = "cr_overall_no_excessive_length";
pub const CSTR_CR_BROKEN_DUTIES: &str = "cr_overall_max_broken";
pub const CSTR_CR_BETWEEN_DUTIES: &str = "cr_overall_max_between";
