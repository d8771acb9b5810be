//! Plant record: the per-plant configuration and hardware ownership that the
//! rest of the engine operates on.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::error::{EngineError, EngineResult};
use crate::scheduler::ScheduleEntry;
use crate::sensor::SensorDriver;
use crate::valve::Valve;

/// Discrete emitter flow rates the cloud may select for a plant's dripper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DripperType {
    OneLPerHour,
    TwoLPerHour,
    FourLPerHour,
    EightLPerHour,
}

impl DripperType {
    pub fn flow_rate_l_per_s(self) -> f64 {
        let l_per_h = match self {
            DripperType::OneLPerHour => 1.0,
            DripperType::TwoLPerHour => 2.0,
            DripperType::FourLPerHour => 4.0,
            DripperType::EightLPerHour => 8.0,
        };
        l_per_h / 3600.0
    }

    pub fn from_code(code: &str) -> EngineResult<Self> {
        match code {
            "1Lh" | "1" | "one_l_per_hour" => Ok(DripperType::OneLPerHour),
            "2Lh" | "2" | "two_l_per_hour" => Ok(DripperType::TwoLPerHour),
            "4Lh" | "4" | "four_l_per_hour" => Ok(DripperType::FourLPerHour),
            "8Lh" | "8" | "eight_l_per_hour" => Ok(DripperType::EightLPerHour),
            other => Err(EngineError::InvalidArgument(format!(
                "unknown dripper type '{other}'"
            ))),
        }
    }
}

/// A plant's day-of-week + time-of-day irrigation schedule. Owned by the
/// plant; destroyed when the plant is removed or replaced on update.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub entries: Vec<ScheduleEntry>,
}

pub struct Plant {
    pub plant_id: i64,
    pub desired_moisture: f64,
    pub water_limit_liters: f64,
    pub dripper_type: DripperType,
    pub pipe_diameter: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub valve: Arc<Valve>,
    pub sensor: Arc<SensorDriver>,
    pub schedule: Option<Schedule>,
    pub last_irrigation_time: Option<OffsetDateTime>,
}

impl Plant {
    pub fn dripper_flow_rate_l_per_s(&self) -> f64 {
        self.dripper_type.flow_rate_l_per_s()
    }

    pub fn validate_params(desired_moisture: f64, water_limit_liters: f64) -> EngineResult<()> {
        if !(0.0..=100.0).contains(&desired_moisture) {
            return Err(EngineError::InvalidArgument(format!(
                "desired_moisture {desired_moisture} out of range [0,100]"
            )));
        }
        if water_limit_liters <= 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "water_limit_liters {water_limit_liters} must be > 0"
            )));
        }
        Ok(())
    }
}
