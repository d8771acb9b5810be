//! Wire-level JSON envelope and typed command/response DTOs for the cloud
//! ↔ engine channel (§6). Transport framing, reconnection, and the invite
//! code auth handshake live in the binary's thin transport adapter, not
//! here — this module only defines the shapes the adapter decodes into and
//! serializes out of, so the command surface never sees raw JSON.
//!
//! Per-field key aliases (snake_case vs camelCase) are part of the wire
//! contract inherited from the source this was rewritten from and must be
//! preserved; every inbound DTO below accepts both spellings.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::algorithm::IrrigationOutcome;
use crate::error::EngineError;
use crate::events::{ProgressEvent, ProgressStage, ResultEvent, TaskOutcome, TimedOpenOutcome};

/// The envelope every message on the channel shares: `{ type, device_id, data }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub message_type: String,
    pub device_id: String,
    pub data: T,
}

pub fn wrap_outbound<T>(message_type: &str, device_id: &str, data: T) -> Envelope<T> {
    Envelope {
        message_type: message_type.to_string(),
        device_id: device_id.to_string(),
        data,
    }
}

// ---------------------------------------------------------------------------
// Inbound command payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleDataDto {
    #[serde(default, alias = "irrigationDays")]
    pub irrigation_days: Vec<String>,
    #[serde(default, alias = "irrigationTime")]
    pub irrigation_time: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddPlantCommand {
    pub plant_id: i64,
    #[serde(alias = "desiredMoisture")]
    pub desired_moisture: f64,
    #[serde(alias = "waterLimit")]
    pub water_limit_liters: f64,
    #[serde(alias = "dripperType")]
    pub dripper_type: String,
    #[serde(default, alias = "scheduleData")]
    pub schedule: Option<ScheduleDataDto>,
    #[serde(default, alias = "sensorPort")]
    pub sensor_port: Option<String>,
    #[serde(default, alias = "valveId")]
    pub valve_id: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdatePlantCommand {
    pub plant_id: i64,
    #[serde(default, alias = "desiredMoisture")]
    pub desired_moisture: Option<f64>,
    #[serde(default, alias = "waterLimit")]
    pub water_limit_liters: Option<f64>,
    #[serde(default, alias = "dripperType")]
    pub dripper_type: Option<String>,
    #[serde(default, alias = "scheduleData")]
    pub schedule: Option<ScheduleDataDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlantIdCommand {
    pub plant_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IrrigatePlantCommand {
    pub plant_id: i64,
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenValveCommand {
    pub plant_id: i64,
    pub minutes: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GardenSyncPlantDto {
    pub plant_id: i64,
    #[serde(alias = "desiredMoisture")]
    pub desired_moisture: f64,
    #[serde(alias = "waterLimit")]
    pub water_limit_liters: f64,
    #[serde(alias = "dripperType")]
    pub dripper_type: String,
    #[serde(default, alias = "scheduleData")]
    pub schedule_data: Option<ScheduleDataDto>,
    #[serde(alias = "sensorPort")]
    pub sensor_port: String,
    #[serde(alias = "valveId")]
    pub valve_id: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GardenSyncCommand {
    #[serde(default)]
    pub garden: serde_json::Value,
    pub plants: Vec<GardenSyncPlantDto>,
}

/// A decoded inbound command, ready for dispatch to the Command Surface.
#[derive(Debug, Clone)]
pub enum InboundCommand {
    Welcome,
    AddPlant(AddPlantCommand),
    UpdatePlant(UpdatePlantCommand),
    RemovePlant(PlantIdCommand),
    GetPlantMoisture(PlantIdCommand),
    GetAllMoisture,
    IrrigatePlant(IrrigatePlantCommand),
    StopIrrigation(PlantIdCommand),
    OpenValve(OpenValveCommand),
    CloseValve(PlantIdCommand),
    RestartValve(PlantIdCommand),
    GetValveStatus(PlantIdCommand),
    GardenSync(GardenSyncCommand),
}

/// Decode one raw envelope into a typed [`InboundCommand`]. The `type` field
/// selects the payload shape `data` is parsed into.
pub fn parse_inbound(raw: &str) -> Result<InboundCommand, EngineError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| EngineError::InvalidArgument(format!("malformed envelope: {e}")))?;

    let message_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| EngineError::InvalidArgument("envelope missing 'type'".into()))?;
    let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);

    let from_data = |v: serde_json::Value| {
        serde_json::from_value(v)
            .map_err(|e| EngineError::InvalidArgument(format!("malformed '{message_type}' payload: {e}")))
    };

    match message_type {
        "WELCOME" => Ok(InboundCommand::Welcome),
        "ADD_PLANT" => Ok(InboundCommand::AddPlant(from_data(data)?)),
        "UPDATE_PLANT" => Ok(InboundCommand::UpdatePlant(from_data(data)?)),
        "REMOVE_PLANT" => Ok(InboundCommand::RemovePlant(from_data(data)?)),
        "GET_PLANT_MOISTURE" => Ok(InboundCommand::GetPlantMoisture(from_data(data)?)),
        "GET_ALL_MOISTURE" => Ok(InboundCommand::GetAllMoisture),
        "IRRIGATE_PLANT" => Ok(InboundCommand::IrrigatePlant(from_data(data)?)),
        "STOP_IRRIGATION" => Ok(InboundCommand::StopIrrigation(from_data(data)?)),
        "OPEN_VALVE" => Ok(InboundCommand::OpenValve(from_data(data)?)),
        "CLOSE_VALVE" => Ok(InboundCommand::CloseValve(from_data(data)?)),
        "RESTART_VALVE" => Ok(InboundCommand::RestartValve(from_data(data)?)),
        "GET_VALVE_STATUS" => Ok(InboundCommand::GetValveStatus(from_data(data)?)),
        "GARDEN_SYNC" => Ok(InboundCommand::GardenSync(from_data(data)?)),
        other => Err(EngineError::InvalidArgument(format!(
            "unknown message type '{other}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Outbound response payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    Skipped,
    Partial,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BaseResponse {
    pub plant_id: i64,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: i64,
}

impl BaseResponse {
    pub fn success(plant_id: i64) -> Self {
        BaseResponse {
            plant_id,
            status: ResponseStatus::Success,
            error_message: None,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    /// Map an `EngineError` onto the wire `status`/`error_message` pair. The
    /// `skipped`/`overwatered`/`busy` kinds read naturally as `skipped`; every
    /// other kind is a plain `error`.
    pub fn from_error(plant_id: i64, err: &EngineError) -> Self {
        let status = match err {
            EngineError::Overwatered => ResponseStatus::Skipped,
            _ => ResponseStatus::Error,
        };
        BaseResponse {
            plant_id,
            status,
            error_message: Some(err.to_string()),
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    pub fn accepted(plant_id: i64) -> Self {
        BaseResponse {
            plant_id,
            status: ResponseStatus::InProgress,
            error_message: None,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AddPlantResponsePayload {
    #[serde(flatten)]
    pub base: BaseResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valve_id: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_port: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MoistureReadingPayload {
    pub plant_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moisture_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValveStatusPayload {
    pub plant_id: i64,
    pub valve_id: u8,
    pub is_open: bool,
    pub is_blocked: bool,
    pub description: String,
}

/// Progress stages translated onto their wire `stage` names (§6). Kept
/// separate from the internal `ProgressStage` so the algorithm's eventing
/// never has to carry serde attributes for a format it doesn't own.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum ProgressPayload {
    InitialCheck {
        initial_moisture: f64,
        target: f64,
    },
    #[serde(rename = "overwatering_check")]
    OverwateringDetected,
    Pulse {
        pulse: u32,
        moisture: f64,
        target: f64,
        total_water: f64,
        water_limit: f64,
    },
    FaultDetected,
}

impl From<&ProgressStage> for ProgressPayload {
    fn from(stage: &ProgressStage) -> Self {
        match *stage {
            ProgressStage::InitialCheck { initial_moisture, target } => {
                ProgressPayload::InitialCheck { initial_moisture, target }
            }
            ProgressStage::OverwateringDetected => ProgressPayload::OverwateringDetected,
            ProgressStage::Pulse { pulse, moisture, target, total_water, water_limit } => {
                ProgressPayload::Pulse { pulse, moisture, target, total_water, water_limit }
            }
            ProgressStage::FaultDetected => ProgressPayload::FaultDetected,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressMessage {
    pub plant_id: i64,
    pub session_id: String,
    #[serde(flatten)]
    pub payload: ProgressPayload,
    pub timestamp: i64,
}

impl From<&ProgressEvent> for ProgressMessage {
    fn from(e: &ProgressEvent) -> Self {
        ProgressMessage {
            plant_id: e.plant_id,
            session_id: e.session_id.clone(),
            payload: ProgressPayload::from(&e.stage),
            timestamp: e.ts.unix_timestamp(),
        }
    }
}

/// Terminal response for an `IRRIGATE_PLANT`/`OPEN_VALVE` session — the
/// `final_summary` the spec's outbound message list names.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResultPayload {
    #[serde(flatten)]
    pub base: BaseResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_moisture: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_moisture: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub water_added_liters: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pulses: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minutes: Option<f64>,
}

impl From<&ResultEvent> for TaskResultPayload {
    fn from(event: &ResultEvent) -> Self {
        let timestamp = event.ts.unix_timestamp();
        let plant_id = event.plant_id;
        let empty = |status: ResponseStatus, error_message: Option<String>| TaskResultPayload {
            base: BaseResponse { plant_id, status, error_message, timestamp },
            initial_moisture: None,
            final_moisture: None,
            water_added_liters: None,
            pulses: None,
            minutes: None,
        };

        match &event.outcome {
            TaskOutcome::Irrigation(IrrigationOutcome::Success {
                initial_moisture,
                final_moisture,
                water_added_liters,
                pulses,
            }) => TaskResultPayload {
                initial_moisture: Some(*initial_moisture),
                final_moisture: Some(*final_moisture),
                water_added_liters: Some(*water_added_liters),
                pulses: Some(*pulses),
                ..empty(ResponseStatus::Success, None)
            },
            TaskOutcome::Irrigation(IrrigationOutcome::Skipped { .. }) => {
                empty(ResponseStatus::Skipped, None)
            }
            TaskOutcome::Irrigation(IrrigationOutcome::Cancelled {
                initial_moisture,
                final_moisture,
                water_added_liters,
            }) => TaskResultPayload {
                initial_moisture: Some(*initial_moisture),
                final_moisture: Some(*final_moisture),
                water_added_liters: Some(*water_added_liters),
                ..empty(ResponseStatus::Partial, Some("cancelled".to_string()))
            },
            TaskOutcome::Irrigation(IrrigationOutcome::Fault {
                initial_moisture,
                final_moisture,
                water_added_liters,
                pulses,
            }) => TaskResultPayload {
                initial_moisture: Some(*initial_moisture),
                final_moisture: Some(*final_moisture),
                water_added_liters: Some(*water_added_liters),
                pulses: Some(*pulses),
                ..empty(ResponseStatus::Error, Some("fault".to_string()))
            },
            TaskOutcome::Irrigation(IrrigationOutcome::Error { error }) => {
                empty(ResponseStatus::Error, Some(error.to_string()))
            }
            TaskOutcome::TimedOpen(TimedOpenOutcome::Completed { minutes }) => TaskResultPayload {
                minutes: Some(*minutes),
                ..empty(ResponseStatus::Completed, None)
            },
            TaskOutcome::TimedOpen(TimedOpenOutcome::Cancelled { minutes, .. }) => {
                TaskResultPayload {
                    minutes: Some(*minutes),
                    ..empty(ResponseStatus::Partial, Some("cancelled".to_string()))
                }
            }
            TaskOutcome::TimedOpen(TimedOpenOutcome::Error) => {
                empty(ResponseStatus::Error, Some("valve actuation failed".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_add_plant_accepts_camel_case_aliases() {
        let raw = r#"{
            "type": "ADD_PLANT",
            "device_id": "pi-1",
            "data": {
                "plant_id": 7,
                "desiredMoisture": 60.0,
                "waterLimit": 0.5,
                "dripperType": "2Lh",
                "sensorPort": "/dev/ttyUSB0",
                "valveId": 3
            }
        }"#;
        match parse_inbound(raw).unwrap() {
            InboundCommand::AddPlant(cmd) => {
                assert_eq!(cmd.plant_id, 7);
                assert_eq!(cmd.desired_moisture, 60.0);
                assert_eq!(cmd.water_limit_liters, 0.5);
                assert_eq!(cmd.dripper_type, "2Lh");
                assert_eq!(cmd.sensor_port.as_deref(), Some("/dev/ttyUSB0"));
                assert_eq!(cmd.valve_id, Some(3));
            }
            other => panic!("expected AddPlant, got {other:?}"),
        }
    }

    #[test]
    fn parse_add_plant_accepts_snake_case() {
        let raw = r#"{
            "type": "ADD_PLANT",
            "device_id": "pi-1",
            "data": {
                "plant_id": 7,
                "desired_moisture": 60.0,
                "water_limit_liters": 0.5,
                "dripper_type": "2Lh"
            }
        }"#;
        match parse_inbound(raw).unwrap() {
            InboundCommand::AddPlant(cmd) => assert_eq!(cmd.plant_id, 7),
            other => panic!("expected AddPlant, got {other:?}"),
        }
    }

    #[test]
    fn parse_garden_sync_decodes_nested_plants() {
        let raw = r#"{
            "type": "GARDEN_SYNC",
            "device_id": "pi-1",
            "data": {
                "garden": {"name": "backyard"},
                "plants": [
                    {
                        "plant_id": 11,
                        "desiredMoisture": 55.0,
                        "waterLimit": 0.4,
                        "dripperType": "1Lh",
                        "sensorPort": "P1",
                        "valveId": 1,
                        "scheduleData": {"irrigation_days": ["mon", "wed"], "irrigation_time": "6:00"}
                    }
                ]
            }
        }"#;
        match parse_inbound(raw).unwrap() {
            InboundCommand::GardenSync(cmd) => {
                assert_eq!(cmd.plants.len(), 1);
                assert_eq!(cmd.plants[0].plant_id, 11);
                assert_eq!(cmd.plants[0].sensor_port, "P1");
                assert_eq!(cmd.plants[0].valve_id, 1);
                let sched = cmd.plants[0].schedule_data.as_ref().unwrap();
                assert_eq!(sched.irrigation_days, vec!["mon", "wed"]);
                assert_eq!(sched.irrigation_time, "6:00");
            }
            other => panic!("expected GardenSync, got {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_type_is_invalid_argument() {
        let raw = r#"{"type": "FROBNICATE", "device_id": "x", "data": {}}"#;
        let err = parse_inbound(raw).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn parse_missing_type_is_invalid_argument() {
        let raw = r#"{"device_id": "x", "data": {}}"#;
        let err = parse_inbound(raw).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let env = wrap_outbound("ADD_PLANT_RESPONSE", "pi-1", BaseResponse::success(7));
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"ADD_PLANT_RESPONSE\""));
        assert!(json.contains("\"device_id\":\"pi-1\""));
        assert!(json.contains("\"status\":\"success\""));
    }

    #[test]
    fn base_response_from_error_marks_overwatered_as_skipped() {
        let resp = BaseResponse::from_error(3, &EngineError::Overwatered);
        assert_eq!(resp.status, ResponseStatus::Skipped);
        assert!(resp.error_message.is_some());
    }

    #[test]
    fn base_response_from_error_marks_busy_as_error() {
        let resp = BaseResponse::from_error(3, &EngineError::Busy);
        assert_eq!(resp.status, ResponseStatus::Error);
    }

    #[test]
    fn progress_payload_serializes_overwatering_as_overwatering_check() {
        let payload = ProgressPayload::OverwateringDetected;
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"stage":"overwatering_check"}"#);
    }
}
