//! Typed error kinds surfaced across the engine's public API.

use thiserror::Error;

/// Errors produced by engine operations (command surface, algorithm, drivers).
///
/// Every variant maps onto one of the wire-level error kinds the transport
/// adapter reports back to the cloud (see [`crate::messages::ResponseStatus`]).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("plant {0} not found")]
    NotFound(i64),

    #[error("plant {0} already exists")]
    AlreadyExists(i64),

    #[error("no free {0} available")]
    PoolExhausted(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("valve is blocked")]
    ValveBlocked,

    #[error("sensor read failed: {0}")]
    SensorReadFailed(String),

    #[error("valve actuation failed: {0}")]
    ValveActuationFailed(String),

    #[error("a task is already running for this plant")]
    Busy,

    #[error("task cancelled")]
    Cancelled,

    #[error("irrigation skipped: overwatered")]
    Overwatered,

    #[error("irrigation fault: water limit reached before target")]
    Fault,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short, stable identifier for the wire `status`/`error_message` pair.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::PoolExhausted(_) => "pool_exhausted",
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::ValveBlocked => "valve_blocked",
            EngineError::SensorReadFailed(_) => "sensor_read_failed",
            EngineError::ValveActuationFailed(_) => "valve_actuation_failed",
            EngineError::Busy => "busy",
            EngineError::Cancelled => "cancelled",
            EngineError::Overwatered => "overwatered",
            EngineError::Fault => "fault",
            EngineError::Internal(_) => "internal",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_match_spec_table() {
        assert_eq!(EngineError::NotFound(1).kind(), "not_found");
        assert_eq!(EngineError::AlreadyExists(1).kind(), "already_exists");
        assert_eq!(EngineError::PoolExhausted("valve").kind(), "pool_exhausted");
        assert_eq!(
            EngineError::InvalidArgument("x".into()).kind(),
            "invalid_argument"
        );
        assert_eq!(EngineError::ValveBlocked.kind(), "valve_blocked");
        assert_eq!(
            EngineError::SensorReadFailed("x".into()).kind(),
            "sensor_read_failed"
        );
        assert_eq!(
            EngineError::ValveActuationFailed("x".into()).kind(),
            "valve_actuation_failed"
        );
        assert_eq!(EngineError::Busy.kind(), "busy");
        assert_eq!(EngineError::Cancelled.kind(), "cancelled");
        assert_eq!(EngineError::Overwatered.kind(), "overwatered");
        assert_eq!(EngineError::Fault.kind(), "fault");
        assert_eq!(EngineError::Internal("x".into()).kind(), "internal");
    }

    #[test]
    fn display_messages_are_non_empty() {
        assert!(!EngineError::Busy.to_string().is_empty());
        assert!(!EngineError::NotFound(42).to_string().is_empty());
    }
}
