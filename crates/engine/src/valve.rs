//! Logical valve: the only type allowed to actuate a relay channel, so
//! open/closed/blocked bookkeeping can never be bypassed.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::EngineResult;
use crate::relay::RelayDriver;

#[derive(Debug, Clone)]
pub struct ValveStatus {
    pub valve_id: u8,
    pub is_open: bool,
    pub is_blocked: bool,
    pub open_time: Option<OffsetDateTime>,
    pub close_time: Option<OffsetDateTime>,
    pub last_irrigation_time: Option<OffsetDateTime>,
    pub description: String,
}

struct ValveState {
    is_open: bool,
    is_blocked: bool,
    open_time: Option<OffsetDateTime>,
    close_time: Option<OffsetDateTime>,
    last_irrigation_time: Option<Instant>,
    last_irrigation_wall: Option<OffsetDateTime>,
}

/// One relay channel, 1-indexed. Exclusively referenced by at most one Plant
/// at a time, plus transiently by the Irrigation Algorithm running for that
/// plant.
pub struct Valve {
    pub valve_id: u8,
    relay: Arc<RelayDriver>,
    state: Mutex<ValveState>,
}

impl Valve {
    pub fn new(valve_id: u8, relay: Arc<RelayDriver>) -> Self {
        Valve {
            valve_id,
            relay,
            state: Mutex::new(ValveState {
                is_open: false,
                is_blocked: false,
                open_time: None,
                close_time: None,
                last_irrigation_time: None,
                last_irrigation_wall: None,
            }),
        }
    }

    /// Fails if blocked. On success the relay is energized and open/last
    /// irrigation timestamps are stamped with a monotonic clock read taken
    /// at actuation. On relay failure, state is left unchanged.
    pub async fn request_open(&self) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        if state.is_blocked {
            return Err(crate::error::EngineError::ValveBlocked);
        }

        let relay = self.relay.clone();
        let valve_id = self.valve_id;
        tokio::task::spawn_blocking(move || relay.turn_on(valve_id))
            .await
            .map_err(|e| crate::error::EngineError::Internal(e.to_string()))??;

        let now = Instant::now();
        state.is_open = true;
        state.open_time = Some(OffsetDateTime::now_utc());
        state.last_irrigation_time = Some(now);
        state.last_irrigation_wall = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    /// Fails if blocked. Idempotent: closing an already-closed valve is not
    /// an error; the relay-off is reissued as a safety measure.
    pub async fn request_close(&self) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        if state.is_blocked {
            return Err(crate::error::EngineError::ValveBlocked);
        }

        let relay = self.relay.clone();
        let valve_id = self.valve_id;
        tokio::task::spawn_blocking(move || relay.turn_off(valve_id))
            .await
            .map_err(|e| crate::error::EngineError::Internal(e.to_string()))??;

        state.is_open = false;
        state.close_time = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    /// Force-close regardless of the blocked latch. Used by safety paths:
    /// task-cancellation grace-period timeout, `remove_plant`, fault exits.
    pub async fn force_close(&self) -> EngineResult<()> {
        let relay = self.relay.clone();
        let valve_id = self.valve_id;
        tokio::task::spawn_blocking(move || relay.turn_off(valve_id))
            .await
            .map_err(|e| crate::error::EngineError::Internal(e.to_string()))??;

        let mut state = self.state.lock().await;
        state.is_open = false;
        state.close_time = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    pub async fn block(&self) {
        self.state.lock().await.is_blocked = true;
    }

    pub async fn unblock(&self) {
        self.state.lock().await.is_blocked = false;
    }

    pub async fn is_blocked(&self) -> bool {
        self.state.lock().await.is_blocked
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.is_open
    }

    /// Time since the valve last began an irrigation pulse, via the
    /// monotonic clock. `None` if it has never opened.
    pub async fn time_since_last_irrigation(&self) -> Option<std::time::Duration> {
        let state = self.state.lock().await;
        state.last_irrigation_time.map(|t| t.elapsed())
    }

    pub async fn status(&self) -> ValveStatus {
        let state = self.state.lock().await;
        let description = format!(
            "valve {} {} {}",
            self.valve_id,
            if state.is_open { "open" } else { "closed" },
            if state.is_blocked { "(blocked)" } else { "" }
        );
        ValveStatus {
            valve_id: self.valve_id,
            is_open: state.is_open,
            is_blocked: state.is_blocked,
            open_time: state.open_time,
            close_time: state.close_time,
            last_irrigation_time: state.last_irrigation_wall,
            description,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayConfig;

    fn test_valve(id: u8) -> Valve {
        let relay = Arc::new(RelayDriver::open(RelayConfig::default(), true));
        Valve::new(id, relay)
    }

    #[tokio::test]
    async fn request_open_then_status_reports_open() {
        let valve = test_valve(1);
        valve.request_open().await.unwrap();
        assert!(valve.is_open().await);
        let status = valve.status().await;
        assert!(status.is_open);
        assert!(status.open_time.is_some());
    }

    #[tokio::test]
    async fn request_close_is_idempotent() {
        let valve = test_valve(1);
        valve.request_close().await.unwrap();
        valve.request_close().await.unwrap();
        assert!(!valve.is_open().await);
    }

    #[tokio::test]
    async fn blocked_valve_refuses_open() {
        let valve = test_valve(1);
        valve.block().await;
        let err = valve.request_open().await.unwrap_err();
        assert_eq!(err, crate::error::EngineError::ValveBlocked);
    }

    #[tokio::test]
    async fn blocked_valve_can_still_be_force_closed() {
        let valve = test_valve(1);
        valve.request_open().await.unwrap();
        valve.block().await;
        valve.force_close().await.unwrap();
        assert!(!valve.is_open().await);
    }

    #[tokio::test]
    async fn unblock_allows_open_again() {
        let valve = test_valve(1);
        valve.block().await;
        valve.unblock().await;
        assert!(valve.request_open().await.is_ok());
    }

    #[tokio::test]
    async fn time_since_last_irrigation_is_none_before_first_open() {
        let valve = test_valve(1);
        assert!(valve.time_since_last_irrigation().await.is_none());
    }
}
