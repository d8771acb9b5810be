//! Task Registry: the per-plant at-most-one-task store (§4.6). Gives the
//! engine its "busy" semantics and the shared cancellation/grace-period
//! contract between smart irrigation and timed-open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::warn;

use crate::algorithm::{self, AlgorithmParams, CancelHandle, RunContext};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventSink, ResultEvent, TimedOpenOutcome};
use crate::valve::Valve;

/// How a running task was started. Kept distinct from the algorithm's own
/// `IrrigationOutcome` so a diagnostics snapshot can tell a smart run from a
/// timed-open without inspecting the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    ManualSmart,
    ManualTimedOpen,
    Scheduled,
}

struct RunningTask {
    session_id: String,
    cancel: CancelHandle,
    start_time: OffsetDateTime,
    mode: TaskMode,
}

#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub session_id: String,
    pub mode: TaskMode,
    pub start_time: OffsetDateTime,
}

/// `plant_id -> RunningTask`, invariant `|tasks_for(plant_id)| <= 1` (P1, P3).
pub struct TaskRegistry {
    tasks: Mutex<HashMap<i64, RunningTask>>,
    session_counter: AtomicU64,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        TaskRegistry {
            tasks: Mutex::new(HashMap::new()),
            session_counter: AtomicU64::new(0),
        }
    }

    fn next_session_id(&self, plant_id: i64) -> String {
        let n = self.session_counter.fetch_add(1, Ordering::Relaxed);
        format!("sess-{plant_id}-{n}")
    }

    pub async fn is_running(&self, plant_id: i64) -> bool {
        self.tasks.lock().await.contains_key(&plant_id)
    }

    pub async fn snapshot(&self, plant_id: i64) -> Option<TaskSnapshot> {
        self.tasks.lock().await.get(&plant_id).map(|t| TaskSnapshot {
            session_id: t.session_id.clone(),
            mode: t.mode,
            start_time: t.start_time,
        })
    }

    /// Remove the registered entry for `plant_id`, but only if it is still
    /// the session that's finishing — guards against a cancel-timeout path
    /// racing a natural completion.
    async fn finish(&self, plant_id: i64, session_id: &str) {
        let mut tasks = self.tasks.lock().await;
        if tasks.get(&plant_id).is_some_and(|t| t.session_id == session_id) {
            tasks.remove(&plant_id);
        }
    }

    /// Start the smart-irrigation algorithm for `plant_id`. Fails with
    /// `Busy` if a task of either mode is already registered (P1).
    pub async fn start_irrigation(
        self: &Arc<Self>,
        plant_id: i64,
        mode: TaskMode,
        mut ctx: RunContext,
        params: AlgorithmParams,
        sink: Arc<dyn EventSink>,
    ) -> EngineResult<String> {
        let session_id = self.next_session_id(plant_id);
        ctx.session_id = session_id.clone();
        let cancel = CancelHandle::new();

        {
            let mut tasks = self.tasks.lock().await;
            if tasks.contains_key(&plant_id) {
                return Err(EngineError::Busy);
            }
            tasks.insert(
                plant_id,
                RunningTask {
                    session_id: session_id.clone(),
                    cancel: cancel.clone(),
                    start_time: OffsetDateTime::now_utc(),
                    mode,
                },
            );
        }

        let registry = self.clone();
        let session_for_task = session_id.clone();

        tokio::spawn(async move {
            let outcome = algorithm::run_irrigation(ctx, &params, &cancel, sink.as_ref()).await;
            registry.finish(plant_id, &session_for_task).await;
            algorithm::deliver_result(sink.as_ref(), plant_id, session_for_task, outcome);
        });

        Ok(session_id)
    }

    /// Open the valve, register a single-shot task whose body is a
    /// cancellable sleep for `minutes`, then close (§4.6 timed-open).
    pub async fn start_timed_open(
        self: &Arc<Self>,
        plant_id: i64,
        minutes: f64,
        valve: Arc<Valve>,
        sink: Arc<dyn EventSink>,
    ) -> EngineResult<String> {
        let session_id = self.next_session_id(plant_id);
        let cancel = CancelHandle::new();

        {
            let mut tasks = self.tasks.lock().await;
            if tasks.contains_key(&plant_id) {
                return Err(EngineError::Busy);
            }
            tasks.insert(
                plant_id,
                RunningTask {
                    session_id: session_id.clone(),
                    cancel: cancel.clone(),
                    start_time: OffsetDateTime::now_utc(),
                    mode: TaskMode::ManualTimedOpen,
                },
            );
        }

        if let Err(e) = valve.request_open().await {
            // The running body never started; roll the slot back immediately.
            self.tasks.lock().await.remove(&plant_id);
            return Err(e);
        }

        let registry = self.clone();
        let session_for_task = session_id.clone();
        let duration = Duration::from_secs_f64((minutes * 60.0).max(0.0));

        tokio::spawn(async move {
            let cancelled = cancel.cancellable_sleep(duration).await;
            let close_result = valve.request_close().await;
            if close_result.is_err() {
                let _ = valve.force_close().await;
            }
            registry.finish(plant_id, &session_for_task).await;

            let outcome = if close_result.is_err() {
                TimedOpenOutcome::Error
            } else if cancelled {
                TimedOpenOutcome::Cancelled {
                    minutes,
                    elapsed_secs: duration.as_secs_f64(),
                }
            } else {
                TimedOpenOutcome::Completed { minutes }
            };
            sink.emit_result(ResultEvent {
                plant_id,
                session_id: session_for_task,
                outcome: outcome.into(),
                ts: OffsetDateTime::now_utc(),
            });
        });

        Ok(session_id)
    }

    /// Signal cancellation and wait up to `grace` for the task to unwind on
    /// its own. On timeout, force-close the valve directly and mark the
    /// task terminated (P6).
    pub async fn cancel(&self, plant_id: i64, valve: &Valve, grace: Duration) -> EngineResult<()> {
        let cancel = {
            let tasks = self.tasks.lock().await;
            match tasks.get(&plant_id) {
                Some(t) => t.cancel.clone(),
                None => {
                    return Err(EngineError::Internal(format!(
                        "plant {plant_id} has no running task"
                    )))
                }
            }
        };
        cancel.cancel();

        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        loop {
            if !self.is_running(plant_id).await {
                return Ok(());
            }
            tokio::select! {
                _ = &mut deadline => {
                    warn!(plant_id, "cancellation grace period elapsed; forcing valve closed");
                    let _ = valve.force_close().await;
                    self.tasks.lock().await.remove(&plant_id);
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelEventSink;
    use crate::relay::{RelayConfig, RelayDriver};
    use crate::sensor::{SensorConfig, SensorDriver};

    fn test_valve(id: u8) -> Arc<Valve> {
        let relay = Arc::new(RelayDriver::open(RelayConfig::default(), true));
        Arc::new(Valve::new(id, relay))
    }

    fn test_sensor(port: &str, start: f64) -> Arc<SensorDriver> {
        let sensor = SensorDriver::new(SensorConfig {
            port: port.to_string(),
            modbus_slave_id: 1,
            simulation_mode: true,
        });
        sensor.set_simulated_moisture(start);
        Arc::new(sensor)
    }

    fn fast_params() -> AlgorithmParams {
        AlgorithmParams {
            water_per_pulse_l: 0.03,
            pause_between_pulses: Duration::from_millis(5),
            overwater_margin_pp: 10.0,
            overwater_age_threshold: Duration::from_secs(24 * 3600),
        }
    }

    #[tokio::test]
    async fn second_irrigate_while_running_is_busy() {
        let registry = Arc::new(TaskRegistry::new());
        let valve = test_valve(1);
        let sensor = test_sensor("P1", 10.0);
        let (sink, _rx) = ChannelEventSink::new();
        let sink: Arc<dyn EventSink> = Arc::new(sink);

        // Very slow flow rate so the pulse never completes before we check busy.
        let ctx = RunContext {
            plant_id: 1,
            session_id: String::new(),
            target: 90.0,
            water_limit: 5.0,
            flow_rate_l_per_s: 0.0001,
            plant_last_irrigation_age: None,
            valve: valve.clone(),
            sensor,
        };

        registry
            .start_irrigation(1, TaskMode::ManualSmart, ctx, fast_params(), sink.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.is_running(1).await);

        let sensor2 = test_sensor("P1", 10.0);
        let ctx2 = RunContext {
            plant_id: 1,
            session_id: String::new(),
            target: 90.0,
            water_limit: 5.0,
            flow_rate_l_per_s: 0.0001,
            plant_last_irrigation_age: None,
            valve: valve.clone(),
            sensor: sensor2,
        };
        let err = registry
            .start_irrigation(1, TaskMode::ManualSmart, ctx2, fast_params(), sink)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Busy);
    }

    #[tokio::test]
    async fn cancel_unwinds_task_and_closes_valve_within_grace() {
        let registry = Arc::new(TaskRegistry::new());
        let valve = test_valve(1);
        let sensor = test_sensor("P1", 10.0);
        let (sink, _rx) = ChannelEventSink::new();
        let sink: Arc<dyn EventSink> = Arc::new(sink);

        let ctx = RunContext {
            plant_id: 1,
            session_id: String::new(),
            target: 90.0,
            water_limit: 5.0,
            flow_rate_l_per_s: 0.001,
            plant_last_irrigation_age: None,
            valve: valve.clone(),
            sensor,
        };

        registry
            .start_irrigation(1, TaskMode::ManualSmart, ctx, fast_params(), sink)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        registry
            .cancel(1, &valve, Duration::from_secs(2))
            .await
            .unwrap();

        assert!(!registry.is_running(1).await);
        assert!(!valve.is_open().await);
    }

    #[tokio::test]
    async fn cancel_with_no_running_task_is_an_error() {
        let registry = TaskRegistry::new();
        let valve = test_valve(1);
        let err = registry
            .cancel(99, &valve, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    #[tokio::test]
    async fn timed_open_completes_and_closes_valve() {
        let registry = Arc::new(TaskRegistry::new());
        let valve = test_valve(1);
        let (sink, mut rx) = ChannelEventSink::new();
        let sink: Arc<dyn EventSink> = Arc::new(sink);

        registry
            .start_timed_open(1, 1.0 / 6000.0, valve.clone(), sink)
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), rx.result_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result.outcome,
            crate::events::TaskOutcome::TimedOpen(TimedOpenOutcome::Completed { .. })
        ));
        assert!(!valve.is_open().await);
        assert!(!registry.is_running(1).await);
    }

    #[tokio::test]
    async fn timed_open_reports_error_outcome_and_force_closes_when_close_fails() {
        let registry = Arc::new(TaskRegistry::new());
        let valve = test_valve(1);
        let (sink, mut rx) = ChannelEventSink::new();
        let sink: Arc<dyn EventSink> = Arc::new(sink);

        registry
            .start_timed_open(1, 1.0 / 6000.0, valve.clone(), sink)
            .await
            .unwrap();
        // Block mid-run so the task's own `request_close` fails and it must
        // fall back to `force_close`.
        valve.block().await;

        let result = tokio::time::timeout(Duration::from_secs(2), rx.result_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            result.outcome,
            crate::events::TaskOutcome::TimedOpen(TimedOpenOutcome::Error)
        );
        assert!(!valve.is_open().await);
        assert!(!registry.is_running(1).await);
    }

    #[tokio::test]
    async fn timed_open_busy_while_irrigation_running() {
        let registry = Arc::new(TaskRegistry::new());
        let valve = test_valve(1);
        let sensor = test_sensor("P1", 10.0);
        let (sink, _rx) = ChannelEventSink::new();
        let sink: Arc<dyn EventSink> = Arc::new(sink);

        let ctx = RunContext {
            plant_id: 1,
            session_id: String::new(),
            target: 90.0,
            water_limit: 5.0,
            flow_rate_l_per_s: 0.001,
            plant_last_irrigation_age: None,
            valve: valve.clone(),
            sensor,
        };
        registry
            .start_irrigation(1, TaskMode::ManualSmart, ctx, fast_params(), sink.clone())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = registry
            .start_timed_open(1, 1.0, valve, sink)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Busy);
    }
}
