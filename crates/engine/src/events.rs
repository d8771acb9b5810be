//! Progress-event sink abstraction. The Irrigation Algorithm emits into this
//! abstract sink rather than pushing directly onto a network socket, which
//! keeps it testable without a transport. The transport adapter is the sink's
//! one consumer (multi-producer single-consumer, per-engine).

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::warn;

use crate::algorithm::IrrigationOutcome;

/// Bounded capacity for the progress channel. Progress is best-effort; if the
/// consumer falls behind, older updates for the same plant may be dropped.
/// The terminal result is never sent on this channel.
const PROGRESS_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressStage {
    InitialCheck { initial_moisture: f64, target: f64 },
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

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub plant_id: i64,
    pub session_id: String,
    pub stage: ProgressStage,
    pub ts: OffsetDateTime,
}

/// Outcome of a timed-open run (§4.6). Shares the registry slot and
/// cancellation contract with smart irrigation but has no moisture-based
/// exit conditions of its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimedOpenOutcome {
    Completed { minutes: f64 },
    Cancelled { minutes: f64, elapsed_secs: f64 },
    Error,
}

/// The terminal outcome of either kind of per-plant task. A session always
/// ends in exactly one of these, delivered as the last event for that
/// session (P5).
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Irrigation(IrrigationOutcome),
    TimedOpen(TimedOpenOutcome),
}

impl From<IrrigationOutcome> for TaskOutcome {
    fn from(outcome: IrrigationOutcome) -> Self {
        TaskOutcome::Irrigation(outcome)
    }
}

impl From<TimedOpenOutcome> for TaskOutcome {
    fn from(outcome: TimedOpenOutcome) -> Self {
        TaskOutcome::TimedOpen(outcome)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultEvent {
    pub plant_id: i64,
    pub session_id: String,
    pub outcome: TaskOutcome,
    pub ts: OffsetDateTime,
}

/// Implemented by the transport adapter (or a test harness). `emit_progress`
/// is a non-blocking, best-effort send; `emit_result` must never be dropped.
pub trait EventSink: Send + Sync {
    fn emit_progress(&self, event: ProgressEvent);
    fn emit_result(&self, event: ResultEvent);
}

/// Channel-backed sink: progress uses a bounded `try_send` (drop-oldest on a
/// full consumer), results use an unbounded channel so the final event for a
/// session is always delivered.
pub struct ChannelEventSink {
    progress_tx: mpsc::Sender<ProgressEvent>,
    result_tx: mpsc::UnboundedSender<ResultEvent>,
}

pub struct ChannelEventReceiver {
    pub progress_rx: mpsc::Receiver<ProgressEvent>,
    pub result_rx: mpsc::UnboundedReceiver<ResultEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, ChannelEventReceiver) {
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        (
            ChannelEventSink {
                progress_tx,
                result_tx,
            },
            ChannelEventReceiver {
                progress_rx,
                result_rx,
            },
        )
    }
}

impl EventSink for ChannelEventSink {
    fn emit_progress(&self, event: ProgressEvent) {
        if let Err(e) = self.progress_tx.try_send(event) {
            warn!("progress channel full or closed, dropping update: {e}");
        }
    }

    fn emit_result(&self, event: ResultEvent) {
        if self.result_tx.send(event).is_err() {
            warn!("result channel closed — terminal response could not be delivered");
        }
    }
}
