//! The Command Surface: the single entry point the transport adapter and the
//! scheduler both call into. Owns every plant record and the two resource
//! managers; hands work off to the Task Registry and Irrigation Algorithm.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::algorithm::{AlgorithmParams, RunContext};
use crate::error::{EngineError, EngineResult};
use crate::events::EventSink;
use crate::managers::{SensorManager, ValveManager};
use crate::messages::GardenSyncCommand;
use crate::plant::{DripperType, Plant, Schedule};
use crate::scheduler::{ScheduleEntry, ScheduleTrigger, Scheduler};
use crate::task_registry::{TaskMode, TaskRegistry};
use crate::valve::ValveStatus;

/// Default grace period the engine waits for a cancelled task to unwind on
/// its own before forcing the valve closed (P6).
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Duration of the "open" leg of `restart_valve`'s close-open-close pulse.
const RESTART_PULSE_DURATION: Duration = Duration::from_secs(2);

/// Parameters accepted by `add_plant`/`garden_sync`, shared between the two
/// entry points since a sync plant record carries the same fields plus an
/// explicit valve/sensor assignment.
pub struct NewPlantParams {
    pub plant_id: i64,
    pub desired_moisture: f64,
    pub water_limit_liters: f64,
    pub dripper_type: DripperType,
    pub schedule: Vec<ScheduleEntry>,
}

pub struct Engine {
    plants: Mutex<std::collections::HashMap<i64, Plant>>,
    /// Mirrors `plants`' key set behind a plain std mutex so the
    /// synchronous `ScheduleTrigger::plant_exists` can answer without
    /// awaiting the async plant-map lock.
    plant_ids: StdMutex<HashSet<i64>>,
    valves: Mutex<ValveManager>,
    sensors: Mutex<SensorManager>,
    tasks: Arc<TaskRegistry>,
    scheduler: Arc<Scheduler>,
    sink: Arc<dyn EventSink>,
    algorithm_params: AlgorithmParams,
    /// Per-plant command lock, created on demand. Guarantees at most one
    /// `add_plant`/`update_plant`/`remove_plant`/`garden_sync` mutation is
    /// in flight for a given plant at a time, independent of the pool-level
    /// manager mutexes.
    plant_locks: StdMutex<std::collections::HashMap<i64, Arc<Mutex<()>>>>,
}

pub struct AddPlantOutcome {
    pub valve_id: u8,
    pub sensor_port: String,
}

impl Engine {
    pub fn new(
        valves: ValveManager,
        sensors: SensorManager,
        scheduler: Arc<Scheduler>,
        sink: Arc<dyn EventSink>,
        algorithm_params: AlgorithmParams,
    ) -> Self {
        Engine {
            plants: Mutex::new(std::collections::HashMap::new()),
            plant_ids: StdMutex::new(HashSet::new()),
            valves: Mutex::new(valves),
            sensors: Mutex::new(sensors),
            tasks: Arc::new(TaskRegistry::new()),
            scheduler,
            sink,
            algorithm_params,
            plant_locks: StdMutex::new(std::collections::HashMap::new()),
        }
    }

    fn plant_lock(&self, plant_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.plant_locks.lock().unwrap();
        locks
            .entry(plant_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn grace_for(&self, _plant_id: i64) -> Duration {
        DEFAULT_CANCEL_GRACE
    }

    // -- Plant lifecycle --------------------------------------------------

    /// Assign a valve and sensor from the pools, build the plant record, and
    /// register its schedule (§4.8 ADD_PLANT).
    pub async fn add_plant(&self, params: NewPlantParams) -> EngineResult<AddPlantOutcome> {
        Plant::validate_params(params.desired_moisture, params.water_limit_liters)?;

        let _guard = self.plant_lock(params.plant_id).lock().await;
        {
            let plants = self.plants.lock().await;
            if plants.contains_key(&params.plant_id) {
                return Err(EngineError::AlreadyExists(params.plant_id));
            }
        }

        let valve = {
            let mut valves = self.valves.lock().await;
            valves.assign_any(params.plant_id)?
        };
        let sensor = match {
            let mut sensors = self.sensors.lock().await;
            sensors.assign_any(params.plant_id)
        } {
            Ok(sensor) => sensor,
            Err(e) => {
                // Roll the valve back so a failed add leaves no resource leak.
                let mut valves = self.valves.lock().await;
                let _ = valves.release(params.plant_id);
                return Err(e);
            }
        };

        let valve_id = valve.valve_id;
        let sensor_port = sensor.port().to_string();

        let plant = Plant {
            plant_id: params.plant_id,
            desired_moisture: params.desired_moisture,
            water_limit_liters: params.water_limit_liters,
            dripper_type: params.dripper_type,
            pipe_diameter: None,
            lat: None,
            lon: None,
            valve,
            sensor,
            schedule: if params.schedule.is_empty() {
                None
            } else {
                Some(Schedule { entries: params.schedule.clone() })
            },
            last_irrigation_time: None,
        };

        {
            let mut plants = self.plants.lock().await;
            plants.insert(params.plant_id, plant);
        }
        self.plant_ids.lock().unwrap().insert(params.plant_id);
        self.scheduler.set_schedule(params.plant_id, params.schedule).await;

        info!(plant_id = params.plant_id, valve_id, sensor_port = %sensor_port, "plant added");
        Ok(AddPlantOutcome { valve_id, sensor_port })
    }

    /// Update a plant's tunables in place. Valve/sensor assignment is
    /// untouched; only moisture target, water limit, dripper type, and
    /// schedule may change.
    pub async fn update_plant(
        &self,
        plant_id: i64,
        desired_moisture: Option<f64>,
        water_limit_liters: Option<f64>,
        dripper_type: Option<DripperType>,
        schedule: Option<Vec<ScheduleEntry>>,
    ) -> EngineResult<()> {
        let _guard = self.plant_lock(plant_id).lock().await;
        let mut plants = self.plants.lock().await;
        let plant = plants.get_mut(&plant_id).ok_or(EngineError::NotFound(plant_id))?;

        let new_moisture = desired_moisture.unwrap_or(plant.desired_moisture);
        let new_limit = water_limit_liters.unwrap_or(plant.water_limit_liters);
        Plant::validate_params(new_moisture, new_limit)?;

        plant.desired_moisture = new_moisture;
        plant.water_limit_liters = new_limit;
        if let Some(dt) = dripper_type {
            plant.dripper_type = dt;
        }
        if let Some(entries) = schedule.clone() {
            plant.schedule = if entries.is_empty() { None } else { Some(Schedule { entries }) };
        }
        drop(plants);

        if let Some(entries) = schedule {
            self.scheduler.set_schedule(plant_id, entries).await;
        }
        info!(plant_id, "plant updated");
        Ok(())
    }

    /// Remove a plant: force-close its valve, release both resources back to
    /// their pools, drop its schedule, and clear any in-flight task.
    pub async fn remove_plant(&self, plant_id: i64) -> EngineResult<()> {
        let _guard = self.plant_lock(plant_id).lock().await;

        if self.tasks.is_running(plant_id).await {
            let valve = {
                let plants = self.plants.lock().await;
                plants.get(&plant_id).ok_or(EngineError::NotFound(plant_id))?.valve.clone()
            };
            let _ = self.tasks.cancel(plant_id, &valve, self.grace_for(plant_id)).await;
        }

        let plant = {
            let mut plants = self.plants.lock().await;
            plants.remove(&plant_id).ok_or(EngineError::NotFound(plant_id))?
        };
        let _ = plant.valve.force_close().await;

        {
            let mut valves = self.valves.lock().await;
            let _ = valves.release(plant_id);
        }
        {
            let mut sensors = self.sensors.lock().await;
            let _ = sensors.release(plant_id);
        }
        self.plant_ids.lock().unwrap().remove(&plant_id);
        self.scheduler.remove_plant(plant_id).await;
        self.plant_locks.lock().unwrap().remove(&plant_id);

        info!(plant_id, "plant removed");
        Ok(())
    }

    // -- Moisture -----------------------------------------------------------

    pub async fn get_plant_moisture(&self, plant_id: i64) -> EngineResult<crate::sensor::SensorReading> {
        let sensor = {
            let plants = self.plants.lock().await;
            plants.get(&plant_id).ok_or(EngineError::NotFound(plant_id))?.sensor.clone()
        };
        sensor.read().await
    }

    /// Read every plant's sensor concurrently via a `JoinSet`, returning
    /// `(plant_id, Result)` pairs so one failing sensor doesn't sink the
    /// whole batch (§4.8 GET_ALL_MOISTURE).
    pub async fn get_all_moisture(&self) -> Vec<(i64, EngineResult<crate::sensor::SensorReading>)> {
        let snapshot: Vec<(i64, Arc<crate::sensor::SensorDriver>)> = {
            let plants = self.plants.lock().await;
            plants.iter().map(|(&id, p)| (id, p.sensor.clone())).collect()
        };

        let mut set = tokio::task::JoinSet::new();
        for (plant_id, sensor) in snapshot {
            set.spawn(async move { (plant_id, sensor.read().await) });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((plant_id, reading)) => results.push((plant_id, reading)),
                Err(e) => warn!("moisture read task panicked: {e}"),
            }
        }
        results
    }

    // -- Irrigation -----------------------------------------------------------

    async fn run_context(&self, plant_id: i64) -> EngineResult<RunContext> {
        let plants = self.plants.lock().await;
        let plant = plants.get(&plant_id).ok_or(EngineError::NotFound(plant_id))?;
        let age = match plant.last_irrigation_time {
            Some(t) => {
                let elapsed = OffsetDateTime::now_utc() - t;
                Some(Duration::from_secs_f64(elapsed.as_seconds_f64().max(0.0)))
            }
            None => None,
        };
        Ok(RunContext {
            plant_id,
            session_id: String::new(),
            target: plant.desired_moisture,
            water_limit: plant.water_limit_liters,
            flow_rate_l_per_s: plant.dripper_flow_rate_l_per_s(),
            plant_last_irrigation_age: age,
            valve: plant.valve.clone(),
            sensor: plant.sensor.clone(),
        })
    }

    /// Start smart irrigation for one plant (manual or scheduled). Stamps
    /// `last_irrigation_time` at acceptance, not at completion — a plant that
    /// is immediately irrigated again while a prior run is still settling
    /// should see an up-to-date age, and the stamp only gates the
    /// overwatering guard, not correctness of the outcome.
    ///
    /// A blocked valve (from a prior overwatering trip) is rejected here,
    /// synchronously, rather than left to surface from deep inside the
    /// algorithm's pulsed loop once the task has already been accepted.
    pub async fn irrigate_plant(&self, plant_id: i64, mode: TaskMode) -> EngineResult<String> {
        let ctx = self.run_context(plant_id).await?;
        if ctx.valve.is_blocked().await {
            return Err(EngineError::ValveBlocked);
        }
        {
            let mut plants = self.plants.lock().await;
            if let Some(plant) = plants.get_mut(&plant_id) {
                plant.last_irrigation_time = Some(OffsetDateTime::now_utc());
            }
        }
        self.tasks
            .start_irrigation(plant_id, mode, ctx, self.algorithm_params, self.sink.clone())
            .await
    }

    pub async fn stop_irrigation(&self, plant_id: i64) -> EngineResult<()> {
        let valve = {
            let plants = self.plants.lock().await;
            plants.get(&plant_id).ok_or(EngineError::NotFound(plant_id))?.valve.clone()
        };
        self.tasks.cancel(plant_id, &valve, self.grace_for(plant_id)).await
    }

    // -- Manual valve control -------------------------------------------------

    pub async fn open_valve(&self, plant_id: i64, minutes: f64) -> EngineResult<String> {
        if minutes <= 0.0 {
            return Err(EngineError::InvalidArgument("minutes must be > 0".into()));
        }
        let valve = {
            let plants = self.plants.lock().await;
            plants.get(&plant_id).ok_or(EngineError::NotFound(plant_id))?.valve.clone()
        };
        self.tasks.start_timed_open(plant_id, minutes, valve, self.sink.clone()).await
    }

    pub async fn close_valve(&self, plant_id: i64) -> EngineResult<()> {
        let valve = {
            let plants = self.plants.lock().await;
            plants.get(&plant_id).ok_or(EngineError::NotFound(plant_id))?.valve.clone()
        };
        if self.tasks.is_running(plant_id).await {
            self.tasks.cancel(plant_id, &valve, self.grace_for(plant_id)).await
        } else {
            valve.force_close().await
        }
    }

    /// Clear a valve's blocked latch and run a short close-open-close pulse
    /// to clear a stuck relay or mechanism, recovering from an
    /// overwatering-guard trip or a prior fault (§4.8 RESTART_VALVE).
    pub async fn restart_valve(&self, plant_id: i64) -> EngineResult<()> {
        let valve = {
            let plants = self.plants.lock().await;
            plants.get(&plant_id).ok_or(EngineError::NotFound(plant_id))?.valve.clone()
        };
        valve.unblock().await;
        valve.force_close().await?;
        valve.request_open().await?;
        tokio::time::sleep(RESTART_PULSE_DURATION).await;
        valve.force_close().await
    }

    pub async fn get_valve_status(&self, plant_id: i64) -> EngineResult<ValveStatus> {
        let valve = {
            let plants = self.plants.lock().await;
            plants.get(&plant_id).ok_or(EngineError::NotFound(plant_id))?.valve.clone()
        };
        Ok(valve.status().await)
    }

    // -- Sync -----------------------------------------------------------------

    /// Idempotently reconcile one plant record against a `GARDEN_SYNC` entry:
    /// explicit valve/sensor ids via `assign_specific` (idempotent, so a
    /// replayed sync never double-assigns — P10), schedule replaced
    /// wholesale, and an existing `last_irrigation_time` carried forward
    /// rather than reset.
    pub async fn sync_one_plant(
        &self,
        plant_id: i64,
        desired_moisture: f64,
        water_limit_liters: f64,
        dripper_type: DripperType,
        valve_id: u8,
        sensor_port: &str,
        schedule: Vec<ScheduleEntry>,
    ) -> EngineResult<()> {
        Plant::validate_params(desired_moisture, water_limit_liters)?;
        let _guard = self.plant_lock(plant_id).lock().await;

        let valve = {
            let mut valves = self.valves.lock().await;
            valves.assign_specific(plant_id, valve_id)?
        };
        let sensor = {
            let mut sensors = self.sensors.lock().await;
            sensors.assign_specific(plant_id, sensor_port)?
        };

        let preserved_last_irrigation = {
            let plants = self.plants.lock().await;
            plants.get(&plant_id).and_then(|p| p.last_irrigation_time)
        };

        let plant = Plant {
            plant_id,
            desired_moisture,
            water_limit_liters,
            dripper_type,
            pipe_diameter: None,
            lat: None,
            lon: None,
            valve,
            sensor,
            schedule: if schedule.is_empty() { None } else { Some(Schedule { entries: schedule.clone() }) },
            last_irrigation_time: preserved_last_irrigation,
        };

        {
            let mut plants = self.plants.lock().await;
            plants.insert(plant_id, plant);
        }
        self.plant_ids.lock().unwrap().insert(plant_id);
        self.scheduler.set_schedule(plant_id, schedule).await;
        Ok(())
    }

    /// Apply a decoded `GARDEN_SYNC` command: reconcile every plant in the
    /// payload via `sync_one_plant`, then prune any plant this engine holds
    /// that the payload no longer mentions (the cloud is the source of
    /// truth for garden membership). Returns one result per plant in the
    /// payload, in payload order, for the adapter to fold into per-plant
    /// `ADD_PLANT_RESPONSE`-shaped acknowledgements.
    pub async fn garden_sync(&self, cmd: GardenSyncCommand) -> Vec<(i64, EngineResult<()>)> {
        let mut synced = HashSet::new();
        let mut results = Vec::with_capacity(cmd.plants.len());

        for plant in cmd.plants {
            synced.insert(plant.plant_id);

            let result = async {
                let dripper_type = DripperType::from_code(&plant.dripper_type)?;
                let schedule = plant
                    .schedule_data
                    .as_ref()
                    .map(|data| {
                        data.irrigation_days
                            .iter()
                            .filter_map(|day| ScheduleEntry::normalize(day, &data.irrigation_time))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();

                self.sync_one_plant(
                    plant.plant_id,
                    plant.desired_moisture,
                    plant.water_limit_liters,
                    dripper_type,
                    plant.valve_id,
                    &plant.sensor_port,
                    schedule,
                )
                .await
            }
            .await;

            results.push((plant.plant_id, result));
        }

        let stale: Vec<i64> = self
            .plant_ids_snapshot()
            .await
            .into_iter()
            .filter(|id| !synced.contains(id))
            .collect();
        for plant_id in stale {
            if let Err(e) = self.remove_plant(plant_id).await {
                warn!(plant_id, "garden_sync prune failed: {e}");
            }
        }

        results
    }

    /// List plant ids currently held, for a sync pass that needs to prune
    /// plants absent from the incoming garden payload.
    pub async fn plant_ids_snapshot(&self) -> Vec<i64> {
        self.plants.lock().await.keys().copied().collect()
    }

    /// Process-shutdown sequence (§3): cancel every running task, then
    /// force-close every valve regardless of its blocked latch, so the
    /// process never exits with a valve left physically open.
    pub async fn shutdown(&self) {
        let plant_ids = self.plant_ids_snapshot().await;
        for plant_id in &plant_ids {
            if self.tasks.is_running(*plant_id).await {
                let valve = {
                    let plants = self.plants.lock().await;
                    plants.get(plant_id).map(|p| p.valve.clone())
                };
                if let Some(valve) = valve {
                    let _ = self.tasks.cancel(*plant_id, &valve, self.grace_for(*plant_id)).await;
                }
            }
        }
        let plants = self.plants.lock().await;
        for plant in plants.values() {
            if let Err(e) = plant.valve.force_close().await {
                warn!(plant_id = plant.plant_id, "shutdown force-close failed: {e}");
            }
        }
    }

    pub fn event_sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone()
    }

    pub fn task_registry(&self) -> Arc<TaskRegistry> {
        self.tasks.clone()
    }
}

/// Bridges the synchronous `ScheduleTrigger` trait the `Scheduler` ticks
/// against into the async `Engine`. `trigger_scheduled_irrigation` cannot
/// await, so it fires-and-forgets a `tokio::spawn`; errors (e.g. a plant
/// removed between the due-check and the trigger) are only logged, since
/// there is no caller left to report them to.
pub struct EngineScheduleSink {
    engine: Arc<Engine>,
}

impl EngineScheduleSink {
    pub fn new(engine: Arc<Engine>) -> Self {
        EngineScheduleSink { engine }
    }
}

impl ScheduleTrigger for EngineScheduleSink {
    fn trigger_scheduled_irrigation(&self, plant_id: i64) {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            match engine.irrigate_plant(plant_id, TaskMode::Scheduled).await {
                Ok(session_id) => info!(plant_id, session_id, "scheduled irrigation started"),
                Err(e) => warn!(plant_id, "scheduled irrigation could not start: {e}"),
            }
        });
    }

    fn plant_exists(&self, plant_id: i64) -> bool {
        self.engine.plant_ids.lock().unwrap().contains(&plant_id)
    }
}
