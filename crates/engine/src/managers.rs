//! Resource Managers: the valve pool (channel ids 1..N) and the sensor pool
//! (port identifiers). Both are plain in-process structures — no
//! persistence — protected by a single engine-wide mutex held only for the
//! duration of an assignment/release (no I/O under lock).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::relay::RelayDriver;
use crate::sensor::{SensorConfig, SensorDriver};
use crate::valve::Valve;

/// Generic available/assigned partition over a pool of resource ids keyed by
/// plant id. Invariant: `available` and `assigned.values()` partition the
/// full pool with no duplicates (P2).
struct Pool<K: Clone + Eq> {
    available: VecDeque<K>,
    assigned: HashMap<i64, K>,
}

impl<K: Clone + Eq> Pool<K> {
    fn new(ids: Vec<K>) -> Self {
        Pool {
            available: ids.into_iter().collect(),
            assigned: HashMap::new(),
        }
    }

    fn assign_any(&mut self, plant_id: i64, what: &'static str) -> EngineResult<K> {
        if self.assigned.contains_key(&plant_id) {
            return Err(EngineError::AlreadyExists(plant_id));
        }
        let id = self
            .available
            .pop_front()
            .ok_or(EngineError::PoolExhausted(what))?;
        self.assigned.insert(plant_id, id.clone());
        Ok(id)
    }

    fn assign_specific(&mut self, plant_id: i64, id: K) {
        self.available.retain(|x| x != &id);
        if let Some(previous) = self.assigned.insert(plant_id, id.clone()) {
            if previous != id {
                self.available.push_back(previous);
            }
        }
    }

    fn release(&mut self, plant_id: i64) -> EngineResult<()> {
        match self.assigned.remove(&plant_id) {
            Some(id) => {
                self.available.push_back(id);
                Ok(())
            }
            None => Err(EngineError::Internal(format!(
                "release: plant {plant_id} has no assignment"
            ))),
        }
    }

    fn get(&self, plant_id: i64) -> Option<&K> {
        self.assigned.get(&plant_id)
    }

    fn available_count(&self) -> usize {
        self.available.len()
    }

    fn assigned_count(&self) -> usize {
        self.assigned.len()
    }
}

/// Owns every `Valve` for channels `1..=n` plus the assignment pool over
/// those channel ids.
pub struct ValveManager {
    pool: Pool<u8>,
    valves: HashMap<u8, Arc<Valve>>,
}

impl ValveManager {
    pub fn new(channel_count: u8, relay: Arc<RelayDriver>) -> Self {
        let ids: Vec<u8> = (1..=channel_count).collect();
        let valves = ids
            .iter()
            .map(|&id| (id, Arc::new(Valve::new(id, relay.clone()))))
            .collect();
        ValveManager {
            pool: Pool::new(ids),
            valves,
        }
    }

    pub fn assign_any(&mut self, plant_id: i64) -> EngineResult<Arc<Valve>> {
        let id = self.pool.assign_any(plant_id, "valve")?;
        Ok(self.valves[&id].clone())
    }

    pub fn assign_specific(&mut self, plant_id: i64, valve_id: u8) -> EngineResult<Arc<Valve>> {
        if !self.valves.contains_key(&valve_id) {
            return Err(EngineError::InvalidArgument(format!(
                "valve {valve_id} does not exist"
            )));
        }
        self.pool.assign_specific(plant_id, valve_id);
        Ok(self.valves[&valve_id].clone())
    }

    pub fn release(&mut self, plant_id: i64) -> EngineResult<()> {
        self.pool.release(plant_id)
    }

    pub fn get(&self, plant_id: i64) -> Option<Arc<Valve>> {
        self.pool.get(plant_id).map(|id| self.valves[id].clone())
    }

    pub fn all_channel_ids(&self) -> Vec<u8> {
        self.valves.keys().copied().collect()
    }

    pub fn available_count(&self) -> usize {
        self.pool.available_count()
    }

    pub fn assigned_count(&self) -> usize {
        self.pool.assigned_count()
    }
}

/// Owns every `SensorDriver` for the configured ports plus the assignment
/// pool over those port identifiers.
pub struct SensorManager {
    pool: Pool<String>,
    sensors: HashMap<String, Arc<SensorDriver>>,
}

impl SensorManager {
    pub fn new(ports: Vec<String>, modbus_slave_id: u8, simulation_mode: bool) -> Self {
        let sensors = ports
            .iter()
            .map(|port| {
                let driver = SensorDriver::new(SensorConfig {
                    port: port.clone(),
                    modbus_slave_id,
                    simulation_mode,
                });
                (port.clone(), Arc::new(driver))
            })
            .collect();
        SensorManager {
            pool: Pool::new(ports),
            sensors,
        }
    }

    pub fn assign_any(&mut self, plant_id: i64) -> EngineResult<Arc<SensorDriver>> {
        let port = self.pool.assign_any(plant_id, "sensor")?;
        Ok(self.sensors[&port].clone())
    }

    pub fn assign_specific(&mut self, plant_id: i64, port: &str) -> EngineResult<Arc<SensorDriver>> {
        if !self.sensors.contains_key(port) {
            return Err(EngineError::InvalidArgument(format!(
                "sensor port {port} does not exist"
            )));
        }
        self.pool.assign_specific(plant_id, port.to_string());
        Ok(self.sensors[port].clone())
    }

    pub fn release(&mut self, plant_id: i64) -> EngineResult<()> {
        self.pool.release(plant_id)
    }

    pub fn get(&self, plant_id: i64) -> Option<Arc<SensorDriver>> {
        self.pool.get(plant_id).map(|port| self.sensors[port].clone())
    }

    pub fn available_count(&self) -> usize {
        self.pool.available_count()
    }

    pub fn assigned_count(&self) -> usize {
        self.pool.assigned_count()
    }
}
