//! USB HID relay board driver. The `hardware` feature gates the real
//! `hidapi` backend; without it, a simulation driver logs intended effects.

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};

/// Fixed relay-board identity and wire format. `off_opcode` is a
/// driver-configuration constant rather than a literal: the source this was
/// rewritten from used `0xFD` in one module and `0x00` in another, and the
/// correct byte is a property of the physical board, not of this code.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub on_opcode: u8,
    pub off_opcode: u8,
}

impl Default for RelayConfig {
    fn default() -> Self {
        // Matches the relay board family this controller ships with.
        RelayConfig {
            vendor_id: 0x16C0,
            product_id: 0x05DF,
            on_opcode: 0xFF,
            off_opcode: 0xFD,
        }
    }
}

/// USB HID relay board.
///
/// `turn_on`/`turn_off` are synchronous at the hardware boundary; callers
/// that must not block the async runtime should invoke them through
/// `tokio::task::spawn_blocking`. The driver itself serializes access to the
/// device handle with an internal mutex.
pub struct RelayDriver {
    config: RelayConfig,
    inner: Mutex<Inner>,
}

struct Inner {
    #[cfg(feature = "hardware")]
    device: Option<hidapi::HidDevice>,
    simulated_on: HashSet<u8>,
    simulation_mode: bool,
}

impl RelayDriver {
    /// Open the relay board. In simulation mode (or if the real device fails
    /// to open) no hardware I/O occurs and every write is logged instead.
    pub fn open(config: RelayConfig, simulation_mode: bool) -> Self {
        #[cfg(feature = "hardware")]
        let device = if simulation_mode {
            None
        } else {
            match hidapi::HidApi::new().and_then(|api| {
                api.open(config.vendor_id, config.product_id)
            }) {
                Ok(dev) => {
                    info!(vendor_id = config.vendor_id, product_id = config.product_id, "relay board opened");
                    Some(dev)
                }
                Err(e) => {
                    warn!("failed to open relay board: {e}; falling back to simulation");
                    None
                }
            }
        };

        if simulation_mode {
            info!("relay driver running in simulation mode");
        }

        RelayDriver {
            config,
            inner: Mutex::new(Inner {
                #[cfg(feature = "hardware")]
                device,
                simulated_on: HashSet::new(),
                simulation_mode,
            }),
        }
    }

    /// Issue `turn_off` for every channel in `channels`. Used once at startup
    /// as a safety measure; failures are logged but non-fatal.
    pub fn all_off(&self, channels: &[u8]) {
        for &ch in channels {
            if let Err(e) = self.turn_off(ch) {
                warn!(channel = ch, "startup turn_off failed: {e}");
            }
        }
    }

    pub fn turn_on(&self, channel: u8) -> EngineResult<()> {
        self.write_report(channel, self.config.on_opcode, true)
    }

    pub fn turn_off(&self, channel: u8) -> EngineResult<()> {
        self.write_report(channel, self.config.off_opcode, false)
    }

    fn write_report(&self, channel: u8, opcode: u8, on: bool) -> EngineResult<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| EngineError::Internal("relay driver mutex poisoned".into()))?;

        if inner.simulation_mode {
            if on {
                inner.simulated_on.insert(channel);
            } else {
                inner.simulated_on.remove(&channel);
            }
            info!(channel, on, "[sim-relay] channel set");
            return Ok(());
        }

        #[cfg(feature = "hardware")]
        {
            let report = [0x00u8, opcode, channel];
            match inner.device.as_ref() {
                Some(dev) => dev
                    .write(&report)
                    .map(|_| ())
                    .map_err(|e| EngineError::ValveActuationFailed(e.to_string())),
                None => Err(EngineError::ValveActuationFailed(
                    "relay device not connected".into(),
                )),
            }
        }

        #[cfg(not(feature = "hardware"))]
        Err(EngineError::ValveActuationFailed(
            "relay device not connected".into(),
        ))
    }

    /// Release the device handle.
    pub fn close(&self) {
        #[cfg(feature = "hardware")]
        if let Ok(mut inner) = self.inner.lock() {
            inner.device = None;
        }
        info!("relay driver closed");
    }
}
