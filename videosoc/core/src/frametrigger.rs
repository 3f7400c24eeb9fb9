use std::cell::Cell;
use std::rc::Rc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::async_driver::{sleep_us, AsyncDriver, Trigger};
use crate::bus::{AhbMaster, BusLayer, SharedBus};

/// One 32-bit register write issued over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWrite {
    pub addr: u32,
    pub value: u32,
}

impl RegisterWrite {
    pub const fn new(addr: u32, value: u32) -> Self {
        Self { addr, value }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameTriggerConfig {
    pub name: String,
    pub bus_index: u32,
    pub interval_us: u64,
    pub settle_us: u64,
    pub go_period_us: u64,
    /// Issued once, in order, after the first tick.
    pub setup: Vec<RegisterWrite>,
    /// Repeated every `go_period_us` after the setup sequence.
    pub go: RegisterWrite,
    pub layer: BusLayer,
}

impl Default for FrameTriggerConfig {
    fn default() -> Self {
        Self {
            name: "frametrigger".to_string(),
            bus_index: 1,
            interval_us: 1_000,
            settle_us: 1_000,
            go_period_us: 40_000,
            setup: vec![
                RegisterWrite::new(0x8005_0000, 0x3),
                RegisterWrite::new(0x8005_0200, 0x3),
            ],
            go: RegisterWrite::new(0x8005_0100, (320 << 16) | 0x3),
            layer: BusLayer::Lt,
        }
    }
}

struct TriggerState {
    name: String,
    new_frame: Trigger,
    ticks: Cell<u64>,
    go_writes: Cell<u64>,
    failures: Cell<u64>,
}

/// Bus master that paces the pipeline: it enables the downstream
/// peripherals and then kicks the frame source at a fixed period.
pub struct FrameTrigger {
    config: FrameTriggerConfig,
    state: Rc<TriggerState>,
    master: AhbMaster,
}

impl FrameTrigger {
    pub fn new(config: FrameTriggerConfig, bus: SharedBus) -> Self {
        let state = Rc::new(TriggerState {
            name: config.name.clone(),
            new_frame: Trigger::new(&format!("{}.new_frame", config.name)),
            ticks: Cell::new(0),
            go_writes: Cell::new(0),
            failures: Cell::new(0),
        });
        let master = AhbMaster::new(&config.name, config.bus_index, bus, config.layer);
        info!(
            "{}: interval {} us, go period {} us, layer {:?}",
            config.name, config.interval_us, config.go_period_us, config.layer
        );
        Self {
            config,
            state,
            master,
        }
    }

    pub fn config(&self) -> &FrameTriggerConfig {
        &self.config
    }

    pub fn new_frame(&self) -> Trigger {
        self.state.new_frame.clone()
    }

    pub fn ticks(&self) -> u64 {
        self.state.ticks.get()
    }

    pub fn go_writes(&self) -> u64 {
        self.state.go_writes.get()
    }

    pub fn failed_writes(&self) -> u64 {
        self.state.failures.get()
    }

    pub fn start(&self, driver: &mut AsyncDriver) {
        let state = self.state.clone();
        let interval = self.config.interval_us.max(1);
        let token = driver.token();
        driver.spawn(async move {
            loop {
                sleep_us(interval).await;
                if token.is_cancelled() {
                    break;
                }
                state.ticks.set(state.ticks.get() + 1);
                state.new_frame.notify();
            }
        });

        let state = self.state.clone();
        let master = self.master.clone();
        let config = self.config.clone();
        let token = driver.token();
        driver.spawn(async move {
            state.new_frame.wait().await;
            if token.is_cancelled() {
                return;
            }
            for write in &config.setup {
                issue(&state, &master, *write).await;
                sleep_us(config.settle_us).await;
                if token.is_cancelled() {
                    return;
                }
            }
            debug!("{}: setup sequence done", state.name);
            loop {
                if issue(&state, &master, config.go).await {
                    state.go_writes.set(state.go_writes.get() + 1);
                }
                sleep_us(config.go_period_us.max(1)).await;
                if token.is_cancelled() {
                    break;
                }
            }
        });
    }
}

/// Fire-and-forget write; failures are counted and logged.
async fn issue(state: &TriggerState, master: &AhbMaster, write: RegisterWrite) -> bool {
    match master.write_word(write.addr, write.value).await {
        Ok(()) => true,
        Err(err) => {
            state.failures.set(state.failures.get() + 1);
            warn!(
                "{}: write 0x{:08X} to 0x{:08X} failed: {err}",
                state.name, write.value, write.addr
            );
            false
        }
    }
}
