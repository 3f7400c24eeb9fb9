//! Discrete-event models of a small video system-on-chip.
//!
//! The crate emulates a handful of AHB/APB peripherals (frame trigger,
//! test-pattern camera, channel filter, zoom/histogram unit, display and
//! keyboard latch) that talk to each other through memory-mapped control
//! registers, value signals and timed bus transactions over a shared video
//! memory. All devices run as cooperative tasks on a single simulated
//! timeline driven by [`async_driver::AsyncDriver`].

use thiserror::Error;

pub mod async_driver;
pub mod async_runtime;
pub mod bus;
pub mod camera;
pub mod config;
pub mod demosoftware;
pub mod display;
pub mod frame;
pub mod frametrigger;
pub mod grayframer;
pub mod keyboard;
pub mod memory;
pub mod platform;
pub mod register;
pub mod signal;
pub mod viewer;

pub use async_driver::{
    current_time, emit_event, sleep_ns, sleep_us, AsyncDriver, DriverEvent, DriverRunResult,
    ShutdownToken, Trigger,
};
pub use async_runtime::{RunOutcome, SocRunner};
pub use bus::{AhbMaster, BusCost, BusLayer, BusPort, BusTiming, SystemBus};
pub use config::PlatformConfig;
pub use frame::FrameGeometry;
pub use memory::{AccessKind, AccessRecord, VideoMemory};
pub use platform::Platform;
pub use register::{RegisterBank, RegisterHandler};
pub use signal::Signal;
pub use viewer::{HeadlessViewer, HostInput, KeyCode, RenderBackend, SharedBackend};

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("rendering backend failed to initialise: {0}")]
    BackendInit(String),
    #[error("bus error at 0x{addr:08X}: {reason}")]
    Bus { addr: u32, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl CoreError {
    pub fn bus(addr: u32, reason: impl Into<String>) -> Self {
        Self::Bus {
            addr,
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }
}
