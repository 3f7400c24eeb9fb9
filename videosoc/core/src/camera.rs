use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::async_driver::{AsyncDriver, ShutdownToken, Trigger};
use crate::bus::{AhbMaster, BusLayer, SharedBus};
use crate::frame::{pack_pair, unpack_pair, FrameGeometry};
use crate::memory::DEFAULT_VIDEO_BASE;
use crate::register::{RegisterBank, RegisterHandler};
use crate::signal::Signal;
use crate::Result;

pub const CTRL: u32 = 0x00;
pub const ADDR: u32 = 0x04;
pub const POS: u32 = 0x08;
pub const SIZE: u32 = 0x0C;

const CTRL_ENABLE: u32 = 0x1;
const CTRL_TRIGGER: u32 = 0x2;

/// BT.601 colour bars as `(Y, U, V)`.
const BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

/// Pixels the bars shift left per frame.
const SCROLL_PER_FRAME: u32 = 4;

/// Render row `row` of test-pattern frame `frame` into `out` (packed 4:2:2,
/// `width * 2` bytes). The top three quarters show scrolling colour bars,
/// the rest a horizontal luma ramp.
pub fn pattern_row(frame: u64, row: u32, rows: u32, width: u32, out: &mut [u8]) {
    let width = width.max(2);
    let ramp = row >= rows - rows / 4;
    let shift = (frame % u64::from(width)) as u32 * SCROLL_PER_FRAME;
    for (pair, group) in out.chunks_exact_mut(4).enumerate() {
        let x = pair as u32 * 2;
        let (y0, y1, u, v) = if ramp {
            let luma = |x: u32| (16 + x * 219 / (width - 1)) as u8;
            (luma(x), luma((x + 1).min(width - 1)), 128, 128)
        } else {
            let bar = (((x + shift) % width) * 8 / width) as usize;
            let (y, u, v) = BARS[bar];
            (y, y, u, v)
        };
        group.copy_from_slice(&[u, y0, v, y1]);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub name: String,
    pub bus_index: u32,
    pub apb_base: u32,
    pub video_base: u32,
    pub video_width: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub pos_x: u32,
    pub pos_y: u32,
    pub layer: BusLayer,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: "camera".to_string(),
            bus_index: 3,
            apb_base: 0x8005_0100,
            video_base: DEFAULT_VIDEO_BASE,
            video_width: 320,
            frame_width: 640,
            frame_height: 480,
            pos_x: 0,
            pos_y: 0,
            layer: BusLayer::Lt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Capture {
    base: u32,
    x: u32,
    y: u32,
    geometry: FrameGeometry,
}

struct CameraState {
    name: String,
    video_width: Cell<u32>,
    capture: Cell<Option<Capture>>,
    toggle: Cell<bool>,
    frames: Cell<u64>,
    frame_trigger: Trigger,
}

struct CtrlHandler {
    state: Rc<CameraState>,
}

impl RegisterHandler for CtrlHandler {
    fn on_pre_read(&self, _bank: &RegisterBank, value: u32) -> u32 {
        let mut value = (value & 0xFFFF & !CTRL_TRIGGER) | (self.state.video_width.get() << 16);
        if self.state.toggle.get() {
            value |= CTRL_TRIGGER;
        }
        value
    }

    fn on_post_write(&self, bank: &RegisterBank, value: u32) -> Result<()> {
        let width = value >> 16;
        if width != 0 && width != self.state.video_width.get() {
            info!("{}: video width {width}", self.state.name);
            self.state.video_width.set(width);
        }
        if value & (CTRL_ENABLE | CTRL_TRIGGER) != CTRL_ENABLE | CTRL_TRIGGER {
            return Ok(());
        }
        let word = |name: &str| bank.get(name).unwrap_or(0);
        let geometry = FrameGeometry::from_size_register(self.state.video_width.get(), word("SIZE"));
        geometry.validate()?;
        let (x, y) = unpack_pair(word("POS"));
        let capture = Capture {
            base: word("ADDR"),
            x,
            y,
            geometry,
        };
        if self.state.capture.replace(Some(capture)) != Some(capture) {
            bank.log_snapshot();
        }
        self.state.frame_trigger.notify();
        Ok(())
    }
}

/// Frame source rendering a synthetic pattern into video memory whenever
/// its CTRL register is written with enable and trigger set.
pub struct Camera {
    config: CameraConfig,
    registers: Rc<RefCell<RegisterBank>>,
    state: Rc<CameraState>,
    master: AhbMaster,
    trigger_out: Signal<bool>,
}

impl Camera {
    pub fn new(config: CameraConfig, bus: SharedBus, trigger_out: Signal<bool>) -> Self {
        let state = Rc::new(CameraState {
            name: config.name.clone(),
            video_width: Cell::new(config.video_width),
            capture: Cell::new(None),
            toggle: Cell::new(false),
            frames: Cell::new(0),
            frame_trigger: Trigger::new(&format!("{}.frame", config.name)),
        });

        let mut bank = RegisterBank::new(&config.name);
        bank.create_register("CTRL", "Camera Control Register", CTRL, 0x00, u32::MAX)
            .with_handler(Rc::new(CtrlHandler {
                state: state.clone(),
            }));
        bank.create_register(
            "ADDR",
            "Camera Video Address Register",
            ADDR,
            config.video_base,
            0xFFFF_F000,
        );
        bank.create_register(
            "POS",
            "Camera Position Register",
            POS,
            pack_pair(config.pos_x, config.pos_y),
            u32::MAX,
        );
        bank.create_register(
            "SIZE",
            "Camera Frame Size Register",
            SIZE,
            pack_pair(config.frame_width, config.frame_height),
            u32::MAX,
        );

        let master = AhbMaster::new(&config.name, config.bus_index, bus, config.layer);
        Self {
            config,
            registers: Rc::new(RefCell::new(bank)),
            state,
            master,
            trigger_out,
        }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn registers(&self) -> Rc<RefCell<RegisterBank>> {
        self.registers.clone()
    }

    pub fn toggle(&self) -> bool {
        self.state.toggle.get()
    }

    pub fn frames_captured(&self) -> u64 {
        self.state.frames.get()
    }

    pub fn start(&self, driver: &mut AsyncDriver) {
        let state = self.state.clone();
        let master = self.master.clone();
        let trigger_out = self.trigger_out.clone();
        let token = driver.token();

        driver.spawn(async move {
            let mut line = Vec::new();
            loop {
                state.frame_trigger.wait().await;
                if token.is_cancelled() {
                    break;
                }
                let Some(capture) = state.capture.get() else {
                    continue;
                };
                match capture.geometry.row_bytes() {
                    Ok(bytes) => line.resize(bytes, 0),
                    Err(err) => {
                        error!("{}: {err}", state.name);
                        continue;
                    }
                }
                match capture_frame(&master, &capture, state.frames.get(), &mut line, &token).await {
                    Ok(true) => {
                        let toggle = !state.toggle.get();
                        state.toggle.set(toggle);
                        state.frames.set(state.frames.get() + 1);
                        debug!("{}: frame {} captured", state.name, state.frames.get());
                        trigger_out.write(toggle);
                    }
                    Ok(false) => break,
                    Err(err) => error!("{}: frame aborted: {err}", state.name),
                }
            }
        });
    }
}

async fn capture_frame(
    master: &AhbMaster,
    capture: &Capture,
    frame: u64,
    line: &mut [u8],
    token: &ShutdownToken,
) -> Result<bool> {
    let rows = capture.geometry.rows()?;
    for row in 0..rows {
        pattern_row(frame, row, rows, capture.geometry.video_width, line);
        let dst = capture
            .geometry
            .row_address(capture.base, capture.x, capture.y, row)?;
        master.write(dst, line).await?;
        if token.is_cancelled() {
            return Ok(false);
        }
    }
    Ok(true)
}
