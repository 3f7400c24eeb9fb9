use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::async_driver::{emit_event, sleep_ns, AsyncDriver, DriverEvent, ShutdownToken, Trigger};
use crate::bus::{AhbMaster, BusLayer, SharedBus};
use crate::frame::MAX_DIMENSION;
use crate::memory::DEFAULT_VIDEO_BASE;
use crate::register::{RegisterBank, RegisterHandler};
use crate::signal::Signal;
use crate::viewer::{HostInput, SharedBackend};
use crate::{CoreError, Result};

pub const CTRL: u32 = 0x00;
pub const ADDR: u32 = 0x04;
pub const WIDTH: u32 = 0x08;
pub const HEIGHT: u32 = 0x0C;

const CTRL_OPEN: u32 = 0x1;
const CTRL_TRIGGER: u32 = 0x2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub name: String,
    pub bus_index: u32,
    pub apb_base: u32,
    pub video_base: u32,
    pub width: u32,
    pub height: u32,
    /// Pause after each streamed row.
    pub row_delay_ns: u64,
    pub layer: BusLayer,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            name: "display".to_string(),
            bus_index: 2,
            apb_base: 0x8005_0000,
            video_base: DEFAULT_VIDEO_BASE,
            width: 640,
            height: 480,
            row_delay_ns: 10,
            layer: BusLayer::Lt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Screen {
    addr: u32,
    width: u32,
    height: u32,
}

struct DisplayState {
    name: String,
    backend: SharedBackend,
    screen: Cell<Option<Screen>>,
    frames: Cell<u64>,
    frame_trigger: Trigger,
}

impl DisplayState {
    fn open(&self, bank: &RegisterBank) -> Result<()> {
        let screen = Screen {
            addr: bank.get("ADDR").unwrap_or(0),
            width: bank.get("Width").unwrap_or(0),
            height: bank.get("Height").unwrap_or(0),
        };
        if screen.width == 0
            || screen.height == 0
            || screen.width > MAX_DIMENSION
            || screen.height > MAX_DIMENSION
        {
            return Err(CoreError::configuration(format!(
                "{}: cannot open a {}x{} screen",
                self.name, screen.width, screen.height
            )));
        }
        self.backend.borrow_mut().open(screen.width, screen.height)?;
        self.screen.set(Some(screen));
        info!(
            "{}: open screen with width {} and height {}",
            self.name, screen.width, screen.height
        );
        bank.log_snapshot();
        Ok(())
    }

    fn close(&self) {
        if self.screen.take().is_some() {
            self.backend.borrow_mut().close();
            info!("{}: screen closed", self.name);
        }
    }
}

struct CtrlHandler {
    state: Rc<DisplayState>,
}

impl RegisterHandler for CtrlHandler {
    fn on_pre_read(&self, _bank: &RegisterBank, _value: u32) -> u32 {
        u32::from(self.state.screen.get().is_some())
    }

    fn on_post_write(&self, bank: &RegisterBank, value: u32) -> Result<()> {
        let open = self.state.screen.get().is_some();
        if value & CTRL_OPEN != 0 && !open {
            self.state.open(bank)?;
        }
        if value & CTRL_OPEN == 0 && open {
            self.state.close();
        }
        if value & CTRL_TRIGGER != 0 {
            self.state.frame_trigger.notify();
        }
        Ok(())
    }
}

/// Framebuffer sink streaming video memory into a [`crate::RenderBackend`].
pub struct Display {
    config: DisplayConfig,
    registers: Rc<RefCell<RegisterBank>>,
    state: Rc<DisplayState>,
    master: AhbMaster,
    key_out: Signal<u8>,
}

impl Display {
    pub fn new(
        config: DisplayConfig,
        bus: SharedBus,
        backend: SharedBackend,
        trigger_in: &Signal<bool>,
        key_out: Signal<u8>,
    ) -> Self {
        let state = Rc::new(DisplayState {
            name: config.name.clone(),
            backend,
            screen: Cell::new(None),
            frames: Cell::new(0),
            frame_trigger: Trigger::new(&format!("{}.frame", config.name)),
        });

        let mut bank = RegisterBank::new(&config.name);
        bank.create_register("CTRL", "Display Control Register", CTRL, 0x00, 0xFF)
            .with_handler(Rc::new(CtrlHandler {
                state: state.clone(),
            }));
        bank.create_register(
            "ADDR",
            "Display Video Address Register",
            ADDR,
            config.video_base,
            0xFFFF_F000,
        );
        bank.create_register("Width", "Display Width Register", WIDTH, config.width, u32::MAX);
        bank.create_register(
            "Height",
            "Display Height Register",
            HEIGHT,
            config.height,
            u32::MAX,
        );

        trigger_in.bind_trigger(&state.frame_trigger);
        let master = AhbMaster::new(&config.name, config.bus_index, bus, config.layer);

        Self {
            config,
            registers: Rc::new(RefCell::new(bank)),
            state,
            master,
            key_out,
        }
    }

    pub fn config(&self) -> &DisplayConfig {
        &self.config
    }

    pub fn registers(&self) -> Rc<RefCell<RegisterBank>> {
        self.registers.clone()
    }

    pub fn backend(&self) -> SharedBackend {
        self.state.backend.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.screen.get().is_some()
    }

    pub fn frames_presented(&self) -> u64 {
        self.state.frames.get()
    }

    pub fn start(&self, driver: &mut AsyncDriver) {
        let state = self.state.clone();
        let master = self.master.clone();
        let key_out = self.key_out.clone();
        let row_delay = self.config.row_delay_ns;
        let token = driver.token();

        driver.spawn(async move {
            let mut xfer = Vec::new();
            loop {
                state.frame_trigger.wait().await;
                if token.is_cancelled() {
                    break;
                }
                let Some(screen) = state.screen.get() else {
                    debug!("{}: trigger ignored, screen closed", state.name);
                    continue;
                };
                xfer.resize(screen.width as usize * 2, 0);
                match paint(&state, &master, screen, &mut xfer, row_delay, &token).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        error!("{}: frame aborted: {err}", state.name);
                        continue;
                    }
                }

                state.backend.borrow_mut().present();
                state.frames.set(state.frames.get() + 1);
                debug!("{}: presented frame {}", state.name, state.frames.get());
                emit_event(DriverEvent::FramePresented);

                let input = state.backend.borrow_mut().poll_input();
                match input {
                    Some(HostInput::Quit) => {
                        info!("{}: quit requested", state.name);
                        emit_event(DriverEvent::Quit);
                    }
                    Some(input) => {
                        if let Some(key) = input.key_byte() {
                            key_out.write(key);
                        }
                    }
                    None => {}
                }
            }
            state.close();
        });
    }
}

/// Stream one frame row by row. Returns `Ok(false)` when interrupted by
/// shutdown.
async fn paint(
    state: &DisplayState,
    master: &AhbMaster,
    screen: Screen,
    xfer: &mut [u8],
    row_delay: u64,
    token: &ShutdownToken,
) -> Result<bool> {
    let row_bytes = screen.width * 2;
    for row in 0..screen.height {
        master
            .read(screen.addr.wrapping_add(row * row_bytes), xfer)
            .await?;
        state.backend.borrow_mut().draw_row(xfer, 0, row);
        sleep_ns(row_delay).await;
        if token.is_cancelled() {
            return Ok(false);
        }
    }
    Ok(true)
}
