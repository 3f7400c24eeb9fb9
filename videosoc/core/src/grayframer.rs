use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::{debug, error, info, trace};
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
pub const IN_POS: u32 = 0x08;
pub const OUT_POS: u32 = 0x0C;
pub const SIZE: u32 = 0x10;

const CTRL_ENABLE: u32 = 0x1;
const CTRL_TRIGGER: u32 = 0x2;

/// Colour channel kept by the filter. The other bytes of each
/// `[U, Y0, V, Y1]` group are overwritten with the fill byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Channel {
    #[default]
    #[serde(rename = "Y")]
    Y,
    #[serde(rename = "U")]
    U,
    #[serde(rename = "V")]
    V,
    #[serde(rename = "passthrough")]
    Passthrough,
}

impl Channel {
    fn filled_bytes(self) -> &'static [usize] {
        match self {
            Channel::Y => &[0, 2],
            Channel::U => &[1, 2, 3],
            Channel::V => &[0, 1, 3],
            Channel::Passthrough => &[],
        }
    }
}

pub fn isolate_channel(row: &mut [u8], channel: Channel, fill: u8) {
    let positions = channel.filled_bytes();
    if positions.is_empty() {
        return;
    }
    for group in row.chunks_exact_mut(4) {
        for &pos in positions {
            group[pos] = fill;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrayframerConfig {
    pub name: String,
    pub bus_index: u32,
    pub apb_base: u32,
    pub channel: Channel,
    pub in_x: u32,
    pub in_y: u32,
    pub out_x: u32,
    pub out_y: u32,
    pub video_width: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub video_base: u32,
    pub fill: u8,
    pub layer: BusLayer,
}

impl Default for GrayframerConfig {
    fn default() -> Self {
        Self {
            name: "grayframer".to_string(),
            bus_index: 4,
            apb_base: 0x8005_0200,
            channel: Channel::Y,
            in_x: 0,
            in_y: 0,
            out_x: 320,
            out_y: 0,
            video_width: 320,
            frame_width: 640,
            frame_height: 480,
            video_base: DEFAULT_VIDEO_BASE,
            fill: 0,
            layer: BusLayer::Lt,
        }
    }
}

/// Window latched from the registers when the filter is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    base: u32,
    in_x: u32,
    in_y: u32,
    out_x: u32,
    out_y: u32,
    geometry: FrameGeometry,
}

struct FramerState {
    name: String,
    video_width: u32,
    layout: Cell<Option<Layout>>,
    line_buffer: RefCell<Option<Vec<u8>>>,
    toggle: Cell<bool>,
    frames: Cell<u64>,
    frame_trigger: Trigger,
}

impl FramerState {
    fn initialized(&self) -> bool {
        self.layout.get().is_some()
    }

    fn latch(&self, bank: &RegisterBank) -> Result<()> {
        let word = |name: &str| bank.get(name).unwrap_or(0);
        let geometry = FrameGeometry::from_size_register(self.video_width, word("SIZE"));
        geometry.validate()?;
        let (in_x, in_y) = unpack_pair(word("IN_POS"));
        let (out_x, out_y) = unpack_pair(word("OUT_POS"));
        self.layout.set(Some(Layout {
            base: word("ADDR"),
            in_x,
            in_y,
            out_x,
            out_y,
            geometry,
        }));
        *self.line_buffer.borrow_mut() = Some(vec![0; geometry.row_bytes()?]);
        Ok(())
    }
}

struct CtrlHandler {
    state: Rc<FramerState>,
}

impl RegisterHandler for CtrlHandler {
    fn on_pre_read(&self, _bank: &RegisterBank, _value: u32) -> u32 {
        let mut value = 0;
        if self.state.initialized() {
            value |= CTRL_ENABLE;
        }
        if self.state.toggle.get() {
            value |= CTRL_TRIGGER;
        }
        value
    }

    fn on_post_write(&self, bank: &RegisterBank, value: u32) -> Result<()> {
        if value & CTRL_TRIGGER != 0 {
            self.state.frame_trigger.notify();
        }
        if value & CTRL_ENABLE != 0 && !self.state.initialized() {
            self.state.latch(bank)?;
            info!("{}: initialised", self.state.name);
            bank.log_snapshot();
        }
        Ok(())
    }
}

/// Channel isolation filter. Copies a window of the frame row by row,
/// keeping only the configured channel, and flips its output toggle after
/// every completed frame.
pub struct Grayframer {
    config: GrayframerConfig,
    registers: Rc<RefCell<RegisterBank>>,
    state: Rc<FramerState>,
    master: AhbMaster,
    trigger_out: Signal<bool>,
}

impl Grayframer {
    pub fn new(
        config: GrayframerConfig,
        bus: SharedBus,
        trigger_in: &Signal<bool>,
        trigger_out: Signal<bool>,
    ) -> Self {
        let state = Rc::new(FramerState {
            name: config.name.clone(),
            video_width: config.video_width,
            layout: Cell::new(None),
            line_buffer: RefCell::new(None),
            toggle: Cell::new(false),
            frames: Cell::new(0),
            frame_trigger: Trigger::new(&format!("{}.frame", config.name)),
        });

        let mut bank = RegisterBank::new(&config.name);
        bank.create_register("CTRL", "Grayframer Control Register", CTRL, 0x00, 0xFF)
            .with_handler(Rc::new(CtrlHandler {
                state: state.clone(),
            }));
        bank.create_register(
            "ADDR",
            "Grayframer Video Address Register",
            ADDR,
            config.video_base,
            0xFFFF_F000,
        );
        bank.create_register(
            "IN_POS",
            "Grayframer Input Register",
            IN_POS,
            pack_pair(config.in_x, config.in_y),
            u32::MAX,
        );
        bank.create_register(
            "OUT_POS",
            "Grayframer Output Register",
            OUT_POS,
            pack_pair(config.out_x, config.out_y),
            u32::MAX,
        );
        bank.create_register(
            "SIZE",
            "Grayframer Frame Size Register",
            SIZE,
            pack_pair(config.frame_width, config.frame_height),
            u32::MAX,
        );

        trigger_in.bind_trigger(&state.frame_trigger);
        let master = AhbMaster::new(&config.name, config.bus_index, bus, config.layer);

        Self {
            config,
            registers: Rc::new(RefCell::new(bank)),
            state,
            master,
            trigger_out,
        }
    }

    pub fn config(&self) -> &GrayframerConfig {
        &self.config
    }

    pub fn registers(&self) -> Rc<RefCell<RegisterBank>> {
        self.registers.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.initialized()
    }

    pub fn toggle(&self) -> bool {
        self.state.toggle.get()
    }

    pub fn frames_processed(&self) -> u64 {
        self.state.frames.get()
    }

    pub fn start(&self, driver: &mut AsyncDriver) {
        let state = self.state.clone();
        let master = self.master.clone();
        let trigger_out = self.trigger_out.clone();
        let channel = self.config.channel;
        let fill = self.config.fill;
        let token = driver.token();

        driver.spawn(async move {
            loop {
                state.frame_trigger.wait().await;
                if token.is_cancelled() {
                    break;
                }
                let Some(layout) = state.layout.get() else {
                    debug!("{}: trigger ignored, not initialised", state.name);
                    continue;
                };
                let Some(mut line) = state.line_buffer.borrow_mut().take() else {
                    continue;
                };
                let result =
                    filter_frame(&master, &layout, &mut line, channel, fill, &token).await;
                *state.line_buffer.borrow_mut() = Some(line);
                match result {
                    Ok(true) => {
                        let toggle = !state.toggle.get();
                        state.toggle.set(toggle);
                        state.frames.set(state.frames.get() + 1);
                        debug!("{}: frame {} done", state.name, state.frames.get());
                        trigger_out.write(toggle);
                    }
                    Ok(false) => break,
                    Err(err) => error!("{}: frame aborted: {err}", state.name),
                }
            }
        });
    }
}

/// Returns `Ok(false)` when interrupted by shutdown.
async fn filter_frame(
    master: &AhbMaster,
    layout: &Layout,
    line: &mut [u8],
    channel: Channel,
    fill: u8,
    token: &ShutdownToken,
) -> Result<bool> {
    let rows = layout.geometry.rows()?;
    for row in 0..rows {
        let src = layout
            .geometry
            .row_address(layout.base, layout.in_x, layout.in_y, row)?;
        let dst = layout
            .geometry
            .row_address(layout.base, layout.out_x, layout.out_y, row)?;
        master.read(src, line).await?;
        isolate_channel(line, channel, fill);
        master.write(dst, line).await?;
        trace!("{}: row {row} 0x{src:08X} -> 0x{dst:08X}", master.name());
        if token.is_cancelled() {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn y_channel_fills_chroma() {
        let mut row = vec![10, 20, 30, 40, 50, 60, 70, 80];
        isolate_channel(&mut row, Channel::Y, 0);
        assert_eq!(row, vec![0, 20, 0, 40, 0, 60, 0, 80]);
    }

    #[test]
    fn u_and_v_follow_the_byte_rules() {
        let mut u = vec![1, 2, 3, 4];
        isolate_channel(&mut u, Channel::U, 128);
        assert_eq!(u, vec![1, 128, 128, 128]);

        let mut v = vec![1, 2, 3, 4];
        isolate_channel(&mut v, Channel::V, 128);
        assert_eq!(v, vec![128, 128, 3, 128]);
    }

    #[test]
    fn passthrough_keeps_row() {
        let mut row = vec![1, 2, 3, 4, 5];
        isolate_channel(&mut row, Channel::Passthrough, 0);
        assert_eq!(row, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn channel_names_in_config() {
        let config: GrayframerConfig =
            serde_json::from_str(r#"{"channel": "U", "fill": 128}"#).unwrap();
        assert_eq!(config.channel, Channel::U);
        assert_eq!(config.fill, 128);
        assert_eq!(config.out_x, 320);
    }
}
