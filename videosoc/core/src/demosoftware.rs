use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::{debug, error, trace};
use serde::{Deserialize, Serialize};

use crate::async_driver::{sleep_us, AsyncDriver, ShutdownToken, Trigger};
use crate::bus::{AhbMaster, BusLayer, SharedBus};
use crate::frame::FrameGeometry;
use crate::memory::DEFAULT_VIDEO_BASE;
use crate::signal::Signal;
use crate::Result;

pub const HISTOGRAM_BUCKETS: usize = 64;
pub const HISTOGRAM_HEIGHT: u32 = 192;
pub const HISTOGRAM_ROW_BYTES: usize = HISTOGRAM_BUCKETS * 4;
pub const BAR_COLOUR: [u8; 4] = [128, 0, 128, 0];
pub const BACKGROUND_COLOUR: [u8; 4] = [128, 255, 128, 255];

/// Stretch a row horizontally: every `[a, b, c, d]` group becomes
/// `[a, b, c, b, a, d, c, d]`. `output` must be twice as long as `input`.
pub fn double_pixels(input: &[u8], output: &mut [u8]) {
    for (src, dst) in input.chunks_exact(4).zip(output.chunks_exact_mut(8)) {
        let [a, b, c, d] = [src[0], src[1], src[2], src[3]];
        dst.copy_from_slice(&[a, b, c, b, a, d, c, d]);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    buckets: [u32; HISTOGRAM_BUCKETS],
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: [0; HISTOGRAM_BUCKETS],
        }
    }
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count the luma bytes (offsets 1 and 3 of every group) of `row`.
    pub fn accumulate(&mut self, row: &[u8]) {
        for group in row.chunks_exact(4) {
            self.buckets[(group[1] / 4) as usize] += 1;
            self.buckets[(group[3] / 4) as usize] += 1;
        }
    }

    pub fn buckets(&self) -> &[u32; HISTOGRAM_BUCKETS] {
        &self.buckets
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().map(|&count| count as u64).sum()
    }

    pub fn max(&self) -> u32 {
        self.buckets.iter().copied().max().unwrap_or(0)
    }

    /// Divisor mapping bucket counts onto the chart height, never zero.
    pub fn scale(&self) -> u32 {
        (self.max() / HISTOGRAM_HEIGHT).max(1)
    }

    /// Render chart row `row` (0 is the top) into `out`, 4 bytes per bucket.
    pub fn render_row(&self, row: u32, out: &mut [u8]) {
        let scale = self.scale();
        let threshold = HISTOGRAM_HEIGHT.saturating_sub(row);
        for (count, dst) in self.buckets.iter().zip(out.chunks_exact_mut(4)) {
            let colour = if count / scale >= threshold {
                BAR_COLOUR
            } else {
                BACKGROUND_COLOUR
            };
            dst.copy_from_slice(&colour);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PanWindow {
    pub x: u32,
    pub y: u32,
}

impl PanWindow {
    pub fn apply_key(&mut self, key: u8, step: u32, max_x: u32, max_y: u32) {
        match key {
            b'r' if self.x < max_x => self.x = (self.x + step).min(max_x),
            b'l' => self.x = self.x.saturating_sub(step),
            b'u' => self.y = self.y.saturating_sub(step),
            b'd' if self.y < max_y => self.y = (self.y + step).min(max_y),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoSoftwareConfig {
    pub name: String,
    pub bus_index: u32,
    pub video_base: u32,
    pub video_width: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub source_x: u32,
    pub source_y: u32,
    pub zoom_out_x: u32,
    pub zoom_out_y: u32,
    pub histogram_out_x: u32,
    pub histogram_out_y: u32,
    pub pan_step: u32,
    pub pan_max_x: u32,
    pub pan_max_y: u32,
    pub startup_delay_us: u64,
    pub layer: BusLayer,
}

impl Default for DemoSoftwareConfig {
    fn default() -> Self {
        Self {
            name: "demosoftware".to_string(),
            bus_index: 5,
            video_base: DEFAULT_VIDEO_BASE,
            video_width: 320,
            frame_width: 640,
            frame_height: 480,
            source_x: 320,
            source_y: 0,
            zoom_out_x: 0,
            zoom_out_y: 240,
            histogram_out_x: 320,
            histogram_out_y: 240,
            pan_step: 2,
            pan_max_x: 160,
            pan_max_y: 120,
            startup_delay_us: 1_000,
            layer: BusLayer::Lt,
        }
    }
}

impl DemoSoftwareConfig {
    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.video_width, self.frame_width, self.frame_height)
    }
}

struct DemoState {
    name: String,
    key: Cell<u8>,
    pan: Cell<PanWindow>,
    toggle: Cell<bool>,
    frames: Cell<u64>,
    histogram: RefCell<Histogram>,
    frame_trigger: Trigger,
}

/// Zoom and histogram unit running on each incoming frame.
pub struct DemoSoftware {
    config: DemoSoftwareConfig,
    state: Rc<DemoState>,
    master: AhbMaster,
    trigger_out: Signal<bool>,
}

impl DemoSoftware {
    pub fn new(
        config: DemoSoftwareConfig,
        bus: SharedBus,
        trigger_in: &Signal<bool>,
        key_in: &Signal<u8>,
        trigger_out: Signal<bool>,
    ) -> Self {
        let state = Rc::new(DemoState {
            name: config.name.clone(),
            key: Cell::new(key_in.read()),
            pan: Cell::new(PanWindow::default()),
            toggle: Cell::new(false),
            frames: Cell::new(0),
            histogram: RefCell::new(Histogram::new()),
            frame_trigger: Trigger::new(&format!("{}.frame", config.name)),
        });
        trigger_in.bind_trigger(&state.frame_trigger);
        let latch = state.clone();
        key_in.on_change(move |key| latch.key.set(key));
        let master = AhbMaster::new(&config.name, config.bus_index, bus, config.layer);
        Self {
            config,
            state,
            master,
            trigger_out,
        }
    }

    pub fn config(&self) -> &DemoSoftwareConfig {
        &self.config
    }

    pub fn pan(&self) -> PanWindow {
        self.state.pan.get()
    }

    pub fn toggle(&self) -> bool {
        self.state.toggle.get()
    }

    pub fn frames_processed(&self) -> u64 {
        self.state.frames.get()
    }

    pub fn last_histogram(&self) -> Histogram {
        self.state.histogram.borrow().clone()
    }

    pub fn start(&self, driver: &mut AsyncDriver) {
        let state = self.state.clone();
        let master = self.master.clone();
        let config = self.config.clone();
        let trigger_out = self.trigger_out.clone();
        let token = driver.token();

        driver.spawn(async move {
            sleep_us(config.startup_delay_us).await;
            loop {
                if token.is_cancelled() {
                    break;
                }
                state.frame_trigger.wait().await;
                if token.is_cancelled() {
                    break;
                }

                let mut pan = state.pan.get();
                pan.apply_key(
                    state.key.get(),
                    config.pan_step,
                    config.pan_max_x,
                    config.pan_max_y,
                );
                state.pan.set(pan);

                let result = process_frame(&master, &config, pan, &token).await;
                match result {
                    Ok(Some(histogram)) => {
                        *state.histogram.borrow_mut() = histogram;
                        let toggle = !state.toggle.get();
                        state.toggle.set(toggle);
                        state.frames.set(state.frames.get() + 1);
                        debug!(
                            "{}: frame {} window ({}, {})",
                            state.name,
                            state.frames.get(),
                            pan.x,
                            pan.y
                        );
                        trigger_out.write(toggle);
                    }
                    Ok(None) => break,
                    Err(err) => error!("{}: frame aborted: {err}", state.name),
                }
            }
        });
    }
}

async fn process_frame(
    master: &AhbMaster,
    config: &DemoSoftwareConfig,
    pan: PanWindow,
    token: &ShutdownToken,
) -> Result<Option<Histogram>> {
    let in_x = config.source_x + pan.x;
    let in_y = config.source_y + pan.y;
    if !zoom(master, config, in_x, in_y, token).await? {
        return Ok(None);
    }
    histogram(master, config, in_x, in_y, token).await
}

/// Returns `Ok(false)` when interrupted by shutdown.
async fn zoom(
    master: &AhbMaster,
    config: &DemoSoftwareConfig,
    in_x: u32,
    in_y: u32,
    token: &ShutdownToken,
) -> Result<bool> {
    let geometry = config.geometry();
    geometry.validate()?;
    let factor = geometry.factor()?;
    let rows = config.frame_height / (2 * factor);
    let base = config.video_base;
    let mut input = vec![0u8; config.video_width as usize];
    let mut output = vec![0u8; config.video_width as usize * 2];

    for row in 0..rows {
        let src = geometry.row_address(base, in_x, in_y, row)?;
        master.read(src, &mut input).await?;
        double_pixels(&input, &mut output);
        for line in [2 * row, 2 * row + 1] {
            let dst = geometry.row_address(base, config.zoom_out_x, config.zoom_out_y, line)?;
            master.write(dst, &output).await?;
        }
        trace!("{}: zoom row {row} from 0x{src:08X}", master.name());
        if token.is_cancelled() {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn histogram(
    master: &AhbMaster,
    config: &DemoSoftwareConfig,
    in_x: u32,
    in_y: u32,
    token: &ShutdownToken,
) -> Result<Option<Histogram>> {
    let geometry = config.geometry();
    geometry.validate()?;
    let factor = geometry.factor()?;
    let rows = config.frame_height / (2 * factor);
    let base = config.video_base;
    let mut input = vec![0u8; config.video_width as usize];
    let mut histogram = Histogram::new();

    for row in 0..rows {
        let src = geometry.row_address(base, in_x, in_y, row)?;
        master.read(src, &mut input).await?;
        histogram.accumulate(&input);
    }
    if token.is_cancelled() {
        return Ok(None);
    }

    let mut chart = [0u8; HISTOGRAM_ROW_BYTES];
    for row in 0..HISTOGRAM_HEIGHT {
        histogram.render_row(row, &mut chart);
        let dst = geometry.row_address(
            base,
            config.histogram_out_x,
            config.histogram_out_y,
            row,
        )?;
        master.write(dst, &chart).await?;
        if token.is_cancelled() {
            return Ok(None);
        }
    }
    Ok(Some(histogram))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubling_repeats_chroma_around_luma() {
        let input = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut output = [0u8; 16];
        double_pixels(&input, &mut output);
        assert_eq!(
            output,
            [1, 2, 3, 2, 1, 4, 3, 4, 5, 6, 7, 6, 5, 8, 7, 8]
        );
    }

    #[test]
    fn histogram_counts_luma_only() {
        let mut hist = Histogram::new();
        hist.accumulate(&[255, 0, 255, 7, 255, 255, 255, 255]);
        assert_eq!(hist.buckets()[0], 1);
        assert_eq!(hist.buckets()[1], 1);
        assert_eq!(hist.buckets()[63], 2);
        assert_eq!(hist.total(), 4);
    }

    #[test]
    fn scale_never_drops_below_one() {
        let mut hist = Histogram::new();
        hist.accumulate(&[0, 10, 0, 10]);
        assert_eq!(hist.scale(), 1);
        for _ in 0..200 {
            hist.accumulate(&[0, 10, 0, 10]);
        }
        assert_eq!(hist.max(), 402);
        assert_eq!(hist.scale(), 2);
    }

    #[test]
    fn chart_rows_grow_from_the_bottom() {
        let mut hist = Histogram::new();
        // 10 samples in bucket 2.
        for _ in 0..5 {
            hist.accumulate(&[0, 8, 0, 8]);
        }
        let mut row = [0u8; HISTOGRAM_ROW_BYTES];

        hist.render_row(HISTOGRAM_HEIGHT - 10, &mut row);
        assert_eq!(&row[8..12], &BAR_COLOUR);
        assert_eq!(&row[0..4], &BACKGROUND_COLOUR);

        hist.render_row(HISTOGRAM_HEIGHT - 11, &mut row);
        assert_eq!(&row[8..12], &BACKGROUND_COLOUR);
    }

    #[test]
    fn pan_window_is_clamped() {
        let mut pan = PanWindow::default();
        pan.apply_key(b'l', 2, 160, 120);
        pan.apply_key(b'u', 2, 160, 120);
        assert_eq!(pan, PanWindow { x: 0, y: 0 });

        for _ in 0..100 {
            pan.apply_key(b'r', 2, 160, 120);
            pan.apply_key(b'd', 2, 160, 120);
        }
        assert_eq!(pan, PanWindow { x: 160, y: 120 });

        pan.apply_key(1, 2, 160, 120);
        pan.apply_key(b'x', 2, 160, 120);
        assert_eq!(pan, PanWindow { x: 160, y: 120 });
    }
}
