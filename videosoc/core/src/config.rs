use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bus::{BusLayer, BusTiming};
use crate::camera::CameraConfig;
use crate::demosoftware::DemoSoftwareConfig;
use crate::display::DisplayConfig;
use crate::frame::{FrameGeometry, MAX_DIMENSION};
use crate::frametrigger::FrameTriggerConfig;
use crate::grayframer::GrayframerConfig;
use crate::keyboard::KeyboardConfig;
use crate::memory::{DEFAULT_VIDEO_BASE, DEFAULT_VIDEO_SIZE};
use crate::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub base: u32,
    pub size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_VIDEO_BASE,
            size: DEFAULT_VIDEO_SIZE,
        }
    }
}

/// Everything needed to assemble the demo SoC. Every field has a default,
/// so a JSON file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub bus: BusTiming,
    pub memory: MemoryConfig,
    pub frametrigger: FrameTriggerConfig,
    pub camera: CameraConfig,
    pub grayframer: GrayframerConfig,
    /// Insert the zoom/histogram unit between the filter and the display.
    pub demo_enabled: bool,
    pub demo: DemoSoftwareConfig,
    pub display: DisplayConfig,
    pub keyboard: KeyboardConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            bus: BusTiming::default(),
            memory: MemoryConfig::default(),
            frametrigger: FrameTriggerConfig::default(),
            camera: CameraConfig::default(),
            grayframer: GrayframerConfig::default(),
            demo_enabled: true,
            demo: DemoSoftwareConfig::default(),
            display: DisplayConfig::default(),
            keyboard: KeyboardConfig::default(),
        }
    }
}

impl PlatformConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Apply one frame layout to every peripheral.
    pub fn with_geometry(mut self, geometry: FrameGeometry) -> Self {
        let FrameGeometry {
            video_width,
            frame_width,
            frame_height,
        } = geometry;
        self.camera.video_width = video_width;
        self.camera.frame_width = frame_width;
        self.camera.frame_height = frame_height;
        self.grayframer.video_width = video_width;
        self.grayframer.frame_width = frame_width;
        self.grayframer.frame_height = frame_height;
        self.demo.video_width = video_width;
        self.demo.frame_width = frame_width;
        self.demo.frame_height = frame_height;
        self.display.width = frame_width;
        self.display.height = frame_height;
        self
    }

    pub fn with_layer(mut self, layer: BusLayer) -> Self {
        self.frametrigger.layer = layer;
        self.camera.layer = layer;
        self.grayframer.layer = layer;
        self.demo.layer = layer;
        self.display.layer = layer;
        self
    }

    pub fn with_clock_ns(mut self, clock_ns: u64) -> Self {
        self.bus.clock_ns = clock_ns;
        self.display.row_delay_ns = clock_ns;
        self
    }

    pub fn with_demo(mut self, enabled: bool) -> Self {
        self.demo_enabled = enabled;
        self
    }

    pub fn apb_windows(&self) -> Vec<(&str, u32)> {
        vec![
            (self.display.name.as_str(), self.display.apb_base),
            (self.camera.name.as_str(), self.camera.apb_base),
            (self.grayframer.name.as_str(), self.grayframer.apb_base),
            (self.keyboard.name.as_str(), self.keyboard.apb_base),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.bus.clock_ns == 0 {
            return Err(CoreError::configuration("bus clock period must be non-zero"));
        }
        if self.bus.bytes_per_beat == 0 {
            return Err(CoreError::configuration("bytes per beat must be non-zero"));
        }
        if self.memory.size == 0 {
            return Err(CoreError::configuration("video memory size must be non-zero"));
        }

        let geometries = [
            (&self.camera.name, FrameGeometry::new(
                self.camera.video_width,
                self.camera.frame_width,
                self.camera.frame_height,
            )),
            (&self.grayframer.name, FrameGeometry::new(
                self.grayframer.video_width,
                self.grayframer.frame_width,
                self.grayframer.frame_height,
            )),
            (&self.demo.name, self.demo.geometry()),
        ];
        for (name, geometry) in geometries {
            geometry
                .validate()
                .map_err(|err| CoreError::configuration(format!("{name}: {err}")))?;
        }

        if self.display.width == 0 || self.display.height == 0 {
            return Err(CoreError::configuration(format!(
                "{}: screen size {}x{} is empty",
                self.display.name, self.display.width, self.display.height
            )));
        }
        if self.display.width > MAX_DIMENSION || self.display.height > MAX_DIMENSION {
            return Err(CoreError::configuration(format!(
                "{}: screen size {}x{} exceeds the 16-bit register field",
                self.display.name, self.display.width, self.display.height
            )));
        }
        let frame_bytes = self.display.width as u64 * self.display.height as u64 * 2;
        if frame_bytes > self.memory.size as u64 {
            return Err(CoreError::configuration(format!(
                "a {}x{} frame needs {frame_bytes} bytes, video memory has {}",
                self.display.width, self.display.height, self.memory.size
            )));
        }

        let windows = self.apb_windows();
        for (idx, (name, base)) in windows.iter().enumerate() {
            if base % 4 != 0 {
                return Err(CoreError::configuration(format!(
                    "{name}: APB base 0x{base:08X} is not word aligned"
                )));
            }
            if let Some((other, _)) = windows[idx + 1..].iter().find(|(_, b)| b == base) {
                return Err(CoreError::configuration(format!(
                    "{name} and {other} share APB base 0x{base:08X}"
                )));
            }
        }
        Ok(())
    }
}
