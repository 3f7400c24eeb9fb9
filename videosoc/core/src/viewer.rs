use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;

use image::RgbImage;
use log::{debug, info};

use crate::{CoreError, Result};

/// Largest width or height a headless viewer agrees to open.
pub const MAX_VIEWER_DIMENSION: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCode {
    Left,
    Right,
    Up,
    Down,
    Char(u8),
}

impl KeyCode {
    /// Byte placed on the key line for this key.
    pub fn key_byte(self) -> u8 {
        match self {
            KeyCode::Left => b'l',
            KeyCode::Right => b'r',
            KeyCode::Up => b'u',
            KeyCode::Down => b'd',
            KeyCode::Char(byte) => byte,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostInput {
    Key(KeyCode),
    /// Key released; reported on the key line as `1`.
    Release,
    Quit,
}

impl HostInput {
    pub fn key_byte(self) -> Option<u8> {
        match self {
            HostInput::Key(code) => Some(code.key_byte()),
            HostInput::Release => Some(1),
            HostInput::Quit => None,
        }
    }
}

/// Parse a scripted input sequence.
///
/// `l`, `r`, `u`, `d` are the arrow keys, `-` is a key release, `q` asks to
/// quit, whitespace is skipped and any other byte is sent as-is.
pub fn parse_key_script(script: &str) -> Vec<HostInput> {
    script
        .bytes()
        .filter(|byte| !byte.is_ascii_whitespace())
        .map(|byte| match byte {
            b'l' => HostInput::Key(KeyCode::Left),
            b'r' => HostInput::Key(KeyCode::Right),
            b'u' => HostInput::Key(KeyCode::Up),
            b'd' => HostInput::Key(KeyCode::Down),
            b'-' => HostInput::Release,
            b'q' => HostInput::Quit,
            other => HostInput::Key(KeyCode::Char(other)),
        })
        .collect()
}

/// Screen the display streams rows into.
pub trait RenderBackend {
    fn open(&mut self, width: u32, height: u32) -> Result<()>;
    /// `row` is packed 4:2:2; pixels beyond the screen are clipped.
    fn draw_row(&mut self, row: &[u8], x: u32, y: u32);
    fn present(&mut self);
    fn poll_input(&mut self) -> Option<HostInput>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

pub type SharedBackend = Rc<RefCell<dyn RenderBackend>>;

fn clamp_channel(value: f32) -> u8 {
    value.clamp(0.0, 255.0) as u8
}

/// Convert one `[U, Y0, V, Y1]` group into two RGB pixels.
pub fn yuv422_to_rgb(group: [u8; 4]) -> [[u8; 3]; 2] {
    let u = group[0] as f32 - 128.0;
    let v = group[2] as f32 - 128.0;
    let pixel = |y: u8| {
        let y = 1.164 * (y as f32 - 16.0);
        [
            clamp_channel(y + 1.596 * v),
            clamp_channel(y - 0.813 * v - 0.391 * u),
            clamp_channel(y + 2.018 * u),
        ]
    };
    [pixel(group[1]), pixel(group[3])]
}

/// In-memory render target with scripted input.
#[derive(Debug, Default)]
pub struct HeadlessViewer {
    width: u32,
    height: u32,
    open: bool,
    rgb: Vec<u8>,
    last_frame: Option<Vec<u8>>,
    input: VecDeque<HostInput>,
    frames_presented: u64,
    rows_drawn: u64,
    opens: u32,
}

impl HeadlessViewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(inputs: impl IntoIterator<Item = HostInput>) -> Self {
        let mut viewer = Self::new();
        viewer.input.extend(inputs);
        viewer
    }

    pub fn push_input(&mut self, input: HostInput) {
        self.input.push_back(input);
    }

    pub fn pending_input(&self) -> usize {
        self.input.len()
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn rows_drawn(&self) -> u64 {
        self.rows_drawn
    }

    pub fn open_count(&self) -> u32 {
        self.opens
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y * self.width + x) * 3) as usize;
        Some([self.rgb[idx], self.rgb[idx + 1], self.rgb[idx + 2]])
    }

    /// Last presented frame, falling back to the frame being drawn.
    pub fn frame_image(&self) -> Option<RgbImage> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        let data = self.last_frame.clone().unwrap_or_else(|| self.rgb.clone());
        RgbImage::from_raw(self.width, self.height, data)
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        let image = self
            .frame_image()
            .ok_or_else(|| CoreError::configuration("viewer was never opened"))?;
        image.save(path)?;
        info!("saved {}x{} frame to {}", self.width, self.height, path.display());
        Ok(())
    }
}

impl RenderBackend for HeadlessViewer {
    fn open(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(CoreError::BackendInit(format!(
                "cannot open a {width}x{height} screen"
            )));
        }
        if width > MAX_VIEWER_DIMENSION || height > MAX_VIEWER_DIMENSION {
            return Err(CoreError::BackendInit(format!(
                "{width}x{height} exceeds the {MAX_VIEWER_DIMENSION} pixel limit"
            )));
        }
        self.width = width;
        self.height = height;
        self.rgb = vec![0; (width * height * 3) as usize];
        self.last_frame = None;
        self.open = true;
        self.opens += 1;
        debug!("headless viewer opened at {width}x{height}");
        Ok(())
    }

    fn draw_row(&mut self, row: &[u8], x: u32, y: u32) {
        if !self.open || y >= self.height {
            return;
        }
        for (pair, chunk) in row.chunks_exact(4).enumerate() {
            let rgb = yuv422_to_rgb([chunk[0], chunk[1], chunk[2], chunk[3]]);
            for (half, pixel) in rgb.iter().enumerate() {
                let px = x + (pair * 2 + half) as u32;
                if px >= self.width {
                    break;
                }
                let idx = ((y * self.width + px) * 3) as usize;
                self.rgb[idx..idx + 3].copy_from_slice(pixel);
            }
        }
        self.rows_drawn += 1;
    }

    fn present(&mut self) {
        if !self.open {
            return;
        }
        self.last_frame = Some(self.rgb.clone());
        self.frames_presented += 1;
    }

    fn poll_input(&mut self) -> Option<HostInput> {
        self.input.pop_front()
    }

    fn close(&mut self) {
        if self.open {
            debug!("headless viewer closed after {} frames", self.frames_presented);
        }
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_chroma_gives_gray() {
        let [first, second] = yuv422_to_rgb([128, 16, 128, 235]);
        assert_eq!(first, [0, 0, 0]);
        assert_eq!(second, [254, 254, 254]);
    }

    #[test]
    fn conversion_clamps() {
        let [pixel, _] = yuv422_to_rgb([255, 255, 255, 0]);
        assert_eq!(pixel[0], 255);
        assert_eq!(pixel[2], 255);
        let [_, dark] = yuv422_to_rgb([0, 0, 0, 0]);
        assert_eq!(dark, [0, 135, 0]);
    }

    #[test]
    fn open_rejects_bad_sizes() {
        let mut viewer = HeadlessViewer::new();
        assert!(matches!(viewer.open(0, 10), Err(CoreError::BackendInit(_))));
        assert!(matches!(
            viewer.open(MAX_VIEWER_DIMENSION + 1, 10),
            Err(CoreError::BackendInit(_))
        ));
        assert!(!viewer.is_open());
        viewer.open(4, 2).unwrap();
        assert!(viewer.is_open());
    }

    #[test]
    fn draw_row_clips_to_width() {
        let mut viewer = HeadlessViewer::new();
        viewer.open(2, 1).unwrap();
        viewer.draw_row(&[128, 235, 128, 235, 128, 235, 128, 235], 0, 0);
        assert_eq!(viewer.pixel(1, 0), Some([254, 254, 254]));
        assert_eq!(viewer.pixel(2, 0), None);
        viewer.present();
        assert_eq!(viewer.frames_presented(), 1);
        assert!(viewer.frame_image().is_some());
    }

    #[test]
    fn key_script_maps_arrows_and_release() {
        let script = parse_key_script("r u - q x");
        assert_eq!(
            script,
            vec![
                HostInput::Key(KeyCode::Right),
                HostInput::Key(KeyCode::Up),
                HostInput::Release,
                HostInput::Quit,
                HostInput::Key(KeyCode::Char(b'x')),
            ]
        );
        let bytes: Vec<Option<u8>> = script.iter().map(|input| input.key_byte()).collect();
        assert_eq!(bytes, vec![Some(b'r'), Some(b'u'), Some(1), None, Some(b'x')]);
    }
}
