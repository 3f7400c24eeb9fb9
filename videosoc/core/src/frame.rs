use serde::{Deserialize, Serialize};

use crate::{CoreError, Result};

/// Bytes per pixel in packed 4:2:2 (`[U, Y0, V, Y1]` per pixel pair).
pub const BYTES_PER_PIXEL: u32 = 2;

/// Largest dimension a SIZE or position register field can carry.
pub const MAX_DIMENSION: u32 = 0xFFFF;

/// Pack a `(high, low)` pair of 16-bit fields into a register word.
pub fn pack_pair(high: u32, low: u32) -> u32 {
    ((high & 0xFFFF) << 16) | (low & 0xFFFF)
}

pub fn unpack_pair(word: u32) -> (u32, u32) {
    (word >> 16, word & 0xFFFF)
}

/// Layout of one frame inside video memory.
///
/// `frame_width` is the width of the whole stored frame in pixels and must
/// be a positive multiple of `video_width`, the width a peripheral handles
/// per row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub video_width: u32,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl FrameGeometry {
    pub fn new(video_width: u32, frame_width: u32, frame_height: u32) -> Self {
        Self {
            video_width,
            frame_width,
            frame_height,
        }
    }

    pub fn from_size_register(video_width: u32, size: u32) -> Self {
        let (frame_width, frame_height) = unpack_pair(size);
        Self::new(video_width, frame_width, frame_height)
    }

    pub fn factor(&self) -> Result<u32> {
        if self.video_width == 0 || self.frame_height == 0 {
            return Err(CoreError::configuration(format!(
                "degenerate geometry {}x{} (video width {})",
                self.frame_width, self.frame_height, self.video_width
            )));
        }
        let factor = self.frame_width / self.video_width;
        if factor == 0 {
            return Err(CoreError::configuration(format!(
                "frame width {} is smaller than video width {}",
                self.frame_width, self.video_width
            )));
        }
        Ok(factor)
    }

    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("video width", self.video_width),
            ("frame width", self.frame_width),
            ("frame height", self.frame_height),
        ];
        if let Some((what, value)) = dims.iter().find(|(_, value)| *value > MAX_DIMENSION) {
            return Err(CoreError::configuration(format!(
                "{what} {value} exceeds the 16-bit register field"
            )));
        }
        self.factor()?;
        self.stride().map(|_| ())
    }

    /// Bytes of one processed row.
    pub fn row_bytes(&self) -> Result<usize> {
        self.video_width
            .checked_mul(BYTES_PER_PIXEL)
            .map(|bytes| bytes as usize)
            .ok_or_else(|| self.overflow())
    }

    pub fn stride(&self) -> Result<u32> {
        let factor = self.factor()?;
        self.video_width
            .checked_mul(BYTES_PER_PIXEL)
            .and_then(|bytes| bytes.checked_mul(factor))
            .ok_or_else(|| self.overflow())
    }

    /// Rows handled per frame: `frame_height / factor`.
    pub fn rows(&self) -> Result<u32> {
        Ok(self.frame_height / self.factor()?)
    }

    pub fn row_address(&self, base: u32, x: u32, y: u32, row: u32) -> Result<u32> {
        let stride = self.stride()?;
        Ok(base
            .wrapping_add(x.wrapping_mul(BYTES_PER_PIXEL))
            .wrapping_add(y.wrapping_mul(stride))
            .wrapping_add(row.wrapping_mul(stride)))
    }

    fn overflow(&self) -> CoreError {
        CoreError::configuration(format!(
            "row of {} pixels (frame width {}) overflows the address space",
            self.video_width, self.frame_width
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_geometry() {
        let geometry = FrameGeometry::new(320, 640, 480);
        assert_eq!(geometry.factor().unwrap(), 2);
        assert_eq!(geometry.stride().unwrap(), 1280);
        assert_eq!(geometry.rows().unwrap(), 240);
        assert_eq!(geometry.row_bytes().unwrap(), 640);
        assert_eq!(
            geometry.row_address(0xA000_0000, 320, 0, 1).unwrap(),
            0xA000_0000 + 640 + 1280
        );
    }

    #[test]
    fn narrow_frame_is_rejected() {
        assert!(FrameGeometry::new(320, 160, 480).factor().is_err());
        assert!(FrameGeometry::new(0, 640, 480).factor().is_err());
        assert!(FrameGeometry::new(320, 640, 0).validate().is_err());
    }

    #[test]
    fn oversized_geometry_is_an_error_not_a_panic() {
        let huge = FrameGeometry::new(0x8000_0000, 0x8000_0000, 480);
        assert!(matches!(huge.stride(), Err(CoreError::Configuration(_))));
        assert!(matches!(huge.row_bytes(), Err(CoreError::Configuration(_))));
        assert!(huge.validate().is_err());

        assert!(FrameGeometry::new(320, 640, 0x1_0000).validate().is_err());
        FrameGeometry::new(0xFFFF, 0xFFFF, 0xFFFF).validate().unwrap();
    }

    #[test]
    fn pairs_pack_into_halves() {
        assert_eq!(pack_pair(640, 480), 0x0280_01E0);
        assert_eq!(unpack_pair(0x0280_01E0), (640, 480));
    }
}
