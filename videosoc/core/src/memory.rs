use serde::{Deserialize, Serialize};

use crate::async_driver::current_time;
use crate::{CoreError, Result};

pub const DEFAULT_VIDEO_BASE: u32 = 0xA000_0000;
pub const DEFAULT_VIDEO_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub time_ns: u64,
    pub kind: AccessKind,
    pub addr: u32,
    pub len: usize,
    /// Generation observed by a read, or produced by a write.
    pub generation: u64,
}

/// Shared frame store.
///
/// There is no locking: a reader sees whatever bytes are present when it
/// runs, possibly half of a frame a producer is still writing. Each write
/// bumps `generation`, which lets tests tell which writes a read observed.
#[derive(Debug, Clone)]
pub struct VideoMemory {
    base: u32,
    data: Vec<u8>,
    generation: u64,
    log: Option<Vec<AccessRecord>>,
}

impl VideoMemory {
    pub fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            data: vec![0; size],
            generation: 0,
            log: None,
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn contains(&self, addr: u32, len: usize) -> bool {
        self.range(addr, len).is_some()
    }

    fn range(&self, addr: u32, len: usize) -> Option<std::ops::Range<usize>> {
        let start = addr.checked_sub(self.base)? as usize;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }

    fn out_of_range(&self, addr: u32, len: usize) -> CoreError {
        CoreError::bus(
            addr,
            format!(
                "{len} byte access outside video memory 0x{:08X}+0x{:X}",
                self.base,
                self.data.len()
            ),
        )
    }

    fn record(&mut self, kind: AccessKind, addr: u32, len: usize) {
        if let Some(log) = self.log.as_mut() {
            log.push(AccessRecord {
                time_ns: current_time(),
                kind,
                addr,
                len,
                generation: self.generation,
            });
        }
    }

    pub fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<u64> {
        let range = self
            .range(addr, buf.len())
            .ok_or_else(|| self.out_of_range(addr, buf.len()))?;
        buf.copy_from_slice(&self.data[range]);
        self.record(AccessKind::Read, addr, buf.len());
        Ok(self.generation)
    }

    pub fn write(&mut self, addr: u32, buf: &[u8]) -> Result<u64> {
        let range = self
            .range(addr, buf.len())
            .ok_or_else(|| self.out_of_range(addr, buf.len()))?;
        self.data[range].copy_from_slice(buf);
        self.generation += 1;
        self.record(AccessKind::Write, addr, buf.len());
        Ok(self.generation)
    }

    /// Borrow bytes without touching the generation or the access log.
    pub fn peek(&self, addr: u32, len: usize) -> Option<&[u8]> {
        self.range(addr, len).map(|range| &self.data[range])
    }

    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
        self.generation += 1;
    }

    pub fn begin_access_log(&mut self) {
        self.log = Some(Vec::new());
    }

    /// Stop logging and hand back everything recorded since
    /// [`VideoMemory::begin_access_log`].
    pub fn take_access_log(&mut self) -> Vec<AccessRecord> {
        self.log.take().unwrap_or_default()
    }

    pub fn is_logging(&self) -> bool {
        self.log.is_some()
    }
}

impl Default for VideoMemory {
    fn default() -> Self {
        Self::new(DEFAULT_VIDEO_BASE, DEFAULT_VIDEO_SIZE)
    }
}
