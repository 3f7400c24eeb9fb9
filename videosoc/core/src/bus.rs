use std::cell::RefCell;
use std::rc::Rc;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::async_driver::sleep_ns;
use crate::memory::VideoMemory;
use crate::register::RegisterBank;
use crate::{CoreError, Result};

pub const APB_SLAVE_SIZE: u32 = 0x100;

/// Transaction-level modelling style of a bus master.
///
/// `Lt` completes the transfer and then waits out the whole cost; `At`
/// waits the address phase, transfers, then waits the data phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum BusLayer {
    #[default]
    Lt,
    At,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusTiming {
    pub clock_ns: u64,
    pub setup_cycles: u64,
    pub bytes_per_beat: usize,
    pub apb_cycles: u64,
}

impl Default for BusTiming {
    fn default() -> Self {
        Self {
            clock_ns: 10,
            setup_cycles: 1,
            bytes_per_beat: 4,
            apb_cycles: 2,
        }
    }
}

impl BusTiming {
    pub fn memory_cost(&self, len: usize) -> BusCost {
        let beats = len.div_ceil(self.bytes_per_beat.max(1)) as u64;
        BusCost {
            address_ns: self.setup_cycles * self.clock_ns,
            data_ns: beats * self.clock_ns,
        }
    }

    pub fn register_cost(&self) -> BusCost {
        BusCost {
            address_ns: self.setup_cycles * self.clock_ns,
            data_ns: self.apb_cycles * self.clock_ns,
        }
    }
}

/// Simulated time a transaction occupies the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusCost {
    pub address_ns: u64,
    pub data_ns: u64,
}

impl BusCost {
    pub fn total(&self) -> u64 {
        self.address_ns + self.data_ns
    }
}

pub trait BusPort {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<BusCost>;
    fn write(&mut self, addr: u32, buf: &[u8]) -> Result<BusCost>;
    /// Cost a transfer would have, without performing it.
    fn estimate(&self, addr: u32, len: usize) -> BusCost;
}

pub type SharedBus = Rc<RefCell<dyn BusPort>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub register_reads: u64,
    pub register_writes: u64,
    pub errors: u64,
}

struct ApbSlave {
    name: String,
    base: u32,
    bank: Rc<RefCell<RegisterBank>>,
}

enum Target {
    Memory,
    Register(usize, u32),
}

/// Address decoder in front of the video memory and the APB register banks.
pub struct SystemBus {
    memory: Rc<RefCell<VideoMemory>>,
    slaves: Vec<ApbSlave>,
    timing: BusTiming,
    stats: BusStats,
}

impl SystemBus {
    pub fn new(memory: Rc<RefCell<VideoMemory>>, timing: BusTiming) -> Self {
        Self {
            memory,
            slaves: Vec::new(),
            timing,
            stats: BusStats::default(),
        }
    }

    pub fn map_registers(
        &mut self,
        name: &str,
        base: u32,
        bank: Rc<RefCell<RegisterBank>>,
    ) -> Result<()> {
        let end = base as u64 + APB_SLAVE_SIZE as u64;
        if let Some(other) = self
            .slaves
            .iter()
            .find(|slave| (base as u64) < slave.base as u64 + APB_SLAVE_SIZE as u64 && (slave.base as u64) < end)
        {
            return Err(CoreError::configuration(format!(
                "APB window of {name} at 0x{base:08X} overlaps {}",
                other.name
            )));
        }
        let memory = self.memory.borrow();
        let mem_start = memory.base() as u64;
        let mem_end = mem_start + memory.size() as u64;
        if (base as u64) < mem_end && mem_start < end {
            return Err(CoreError::configuration(format!(
                "APB window of {name} at 0x{base:08X} overlaps video memory"
            )));
        }
        drop(memory);
        self.slaves.push(ApbSlave {
            name: name.to_string(),
            base,
            bank,
        });
        Ok(())
    }

    pub fn memory(&self) -> Rc<RefCell<VideoMemory>> {
        self.memory.clone()
    }

    pub fn timing(&self) -> BusTiming {
        self.timing
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }

    pub fn slave_names(&self) -> Vec<&str> {
        self.slaves.iter().map(|slave| slave.name.as_str()).collect()
    }

    fn decode(&self, addr: u32, len: usize) -> Result<Target> {
        if let Some((idx, slave)) = self
            .slaves
            .iter()
            .enumerate()
            .find(|(_, slave)| addr >= slave.base && addr - slave.base < APB_SLAVE_SIZE)
        {
            let offset = addr - slave.base;
            if len != 4 || offset % 4 != 0 {
                return Err(CoreError::bus(
                    addr,
                    format!("register access must be one aligned 32-bit word, got {len} bytes"),
                ));
            }
            if !slave.bank.borrow().contains(offset) {
                return Err(CoreError::bus(
                    addr,
                    format!("no register at offset 0x{offset:02X} of {}", slave.name),
                ));
            }
            return Ok(Target::Register(idx, offset));
        }
        if self.memory.borrow().contains(addr, len) {
            return Ok(Target::Memory);
        }
        Err(CoreError::bus(addr, format!("unmapped {len} byte access")))
    }

    fn read_inner(&mut self, addr: u32, buf: &mut [u8]) -> Result<BusCost> {
        match self.decode(addr, buf.len())? {
            Target::Memory => {
                self.memory.borrow_mut().read(addr, buf)?;
                self.stats.reads += 1;
                self.stats.bytes_read += buf.len() as u64;
                Ok(self.timing.memory_cost(buf.len()))
            }
            Target::Register(idx, offset) => {
                let value = self.slaves[idx].bank.borrow().read(offset)?;
                buf.copy_from_slice(&value.to_be_bytes());
                self.stats.register_reads += 1;
                Ok(self.timing.register_cost())
            }
        }
    }

    fn write_inner(&mut self, addr: u32, buf: &[u8]) -> Result<BusCost> {
        match self.decode(addr, buf.len())? {
            Target::Memory => {
                self.memory.borrow_mut().write(addr, buf)?;
                self.stats.writes += 1;
                self.stats.bytes_written += buf.len() as u64;
                Ok(self.timing.memory_cost(buf.len()))
            }
            Target::Register(idx, offset) => {
                let value = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
                trace!(
                    "{}: write 0x{value:08X} to offset 0x{offset:02X}",
                    self.slaves[idx].name
                );
                self.stats.register_writes += 1;
                self.slaves[idx].bank.borrow_mut().write(offset, value)?;
                Ok(self.timing.register_cost())
            }
        }
    }
}

impl BusPort for SystemBus {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<BusCost> {
        let result = self.read_inner(addr, buf);
        if result.is_err() {
            self.stats.errors += 1;
        }
        result
    }

    fn write(&mut self, addr: u32, buf: &[u8]) -> Result<BusCost> {
        let result = self.write_inner(addr, buf);
        if result.is_err() {
            self.stats.errors += 1;
        }
        result
    }

    fn estimate(&self, addr: u32, len: usize) -> BusCost {
        match self.decode(addr, len) {
            Ok(Target::Register(..)) => self.timing.register_cost(),
            _ => self.timing.memory_cost(len),
        }
    }
}

/// Bus master handle owned by one peripheral task.
///
/// The shared bus is only borrowed for the duration of a transfer, never
/// across the timed wait that follows it.
#[derive(Clone)]
pub struct AhbMaster {
    name: String,
    index: u32,
    bus: SharedBus,
    layer: BusLayer,
}

impl AhbMaster {
    pub fn new(name: &str, index: u32, bus: SharedBus, layer: BusLayer) -> Self {
        Self {
            name: name.to_string(),
            index,
            bus,
            layer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn layer(&self) -> BusLayer {
        self.layer
    }

    pub async fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        match self.layer {
            BusLayer::Lt => {
                let cost = self.bus.borrow_mut().read(addr, buf)?;
                sleep_ns(cost.total()).await;
            }
            BusLayer::At => {
                let cost = self.bus.borrow().estimate(addr, buf.len());
                sleep_ns(cost.address_ns).await;
                let cost = self.bus.borrow_mut().read(addr, buf)?;
                sleep_ns(cost.data_ns).await;
            }
        }
        Ok(())
    }

    pub async fn write(&self, addr: u32, buf: &[u8]) -> Result<()> {
        match self.layer {
            BusLayer::Lt => {
                let cost = self.bus.borrow_mut().write(addr, buf)?;
                sleep_ns(cost.total()).await;
            }
            BusLayer::At => {
                let cost = self.bus.borrow().estimate(addr, buf.len());
                sleep_ns(cost.address_ns).await;
                let cost = self.bus.borrow_mut().write(addr, buf)?;
                sleep_ns(cost.data_ns).await;
            }
        }
        Ok(())
    }

    pub async fn write_word(&self, addr: u32, value: u32) -> Result<()> {
        self.write(addr, &value.to_be_bytes()).await
    }

    pub async fn read_word(&self, addr: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_driver::{current_time, AsyncDriver};
    use std::cell::Cell;

    fn bus_with_bank() -> (Rc<RefCell<SystemBus>>, Rc<RefCell<RegisterBank>>) {
        let memory = Rc::new(RefCell::new(VideoMemory::new(0xA000_0000, 0x1000)));
        let mut bank = RegisterBank::new("dev");
        bank.create_register("CTRL", "control", 0x00, 0, 0xFF);
        bank.create_register("ADDR", "address", 0x04, 0, 0xFFFF_F000);
        let bank = Rc::new(RefCell::new(bank));
        let mut bus = SystemBus::new(memory, BusTiming::default());
        bus.map_registers("dev", 0x8005_0000, bank.clone()).unwrap();
        (Rc::new(RefCell::new(bus)), bank)
    }

    #[test]
    fn register_words_are_big_endian() {
        let (bus, bank) = bus_with_bank();
        bus.borrow_mut()
            .write(0x8005_0000, &[0x00, 0x00, 0x00, 0x03])
            .unwrap();
        assert_eq!(bank.borrow().get("CTRL"), Some(3));

        let mut buf = [0u8; 4];
        bank.borrow_mut().set("ADDR", 0xA000_1000).unwrap();
        bus.borrow_mut().read(0x8005_0004, &mut buf).unwrap();
        assert_eq!(buf, [0xA0, 0x00, 0x10, 0x00]);
    }

    #[test]
    fn misaligned_or_unmapped_accesses_fail() {
        let (bus, _bank) = bus_with_bank();
        let mut bus = bus.borrow_mut();
        assert!(bus.write(0x8005_0002, &[0; 4]).is_err());
        assert!(bus.write(0x8005_0000, &[0; 2]).is_err());
        assert!(bus.write(0x8005_0008, &[0; 4]).is_err());
        assert!(bus.write(0x1000_0000, &[0; 4]).is_err());
        assert_eq!(bus.stats().errors, 4);
    }

    #[test]
    fn overlapping_windows_are_rejected() {
        let (bus, bank) = bus_with_bank();
        assert!(bus
            .borrow_mut()
            .map_registers("again", 0x8005_0080, bank.clone())
            .is_err());
        assert!(bus
            .borrow_mut()
            .map_registers("video", 0xA000_0000, bank)
            .is_err());
    }

    #[test]
    fn memory_cost_counts_beats() {
        let timing = BusTiming::default();
        let cost = timing.memory_cost(640);
        assert_eq!(cost.address_ns, 10);
        assert_eq!(cost.data_ns, 160 * 10);
        assert_eq!(timing.memory_cost(5).data_ns, 20);
    }

    fn timed_write(layer: BusLayer) -> (u64, u64) {
        let (bus, _bank) = bus_with_bank();
        let memory = bus.borrow().memory();
        let shared: SharedBus = bus;
        let master = AhbMaster::new("m", 0, shared, layer);
        let seen_generation_at = Rc::new(Cell::new(0));
        let done_at = Rc::new(Cell::new(0));
        let mut driver = AsyncDriver::new();

        let probe_mem = memory.clone();
        let probe = seen_generation_at.clone();
        driver.spawn(async move {
            // Sample just after the address phase would have ended.
            sleep_ns(15).await;
            probe.set(probe_mem.borrow().generation());
        });
        let done = done_at.clone();
        driver.spawn(async move {
            master.write(0xA000_0000, &[1; 8]).await.unwrap();
            done.set(current_time());
        });
        driver.run_for(1_000);
        (seen_generation_at.get(), done_at.get())
    }

    #[test]
    fn lt_and_at_take_the_same_time() {
        let (lt_gen, lt_done) = timed_write(BusLayer::Lt);
        let (at_gen, at_done) = timed_write(BusLayer::At);
        assert_eq!(lt_done, 30);
        assert_eq!(at_done, 30);
        assert_eq!(lt_gen, 1);
        assert_eq!(at_gen, 1);
    }

    #[test]
    fn at_transfer_happens_after_address_phase() {
        let (bus, _bank) = bus_with_bank();
        let memory = bus.borrow().memory();
        let shared: SharedBus = bus;
        let master = AhbMaster::new("m", 0, shared, BusLayer::At);
        let before = Rc::new(Cell::new(u64::MAX));
        let mut driver = AsyncDriver::new();

        let probe_mem = memory.clone();
        let probe = before.clone();
        driver.spawn(async move {
            sleep_ns(5).await;
            probe.set(probe_mem.borrow().generation());
        });
        driver.spawn(async move {
            master.write(0xA000_0000, &[1; 8]).await.unwrap();
        });
        driver.run_for(1_000);
        assert_eq!(before.get(), 0);
    }
}
