use std::fmt;
use std::rc::Rc;

use log::info;
use serde::{Deserialize, Serialize};

use crate::{CoreError, Result};

/// Hooks a peripheral attaches to one of its registers.
///
/// `on_pre_read` may replace the stored value before it is returned on the
/// bus. `on_post_write` sees the value after the write mask was applied.
pub trait RegisterHandler {
    fn on_pre_read(&self, _bank: &RegisterBank, value: u32) -> u32 {
        value
    }

    fn on_post_write(&self, _bank: &RegisterBank, _value: u32) -> Result<()> {
        Ok(())
    }
}

pub struct Register {
    name: String,
    description: String,
    offset: u32,
    reset: u32,
    mask: u32,
    value: u32,
    handler: Option<Rc<dyn RegisterHandler>>,
}

impl Register {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn reset_value(&self) -> u32 {
        self.reset
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn with_handler(&mut self, handler: Rc<dyn RegisterHandler>) -> &mut Self {
        self.handler = Some(handler);
        self
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Register")
            .field("name", &self.name)
            .field("offset", &format_args!("0x{:02X}", self.offset))
            .field("mask", &format_args!("0x{:08X}", self.mask))
            .field("value", &format_args!("0x{:08X}", self.value))
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSnapshot {
    pub name: String,
    pub offset: u32,
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankSnapshot {
    pub bank: String,
    pub registers: Vec<RegisterSnapshot>,
}

/// Named, offset-addressed control registers of one peripheral.
#[derive(Debug)]
pub struct RegisterBank {
    name: String,
    registers: Vec<Register>,
}

impl RegisterBank {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            registers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Register a new word at `offset`. The initial value is `reset & mask`.
    pub fn create_register(
        &mut self,
        name: &str,
        description: &str,
        offset: u32,
        reset: u32,
        mask: u32,
    ) -> &mut Register {
        self.registers.retain(|reg| reg.offset != offset);
        self.registers.push(Register {
            name: name.to_string(),
            description: description.to_string(),
            offset,
            reset,
            mask,
            value: reset & mask,
            handler: None,
        });
        let last = self.registers.len() - 1;
        &mut self.registers[last]
    }

    pub fn contains(&self, offset: u32) -> bool {
        self.find(offset).is_some()
    }

    pub fn register(&self, name: &str) -> Option<&Register> {
        self.registers.iter().find(|reg| reg.name == name)
    }

    fn find(&self, offset: u32) -> Option<usize> {
        self.registers.iter().position(|reg| reg.offset == offset)
    }

    fn missing(&self, offset: u32) -> CoreError {
        CoreError::bus(
            offset,
            format!("no register at offset 0x{offset:02X} in bank {}", self.name),
        )
    }

    /// Bus-side read: runs the pre-read hook, if any.
    pub fn read(&self, offset: u32) -> Result<u32> {
        let idx = self.find(offset).ok_or_else(|| self.missing(offset))?;
        let reg = &self.registers[idx];
        let value = match reg.handler.clone() {
            Some(handler) => handler.on_pre_read(self, reg.value),
            None => reg.value,
        };
        Ok(value)
    }

    /// Bus-side write: stores `value & mask`, then runs the post-write hook.
    pub fn write(&mut self, offset: u32, value: u32) -> Result<()> {
        let idx = self.find(offset).ok_or_else(|| self.missing(offset))?;
        let reg = &mut self.registers[idx];
        reg.value = value & reg.mask;
        let stored = reg.value;
        match reg.handler.clone() {
            Some(handler) => handler.on_post_write(self, stored),
            None => Ok(()),
        }
    }

    /// Stored value without hooks.
    pub fn get(&self, name: &str) -> Option<u32> {
        self.register(name).map(Register::value)
    }

    /// Device-side update: bypasses the mask and the hooks.
    pub fn set(&mut self, name: &str, value: u32) -> Result<()> {
        let bank = self.name.clone();
        let reg = self
            .registers
            .iter_mut()
            .find(|reg| reg.name == name)
            .ok_or_else(|| CoreError::configuration(format!("unknown register {name} in {bank}")))?;
        reg.value = value;
        Ok(())
    }

    pub fn reset(&mut self) {
        for reg in &mut self.registers {
            reg.value = reg.reset & reg.mask;
        }
    }

    pub fn snapshot(&self) -> BankSnapshot {
        let mut registers: Vec<RegisterSnapshot> = self
            .registers
            .iter()
            .map(|reg| RegisterSnapshot {
                name: reg.name.clone(),
                offset: reg.offset,
                value: reg.value,
            })
            .collect();
        registers.sort_by_key(|reg| reg.offset);
        BankSnapshot {
            bank: self.name.clone(),
            registers,
        }
    }

    pub fn log_snapshot(&self) {
        for reg in self.snapshot().registers {
            info!(
                "{}: {:<8} @0x{:02X} = 0x{:08X}",
                self.name, reg.name, reg.offset, reg.value
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Recorder {
        seen: Cell<Option<u32>>,
    }

    impl RegisterHandler for Recorder {
        fn on_pre_read(&self, _bank: &RegisterBank, value: u32) -> u32 {
            value | 0x8000_0000
        }

        fn on_post_write(&self, _bank: &RegisterBank, value: u32) -> Result<()> {
            self.seen.set(Some(value));
            Ok(())
        }
    }

    #[test]
    fn write_applies_mask_before_handler() {
        let mut bank = RegisterBank::new("test");
        let recorder = Rc::new(Recorder {
            seen: Cell::new(None),
        });
        bank.create_register("ADDR", "base address", 0x04, 0xA000_0000, 0xFFFF_F000)
            .with_handler(recorder.clone());

        bank.write(0x04, 0xA012_3456).unwrap();
        assert_eq!(bank.get("ADDR"), Some(0xA012_3000));
        assert_eq!(recorder.seen.get(), Some(0xA012_3000));
        assert_eq!(bank.read(0x04).unwrap(), 0xA012_3000 | 0x8000_0000);
    }

    #[test]
    fn reset_restores_masked_reset_value() {
        let mut bank = RegisterBank::new("test");
        bank.create_register("CTRL", "control", 0x00, 0x1FF, 0xFF);
        assert_eq!(bank.get("CTRL"), Some(0xFF));
        bank.write(0x00, 0x12).unwrap();
        bank.reset();
        assert_eq!(bank.get("CTRL"), Some(0xFF));
    }

    #[test]
    fn unknown_offset_is_a_bus_error() {
        let mut bank = RegisterBank::new("test");
        bank.create_register("CTRL", "control", 0x00, 0, 0xFF);
        assert!(matches!(bank.write(0x08, 1), Err(CoreError::Bus { addr: 0x08, .. })));
        assert!(bank.read(0x08).is_err());
    }

    #[test]
    fn set_bypasses_mask() {
        let mut bank = RegisterBank::new("test");
        bank.create_register("CTRL", "control", 0x00, 0, 0x0F);
        bank.set("CTRL", 0xF0).unwrap();
        assert_eq!(bank.get("CTRL"), Some(0xF0));
        assert!(bank.set("NOPE", 1).is_err());
    }

    #[test]
    fn snapshot_is_sorted_by_offset() {
        let mut bank = RegisterBank::new("display");
        bank.create_register("Height", "", 0x0C, 480, u32::MAX);
        bank.create_register("CTRL", "", 0x00, 0, 0xFF);
        let snap = bank.snapshot();
        let offsets: Vec<u32> = snap.registers.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0x00, 0x0C]);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"Height\""));
    }
}
