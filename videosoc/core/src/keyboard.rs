use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::async_driver::{AsyncDriver, Trigger};
use crate::register::RegisterBank;
use crate::signal::Signal;

pub const DATA: u32 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyboardConfig {
    pub name: String,
    pub apb_base: u32,
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self {
            name: "keyboard".to_string(),
            apb_base: 0x8005_0300,
        }
    }
}

struct LatchState {
    name: String,
    received: Cell<u64>,
    key_received: Trigger,
}

/// APB slave exposing the most recent key code in its `data` register.
///
/// There is no queue: a key that arrives before the previous one was read
/// replaces it.
pub struct KeyboardLatch {
    config: KeyboardConfig,
    registers: Rc<RefCell<RegisterBank>>,
    state: Rc<LatchState>,
}

impl KeyboardLatch {
    pub fn new(config: KeyboardConfig, key_in: &Signal<u8>) -> Self {
        let mut bank = RegisterBank::new(&config.name);
        bank.create_register("data", "Keyboard Data Register", DATA, 0x00, 0xFF);
        let registers = Rc::new(RefCell::new(bank));
        let state = Rc::new(LatchState {
            name: config.name.clone(),
            received: Cell::new(0),
            key_received: Trigger::new(&format!("{}.key", config.name)),
        });

        let latch_registers = registers.clone();
        let latch_state = state.clone();
        key_in.on_change(move |key| {
            if let Err(err) = latch_registers.borrow_mut().set("data", u32::from(key)) {
                warn!("{}: dropped key 0x{key:02X}: {err}", latch_state.name);
                return;
            }
            latch_state.received.set(latch_state.received.get() + 1);
            latch_state.key_received.notify();
        });

        Self {
            config,
            registers,
            state,
        }
    }

    pub fn config(&self) -> &KeyboardConfig {
        &self.config
    }

    pub fn registers(&self) -> Rc<RefCell<RegisterBank>> {
        self.registers.clone()
    }

    pub fn data(&self) -> u8 {
        self.registers.borrow().get("data").unwrap_or(0) as u8
    }

    pub fn keys_received(&self) -> u64 {
        self.state.received.get()
    }

    pub fn start(&self, driver: &mut AsyncDriver) {
        let state = self.state.clone();
        let registers = self.registers.clone();
        let token = driver.token();
        driver.spawn(async move {
            loop {
                state.key_received.wait().await;
                if token.is_cancelled() {
                    break;
                }
                let key = registers.borrow().get("data").unwrap_or(0);
                info!("{}: got key 0x{key:02X}", state.name);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_follows_signal_changes() {
        let key = Signal::new("key", 0u8);
        let latch = KeyboardLatch::new(KeyboardConfig::default(), &key);
        key.write(b'l');
        assert_eq!(latch.data(), b'l');
        key.write(b'l');
        assert_eq!(latch.keys_received(), 1);
        key.write(1);
        assert_eq!(latch.data(), 1);
        assert_eq!(latch.registers().borrow().read(DATA).unwrap(), 1);
    }

    #[test]
    fn latched_key_shows_up_in_snapshot() {
        let key = Signal::new("key", 0u8);
        let latch = KeyboardLatch::new(KeyboardConfig::default(), &key);
        key.write(b'd');
        let snapshot = latch.registers().borrow().snapshot();
        assert_eq!(snapshot.registers[0].name, "data");
        assert_eq!(snapshot.registers[0].value, u32::from(b'd'));
        assert_eq!(latch.keys_received(), 1);
    }
}
