use std::cell::RefCell;
use std::rc::Rc;

use log::info;
use serde::{Deserialize, Serialize};

use crate::async_driver::AsyncDriver;
use crate::bus::{BusStats, SharedBus, SystemBus};
use crate::camera::Camera;
use crate::config::PlatformConfig;
use crate::demosoftware::DemoSoftware;
use crate::display::Display;
use crate::frametrigger::FrameTrigger;
use crate::grayframer::Grayframer;
use crate::keyboard::KeyboardLatch;
use crate::memory::VideoMemory;
use crate::register::BankSnapshot;
use crate::signal::Signal;
use crate::viewer::SharedBackend;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCounters {
    pub trigger_ticks: u64,
    pub go_writes: u64,
    pub camera_frames: u64,
    pub filtered_frames: u64,
    pub demo_frames: Option<u64>,
    pub presented_frames: u64,
    pub keys_received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSnapshot {
    pub memory_generation: u64,
    pub bus: BusStats,
    pub counters: PipelineCounters,
    pub registers: Vec<BankSnapshot>,
}

/// The assembled demo SoC.
///
/// ```text
/// frametrigger --go--> camera --camera_frame--> grayframer --gray_frame-->
///     [demosoftware --demo_frame-->] display --key_code--> keyboard, demosoftware
/// ```
pub struct Platform {
    config: PlatformConfig,
    memory: Rc<RefCell<VideoMemory>>,
    bus: Rc<RefCell<SystemBus>>,
    frametrigger: FrameTrigger,
    camera: Camera,
    grayframer: Grayframer,
    demo: Option<DemoSoftware>,
    display: Display,
    keyboard: KeyboardLatch,
    key_code: Signal<u8>,
}

impl Platform {
    pub fn build(config: PlatformConfig, backend: SharedBackend) -> Result<Self> {
        config.validate()?;

        let memory = Rc::new(RefCell::new(VideoMemory::new(
            config.memory.base,
            config.memory.size,
        )));
        let bus = Rc::new(RefCell::new(SystemBus::new(memory.clone(), config.bus)));
        let shared: SharedBus = bus.clone();

        let camera_frame = Signal::new("camera_frame", false);
        let gray_frame = Signal::new("gray_frame", false);
        let key_code = Signal::new("key_code", 0u8);

        let frametrigger = FrameTrigger::new(config.frametrigger.clone(), shared.clone());
        let camera = Camera::new(config.camera.clone(), shared.clone(), camera_frame.clone());
        let grayframer = Grayframer::new(
            config.grayframer.clone(),
            shared.clone(),
            &camera_frame,
            gray_frame.clone(),
        );

        let (demo, display_trigger) = if config.demo_enabled {
            let demo_frame = Signal::new("demo_frame", false);
            let demo = DemoSoftware::new(
                config.demo.clone(),
                shared.clone(),
                &gray_frame,
                &key_code,
                demo_frame.clone(),
            );
            (Some(demo), demo_frame)
        } else {
            (None, gray_frame)
        };

        let display = Display::new(
            config.display.clone(),
            shared,
            backend,
            &display_trigger,
            key_code.clone(),
        );
        let keyboard = KeyboardLatch::new(config.keyboard.clone(), &key_code);

        {
            let mut bus = bus.borrow_mut();
            bus.map_registers(&config.display.name, config.display.apb_base, display.registers())?;
            bus.map_registers(&config.camera.name, config.camera.apb_base, camera.registers())?;
            bus.map_registers(
                &config.grayframer.name,
                config.grayframer.apb_base,
                grayframer.registers(),
            )?;
            bus.map_registers(
                &config.keyboard.name,
                config.keyboard.apb_base,
                keyboard.registers(),
            )?;
        }

        info!(
            "platform: video memory 0x{:08X}+0x{:X}, apb slaves {:?}, demo {}",
            config.memory.base,
            config.memory.size,
            bus.borrow().slave_names(),
            if config.demo_enabled { "on" } else { "off" }
        );

        Ok(Self {
            config,
            memory,
            bus,
            frametrigger,
            camera,
            grayframer,
            demo,
            display,
            keyboard,
            key_code,
        })
    }

    /// Spawn every peripheral task on `driver`.
    pub fn start(&self, driver: &mut AsyncDriver) {
        self.keyboard.start(driver);
        self.display.start(driver);
        if let Some(demo) = &self.demo {
            demo.start(driver);
        }
        self.grayframer.start(driver);
        self.camera.start(driver);
        self.frametrigger.start(driver);
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn memory(&self) -> Rc<RefCell<VideoMemory>> {
        self.memory.clone()
    }

    pub fn bus(&self) -> Rc<RefCell<SystemBus>> {
        self.bus.clone()
    }

    pub fn frametrigger(&self) -> &FrameTrigger {
        &self.frametrigger
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn grayframer(&self) -> &Grayframer {
        &self.grayframer
    }

    pub fn demo(&self) -> Option<&DemoSoftware> {
        self.demo.as_ref()
    }

    pub fn display(&self) -> &Display {
        &self.display
    }

    pub fn keyboard(&self) -> &KeyboardLatch {
        &self.keyboard
    }

    pub fn key_code(&self) -> Signal<u8> {
        self.key_code.clone()
    }

    pub fn counters(&self) -> PipelineCounters {
        PipelineCounters {
            trigger_ticks: self.frametrigger.ticks(),
            go_writes: self.frametrigger.go_writes(),
            camera_frames: self.camera.frames_captured(),
            filtered_frames: self.grayframer.frames_processed(),
            demo_frames: self.demo.as_ref().map(DemoSoftware::frames_processed),
            presented_frames: self.display.frames_presented(),
            keys_received: self.keyboard.keys_received(),
        }
    }

    pub fn snapshot(&self) -> PlatformSnapshot {
        let registers = [
            self.display.registers(),
            self.camera.registers(),
            self.grayframer.registers(),
            self.keyboard.registers(),
        ]
        .iter()
        .map(|bank| bank.borrow().snapshot())
        .collect();
        PlatformSnapshot {
            memory_generation: self.memory.borrow().generation(),
            bus: self.bus.borrow().stats(),
            counters: self.counters(),
            registers,
        }
    }
}
