use std::cell::RefCell;
use std::rc::Rc;

use videosoc_core::bus::{BusTiming, SystemBus};
use videosoc_core::display::{Display, DisplayConfig, ADDR, CTRL, HEIGHT, WIDTH};
use videosoc_core::memory::DEFAULT_VIDEO_BASE;
use videosoc_core::{
    AsyncDriver, DriverEvent, HeadlessViewer, HostInput, KeyCode, RenderBackend, Signal,
    VideoMemory,
};

struct Rig {
    display: Display,
    viewer: Rc<RefCell<HeadlessViewer>>,
    key: Signal<u8>,
    trigger: Signal<bool>,
    driver: AsyncDriver,
}

fn rig(inputs: Vec<HostInput>) -> Rig {
    let memory = Rc::new(RefCell::new(VideoMemory::new(DEFAULT_VIDEO_BASE, 0x10000)));
    // 4x2 screen: a white row above a black row.
    memory
        .borrow_mut()
        .write(DEFAULT_VIDEO_BASE, &[128, 235, 128, 235, 128, 235, 128, 235])
        .unwrap();
    memory
        .borrow_mut()
        .write(DEFAULT_VIDEO_BASE + 8, &[128, 16, 128, 16, 128, 16, 128, 16])
        .unwrap();

    let bus = Rc::new(RefCell::new(SystemBus::new(memory, BusTiming::default())));
    let viewer = Rc::new(RefCell::new(HeadlessViewer::with_input(inputs)));
    let key = Signal::new("key_code", 0u8);
    let trigger = Signal::new("frame", false);
    let display = Display::new(
        DisplayConfig::default(),
        bus,
        viewer.clone(),
        &trigger,
        key.clone(),
    );

    let mut driver = AsyncDriver::new();
    display.start(&mut driver);
    driver.run_for(1);

    let registers = display.registers();
    let mut registers = registers.borrow_mut();
    registers.write(ADDR, DEFAULT_VIDEO_BASE).unwrap();
    registers.write(WIDTH, 4).unwrap();
    registers.write(HEIGHT, 2).unwrap();
    drop(registers);

    Rig {
        display,
        viewer,
        key,
        trigger,
        driver,
    }
}

#[test]
fn open_and_trigger_presents_one_frame() {
    let mut rig = rig(Vec::new());
    rig.display.registers().borrow_mut().write(CTRL, 0x3).unwrap();
    assert!(rig.display.is_open());
    assert_eq!(rig.viewer.borrow().size(), (4, 2));

    let result = rig.driver.run_for(1_000_000);
    assert_eq!(result.event, DriverEvent::FramePresented);
    // Two rows of one 8 byte read (30 ns) plus a 10 ns row delay each.
    assert_eq!(result.elapsed_ns, 80);

    let viewer = rig.viewer.borrow();
    assert_eq!(viewer.frames_presented(), 1);
    assert_eq!(viewer.rows_drawn(), 2);
    assert_eq!(viewer.pixel(3, 0), Some([254, 254, 254]));
    assert_eq!(viewer.pixel(3, 1), Some([0, 0, 0]));
}

#[test]
fn trigger_signal_repaints() {
    let mut rig = rig(Vec::new());
    rig.display.registers().borrow_mut().write(CTRL, 0x1).unwrap();
    assert_eq!(rig.driver.run_for(1_000_000).event, DriverEvent::Deadline);

    rig.trigger.write(true);
    assert_eq!(rig.driver.run_for(1_000_000).event, DriverEvent::FramePresented);
    assert_eq!(rig.display.frames_presented(), 1);
}

#[test]
fn trigger_while_closed_draws_nothing() {
    let mut rig = rig(Vec::new());
    rig.trigger.write(true);
    assert_eq!(rig.driver.run_for(1_000_000).event, DriverEvent::Deadline);
    assert_eq!(rig.viewer.borrow().frames_presented(), 0);
}

#[test]
fn host_input_reaches_key_line_and_quit_stops() {
    let mut rig = rig(vec![HostInput::Key(KeyCode::Right), HostInput::Quit]);
    let registers = rig.display.registers();

    registers.borrow_mut().write(CTRL, 0x3).unwrap();
    assert_eq!(rig.driver.run_for(1_000_000).event, DriverEvent::FramePresented);
    assert_eq!(rig.key.read(), b'r');

    registers.borrow_mut().write(CTRL, 0x3).unwrap();
    assert_eq!(rig.driver.run_for(1_000_000).event, DriverEvent::FramePresented);
    assert_eq!(rig.driver.run_for(1_000_000).event, DriverEvent::Quit);
    assert_eq!(rig.key.read(), b'r');
    assert_eq!(rig.viewer.borrow().open_count(), 1);
}

#[test]
fn release_writes_one() {
    let mut rig = rig(vec![HostInput::Key(KeyCode::Left), HostInput::Release]);
    let registers = rig.display.registers();
    for _ in 0..2 {
        registers.borrow_mut().write(CTRL, 0x3).unwrap();
        rig.driver.run_for(1_000_000);
    }
    assert_eq!(rig.key.read(), 1);
    assert_eq!(rig.key.change_count(), 2);
}

#[test]
fn clearing_enable_closes_backend() {
    let rig = rig(Vec::new());
    let registers = rig.display.registers();
    registers.borrow_mut().write(CTRL, 0x1).unwrap();
    assert!(rig.viewer.borrow().is_open());
    registers.borrow_mut().write(CTRL, 0x0).unwrap();
    assert!(!rig.viewer.borrow().is_open());
    assert_eq!(registers.borrow().read(CTRL).unwrap(), 0);
}

#[test]
fn shutdown_closes_open_screen() {
    let mut rig = rig(Vec::new());
    rig.display.registers().borrow_mut().write(CTRL, 0x1).unwrap();
    rig.driver.run_for(100);
    rig.driver.shutdown();
    assert_eq!(rig.driver.task_count(), 0);
    assert!(!rig.viewer.borrow().is_open());
    assert!(!rig.display.is_open());
}
