use std::cell::{Cell, RefCell};
use std::rc::Rc;

use videosoc_core::bus::{BusTiming, SharedBus, SystemBus};
use videosoc_core::{sleep_ns, AccessKind, AhbMaster, AsyncDriver, BusLayer, VideoMemory};

const BASE: u32 = 0xA000_0000;

fn master_on(memory: &Rc<RefCell<VideoMemory>>, name: &str) -> AhbMaster {
    let bus: SharedBus = Rc::new(RefCell::new(SystemBus::new(
        memory.clone(),
        BusTiming::default(),
    )));
    AhbMaster::new(name, 0, bus, BusLayer::Lt)
}

#[test]
fn access_log_records_time_kind_and_generation() {
    let memory = Rc::new(RefCell::new(VideoMemory::new(BASE, 0x1000)));
    let writer = master_on(&memory, "writer");
    let reader = master_on(&memory, "reader");
    memory.borrow_mut().begin_access_log();

    let mut driver = AsyncDriver::new();
    driver.spawn(async move {
        for row in 0..3u32 {
            writer.write(BASE + row * 16, &[0xAA; 16]).await.unwrap();
        }
    });
    driver.spawn(async move {
        sleep_ns(1_000).await;
        let mut buf = [0u8; 16];
        reader.read(BASE + 32, &mut buf).await.unwrap();
        assert_eq!(buf, [0xAA; 16]);
    });
    driver.run_for(10_000);

    let log = memory.borrow_mut().take_access_log();
    let summary: Vec<(u64, AccessKind, u32, u64)> = log
        .iter()
        .map(|r| (r.time_ns, r.kind, r.addr, r.generation))
        .collect();
    // 16 bytes cost 10 ns address plus 4 beats of 10 ns.
    assert_eq!(
        summary,
        vec![
            (0, AccessKind::Write, BASE, 1),
            (50, AccessKind::Write, BASE + 16, 2),
            (100, AccessKind::Write, BASE + 32, 3),
            (1_000, AccessKind::Read, BASE + 32, 3),
        ]
    );
    assert!(!memory.borrow().is_logging());
}

#[test]
fn reader_racing_a_writer_sees_partial_progress() {
    let memory = Rc::new(RefCell::new(VideoMemory::new(BASE, 0x1000)));
    let writer = master_on(&memory, "writer");
    let reader = master_on(&memory, "reader");
    let observed = Rc::new(Cell::new(0u64));

    let mut driver = AsyncDriver::new();
    driver.spawn(async move {
        for row in 0..10u32 {
            writer.write(BASE + row * 16, &[row as u8 + 1; 16]).await.unwrap();
        }
    });
    let seen = observed.clone();
    let probe_memory = memory.clone();
    driver.spawn(async move {
        sleep_ns(120).await;
        seen.set(probe_memory.borrow().generation());
        let mut buf = [0u8; 16];
        reader.read(BASE + 9 * 16, &mut buf).await.unwrap();
        assert_eq!(buf, [0; 16]);
    });
    driver.run_for(10_000);

    assert_eq!(observed.get(), 3);
    assert_eq!(memory.borrow().generation(), 10);
}
