use std::cell::RefCell;
use std::rc::Rc;

use videosoc_core::memory::DEFAULT_VIDEO_BASE;
use videosoc_core::viewer::parse_key_script;
use videosoc_core::{
    BusLayer, HeadlessViewer, Platform, PlatformConfig, RenderBackend, SocRunner,
};

const RUN_NS: u64 = 100_000_000;

fn runner(config: PlatformConfig, keys: &str) -> (SocRunner, Rc<RefCell<HeadlessViewer>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let viewer = Rc::new(RefCell::new(HeadlessViewer::with_input(parse_key_script(
        keys,
    ))));
    let platform = Platform::build(config, viewer.clone()).unwrap();
    (SocRunner::new(platform), viewer)
}

#[test]
fn default_platform_presents_frames_and_drains() {
    let (mut runner, viewer) = runner(PlatformConfig::default(), "");
    let outcome = runner.run_for(RUN_NS);
    assert_eq!(outcome.elapsed_ns, RUN_NS);
    assert!(!outcome.quit_requested);
    assert!(outcome.frames_presented > 0);
    assert_eq!(viewer.borrow().frames_presented(), outcome.frames_presented);

    let counters = runner.platform().counters();
    // Go writes at 3, 43 and 83 ms.
    assert_eq!(counters.go_writes, 3);
    assert_eq!(counters.camera_frames, 3);
    assert!(counters.filtered_frames >= 3);
    assert!(counters.demo_frames.unwrap_or(0) >= 3);

    runner.shutdown();
    assert_eq!(runner.task_count(), 0);
    assert!(!viewer.borrow().is_open());
}

#[test]
fn filtered_half_keeps_only_luma() {
    let (mut runner, _viewer) = runner(PlatformConfig::default(), "");
    runner.run_for(RUN_NS);
    let memory = runner.platform().memory();
    let memory = memory.borrow();
    // Filter output starts at x = 320, i.e. 640 bytes into the row.
    let row = memory.peek(DEFAULT_VIDEO_BASE + 640, 640).unwrap();
    assert!(row.chunks_exact(4).all(|g| g[0] == 0 && g[2] == 0));
    assert!(row.chunks_exact(4).any(|g| g[1] != 0));
}

#[test]
fn arrow_key_pans_the_zoom_window() {
    let (mut runner, _viewer) = runner(PlatformConfig::default(), "r");
    runner.run_for(RUN_NS);
    let platform = runner.platform();
    assert_eq!(platform.keyboard().data(), b'r');
    assert_eq!(platform.key_code().read(), b'r');
    let demo = platform.demo().unwrap();
    assert!(demo.pan().x > 0);
    assert_eq!(demo.pan().y, 0);
    assert!(demo.last_histogram().total() > 0);
}

#[test]
fn quit_key_ends_the_run_early() {
    let (mut runner, _viewer) = runner(PlatformConfig::default(), "q");
    let outcome = runner.run_for(RUN_NS);
    assert!(outcome.quit_requested);
    assert!(outcome.elapsed_ns < RUN_NS);
    assert_eq!(outcome.frames_presented, 1);

    let again = runner.run_for(RUN_NS);
    assert_eq!(again.elapsed_ns, 0);
    runner.shutdown();
    assert_eq!(runner.task_count(), 0);
}

#[test]
fn filter_feeds_display_directly_without_demo() {
    let config = PlatformConfig::default().with_demo(false);
    let (mut runner, _viewer) = runner(config, "");
    let outcome = runner.run_for(RUN_NS);
    assert!(runner.platform().demo().is_none());
    let counters = runner.platform().counters();
    assert!(counters.demo_frames.is_none());
    assert!(outcome.frames_presented > 0);
    // One extra frame comes from the trigger bit of the display setup write.
    assert!(outcome.frames_presented <= counters.filtered_frames + 1);
}

#[test]
fn approximately_timed_layer_runs_the_same_pipeline() {
    let config = PlatformConfig::default().with_layer(BusLayer::At);
    let (mut runner, _viewer) = runner(config, "");
    let outcome = runner.run_for(RUN_NS);
    assert!(outcome.frames_presented > 0);
    assert_eq!(runner.platform().counters().camera_frames, 3);
}

#[test]
fn snapshot_serialises_registers_and_counters() {
    let (mut runner, _viewer) = runner(PlatformConfig::default(), "");
    runner.run_for(5_000_000);
    let snapshot = runner.platform().snapshot();
    assert_eq!(snapshot.registers.len(), 4);
    let display = &snapshot.registers[0];
    assert_eq!(display.bank, "display");
    assert_eq!(display.registers[0].name, "CTRL");
    assert_eq!(display.registers[0].value, 0x3);

    let json = serde_json::to_string(&snapshot).unwrap();
    assert!(json.contains("\"grayframer\""));
    assert!(json.contains("\"memory_generation\""));
    assert!(snapshot.bus.register_writes >= 3);
}

#[test]
fn invalid_configuration_fails_to_build() {
    let mut config = PlatformConfig::default();
    config.grayframer.frame_width = 100;
    let viewer = Rc::new(RefCell::new(HeadlessViewer::new()));
    assert!(Platform::build(config, viewer).is_err());
}
