use log::{debug, info};

use crate::async_driver::{AsyncDriver, DriverEvent};
use crate::platform::Platform;

const DEFAULT_SLICE_NS: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunOutcome {
    /// Simulated time covered by this call.
    pub elapsed_ns: u64,
    /// Frames presented during this call.
    pub frames_presented: u64,
    pub quit_requested: bool,
}

/// Drives a [`Platform`] on its own [`AsyncDriver`] in fixed slices.
pub struct SocRunner {
    platform: Platform,
    driver: AsyncDriver,
    slice_ns: u64,
    started: bool,
    quit: bool,
    frames_presented: u64,
}

impl SocRunner {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            driver: AsyncDriver::new(),
            slice_ns: DEFAULT_SLICE_NS,
            started: false,
            quit: false,
            frames_presented: 0,
        }
    }

    pub fn with_slice_ns(mut self, slice_ns: u64) -> Self {
        self.slice_ns = slice_ns.max(1);
        self
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn now(&self) -> u64 {
        self.driver.now()
    }

    pub fn task_count(&self) -> usize {
        self.driver.task_count()
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn quit_requested(&self) -> bool {
        self.quit
    }

    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.platform.start(&mut self.driver);
        self.started = true;
        info!("runner: {} tasks started", self.driver.task_count());
    }

    /// Advance until simulated time `deadline_ns` or until the backend asks
    /// to quit, whichever comes first.
    pub fn run_until(&mut self, deadline_ns: u64) -> RunOutcome {
        self.start();
        let start = self.driver.now();
        let mut outcome = RunOutcome::default();

        while !self.quit && self.driver.now() < deadline_ns {
            let slice = self.slice_ns.min(deadline_ns - self.driver.now());
            let result = self.driver.run_for(slice);
            match result.event {
                DriverEvent::Deadline => {}
                DriverEvent::FramePresented => {
                    self.frames_presented += 1;
                    outcome.frames_presented += 1;
                }
                DriverEvent::Quit => {
                    info!("runner: quit at {} ns", self.driver.now());
                    self.quit = true;
                }
                DriverEvent::User(code) => debug!("runner: user event {code}"),
            }
        }

        outcome.elapsed_ns = self.driver.now() - start;
        outcome.quit_requested = self.quit;
        outcome
    }

    pub fn run_for(&mut self, duration_ns: u64) -> RunOutcome {
        let deadline = self.driver.now().saturating_add(duration_ns);
        self.run_until(deadline)
    }

    /// Stop every task. Returns the number of polls needed to drain them.
    pub fn shutdown(&mut self) -> usize {
        let polls = self.driver.shutdown();
        info!(
            "runner: shut down at {} ns after {} frames",
            self.driver.now(),
            self.frames_presented
        );
        polls
    }
}
