//! Wall-clock timing for supersteps and benchmarks.
//!
//! All timestamps are seconds relative to an origin chosen when the runtime
//! (or an explicit [`Timer`]) is created, taken from the platform monotonic
//! clock. This mirrors the classic BSP `bsp_time`/`bsp_dtime` pair.

use std::time::Instant;

use rand::Rng;

/// Monotonic stopwatch with a fixed origin.
#[derive(Debug, Clone)]
pub struct Timer {
    origin: Instant,
    last_delta: f64,
}

impl Timer {
    /// Start a new timer; `elapsed` is measured from this moment.
    pub fn new() -> Self {
        Timer {
            origin: Instant::now(),
            last_delta: 0.0,
        }
    }

    /// Seconds since the timer was created.
    pub fn elapsed(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Seconds since the previous call to `delta` (or since creation on the
    /// first call).
    pub fn delta(&mut self) -> f64 {
        let now = self.elapsed();
        let d = now - self.last_delta;
        self.last_delta = now;
        d
    }
}

impl Default for Timer {
    fn default() -> Self {
        Timer::new()
    }
}

/// Busy-wait for `seconds`, keeping the CPU occupied.
///
/// Useful before measurements on machines whose frequency governors clock
/// down when idle; a sleeping warmup would defeat the purpose, so the loop
/// draws random numbers until the deadline passes.
pub fn warmup(seconds: f64) {
    let start = Instant::now();
    let mut rng = rand::thread_rng();
    let mut sink: u64 = 0;
    while start.elapsed().as_secs_f64() < seconds {
        sink = sink.wrapping_add(rng.gen::<u64>());
    }
    std::hint::black_box(sink);
}
