use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic nanoseconds since a timer's origin.
pub type Nanos = u64;

/// Trait for high-precision timers
pub trait Timer: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Nanos;
    fn sleep(&self, d: Duration);

    fn elapsed(&self, since: Nanos) -> Duration {
        Duration::from_nanos(self.now().saturating_sub(since))
    }

    /// Busy-wait until `deadline`. Virtual timers jump straight to it.
    fn spin_until(&self, deadline: Nanos) {
        while self.now() < deadline {
            std::hint::spin_loop();
        }
    }
}

/// Timer handle shared between the execution thread and the preload worker.
pub type SharedTimer = Arc<dyn Timer>;

pub fn to_nanos(d: Duration) -> Nanos {
    d.as_nanos().min(u64::MAX as u128) as u64
}

/// Signed difference `a - b` in milliseconds.
pub fn diff_ms(a: Nanos, b: Nanos) -> f64 {
    (a as f64 - b as f64) / 1_000_000.0
}

#[derive(Debug, Clone)]
pub struct HighPrecisionTimer {
    pub start: Instant,
}

impl Timer for HighPrecisionTimer {
    fn now(&self) -> Nanos {
        to_nanos(self.start.elapsed())
    }

    fn sleep(&self, d: Duration) {
        self.high_precision_sleep(d)
    }
}

impl HighPrecisionTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn shared() -> SharedTimer {
        Arc::new(Self::new())
    }

    pub fn high_precision_sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        #[cfg(target_os = "linux")]
        self.linux_sleep(duration);
        #[cfg(not(target_os = "linux"))]
        self.spin_sleep(duration);
    }

    #[cfg(target_os = "linux")]
    fn linux_sleep(&self, duration: Duration) {
        use libc::{clock_nanosleep, timespec, CLOCK_MONOTONIC};

        let req = timespec {
            tv_sec: duration.as_secs() as libc::time_t,
            tv_nsec: duration.subsec_nanos() as libc::c_long,
        };

        unsafe {
            clock_nanosleep(CLOCK_MONOTONIC, 0, &req, std::ptr::null_mut());
        }
    }

    // OS sleep for the bulk of the wait, spin for the last 100us
    #[cfg(not(target_os = "linux"))]
    fn spin_sleep(&self, duration: Duration) {
        let target = Instant::now() + duration;
        let spin_window = Duration::from_micros(100);
        if duration > spin_window {
            std::thread::sleep(duration - spin_window);
        }
        while Instant::now() < target {
            std::hint::spin_loop();
        }
    }
}

impl Default for HighPrecisionTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Virtual clock for headless runs and tests.
///
/// `sleep` advances the shared virtual time. An accelerated timer additionally
/// blocks for `d / speedup` of real time so that other threads polling the
/// clock (the preload worker) observe a plausible interleaving.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTimer {
    now: Arc<AtomicU64>,
    speedup: Option<u32>,
}

impl SimulatedTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accelerated(speedup: u32) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(0)),
            speedup: Some(speedup.max(1)),
        }
    }

    pub fn advance(&self, d: Duration) {
        self.now.fetch_add(to_nanos(d), Ordering::SeqCst);
    }

    pub fn shared(&self) -> SharedTimer {
        Arc::new(self.clone())
    }
}

impl Timer for SimulatedTimer {
    fn now(&self) -> Nanos {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, d: Duration) {
        if let Some(speedup) = self.speedup {
            std::thread::sleep(d / speedup);
        }
        self.advance(d);
    }

    fn spin_until(&self, deadline: Nanos) {
        self.now.fetch_max(deadline, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameStats {
    pub frames: usize,
    pub average_frame_time_ns: f64,
    pub jitter_ns: f64,
    pub min_frame_time_ns: f64,
    pub max_frame_time_ns: f64,
    pub effective_fps: f64,
}

/// Rolling window of frame-to-frame intervals.
#[derive(Debug, Clone)]
pub struct FrameTimes {
    samples: VecDeque<Duration>,
    max_samples: usize,
}

impl FrameTimes {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples.min(4096)),
            max_samples: max_samples.max(1),
        }
    }

    pub fn record(&mut self, d: Duration) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(d);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn stats(&self) -> FrameStats {
        let times: Vec<f64> = self.samples.iter().map(|d| d.as_nanos() as f64).collect();
        if times.is_empty() {
            return FrameStats {
                frames: 0,
                average_frame_time_ns: 0.0,
                jitter_ns: 0.0,
                min_frame_time_ns: 0.0,
                max_frame_time_ns: 0.0,
                effective_fps: 0.0,
            };
        }
        let avg = times.iter().sum::<f64>() / times.len() as f64;
        let var = times.iter().map(|x| (x - avg).powi(2)).sum::<f64>() / times.len() as f64;
        let min = times.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = times.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        FrameStats {
            frames: times.len(),
            average_frame_time_ns: avg,
            jitter_ns: var.sqrt(),
            min_frame_time_ns: min,
            max_frame_time_ns: max,
            effective_fps: if avg > 0.0 { 1e9 / avg } else { 0.0 },
        }
    }
}

impl Default for FrameTimes {
    fn default() -> Self {
        Self::new(1000)
    }
}
