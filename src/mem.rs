use parking_lot::Mutex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use sysinfo::{System, SystemExt};

/// Cached, low-overhead memory watcher shared by all decoders.
/// Refreshes at most every `REFRESH_EVERY`.
struct MemState {
    sys: System,
    last_check: Instant,
    last_frac: f64, // available / total (0.0..1.0)
}

static STATE: OnceLock<Mutex<MemState>> = OnceLock::new();
const REFRESH_EVERY: Duration = Duration::from_millis(500);

/// Returns a recent estimate of the available memory fraction (0.0..1.0).
pub fn available_memory_fraction() -> f64 {
    let state = STATE.get_or_init(|| {
        let mut sys = System::new();
        sys.refresh_memory();
        Mutex::new(MemState { sys, last_check: Instant::now() - REFRESH_EVERY * 2, last_frac: 1.0 })
    });
    let mut st = state.lock();
    let now = Instant::now();
    if now.duration_since(st.last_check) >= REFRESH_EVERY {
        st.sys.refresh_memory();
        let total = st.sys.total_memory() as f64;
        let avail = st.sys.available_memory() as f64;
        st.last_frac = if total > 0.0 { (avail / total).clamp(0.0, 1.0) } else { 1.0 };
        st.last_check = now;
    }
    st.last_frac
}

/// Cooperative backoff for row loops: every `check_every` rows, sleep briefly while the
/// available memory fraction is under `threshold`. A zero threshold disables it.
#[derive(Clone, Copy, Debug)]
pub struct MemoryThrottle {
    threshold: f64,
    check_every: u64,
}

impl MemoryThrottle {
    pub fn new(threshold: f64) -> Self {
        Self { threshold, check_every: 4096 }
    }

    pub fn disabled() -> Self {
        Self::new(0.0)
    }

    #[inline]
    pub fn maybe_pause(&self, row: u64) {
        if self.threshold <= 0.0 || row % self.check_every != 0 {
            return;
        }
        if available_memory_fraction() < self.threshold {
            std::thread::sleep(Duration::from_millis(25));
        }
    }
}
