//! System clock adapter.
//!
//! - **`target_os = "espidf"`** — wraps `esp_timer_get_time()` (monotonic,
//!   microsecond precision).
//! - **host** — `std::time::Instant` since construction.
//!
//! The wall-clock offset is supplied externally (time-sync service); until
//! then `epoch_ms()` returns the monotonic count unchanged.

use crate::app::ports::ClockPort;

pub struct SystemClock {
    epoch_offset_ms: i64,
    synced: bool,

    #[cfg(not(target_os = "espidf"))]
    start: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch_offset_ms: 0,
            synced: false,
            #[cfg(not(target_os = "espidf"))]
            start: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockPort for SystemClock {
    #[cfg(target_os = "espidf")]
    fn monotonic_ms(&self) -> u64 {
        (unsafe { esp_idf_svc::sys::esp_timer_get_time() }) as u64 / 1_000
    }

    #[cfg(not(target_os = "espidf"))]
    fn monotonic_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn set_epoch_offset(&mut self, offset_ms: i64) {
        self.epoch_offset_ms = offset_ms;
        self.synced = true;
    }

    fn epoch_ms(&self) -> u64 {
        let mono = self.monotonic_ms() as i64;
        mono.saturating_add(self.epoch_offset_ms).max(0) as u64
    }

    fn time_sync_available(&self) -> bool {
        self.synced
    }
}
