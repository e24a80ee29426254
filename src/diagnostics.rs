//! Runtime diagnostics and power counters.
//!
//! A small persisted record (boot count, lifetime uplink failures) lives
//! in the `diag` namespace as a postcard blob; volatile counters are
//! collected per session. The orchestrator merges a snapshot into the
//! upload body as the `diag` appendix whenever something changed since the
//! last emit.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::app::ports::{ClockPort, StoragePort};
use crate::transport;

const NS_DIAG: &str = "diag";
const KEY_PERSISTED: &str = "counters";

/// Counters that survive reboots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedCounters {
    boot_count: u32,
    lifetime_uplink_failures: u32,
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    persisted: PersistedCounters,
    /// Session counters.
    uplink_failures: u32,
    acq_fail_reports: u32,
    buffer_overflows: u32,
    dropped_samples: u32,
    /// Transport counter value at the last emit, for delta detection.
    last_emitted_fingerprint: u64,
}

impl Diagnostics {
    /// Load persisted counters and record this boot.
    pub fn load_and_count_boot(store: &mut impl StoragePort) -> Self {
        let mut persisted: PersistedCounters = store
            .get_blob(NS_DIAG, KEY_PERSISTED)
            .and_then(|blob| postcard::from_bytes(&blob).ok())
            .unwrap_or_default();
        persisted.boot_count += 1;
        let mut diag = Self {
            persisted,
            ..Self::default()
        };
        diag.persist(store);
        diag
    }

    fn persist(&mut self, store: &mut impl StoragePort) {
        if let Ok(blob) = postcard::to_allocvec(&self.persisted) {
            let _ = store.set_blob(NS_DIAG, KEY_PERSISTED, &blob);
        }
    }

    pub fn boot_count(&self) -> u32 {
        self.persisted.boot_count
    }

    pub fn record_uplink_failure(&mut self, store: &mut impl StoragePort) {
        self.uplink_failures += 1;
        self.persisted.lifetime_uplink_failures += 1;
        self.persist(store);
    }

    pub fn record_acq_fail_report(&mut self) {
        self.acq_fail_reports += 1;
    }

    pub fn record_buffer_overflow(&mut self) {
        self.buffer_overflows += 1;
    }

    pub fn record_dropped_samples(&mut self, dropped: u32) {
        self.dropped_samples += dropped;
    }

    fn fingerprint(&self) -> u64 {
        u64::from(self.uplink_failures)
            ^ (u64::from(self.acq_fail_reports) << 16)
            ^ (u64::from(self.buffer_overflows) << 32)
            ^ (u64::from(self.dropped_samples) << 40)
    }

    /// Snapshot for the `diag` appendix, or `None` when nothing changed
    /// since the last emit (the appendix is one-shot).
    pub fn take_snapshot_if_changed(&mut self, clock: &impl ClockPort) -> Option<serde_json::Value> {
        let fingerprint = self.fingerprint();
        if fingerprint == self.last_emitted_fingerprint {
            return None;
        }
        self.last_emitted_fingerprint = fingerprint;
        Some(json!({
            "uptime_s": clock.monotonic_ms() / 1000,
            "boots": self.persisted.boot_count,
            "uplink_failures": self.uplink_failures,
            "lifetime_uplink_failures": self.persisted.lifetime_uplink_failures,
            "device_exchange_failures": transport::failed_exchanges(),
            "acq_fail_reports": self.acq_fail_reports,
            "buffer_overflows": self.buffer_overflows,
            "dropped_samples": self.dropped_samples,
        }))
    }
}
