//! Port traits — the hexagonal boundary between domain logic and the
//! outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ domain component
//! ```
//!
//! Driven adapters (HTTP client, NVS, system clock, OTA partitions)
//! implement these traits. The domain components consume them via
//! generics, so the core never touches ESP-IDF directly and the whole
//! agent runs under host-side mocks.

// ───────────────────────────────────────────────────────────────
// HTTP port (domain → network)
// ───────────────────────────────────────────────────────────────

/// A completed HTTP exchange. `status == 0` never occurs; transport-level
/// failures surface as [`HttpError`] instead.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpError {
    /// Could not reach the peer (DNS, TCP, TLS).
    Connect,
    /// No completion within the per-call timeout.
    Timeout,
    /// Stream broke mid-exchange.
    Io,
}

impl core::fmt::Display for HttpError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect failed"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Io => write!(f, "I/O error"),
        }
    }
}

/// Blocking HTTP POST with a per-call timeout. Every external exchange in
/// the agent goes through this single method.
pub trait HttpPort {
    fn post(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
        timeout_ms: u32,
    ) -> Result<HttpResponse, HttpError>;
}

// ───────────────────────────────────────────────────────────────
// Storage port (domain ↔ NVS)
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    NotFound,
    IoError,
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

/// Namespaced key/value storage. Writes MUST be atomic (the ESP-IDF NVS
/// API guarantees this natively; the in-memory simulation trivially).
///
/// Missing keys read as `None`; only genuine backend failures surface as
/// errors from the setters.
pub trait StoragePort {
    fn get_u64(&self, namespace: &str, key: &str) -> Option<u64>;
    fn set_u64(&mut self, namespace: &str, key: &str, value: u64) -> Result<(), StorageError>;

    fn get_str(&self, namespace: &str, key: &str) -> Option<String>;
    fn set_str(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), StorageError>;

    fn get_blob(&self, namespace: &str, key: &str) -> Option<Vec<u8>>;
    fn set_blob(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. `Ok(())` even if the key did not exist.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError>;
}

// ───────────────────────────────────────────────────────────────
// Clock port
// ───────────────────────────────────────────────────────────────

/// Monotonic time plus an externally supplied wall-clock offset.
///
/// Before time sync the offset is zero, so `epoch_ms()` degrades to the
/// monotonic count — timestamps stay strictly ordered either way.
pub trait ClockPort {
    /// Milliseconds since boot, monotonic.
    fn monotonic_ms(&self) -> u64;

    /// Apply a wall-clock offset obtained from an external sync source.
    fn set_epoch_offset(&mut self, offset_ms: i64);

    /// Wall-clock milliseconds (monotonic + offset).
    fn epoch_ms(&self) -> u64;

    /// Whether a sync offset has been applied.
    fn time_sync_available(&self) -> bool;
}

// ───────────────────────────────────────────────────────────────
// Update partition port (FOTA ↔ flash)
// ───────────────────────────────────────────────────────────────

/// Verification state of an app region, as reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// Factory image or never-OTA'd region.
    Fresh,
    /// Booted once after an apply; must be marked valid or it rolls back.
    PendingVerify,
    /// Confirmed good.
    Valid,
    /// Rolled back or aborted.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionError {
    /// No inactive update region available.
    NoRegion,
    /// Begin/write/end/read against the region failed.
    Io,
    /// Switching the boot region failed.
    SetBoot,
}

impl core::fmt::Display for PartitionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoRegion => write!(f, "no update region"),
            Self::Io => write!(f, "partition I/O failed"),
            Self::SetBoot => write!(f, "set boot region failed"),
        }
    }
}

/// One inactive update region at a time. `begin` selects the next region,
/// erases it, and opens a write handle at offset zero; `resume` re-opens
/// the same region without erasing, continuing at `written`. Writes are
/// strictly append-order from the open offset. `read_back` is valid for
/// any already-written range while the handle is open (used to rebuild
/// the streaming hash on resume).
pub trait UpdatePartitionPort {
    fn begin(&mut self, image_size: u32) -> Result<(), PartitionError>;
    fn resume(&mut self, image_size: u32, written: u32) -> Result<(), PartitionError>;
    fn write(&mut self, data: &[u8]) -> Result<(), PartitionError>;
    fn read_back(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), PartitionError>;
    fn end(&mut self) -> Result<(), PartitionError>;
    /// Discard the open handle, if any. Safe to call when idle.
    fn abort(&mut self);
    /// Point the bootloader at the freshly written region.
    fn set_boot(&mut self) -> Result<(), PartitionError>;

    /// State of the region we are currently running from.
    fn running_state(&self) -> RegionState;
    /// State of the inactive update region (detects a rolled-back image).
    fn update_region_state(&self) -> RegionState;
    /// Confirm the running image so the bootloader cancels rollback.
    fn mark_valid(&mut self) -> Result<(), PartitionError>;
}

// ───────────────────────────────────────────────────────────────
// Reboot port
// ───────────────────────────────────────────────────────────────

/// Relinquish control to the bootloader. On hardware this does not return.
pub trait RebootPort {
    fn reboot(&mut self);
}
