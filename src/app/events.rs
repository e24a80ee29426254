//! Structured events flowing from leaf components to the orchestrator.
//!
//! The source design used process-wide callbacks for fault and progress
//! notification; here they are bounded channels the orchestrator drains at
//! the top of each slot and stages as one-shot appendices. Losing an event
//! under backpressure is acceptable — the next occurrence re-reports.

use crate::error::TransportError;

/// Classified outcome of a failed device exchange, attached to the next
/// uplink as the `sim_fault` appendix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// Transport gave up after retries.
    Timeout(TransportError),
    /// Device answered with a Modbus exception.
    Exception(u8),
    /// Response failed CRC or structural checks.
    Malformed,
    /// Slave or function byte did not echo the request.
    HeaderMismatch,
}

impl DeviceFault {
    /// Short tag for the `events[]` appendix.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Timeout(_) => "dev-timeout",
            Self::Exception(_) => "dev-exception",
            Self::Malformed => "dev-malformed",
            Self::HeaderMismatch => "dev-header",
        }
    }
}

/// One structured fault event, carrying enough context for the cloud to
/// localise the failing read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEvent {
    pub fault: DeviceFault,
    /// Register address the exchange targeted.
    pub addr: u16,
    /// Register count (1 for writes).
    pub count: u16,
    /// True when the exchange was a write.
    pub write: bool,
}

/// Events the sampler raises toward the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
    /// A device exchange failed (classified).
    SimFault(FaultEvent),
    /// The ring overwrote its oldest record.
    BufferOverflow,
    /// Three consecutive read failures (rate-limited marker).
    AcqReadFail,
}

impl AppEvent {
    /// Short tag for the cleared `events[]` appendix list.
    pub fn tag(self) -> &'static str {
        match self {
            Self::SimFault(e) => e.fault.tag(),
            Self::BufferOverflow => "buffer_overflow",
            Self::AcqReadFail => "acq_read_fail",
        }
    }
}
