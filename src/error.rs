//! Unified error types for the agent.
//!
//! A single `Error` enum that every subsystem can convert into, keeping
//! error handling uniform across the sampler and orchestrator loops. All
//! variants are `Copy` so they can be carried through fault events and
//! staged appendices without allocation.

use core::fmt;

/// Every fallible operation in the agent funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A framed device exchange failed.
    Frame(FrameError),
    /// The device answered with a Modbus exception frame.
    ProtocolException(u8),
    /// An HTTP exchange failed after retries.
    Transport(TransportError),
    /// Envelope verification failed.
    Security(SecurityError),
    /// A firmware-update operation failed.
    Fota(FotaError),
    /// Batch blob could not be decoded.
    Codec(CodecError),
    /// Persistent storage failed.
    Storage,
    /// Configuration is invalid or could not be applied.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "frame: {e}"),
            Self::ProtocolException(code) => write!(f, "modbus exception 0x{code:02X}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Security(e) => write!(f, "security: {e}"),
            Self::Fota(e) => write!(f, "fota: {e}"),
            Self::Codec(e) => write!(f, "codec: {e}"),
            Self::Storage => write!(f, "storage failure"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame parsing errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the smallest valid frame.
    TooShort,
    /// Trailer CRC does not match the computed CRC-16.
    CrcMismatch,
    /// The function byte has its MSB set (exception frame).
    ExceptionFrame,
    /// The function byte is not the one the parser expects.
    WrongFunction,
    /// Declared byte count disagrees with the frame length.
    LengthMismatch,
    /// Declared byte count is odd (registers are 16-bit).
    OddByteCount,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "frame too short"),
            Self::CrcMismatch => write!(f, "CRC mismatch"),
            Self::ExceptionFrame => write!(f, "exception frame"),
            Self::WrongFunction => write!(f, "unexpected function code"),
            Self::LengthMismatch => write!(f, "byte count / length mismatch"),
            Self::OddByteCount => write!(f, "odd byte count"),
        }
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No completion within the per-call timeout.
    Timeout,
    /// HTTP 4xx — credentials or token rejected.
    AuthFailed,
    /// HTTP 5xx or a blank body.
    ServerRejected,
    /// Completed but the body lacked the expected field.
    BadResponse,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::AuthFailed => write!(f, "auth failed"),
            Self::ServerRejected => write!(f, "server rejected"),
            Self::BadResponse => write!(f, "bad response"),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// Security errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityError {
    /// MAC did not verify.
    HmacInvalid,
    /// Nonce was not strictly greater than the last seen.
    Replay,
    /// Envelope JSON missing a required field.
    Malformed,
    /// Payload base64 failed to decode.
    BadBase64,
}

impl fmt::Display for SecurityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HmacInvalid => write!(f, "HMAC invalid"),
            Self::Replay => write!(f, "nonce replay"),
            Self::Malformed => write!(f, "malformed envelope"),
            Self::BadBase64 => write!(f, "bad base64"),
        }
    }
}

impl From<SecurityError> for Error {
    fn from(e: SecurityError) -> Self {
        Self::Security(e)
    }
}

// ---------------------------------------------------------------------------
// FOTA errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FotaError {
    /// Chunk index did not match the expected one.
    OutOfOrder,
    /// Chunk base64 failed to decode or was empty.
    BadBase64,
    /// Chunk would write past the declared image size.
    Overflow,
    /// Manifest hash is not 64 hex characters.
    BadHashFormat,
    /// Streamed digest disagrees with the manifest hash.
    HashMismatch,
    /// Update-region operation failed.
    Partition,
}

impl fmt::Display for FotaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfOrder => write!(f, "chunk out of order"),
            Self::BadBase64 => write!(f, "bad chunk base64"),
            Self::Overflow => write!(f, "chunk overflow"),
            Self::BadHashFormat => write!(f, "bad hash format"),
            Self::HashMismatch => write!(f, "hash mismatch"),
            Self::Partition => write!(f, "partition failure"),
        }
    }
}

impl From<FotaError> for Error {
    fn from(e: FotaError) -> Self {
        Self::Fota(e)
    }
}

// ---------------------------------------------------------------------------
// Batch codec errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Blob shorter than header + CRC.
    TooShort,
    /// Unsupported format version byte.
    BadVersion,
    /// Field count is not the canonical ten.
    BadFieldCount,
    /// An opcode or its operand would read into the CRC trailer.
    Truncated,
    /// Opcode byte is neither run nor delta.
    UnknownOpcode,
    /// Trailer CRC32 does not validate.
    CrcMismatch,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "blob too short"),
            Self::BadVersion => write!(f, "unsupported version"),
            Self::BadFieldCount => write!(f, "unexpected field count"),
            Self::Truncated => write!(f, "truncated stream"),
            Self::UnknownOpcode => write!(f, "unknown opcode"),
            Self::CrcMismatch => write!(f, "CRC32 mismatch"),
        }
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
