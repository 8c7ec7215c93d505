//! J2534 status codes.
//!
//! One reply status byte accompanies every request (spec.md §4.1); this is
//! the full PassThru error space from spec.md §6, not just the subset this
//! crate's operations currently produce, so a filter/IOCTL addition never
//! needs a new enum variant plumbed through every call site.

/// A PassThru status/error code, as carried in reply byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
pub enum StatusCode {
    NoError = 0x00,
    NotSupported = 0x01,
    InvalidChannelId = 0x02,
    InvalidProtocolId = 0x03,
    NullParameter = 0x04,
    InvalidIoctlValue = 0x05,
    InvalidFlags = 0x06,
    Failed = 0x07,
    DeviceNotConnected = 0x08,
    Timeout = 0x09,
    InvalidMsg = 0x0A,
    InvalidTimeInterval = 0x0B,
    ExceededLimit = 0x0C,
    InvalidMsgId = 0x0D,
    DeviceInUse = 0x0E,
    InvalidIoctlId = 0x0F,
    BufferEmpty = 0x10,
    BufferFull = 0x11,
    BufferOverflow = 0x12,
    PinInvalid = 0x13,
    ChannelInUse = 0x14,
    MsgProtocolId = 0x15,
    InvalidFilterId = 0x16,
    NoFlowControl = 0x17,
    NotUnique = 0x18,
    InvalidBaudrate = 0x19,
    InvalidDeviceId = 0x1A,
}

impl StatusCode {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Convenience result alias for engine operations that produce exactly one
/// reply status on failure (spec.md §7 bands 1 & 2: protocol rejection and
/// resource exhaustion). Band 3 (runtime anomaly) is logged and does not
/// return an `Err` at all — the offending frame is dropped and the caller
/// carries on, per spec.md §7.
pub type Result<T> = core::result::Result<T, StatusCode>;

/// A status code plus the short diagnostic string the dispatcher stamps
/// onto an ERR reply (spec.md §7 band 1). Channels and the registry return
/// this instead of touching the framer directly, so the dispatcher stays
/// the single place that owns "exactly one reply per request" (spec.md §8
/// invariant 3).
#[derive(Debug, Clone, Copy)]
pub struct FwError {
    pub code: StatusCode,
    pub text: &'static str,
}

impl FwError {
    pub const fn new(code: StatusCode, text: &'static str) -> Self {
        Self { code, text }
    }
}

/// Result alias for registry/channel operations that report failure as a
/// status code plus diagnostic text.
pub type OpResult<T> = core::result::Result<T, FwError>;
