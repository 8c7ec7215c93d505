//! Compile-time configuration.
//!
//! Firmware has no runtime config file; everything tunable lives here as a
//! `const`, mirroring how the teacher crate sizes its queues
//! (`can_queue::RX_CAPACITY`/`TX_CAPACITY`) and its tick rate
//! (`hardware::MONOTONIC_FREQUENCY`).

/// Number of channel registry slots.
pub const MAX_CHANNELS: usize = 8;

/// Hardware receive mailboxes. Fixed by the CAN peripheral.
pub const MBOX_COUNT: usize = 7;

/// Mailboxes 0..EXTENDED_MBOX_COUNT are reserved for 29-bit ids.
pub const EXTENDED_MBOX_COUNT: usize = 4;

/// Remaining mailboxes (EXTENDED_MBOX_COUNT..MBOX_COUNT) are 11-bit only.
pub const STANDARD_MBOX_COUNT: usize = MBOX_COUNT - EXTENDED_MBOX_COUNT;

/// Per-mailbox receive ring depth (frames between an ISR tick and the next
/// `Device::tick()`). Matches the original firmware's `MAX_RX_QUEUE`.
pub const MBOX_RING_CAP: usize = 8;

/// ISO 15765-2 caps a segmented application payload at 4095 bytes (12-bit
/// length field).
pub const ISOTP_MAX_PAYLOAD: usize = 4095;

/// Largest ISO-TP application payload this firmware will reassemble or
/// segment, plus the 4-byte CAN id prefix every RX_DATA/TX payload carries.
pub const ISOTP_BUF_CAP: usize = ISOTP_MAX_PAYLOAD + 4;

/// Host message argument payload cap. One constant regardless of profile,
/// per spec.md ("2 KiB or 4 KiB depending on profile; a single constant") —
/// sized to the larger of the two: a fully reassembled ISO-TP RX_DATA
/// payload (`ISOTP_BUF_CAP`) plus its 4-byte status word prefix.
pub const ARG_CAP: usize = ISOTP_BUF_CAP + 4;

/// Default local separation time (milliseconds) until IOCTL_SET changes it.
pub const DEFAULT_STMIN_MS: u32 = 10;

/// Default local block size until IOCTL_SET changes it.
pub const DEFAULT_BLOCK_SIZE: u8 = 8;

/// First sequence-number nibble of a multi-frame send/receive.
pub const ISOTP_SEQ_START: u8 = 0x21;

/// Sequence nibble wraps 0x2F -> 0x20 (never re-emitted as a PCI on its own).
pub const ISOTP_SEQ_WRAP: u8 = 0x20;
pub const ISOTP_SEQ_MAX: u8 = 0x2F;
