//! Wire protocol constants: message types, J2534 protocol ids, channel
//! flags and filter types, and the ISO-TP IOCTL ids. Grouped the way
//! `j2534_mini.h`/`comm.h` group them in the original firmware — a block
//! of named constants, not an executable module.

/// Host message type codes (spec.md §6).
pub mod msg_type {
    pub const LOG: u8 = 0x01;
    pub const OPEN_CHANNEL: u8 = 0x02;
    pub const CLOSE_CHANNEL: u8 = 0x03;
    pub const CHANNEL_DATA: u8 = 0x04;
    pub const READ_BATT: u8 = 0x05;
    pub const SET_CHAN_FILT: u8 = 0x06;
    pub const REM_CHAN_FILT: u8 = 0x07;
    pub const IOCTL_GET: u8 = 0x08;
    pub const IOCTL_SET: u8 = 0x09;
    pub const STATUS: u8 = 0xAA;
    pub const GET_FW_VERSION: u8 = 0xAB;
}

/// J2534 protocol ids (spec.md §6).
pub mod protocol_id {
    pub const J1850VPW: u32 = 0x01;
    pub const J1850PWM: u32 = 0x02;
    pub const ISO9141: u32 = 0x03;
    pub const ISO14230: u32 = 0x04;
    pub const CAN: u32 = 0x05;
    pub const ISO15765: u32 = 0x06;
    pub const SCI_A_ENGINE: u32 = 0x07;
    pub const SCI_A_TRANS: u32 = 0x08;
    pub const SCI_B_ENGINE: u32 = 0x09;
    pub const SCI_B_TRANS: u32 = 0x0A;
}

/// Channel creation flags (spec.md §6).
pub mod flags {
    pub const CAN_29BIT_ID: u32 = 0x0000_0100;
    pub const ISO9141_NO_CHECKSUM: u32 = 0x0000_0200;
    pub const CAN_ID_BOTH: u32 = 0x0000_0800;
    pub const ISO9141_K_LINE_ONLY: u32 = 0x0000_1000;
}

/// Filter kinds (spec.md §6).
pub mod filter_type {
    pub const PASS: u8 = 0x01;
    pub const BLOCK: u8 = 0x02;
    pub const FLOW_CONTROL: u8 = 0x03;
}

/// ISO-TP per-channel IOCTL option ids. Not attested in the retrieved
/// original source (the header defining them was not part of the
/// retrieval pack); values chosen here are a DESIGN.md-recorded decision,
/// not a recovered constant.
pub mod ioctl_id {
    pub const ISO15765_STMIN: u32 = 0x01;
    pub const ISO15765_BS: u32 = 0x02;
}

/// RX_DATA status word values (prefixed 32-bit word on every RX_DATA
/// payload). `NORMAL` covers both raw-CAN frames and fully reassembled
/// ISO-TP payloads; `ISO15765_FIRST_FRAME` marks the early first-frame
/// indication (spec.md §4.5, §6).
pub mod rx_status {
    pub const NORMAL: u32 = 0x0000_0000;
    pub const ISO15765_FIRST_FRAME: u32 = 0x0000_0001;
}

/// STATUS (0xAA) sub-codes, carried as the first argument byte (spec.md
/// §4.9 — this crate's resolution of the reset-all-channels operation).
pub mod status_subcode {
    pub const HELLO: u8 = 0x01;
    pub const GOODBYE: u8 = 0x02;
}
