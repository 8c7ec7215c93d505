//! Command dispatcher (spec.md §4.2): decodes one fully-received
//! [`HostMessage`](crate::framing::HostMessage) and routes it to the
//! registry, to a specific channel, or to [`BoardServices`], emitting
//! exactly one reply per request (spec.md §8 invariant 3).
//!
//! Grounded on `channel.cpp::setup_channel` / `comm_channels.cpp`'s per-type
//! handlers in `original_source`, generalised into one `match` over
//! `msg_type` instead of one C++ file per message — the original's
//! `setup_channel` famously falls through to a second `respond_err` after
//! the first (spec.md §9 Design Notes); every branch here returns as soon
//! as it has sent its one reply.
use byteorder::{ByteOrder, LittleEndian};

use crate::board::BoardServices;
use crate::can_queue::{CanController, Driver};
use crate::error::{FwError, StatusCode};
use crate::framing::{Framer, HostMessage, HostTransport};
use crate::proto::{filter_type, msg_type, status_subcode};
use crate::registry::ChannelRegistry;

fn read_u32(args: &[u8], offset: usize) -> Option<u32> {
    args.get(offset..offset + 4).map(LittleEndian::read_u32)
}

fn fail<T: HostTransport>(framer: &mut Framer<T>, op: u8, text: &[u8]) {
    #[cfg(not(test))]
    defmt::warn!("rejecting message type {}: {}", op, core::str::from_utf8(text).unwrap_or("?"));
    framer.respond_err(op, StatusCode::Failed, text);
}

fn reply_err<T: HostTransport>(framer: &mut Framer<T>, op: u8, err: FwError) {
    framer.respond_err(op, err.code, err.text.as_bytes());
}

/// Handle one complete inbound message. Never panics, never leaves more
/// than one reply unsent: every validation failure below returns
/// immediately after calling `respond_err`.
pub fn dispatch<Ctl, T, B>(
    msg: &HostMessage,
    registry: &mut ChannelRegistry,
    driver: &mut Driver<'_, Ctl>,
    framer: &mut Framer<T>,
    board: &mut B,
) where
    Ctl: CanController,
    T: HostTransport,
    B: BoardServices,
{
    let op = msg.msg_type;
    let args = &msg.args[..];
    match op {
        msg_type::OPEN_CHANNEL => {
            let (Some(id), Some(protocol), Some(baud), Some(flags)) = (
                read_u32(args, 0),
                read_u32(args, 4),
                read_u32(args, 8),
                read_u32(args, 12),
            ) else {
                return fail(framer, op, b"OPEN_CHANNEL payload too short");
            };
            if id > u8::MAX as u32 {
                return fail(framer, op, b"Channel ID out of range");
            }
            match registry.open(id as u8, protocol, baud, flags, driver) {
                Ok(()) => framer.respond_ok(op, &[]),
                Err(e) => reply_err(framer, op, e),
            }
        }
        msg_type::CLOSE_CHANNEL => {
            let Some(id) = read_u32(args, 0) else {
                return fail(framer, op, b"CLOSE_CHANNEL payload too short");
            };
            if id > u8::MAX as u32 {
                return fail(framer, op, b"Channel ID out of range");
            }
            match registry.close(id as u8, driver) {
                Ok(()) => framer.respond_ok(op, &[]),
                Err(e) => reply_err(framer, op, e),
            }
        }
        msg_type::SET_CHAN_FILT => {
            let (
                Some(channel_id),
                Some(filter_id),
                Some(filter_type_raw),
                Some(mask_len),
                Some(pattern_len),
                Some(fc_len),
            ) = (
                read_u32(args, 0),
                read_u32(args, 4),
                read_u32(args, 8),
                read_u32(args, 12),
                read_u32(args, 16),
                read_u32(args, 20),
            )
            else {
                return fail(framer, op, b"SET_CHAN_FILT payload too short");
            };
            let filter_kind = filter_type_raw as u8;
            if filter_kind == filter_type::FLOW_CONTROL && fc_len == 0 {
                return framer.respond_err(op, StatusCode::NullParameter, b"Flow control filter needs an FC id");
            }
            let (mask_len, pattern_len, fc_len) = (mask_len as usize, pattern_len as usize, fc_len as usize);
            let header = 24;
            let total = header
                .checked_add(mask_len)
                .and_then(|t| t.checked_add(pattern_len))
                .and_then(|t| t.checked_add(fc_len));
            if total.map_or(true, |t| args.len() < t) {
                return fail(framer, op, b"SET_CHAN_FILT argument lengths disagree with payload");
            }
            let mask = &args[header..header + mask_len];
            let pattern = &args[header + mask_len..header + mask_len + pattern_len];
            let fc = &args[header + mask_len + pattern_len..header + mask_len + pattern_len + fc_len];
            if channel_id > u8::MAX as u32 || filter_id > u8::MAX as u32 {
                return fail(framer, op, b"Channel/filter ID out of range");
            }
            match registry.add_filter(channel_id as u8, driver, filter_id as u8, filter_kind, mask, pattern, fc) {
                Ok(()) => framer.respond_ok(op, &[filter_id as u8]),
                Err(e) => reply_err(framer, op, e),
            }
        }
        msg_type::REM_CHAN_FILT => {
            let (Some(channel_id), Some(filter_id)) = (read_u32(args, 0), read_u32(args, 4)) else {
                return fail(framer, op, b"REM_CHAN_FILT payload too short");
            };
            if channel_id > u8::MAX as u32 || filter_id > u8::MAX as u32 {
                return fail(framer, op, b"Channel/filter ID out of range");
            }
            match registry.remove_filter(channel_id as u8, driver, filter_id as u8) {
                Ok(()) => framer.respond_ok(op, &[]),
                Err(e) => reply_err(framer, op, e),
            }
        }
        msg_type::CHANNEL_DATA => {
            let (Some(channel_id), Some(_tx_flags)) = (read_u32(args, 0), read_u32(args, 4)) else {
                return fail(framer, op, b"TX_CHAN_DATA payload too short");
            };
            if channel_id > u8::MAX as u32 {
                return fail(framer, op, b"Channel ID out of range");
            }
            let payload = &args[8..];
            match registry.send(channel_id as u8, driver, payload) {
                Ok(()) => framer.respond_ok(op, &[]),
                Err(e) => reply_err(framer, op, e),
            }
        }
        msg_type::IOCTL_GET => {
            let (Some(channel_id), Some(option_id)) = (read_u32(args, 0), read_u32(args, 4)) else {
                return fail(framer, op, b"IOCTL_GET payload too short");
            };
            if channel_id > u8::MAX as u32 {
                return fail(framer, op, b"Channel ID out of range");
            }
            match registry.ioctl_get(channel_id as u8, option_id) {
                Ok(value) => {
                    let mut out = [0u8; 4];
                    LittleEndian::write_u32(&mut out, value);
                    framer.respond_ok(op, &out);
                }
                Err(e) => reply_err(framer, op, e),
            }
        }
        msg_type::IOCTL_SET => {
            let (Some(channel_id), Some(option_id), Some(value)) =
                (read_u32(args, 0), read_u32(args, 4), read_u32(args, 8))
            else {
                return fail(framer, op, b"IOCTL_SET payload too short");
            };
            if channel_id > u8::MAX as u32 {
                return fail(framer, op, b"Channel ID out of range");
            }
            match registry.ioctl_set(channel_id as u8, option_id, value) {
                Ok(()) => framer.respond_ok(op, &[]),
                Err(e) => reply_err(framer, op, e),
            }
        }
        msg_type::READ_BATT => {
            let mv = board.read_battery_millivolts();
            let mut out = [0u8; 4];
            LittleEndian::write_u32(&mut out, mv);
            framer.respond_ok(op, &out);
        }
        msg_type::GET_FW_VERSION => {
            let version = board.firmware_version();
            framer.respond_ok(op, version.as_bytes());
        }
        msg_type::STATUS => match args.first() {
            Some(&status_subcode::HELLO) => {
                board.on_hello();
                framer.respond_ok(op, &[]);
            }
            Some(&status_subcode::GOODBYE) => {
                board.on_goodbye();
                registry.reset_all(driver);
                framer.reset_inbound();
                framer.respond_ok(op, &[]);
            }
            _ => fail(framer, op, b"Unknown STATUS sub-code"),
        },
        msg_type::LOG => fail(framer, op, b"LOG is firmware-to-host only"),
        _ => fail(framer, op, b"Unrecognised message type"),
    }
}
