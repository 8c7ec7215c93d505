//! PassThru device firmware: the channel subsystem behind the host's
//! OPEN_CHANNEL/CLOSE_CHANNEL/CHANNEL_DATA/SET_CHAN_FILT wire protocol.
//!
//! This crate is hardware-agnostic: it never touches a register directly.
//! A board binary supplies the three out-of-scope collaborators
//! ([`can_queue::CanController`], [`framing::HostTransport`],
//! [`board::BoardServices`]) and a free-running millisecond
//! [`clock::Clock`], then drives one [`device::Device`] from a `loop {}`
//! plus its CAN receive interrupt. Compiled with `std` under `cfg(test)` so
//! the whole subsystem runs on the host; the firmware build is `no_std`.
#![cfg_attr(not(test), no_std)]

pub mod board;
pub mod can_queue;
pub mod channel;
pub mod clock;
pub mod consts;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod proto;
pub mod registry;
