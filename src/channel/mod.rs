//! The polymorphic channel: a tagged enum over the two protocols a channel
//! can speak, dispatched through one [`ChannelOps`] trait (spec.md §9
//! Design Notes "Polymorphic channels"). The original firmware gets this
//! for free via a `Channel` base class and virtual dispatch
//! (`comm_channels.h`); Rust's enum + trait-impl pair is the idiomatic
//! equivalent with no vtable and no heap.
pub mod isotp;
pub mod raw_can;

use crate::can_queue::{CanController, Driver};
use crate::clock::Instant;
use crate::error::OpResult;
use crate::registry::{ChannelId, FilterId, MailboxAllocator};

use isotp::IsoTpChannel;
use raw_can::RawCanChannel;

/// An unsolicited record a channel emits during `tick`: either a forwarded
/// frame (RX_DATA) or a diagnostic line (LOG). Kept free of `HostTransport`
/// so channel code never needs to know how framing works.
pub enum RxEvent<'a> {
    Data { status: u32, payload: &'a [u8] },
    Log(&'a str),
}

/// Operations the registry and dispatcher drive on any open channel,
/// regardless of which protocol it speaks.
pub trait ChannelOps<Ctl: CanController> {
    #[allow(clippy::too_many_arguments)]
    fn add_filter(
        &mut self,
        driver: &mut Driver<'_, Ctl>,
        mailboxes: &mut MailboxAllocator,
        channel_id: ChannelId,
        filter_id: FilterId,
        filter_type: u8,
        mask: &[u8],
        pattern: &[u8],
        fc: &[u8],
    ) -> OpResult<()>;

    fn remove_filter(
        &mut self,
        driver: &mut Driver<'_, Ctl>,
        mailboxes: &mut MailboxAllocator,
        filter_id: FilterId,
    ) -> OpResult<()>;

    fn send(&mut self, driver: &mut Driver<'_, Ctl>, payload: &[u8]) -> OpResult<()>;

    fn tick(&mut self, driver: &mut Driver<'_, Ctl>, now: Instant, emit: &mut dyn FnMut(RxEvent));

    fn ioctl_get(&self, option_id: u32) -> OpResult<u32>;

    fn ioctl_set(&mut self, option_id: u32, value: u32) -> OpResult<()>;

    fn teardown(&mut self, driver: &mut Driver<'_, Ctl>, mailboxes: &mut MailboxAllocator);
}

/// Fold up to 4 bytes into a big-endian `u32`, matching the original
/// firmware's byte-at-a-time mask/pattern/id assembly
/// (`comm_channel_can.cpp`/`comm_channel_iso15765.cpp`). Fewer than 4 bytes
/// behaves as if left-padded with zero high bytes.
pub(crate) fn fold_be(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}

/// One open channel slot: either a raw-CAN channel or an ISO-TP channel.
pub enum Channel {
    RawCan(RawCanChannel),
    IsoTp(IsoTpChannel),
}

impl<Ctl: CanController> ChannelOps<Ctl> for Channel {
    fn add_filter(
        &mut self,
        driver: &mut Driver<'_, Ctl>,
        mailboxes: &mut MailboxAllocator,
        channel_id: ChannelId,
        filter_id: FilterId,
        filter_type: u8,
        mask: &[u8],
        pattern: &[u8],
        fc: &[u8],
    ) -> OpResult<()> {
        match self {
            Channel::RawCan(c) => c.add_filter(driver, mailboxes, channel_id, filter_id, filter_type, mask, pattern, fc),
            Channel::IsoTp(c) => c.add_filter(driver, mailboxes, channel_id, filter_id, filter_type, mask, pattern, fc),
        }
    }

    fn remove_filter(
        &mut self,
        driver: &mut Driver<'_, Ctl>,
        mailboxes: &mut MailboxAllocator,
        filter_id: FilterId,
    ) -> OpResult<()> {
        match self {
            Channel::RawCan(c) => c.remove_filter(driver, mailboxes, filter_id),
            Channel::IsoTp(c) => c.remove_filter(driver, mailboxes, filter_id),
        }
    }

    fn send(&mut self, driver: &mut Driver<'_, Ctl>, payload: &[u8]) -> OpResult<()> {
        match self {
            Channel::RawCan(c) => c.send(driver, payload),
            Channel::IsoTp(c) => c.send(driver, payload),
        }
    }

    fn tick(&mut self, driver: &mut Driver<'_, Ctl>, now: Instant, emit: &mut dyn FnMut(RxEvent)) {
        match self {
            Channel::RawCan(c) => c.tick(driver, now, emit),
            Channel::IsoTp(c) => c.tick(driver, now, emit),
        }
    }

    fn ioctl_get(&self, option_id: u32) -> OpResult<u32> {
        match self {
            Channel::RawCan(c) => c.ioctl_get(option_id),
            Channel::IsoTp(c) => c.ioctl_get(option_id),
        }
    }

    fn ioctl_set(&mut self, option_id: u32, value: u32) -> OpResult<()> {
        match self {
            Channel::RawCan(c) => c.ioctl_set(option_id, value),
            Channel::IsoTp(c) => c.ioctl_set(option_id, value),
        }
    }

    fn teardown(&mut self, driver: &mut Driver<'_, Ctl>, mailboxes: &mut MailboxAllocator) {
        match self {
            Channel::RawCan(c) => c.teardown(driver, mailboxes),
            Channel::IsoTp(c) => c.teardown(driver, mailboxes),
        }
    }
}
