//! Channel registry: the process-wide table of open channels, the shared
//! mailbox allocator they draw from, and the committed-bitrate invariant
//! that binds them all to one bus speed at a time.
//!
//! Grounded on `comm_channels.h`'s `used_mailboxes` tables generalised from
//! one table per channel instance to one shared pool (spec.md §3 "Mailbox
//! allocation table"), since the original only ever ran one channel at a
//! time and never needed to arbitrate seven mailboxes across several.
use crate::can_queue::{CanController, Driver};
use crate::channel::{Channel, ChannelOps, RxEvent};
use crate::channel::isotp::IsoTpChannel;
use crate::channel::raw_can::RawCanChannel;
use crate::clock::Instant;
use crate::consts::{EXTENDED_MBOX_COUNT, MAX_CHANNELS, MBOX_COUNT};
use crate::error::{FwError, OpResult, StatusCode};
use crate::proto::protocol_id;

pub type ChannelId = u8;
pub type FilterId = u8;
pub type MailboxSlot = usize;

/// Owner of a mailbox slot: which channel and which of that channel's
/// filter ids claimed it.
#[derive(Clone, Copy)]
struct Owner {
    channel_id: ChannelId,
    filter_id: FilterId,
}

/// The shared pool of seven hardware mailboxes. Slots 0–3 are the
/// preferred range for 29-bit extended filters and 4–6 for 11-bit standard
/// filters (spec.md §3); a channel that finds its preferred sub-pool full
/// but the other one free still gets a slot; see DESIGN.md "mailbox
/// allocator fallback" for why a hard, non-overlapping partition would
/// contradict spec.md §8 property 13 / scenario S5.
pub struct MailboxAllocator {
    owners: [Option<Owner>; MBOX_COUNT],
}

impl MailboxAllocator {
    pub const fn new() -> Self {
        Self { owners: [None; MBOX_COUNT] }
    }

    /// Claim a free slot for `(channel_id, filter_id)`, searching the
    /// caller's preferred id-width class first. Returns `None` once all
    /// seven mailboxes are owned.
    pub fn alloc(&mut self, extended: bool, channel_id: ChannelId, filter_id: FilterId) -> Option<MailboxSlot> {
        let (preferred, fallback): (core::ops::Range<usize>, core::ops::Range<usize>) = if extended {
            (0..EXTENDED_MBOX_COUNT, EXTENDED_MBOX_COUNT..MBOX_COUNT)
        } else {
            (EXTENDED_MBOX_COUNT..MBOX_COUNT, 0..EXTENDED_MBOX_COUNT)
        };
        for slot in preferred.chain(fallback) {
            if self.owners[slot].is_none() {
                self.owners[slot] = Some(Owner { channel_id, filter_id });
                return Some(slot);
            }
        }
        None
    }

    pub fn free(&mut self, slot: MailboxSlot) {
        self.owners[slot] = None;
    }

    /// Release every slot owned by `channel_id`, used when a channel
    /// closes or on a global reset.
    pub fn free_all_owned_by(&mut self, channel_id: ChannelId) {
        for owner in self.owners.iter_mut() {
            if owner.map(|o| o.channel_id) == Some(channel_id) {
                *owner = None;
            }
        }
    }

    pub fn reset(&mut self) {
        self.owners = [None; MBOX_COUNT];
    }
}

impl Default for MailboxAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide table of open channels plus the bus-wide state every
/// open channel shares: the mailbox pool and the one committed bitrate.
pub struct ChannelRegistry {
    slots: [Option<Channel>; MAX_CHANNELS],
    mailboxes: MailboxAllocator,
    bitrate: Option<u32>,
}

impl ChannelRegistry {
    pub const fn new() -> Self {
        const NONE: Option<Channel> = None;
        Self {
            slots: [NONE; MAX_CHANNELS],
            mailboxes: MailboxAllocator::new(),
            bitrate: None,
        }
    }

    /// PassThru `open`. spec.md §4.2 order: channel slot, then protocol id,
    /// then bitrate, then construction.
    pub fn open<Ctl: CanController>(
        &mut self,
        id: ChannelId,
        protocol: u32,
        baud: u32,
        flags: u32,
        driver: &mut Driver<'_, Ctl>,
    ) -> OpResult<()> {
        let idx = id as usize;
        if idx >= MAX_CHANNELS || self.slots[idx].is_some() {
            return Err(FwError::new(StatusCode::ChannelInUse, "Channel ID in use"));
        }
        let extended = (flags & crate::proto::flags::CAN_29BIT_ID) != 0;
        match protocol {
            protocol_id::CAN | protocol_id::ISO15765 => {}
            protocol_id::J1850VPW
            | protocol_id::J1850PWM
            | protocol_id::ISO9141
            | protocol_id::ISO14230
            | protocol_id::SCI_A_ENGINE
            | protocol_id::SCI_A_TRANS
            | protocol_id::SCI_B_ENGINE
            | protocol_id::SCI_B_TRANS => {
                return Err(FwError::new(StatusCode::NotSupported, "Protocol not supported"));
            }
            _ => return Err(FwError::new(StatusCode::InvalidProtocolId, "Unknown protocol ID")),
        }
        if let Some(committed) = self.bitrate {
            if committed != baud {
                return Err(FwError::new(StatusCode::Failed, "Bitrate does not match already-open channels"));
            }
        }
        if driver.init(baud).is_err() {
            #[cfg(not(test))]
            defmt::error!("CAN controller setup failed for channel {}", id);
            return Err(FwError::new(StatusCode::Failed, "CAN Controller setup failed!"));
        }
        let channel = match protocol {
            protocol_id::CAN => Channel::RawCan(RawCanChannel::new(id, extended)),
            _ => Channel::IsoTp(IsoTpChannel::new(id, extended)),
        };
        self.bitrate = Some(baud);
        self.slots[idx] = Some(channel);
        #[cfg(not(test))]
        defmt::debug!("channel {} opened, protocol {}, baud {}", id, protocol, baud);
        Ok(())
    }

    /// PassThru `close`.
    pub fn close<Ctl: CanController>(&mut self, id: ChannelId, driver: &mut Driver<'_, Ctl>) -> OpResult<()> {
        let idx = id as usize;
        let channel = self.slots[idx]
            .as_mut()
            .ok_or(FwError::new(StatusCode::InvalidChannelId, "Channel not open"))?;
        channel.teardown(driver, &mut self.mailboxes);
        self.slots[idx] = None;
        #[cfg(not(test))]
        defmt::debug!("channel {} closed", id);
        if self.slots.iter().all(Option::is_none) {
            self.bitrate = None;
            driver.disable();
        }
        Ok(())
    }

    /// Reset every channel and all shared state: the STATUS (0xAA)
    /// "goodbye" operation (spec.md §4.9).
    pub fn reset_all<Ctl: CanController>(&mut self, driver: &mut Driver<'_, Ctl>) {
        #[cfg(not(test))]
        defmt::info!("resetting all channels");
        for slot in self.slots.iter_mut() {
            if let Some(channel) = slot {
                channel.teardown(driver, &mut self.mailboxes);
            }
            *slot = None;
        }
        self.mailboxes.reset();
        self.bitrate = None;
        driver.disable();
    }

    fn get_mut(&mut self, id: ChannelId) -> OpResult<&mut Channel> {
        self.slots
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or(FwError::new(StatusCode::InvalidChannelId, "Channel not open"))
    }

    pub fn add_filter<Ctl: CanController>(
        &mut self,
        id: ChannelId,
        driver: &mut Driver<'_, Ctl>,
        filter_id: FilterId,
        filter_type: u8,
        mask: &[u8],
        pattern: &[u8],
        fc: &[u8],
    ) -> OpResult<()> {
        let mailboxes = &mut self.mailboxes;
        let channel = self.slots
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or(FwError::new(StatusCode::InvalidChannelId, "Channel not open"))?;
        channel.add_filter(driver, mailboxes, id, filter_id, filter_type, mask, pattern, fc)
    }

    pub fn remove_filter<Ctl: CanController>(
        &mut self,
        id: ChannelId,
        driver: &mut Driver<'_, Ctl>,
        filter_id: FilterId,
    ) -> OpResult<()> {
        let mailboxes = &mut self.mailboxes;
        let channel = self.slots
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or(FwError::new(StatusCode::InvalidChannelId, "Channel not open"))?;
        channel.remove_filter(driver, mailboxes, filter_id)
    }

    pub fn send<Ctl: CanController>(
        &mut self,
        id: ChannelId,
        driver: &mut Driver<'_, Ctl>,
        payload: &[u8],
    ) -> OpResult<()> {
        self.get_mut(id)?.send(driver, payload)
    }

    pub fn ioctl_get(&self, id: ChannelId, option_id: u32) -> OpResult<u32> {
        self.slots
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(FwError::new(StatusCode::InvalidChannelId, "Channel not open"))?
            .ioctl_get(option_id)
    }

    pub fn ioctl_set(&mut self, id: ChannelId, option_id: u32, value: u32) -> OpResult<()> {
        self.get_mut(id)?.ioctl_set(option_id, value)
    }

    /// Drive every open channel's background work: drain its mailboxes and
    /// service any in-flight ISO-TP send. `emit` forwards RX_DATA/LOG
    /// records to the framer without coupling channels to `HostTransport`.
    pub fn tick<Ctl: CanController>(
        &mut self,
        driver: &mut Driver<'_, Ctl>,
        now: Instant,
        emit: &mut dyn FnMut(RxEvent),
    ) {
        for slot in self.slots.iter_mut() {
            if let Some(channel) = slot {
                channel.tick(driver, now, emit);
            }
        }
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
