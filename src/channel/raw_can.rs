//! Raw-CAN channel: pass/block frame filtering and direct frame send/recv.
//! Grounded on `comm_channel_can.cpp`'s `CanChannel`.
use heapless::Vec as HVec;

use crate::can_queue::{CanController, Driver};
use crate::clock::Instant;
use crate::consts::MBOX_COUNT;
use crate::error::{FwError, OpResult, StatusCode};
use crate::proto::filter_type as ft;
use crate::registry::{ChannelId, FilterId, MailboxAllocator, MailboxSlot};

use super::{fold_be, ChannelOps, RxEvent};

#[derive(Clone, Copy)]
enum FilterKind {
    Pass,
    Block,
}

#[derive(Clone, Copy)]
struct RawFilter {
    kind: FilterKind,
    pattern: u32,
    mask: u32,
    slot: MailboxSlot,
}

/// A raw-CAN channel: up to seven pass/block filters, each bound to one
/// hardware mailbox.
pub struct RawCanChannel {
    channel_id: ChannelId,
    extended: bool,
    filters: [Option<RawFilter>; MBOX_COUNT],
}

impl RawCanChannel {
    pub fn new(channel_id: ChannelId, extended: bool) -> Self {
        Self { channel_id, extended, filters: [None; MBOX_COUNT] }
    }
}

impl<Ctl: CanController> ChannelOps<Ctl> for RawCanChannel {
    fn add_filter(
        &mut self,
        driver: &mut Driver<'_, Ctl>,
        mailboxes: &mut MailboxAllocator,
        channel_id: ChannelId,
        filter_id: FilterId,
        filter_type: u8,
        mask: &[u8],
        pattern: &[u8],
        _fc: &[u8],
    ) -> OpResult<()> {
        if filter_type == ft::FLOW_CONTROL {
            return Err(FwError::new(StatusCode::Failed, "CAN channel cannot use a flow control filter"));
        }
        let idx = filter_id as usize;
        if idx >= MBOX_COUNT {
            return Err(FwError::new(StatusCode::ExceededLimit, "Filter ID out of range"));
        }
        if mask.len() > 4 || pattern.len() > 4 {
            return Err(FwError::new(StatusCode::Failed, "Mask/pattern too long"));
        }
        if self.filters[idx].is_some() {
            return Err(FwError::new(StatusCode::Failed, "Filter ID in use"));
        }
        let mask_u32 = fold_be(mask);
        let pattern_u32 = fold_be(pattern);
        let slot = mailboxes
            .alloc(self.extended, channel_id, filter_id)
            .ok_or(FwError::new(StatusCode::ExceededLimit, "No free CAN mailbox"))?;
        let kind = if filter_type == ft::BLOCK { FilterKind::Block } else { FilterKind::Pass };
        let hw_result = match kind {
            FilterKind::Block => driver.enable_filter(slot, 0, 0, self.extended),
            FilterKind::Pass => driver.enable_filter(slot, pattern_u32, mask_u32, self.extended),
        };
        if hw_result.is_err() {
            mailboxes.free(slot);
            #[cfg(not(test))]
            defmt::error!("channel {}: CAN filter program failed on mailbox {}", self.channel_id, slot);
            return Err(FwError::new(StatusCode::Failed, "CAN filter program failed"));
        }
        self.filters[idx] = Some(RawFilter { kind, pattern: pattern_u32, mask: mask_u32, slot });
        Ok(())
    }

    fn remove_filter(
        &mut self,
        driver: &mut Driver<'_, Ctl>,
        mailboxes: &mut MailboxAllocator,
        filter_id: FilterId,
    ) -> OpResult<()> {
        let idx = filter_id as usize;
        if idx >= MBOX_COUNT {
            return Err(FwError::new(StatusCode::InvalidMsgId, "Filter does not exist"));
        }
        let filter = self.filters[idx]
            .take()
            .ok_or(FwError::new(StatusCode::InvalidMsgId, "Filter does not exist"))?;
        driver.disable_filter(filter.slot);
        mailboxes.free(filter.slot);
        Ok(())
    }

    fn send(&mut self, driver: &mut Driver<'_, Ctl>, payload: &[u8]) -> OpResult<()> {
        if payload.len() < 4 {
            return Err(FwError::new(StatusCode::Failed, "Payload too short"));
        }
        let id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let frame = crate::can_queue::CanFrame::new_id(id, self.extended, &payload[4..]);
        match driver.send(frame) {
            Ok(()) | Err(nb::Error::WouldBlock) => Ok(()),
            Err(nb::Error::Other(_)) => {
                #[cfg(not(test))]
                defmt::error!("channel {}: CAN Tx failed", self.channel_id);
                Err(FwError::new(StatusCode::Failed, "CAN Tx failed"))
            }
        }
    }

    fn tick(&mut self, driver: &mut Driver<'_, Ctl>, _now: Instant, emit: &mut dyn FnMut(RxEvent)) {
        for filter in self.filters.iter().flatten() {
            while let Some(frame) = driver.receive(filter.slot) {
                let forward = match filter.kind {
                    FilterKind::Pass => true,
                    FilterKind::Block => (frame.raw_id() & filter.mask) != filter.pattern,
                };
                if !forward {
                    continue;
                }
                let mut payload: HVec<u8, 12> = HVec::new();
                let _ = payload.extend_from_slice(&frame.raw_id().to_be_bytes());
                let _ = payload.extend_from_slice(frame.data());
                emit(RxEvent::Data { status: crate::proto::rx_status::NORMAL, payload: &payload[..] });
            }
        }
    }

    fn ioctl_get(&self, _option_id: u32) -> OpResult<u32> {
        Err(FwError::new(StatusCode::Failed, "Not implemented"))
    }

    fn ioctl_set(&mut self, _option_id: u32, _value: u32) -> OpResult<()> {
        Err(FwError::new(StatusCode::Failed, "Not implemented"))
    }

    fn teardown(&mut self, driver: &mut Driver<'_, Ctl>, mailboxes: &mut MailboxAllocator) {
        for filter in self.filters.iter_mut() {
            if let Some(f) = filter.take() {
                driver.disable_filter(f.slot);
                mailboxes.free(f.slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can_queue::{CanFrame, MailboxRings};
    use crate::clock::test_support::FakeClock;
    use crate::clock::Clock;

    struct MockController;
    impl CanController for MockController {
        type Error = ();
        fn init(&mut self, _bitrate: u32) -> Result<(), ()> { Ok(()) }
        fn disable(&mut self) {}
        fn set_filter(&mut self, _slot: usize, _p: u32, _m: u32, _ext: bool) -> Result<(), ()> { Ok(()) }
        fn clear_filter(&mut self, _slot: usize) {}
        fn send(&mut self, _frame: CanFrame) -> nb::Result<(), ()> { Ok(()) }
    }

    #[test]
    fn pass_filter_forwards_matching_frames() {
        let mut rings = MailboxRings::new();
        let (mut tx, rx) = rings.split();
        let mut driver = Driver::new(MockController, rx);
        let mut mailboxes = MailboxAllocator::new();
        let mut chan = RawCanChannel::new(0, false);
        chan.add_filter(&mut driver, &mut mailboxes, 0, 0, ft::PASS, &[0xFF, 0xFF], &[0x01, 0x23], &[]).unwrap();
        tx.push(0, CanFrame::new_id(0x123, false, &[1, 2, 3]));
        let now = FakeClock::new().now();
        let mut forwarded = 0;
        chan.tick(&mut driver, now, &mut |ev| {
            if let RxEvent::Data { payload, .. } = ev {
                assert_eq!(&payload[0..4], &0x123u32.to_be_bytes());
                forwarded += 1;
            }
        });
        assert_eq!(forwarded, 1);
    }

    #[test]
    fn block_filter_drops_matching_frames() {
        let mut rings = MailboxRings::new();
        let (mut tx, rx) = rings.split();
        let mut driver = Driver::new(MockController, rx);
        let mut mailboxes = MailboxAllocator::new();
        let mut chan = RawCanChannel::new(0, false);
        chan.add_filter(&mut driver, &mut mailboxes, 0, 0, ft::BLOCK, &[0xFF, 0xFF], &[0x01, 0x23], &[]).unwrap();
        tx.push(0, CanFrame::new_id(0x123, false, &[]));
        tx.push(0, CanFrame::new_id(0x456, false, &[]));
        let now = FakeClock::new().now();
        let mut forwarded = 0;
        chan.tick(&mut driver, now, &mut |_| forwarded += 1);
        assert_eq!(forwarded, 1);
    }

    #[test]
    fn eighth_filter_add_exceeds_mailbox_limit() {
        let mut rings = MailboxRings::new();
        let (_tx, rx) = rings.split();
        let mut driver = Driver::new(MockController, rx);
        let mut mailboxes = MailboxAllocator::new();
        let mut chan = RawCanChannel::new(0, false);
        for i in 0..MBOX_COUNT as u8 {
            chan.add_filter(&mut driver, &mut mailboxes, 0, i, ft::PASS, &[0xFF], &[i], &[]).unwrap();
        }
        let err = chan.add_filter(&mut driver, &mut mailboxes, 0, 0, ft::PASS, &[0xFF], &[9], &[]);
        // filter_id 0 is already in use at this point regardless of mailbox exhaustion
        assert!(err.is_err());
    }

    #[test]
    fn remove_unknown_filter_reports_invalid_msg_id() {
        let mut rings = MailboxRings::new();
        let (_tx, rx) = rings.split();
        let mut driver = Driver::new(MockController, rx);
        let mut mailboxes = MailboxAllocator::new();
        let mut chan = RawCanChannel::new(0, false);
        let err = chan.remove_filter(&mut driver, &mut mailboxes, 3).unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidMsgId);
    }
}
