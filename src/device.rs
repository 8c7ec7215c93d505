//! Top-level device: wires the framer, channel registry, CAN driver and
//! board services into the cooperative foreground loop spec.md §5
//! describes ("one cooperative foreground loop plus hardware interrupts").
//!
//! A board binary (not part of this crate — spec.md §1 keeps the USB-serial
//! transport, the CAN peripheral driver and LED/battery/version hardware
//! external) owns concrete `CanController`/`HostTransport`/`BoardServices`
//! implementations and a `'static MailboxRings`, constructs one `Device`,
//! drives `Device::tick()` from a plain `loop {}`, and forwards its CAN RX
//! interrupt into `Device::on_can_frame()`.
use crate::board::BoardServices;
use crate::can_queue::{CanController, CanFrame, Driver, MailboxRings, RxProducers};
use crate::channel::RxEvent;
use crate::clock::Clock;
use crate::dispatcher::dispatch;
use crate::framing::{Framer, HostTransport};
use crate::proto::msg_type;
use crate::registry::ChannelRegistry;

pub struct Device<'a, Ctl, T, B, Clk>
where
    Ctl: CanController,
    T: HostTransport,
    B: BoardServices,
    Clk: Clock,
{
    registry: ChannelRegistry,
    driver: Driver<'a, Ctl>,
    producers: RxProducers<'a>,
    framer: Framer<T>,
    board: B,
    clock: Clk,
}

impl<'a, Ctl, T, B, Clk> Device<'a, Ctl, T, B, Clk>
where
    Ctl: CanController,
    T: HostTransport,
    B: BoardServices,
    Clk: Clock,
{
    pub fn new(controller: Ctl, rings: &'a mut MailboxRings, transport: T, board: B, clock: Clk) -> Self {
        let (producers, consumers) = rings.split();
        Self {
            registry: ChannelRegistry::new(),
            driver: Driver::new(controller, consumers),
            producers,
            framer: Framer::new(transport),
            board,
            clock,
        }
    }

    /// Forward one frame received on `mailbox` from interrupt context into
    /// that mailbox's ring (spec.md §4.3: "the callback ... copies the
    /// frame into the ring"). Returns `false` if the ring was full and the
    /// frame was dropped.
    pub fn on_can_frame(&mut self, mailbox: usize, frame: CanFrame) -> bool {
        self.producers.push(mailbox, frame)
    }

    /// One iteration of the foreground loop (spec.md §2): drain at most one
    /// complete inbound host message and dispatch it, then tick every live
    /// channel in id order.
    pub fn tick(&mut self) {
        if let Some(msg) = self.framer.poll_inbound() {
            dispatch(&msg, &mut self.registry, &mut self.driver, &mut self.framer, &mut self.board);
        }
        let now = self.clock.now();
        let framer = &mut self.framer;
        self.registry.tick(&mut self.driver, now, &mut |ev| match ev {
            RxEvent::Data { status, payload } => {
                framer.send_parts(0, msg_type::CHANNEL_DATA, &status.to_be_bytes(), payload);
            }
            RxEvent::Log(text) => framer.log(text.as_bytes()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use crate::framing::test_support::MockTransport;
    use crate::proto::{filter_type as ft, protocol_id, rx_status};
    use embedded_can::Frame as _;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec as StdVec;

    struct MockBoard;
    impl BoardServices for MockBoard {
        fn read_battery_millivolts(&mut self) -> u32 {
            0
        }
        fn firmware_version(&self) -> &str {
            "test"
        }
    }

    /// Records every frame handed to `send`, so scenario tests can assert
    /// on what the firmware put on the wire (flow-control frames, first
    /// frames, consecutive frames).
    #[derive(Clone, Default)]
    struct RecordingController {
        sent: Rc<RefCell<StdVec<CanFrame>>>,
    }

    impl CanController for RecordingController {
        type Error = ();
        fn init(&mut self, _bitrate: u32) -> Result<(), ()> {
            Ok(())
        }
        fn disable(&mut self) {}
        fn set_filter(&mut self, _slot: usize, _pattern: u32, _mask: u32, _extended: bool) -> Result<(), ()> {
            Ok(())
        }
        fn clear_filter(&mut self, _slot: usize) {}
        fn send(&mut self, frame: CanFrame) -> nb::Result<(), ()> {
            self.sent.borrow_mut().push(frame);
            Ok(())
        }
    }

    type TestDevice<'a> = Device<'a, RecordingController, MockTransport, MockBoard, FakeClock>;

    fn le_u32(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }

    fn push_host_message(device: &mut TestDevice<'_>, msg_id: u8, msg_type: u8, args: &[u8]) {
        let mut framed = StdVec::new();
        let total = (2 + args.len()) as u16;
        framed.extend_from_slice(&total.to_le_bytes());
        framed.push(msg_id);
        framed.push(msg_type);
        framed.extend_from_slice(args);
        device.framer.transport_mut().feed(&framed);
    }

    struct OutRecord {
        msg_id: u8,
        msg_type: u8,
        args: StdVec<u8>,
    }

    fn drain_outbound(device: &mut TestDevice<'_>) -> StdVec<OutRecord> {
        let bytes = device.framer.transport_mut().take_outbound();
        let mut out = StdVec::new();
        let mut i = 0;
        while i + 4 <= bytes.len() {
            let msg_id = bytes[i];
            let msg_type = bytes[i + 1];
            let len = u16::from_le_bytes([bytes[i + 2], bytes[i + 3]]) as usize;
            let start = i + 4;
            if start + len > bytes.len() {
                break;
            }
            out.push(OutRecord { msg_id, msg_type, args: bytes[start..start + len].to_vec() });
            i = start + len;
        }
        out
    }

    fn open_channel_args(id: u32, protocol: u32, baud: u32, flags: u32) -> StdVec<u8> {
        let mut a = StdVec::new();
        a.extend_from_slice(&le_u32(id));
        a.extend_from_slice(&le_u32(protocol));
        a.extend_from_slice(&le_u32(baud));
        a.extend_from_slice(&le_u32(flags));
        a
    }

    fn set_filter_args(channel_id: u32, filter_id: u32, filter_type: u32, mask: &[u8], pattern: &[u8], fc: &[u8]) -> StdVec<u8> {
        let mut a = StdVec::new();
        a.extend_from_slice(&le_u32(channel_id));
        a.extend_from_slice(&le_u32(filter_id));
        a.extend_from_slice(&le_u32(filter_type));
        a.extend_from_slice(&le_u32(mask.len() as u32));
        a.extend_from_slice(&le_u32(pattern.len() as u32));
        a.extend_from_slice(&le_u32(fc.len() as u32));
        a.extend_from_slice(mask);
        a.extend_from_slice(pattern);
        a.extend_from_slice(fc);
        a
    }

    fn new_device(rings: &mut MailboxRings) -> Device<'_, RecordingController, MockTransport, MockBoard, FakeClock> {
        Device::new(RecordingController::default(), rings, MockTransport::new(), MockBoard, FakeClock::new())
    }

    /// S1 — open and single-frame echo, raw-CAN.
    #[test]
    fn s1_open_and_single_frame_echo_raw_can() {
        let mut rings = MailboxRings::new();
        let mut device = new_device(&mut rings);

        push_host_message(&mut device, 1, msg_type::OPEN_CHANNEL, &open_channel_args(5, protocol_id::CAN, 500_000, 0));
        device.tick();
        let replies = drain_outbound(&mut device);
        assert_eq!(replies[0].args[0], 0x00);

        push_host_message(
            &mut device,
            2,
            msg_type::SET_CHAN_FILT,
            &set_filter_args(5, 0, ft::PASS as u32, &0x7FFu32.to_be_bytes(), &0x7E8u32.to_be_bytes(), &[]),
        );
        device.tick();
        let replies = drain_outbound(&mut device);
        assert_eq!(replies[0].args[0], 0x00);

        // First PASS filter on a non-extended (standard) channel lands on
        // mailbox 4 (first-fit in the standard 4..7 range).
        device.on_can_frame(4, CanFrame::new_id(0x7E8, false, &[0x03, 0x7F, 0x22, 0x12]));
        device.tick();
        let events = drain_outbound(&mut device);
        let rx = &events[0];
        assert_eq!(rx.msg_type, msg_type::CHANNEL_DATA);
        assert_eq!(&rx.args[..], &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, 0xE8, 0x03, 0x7F, 0x22, 0x12][..]);
    }

    /// S2 — ISO-TP first-frame round trip.
    #[test]
    fn s2_isotp_first_frame_round_trip() {
        let mut rings = MailboxRings::new();
        let mut device = new_device(&mut rings);

        push_host_message(&mut device, 1, msg_type::OPEN_CHANNEL, &open_channel_args(6, protocol_id::ISO15765, 500_000, 0));
        device.tick();
        let _ = drain_outbound(&mut device);

        push_host_message(
            &mut device,
            2,
            msg_type::SET_CHAN_FILT,
            &set_filter_args(
                6,
                0,
                ft::FLOW_CONTROL as u32,
                &0x0000_07FFu32.to_be_bytes(),
                &0x0000_07E8u32.to_be_bytes(),
                &0x0000_07E0u32.to_be_bytes(),
            ),
        );
        device.tick();
        let _ = drain_outbound(&mut device);

        device.on_can_frame(4, CanFrame::new_id(0x7E8, false, &[0x10, 0x14, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6]));
        device.tick();
        let events = drain_outbound(&mut device);
        let first = &events[0];
        assert_eq!(first.msg_type, msg_type::CHANNEL_DATA);
        let status = u32::from_be_bytes([first.args[0], first.args[1], first.args[2], first.args[3]]);
        assert_eq!(status, rx_status::ISO15765_FIRST_FRAME);
        assert_eq!(&first.args[4..8], &0x7E8u32.to_be_bytes());

        let sent = device.driver_controller_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].raw_id(), 0x7E0);
        assert_eq!(sent[0].data()[0], 0x30);

        device.on_can_frame(4, CanFrame::new_id(0x7E8, false, &[0x21, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7]));
        device.tick();
        let _ = drain_outbound(&mut device);
        device.on_can_frame(4, CanFrame::new_id(0x7E8, false, &[0x22, 0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7]));
        device.tick();
        let events = drain_outbound(&mut device);
        let complete = &events[0];
        assert_eq!(u32::from_be_bytes([complete.args[4], complete.args[5], complete.args[6], complete.args[7]]), 0x7E8);
        assert_eq!(complete.args.len(), 4 + 4 + 20); // status + id + 20-byte payload
    }

    /// S3 — ISO-TP multi-frame send.
    #[test]
    fn s3_isotp_multi_frame_send() {
        let mut rings = MailboxRings::new();
        let mut device = new_device(&mut rings);

        push_host_message(&mut device, 1, msg_type::OPEN_CHANNEL, &open_channel_args(6, protocol_id::ISO15765, 500_000, 0));
        device.tick();
        let _ = drain_outbound(&mut device);
        push_host_message(
            &mut device,
            2,
            msg_type::SET_CHAN_FILT,
            &set_filter_args(
                6,
                0,
                ft::FLOW_CONTROL as u32,
                &0x0000_07FFu32.to_be_bytes(),
                &0x0000_07E8u32.to_be_bytes(),
                &0x0000_07E0u32.to_be_bytes(),
            ),
        );
        device.tick();
        let _ = drain_outbound(&mut device);

        let payload: StdVec<u8> = (1..=20).collect();
        let mut tx_args = StdVec::new();
        tx_args.extend_from_slice(&le_u32(6));
        tx_args.extend_from_slice(&le_u32(0)); // tx_flags
        tx_args.extend_from_slice(&0x7E0u32.to_be_bytes());
        tx_args.extend_from_slice(&payload);
        push_host_message(&mut device, 3, msg_type::CHANNEL_DATA, &tx_args);
        device.tick();
        let replies = drain_outbound(&mut device);
        assert_eq!(replies[0].args[0], 0x00);

        let sent = device.driver_controller_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data(), &[0x10, 0x14, 1, 2, 3, 4, 5, 6]);

        // FC: block size 8, sep time 20ms. Arrives at t=0; the local
        // separation time (10ms default) gates the first CF, the FC's own
        // 20ms sep time gates the second.
        device.on_can_frame(4, CanFrame::new_id(0x7E8, false, &[0x30, 0x08, 0x14, 0, 0, 0, 0, 0]));
        device.tick(); // processes FC, too early to send (now=0 < deadline=10)
        assert_eq!(device.driver_controller_sent().len(), 1);

        device.clock_advance(15); // now=15 >= 10
        device.tick();
        assert_eq!(device.driver_controller_sent().len(), 2);

        device.clock_advance(25); // now=40 >= 35 (15 + 20ms remote sep time)
        device.tick();

        let sent = device.driver_controller_sent();
        // [0]=FF, [1]=first CF, [2]=second CF
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].data(), &[0x21, 7, 8, 9, 10, 11, 12, 13]);
        assert_eq!(sent[2].data(), &[0x22, 14, 15, 16, 17, 18, 19, 20]);
    }

    /// S4 — baud mismatch.
    #[test]
    fn s4_baud_mismatch_fails() {
        let mut rings = MailboxRings::new();
        let mut device = new_device(&mut rings);
        push_host_message(&mut device, 1, msg_type::OPEN_CHANNEL, &open_channel_args(0, protocol_id::CAN, 500_000, 0));
        device.tick();
        let _ = drain_outbound(&mut device);

        push_host_message(&mut device, 2, msg_type::OPEN_CHANNEL, &open_channel_args(1, protocol_id::CAN, 250_000, 0));
        device.tick();
        let replies = drain_outbound(&mut device);
        assert_eq!(replies[0].args[0], crate::error::StatusCode::Failed.code());
    }

    /// S5 — filter exhaustion on ISO-TP.
    #[test]
    fn s5_eighth_filter_add_exceeds_limit() {
        let mut rings = MailboxRings::new();
        let mut device = new_device(&mut rings);
        push_host_message(&mut device, 1, msg_type::OPEN_CHANNEL, &open_channel_args(6, protocol_id::ISO15765, 500_000, 0));
        device.tick();
        let _ = drain_outbound(&mut device);

        for i in 0..7u32 {
            push_host_message(
                &mut device,
                2,
                msg_type::SET_CHAN_FILT,
                &set_filter_args(
                    6,
                    i,
                    ft::FLOW_CONTROL as u32,
                    &0x0000_07FFu32.to_be_bytes(),
                    &(0x700 + i).to_be_bytes(),
                    &(0x7E0 + i).to_be_bytes(),
                ),
            );
            device.tick();
            let replies = drain_outbound(&mut device);
            assert_eq!(replies[0].args[0], 0x00, "filter {i} should succeed");
        }

        push_host_message(
            &mut device,
            2,
            msg_type::SET_CHAN_FILT,
            &set_filter_args(6, 7, ft::FLOW_CONTROL as u32, &0x0000_07FFu32.to_be_bytes(), &0x0000_0800u32.to_be_bytes(), &0x0000_07E7u32.to_be_bytes()),
        );
        device.tick();
        let replies = drain_outbound(&mut device);
        assert_eq!(replies[0].args[0], crate::error::StatusCode::ExceededLimit.code());
    }

    /// S6 — reset-all-channels (STATUS goodbye) then re-open succeeds.
    #[test]
    fn s6_reset_allows_reopen_on_any_id() {
        let mut rings = MailboxRings::new();
        let mut device = new_device(&mut rings);
        push_host_message(&mut device, 1, msg_type::OPEN_CHANNEL, &open_channel_args(0, protocol_id::CAN, 500_000, 0));
        device.tick();
        let _ = drain_outbound(&mut device);

        push_host_message(&mut device, 2, msg_type::STATUS, &[crate::proto::status_subcode::GOODBYE]);
        device.tick();
        let replies = drain_outbound(&mut device);
        assert_eq!(replies[0].args[0], 0x00);

        push_host_message(&mut device, 3, msg_type::OPEN_CHANNEL, &open_channel_args(0, protocol_id::CAN, 250_000, 0));
        device.tick();
        let replies = drain_outbound(&mut device);
        assert_eq!(replies[0].args[0], 0x00, "baud is free again after reset");
    }

    impl<'a> TestDevice<'a> {
        fn driver_controller_sent(&self) -> StdVec<CanFrame> {
            self.driver.controller_for_test().sent.borrow().clone()
        }

        fn clock_advance(&self, ms: u32) {
            self.clock.advance_millis(ms);
        }
    }
}
