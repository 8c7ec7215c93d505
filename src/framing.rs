//! Host/firmware message framing over the serial link (spec.md §4.1),
//! generalising the original firmware's `PCCOMM` namespace
//! (`comm.h`/`comm.cpp`): a two-byte little-endian length prefix, then a
//! fixed-layout body of message id, message type, and argument bytes.
use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

use crate::consts::ARG_CAP;
use crate::error::StatusCode;
use crate::proto::msg_type;

/// Largest body (message id + message type + args) the framer will
/// accept. Anything the host declares larger is rejected per spec.md
/// §4.1 "Failure" without ever allocating a buffer for it.
const BODY_CAP: usize = ARG_CAP + 2;

/// The out-of-scope hardware collaborator: a non-blocking byte-level sink
/// and source over the USB-serial link. A board binary implements this
/// over its CDC/UART peripheral.
pub trait HostTransport {
    /// Copy up to `buf.len()` available bytes into `buf` without
    /// blocking; returns how many were copied (0 if none are available
    /// yet).
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Write `buf` in full. The original firmware's `send_message` does a
    /// blocking `SerialUSB.write().flush()`; this crate keeps that
    /// contract at the transport boundary rather than re-implementing a
    /// retry buffer nobody above this layer needs.
    fn write_all(&mut self, buf: &[u8]);
}

/// One fully received inbound message.
#[derive(Debug, Clone)]
pub struct HostMessage {
    pub msg_id: u8,
    pub msg_type: u8,
    pub args: Vec<u8, ARG_CAP>,
}

enum InboundState {
    /// Accumulating the two-byte length prefix.
    Length { have: [u8; 2], len: u8 },
    /// Accumulating `target` bytes of body (msg_id, msg_type, args).
    Body { target: usize, buf: Vec<u8, BODY_CAP> },
}

impl InboundState {
    const fn fresh() -> Self {
        InboundState::Length { have: [0; 2], len: 0 }
    }
}

/// Drives the inbound state machine and assembles outbound records.
/// Wraps a single `HostTransport`; holds no other state but the message
/// id correlation tag and the in-progress inbound body.
pub struct Framer<T: HostTransport> {
    transport: T,
    state: InboundState,
    last_id: u8,
}

impl<T: HostTransport> Framer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: InboundState::fresh(),
            last_id: 0,
        }
    }

    /// Advance inbound framing using whatever bytes are currently
    /// available and return a complete message, or `None` if none is
    /// ready yet. Tolerates arbitrary chunking: a call that finds nothing
    /// new simply returns `None` and the partial state survives to the
    /// next tick.
    pub fn poll_inbound(&mut self) -> Option<HostMessage> {
        loop {
            match &mut self.state {
                InboundState::Length { have, len } => {
                    let mut chunk = [0u8; 2];
                    let need = 2 - *len as usize;
                    let got = self.transport.read(&mut chunk[..need]);
                    if got == 0 {
                        return None;
                    }
                    have[*len as usize..*len as usize + got].copy_from_slice(&chunk[..got]);
                    *len += got as u8;
                    if *len < 2 {
                        return None;
                    }
                    let target = LittleEndian::read_u16(have) as usize;
                    if target < 2 || target > BODY_CAP {
                        self.respond_err(
                            msg_type::LOG,
                            StatusCode::Failed,
                            b"declared message length out of range",
                        );
                        self.state = InboundState::fresh();
                        return None;
                    }
                    self.state = InboundState::Body { target, buf: Vec::new() };
                }
                InboundState::Body { target, buf } => {
                    let remaining = *target - buf.len();
                    if remaining == 0 {
                        // Shouldn't happen (handled by the completion branch below),
                        // but don't spin if it ever does.
                        self.state = InboundState::fresh();
                        return None;
                    }
                    let mut chunk = [0u8; 64];
                    let want = core::cmp::min(remaining, chunk.len());
                    let got = self.transport.read(&mut chunk[..want]);
                    if got == 0 {
                        return None;
                    }
                    // capacity was validated against BODY_CAP when `target` was accepted
                    let _ = buf.extend_from_slice(&chunk[..got]);
                    if buf.len() < *target {
                        return None;
                    }
                    let msg_id = buf[0];
                    let msg_type = buf[1];
                    let mut args = Vec::new();
                    let _ = args.extend_from_slice(&buf[2..]);
                    if msg_id != 0 {
                        self.last_id = msg_id;
                    }
                    self.state = InboundState::fresh();
                    return Some(HostMessage { msg_id, msg_type, args });
                }
            }
        }
    }

    /// Reset the inbound state machine, discarding any partially received
    /// message. Used on global reset (STATUS goodbye).
    pub fn reset_inbound(&mut self) {
        self.state = InboundState::fresh();
    }

    /// Emit one outbound record with an explicit message id. Used for
    /// unsolicited messages (RX_DATA, LOG) which always carry id 0.
    pub fn send(&mut self, msg_id: u8, msg_type: u8, args: &[u8]) {
        let len = core::cmp::min(args.len(), BODY_CAP - 2) as u16;
        let mut header = [0u8; 4];
        header[0] = msg_id;
        header[1] = msg_type;
        LittleEndian::write_u16(&mut header[2..], len);
        self.transport.write_all(&header);
        self.transport.write_all(&args[..len as usize]);
    }

    /// Emit one outbound record assembled from two parts (e.g. a status
    /// word and a payload) without needing them contiguous in memory first
    /// — avoids a stack copy of a full `ISOTP_BUF_CAP`-sized reassembled
    /// payload just to prepend 4 status bytes.
    pub fn send_parts(&mut self, msg_id: u8, msg_type: u8, head: &[u8], tail: &[u8]) {
        let total = core::cmp::min(head.len() + tail.len(), BODY_CAP - 2) as u16;
        let mut header = [0u8; 4];
        header[0] = msg_id;
        header[1] = msg_type;
        LittleEndian::write_u16(&mut header[2..], total);
        self.transport.write_all(&header);
        let head_take = core::cmp::min(head.len(), total as usize);
        self.transport.write_all(&head[..head_take]);
        let tail_take = (total as usize) - head_take;
        self.transport.write_all(&tail[..tail_take]);
    }

    /// Reply ok to the last request, prefixing the status byte
    /// (`StatusCode::NoError`).
    pub fn respond_ok(&mut self, msg_type: u8, args: &[u8]) {
        let mut prefixed: Vec<u8, BODY_CAP> = Vec::new();
        let _ = prefixed.push(StatusCode::NoError.code());
        let _ = prefixed.extend_from_slice(args);
        self.send(self.last_id, msg_type, &prefixed);
    }

    /// Reply with an error status and a short diagnostic string.
    pub fn respond_err(&mut self, msg_type: u8, err: StatusCode, text: &[u8]) {
        let mut prefixed: Vec<u8, BODY_CAP> = Vec::new();
        let _ = prefixed.push(err.code());
        let _ = prefixed.extend_from_slice(text);
        self.send(self.last_id, msg_type, &prefixed);
    }

    /// Emit an unsolicited diagnostic log record (message id 0).
    pub fn log(&mut self, text: &[u8]) {
        self.send(0, msg_type::LOG, text);
    }

    /// Test-only escape hatch onto the wrapped transport, so tests outside
    /// this module can inspect what a dispatch sent.
    #[cfg(test)]
    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::HostTransport;
    use std::collections::VecDeque;

    /// Host transport test double: two byte queues, one per direction.
    /// `chunked` pushes inbound bytes a few at a time so tests can verify
    /// the framer tolerates arbitrary chunking.
    pub struct MockTransport {
        pub inbound: VecDeque<u8>,
        pub outbound: VecDeque<u8>,
        pub chunk_limit: usize,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self { inbound: VecDeque::new(), outbound: VecDeque::new(), chunk_limit: usize::MAX }
        }

        pub fn chunked(limit: usize) -> Self {
            Self { inbound: VecDeque::new(), outbound: VecDeque::new(), chunk_limit: limit }
        }

        pub fn feed(&mut self, bytes: &[u8]) {
            self.inbound.extend(bytes.iter().copied());
        }

        pub fn take_outbound(&mut self) -> Vec<u8> {
            self.outbound.drain(..).collect()
        }
    }

    impl HostTransport for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> usize {
            let n = core::cmp::min(buf.len(), self.chunk_limit);
            let mut i = 0;
            while i < n {
                match self.inbound.pop_front() {
                    Some(b) => {
                        buf[i] = b;
                        i += 1;
                    }
                    None => break,
                }
            }
            i
        }

        fn write_all(&mut self, buf: &[u8]) {
            self.outbound.extend(buf.iter().copied());
        }
    }
}
