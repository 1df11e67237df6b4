// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Endpoint 0: control transfers.
//!
//! Every control transfer starts with the host sending an 8-byte SETUP
//! packet. Depending on what's in it, there's then an optional data stage
//! (we only do IN data stages, i.e. replies) and a status stage, which is a
//! zero-length packet in the opposite direction to the data.
//!
//! Replies can be longer than a packet. We put the whole reply in a response
//! buffer, queue the first two packets straight away (one in each of the
//! ping-pong TX slots), and keep a cursor for the rest, which goes out one
//! packet per completed IN token. If the reply is shorter than the host asked
//! for and ends exactly on a packet boundary, the host can't tell it's over,
//! so we owe it a zero-length packet at the end; the cursor tracks that too.
//!
//! `SET_ADDRESS` is the weird one. We have to finish the transfer at our old
//! address, so the new address is parked until the status stage IN
//! completes.

use log::{debug, error, warn};

use super::bdt::{DataToggle, Direction, Parity, PingPong, Pid, MAX_PACKET};
use super::descriptors::{self, DescriptorEntry};
use super::setup::{RequestKind, SetupPacket, StandardRequest, UsbDir};
use super::{arm_rx, endpoint, EndpointHandler, EndpointIo, PacketBuffers, Token};

/// Largest reply we'll buffer. Longer replies are cut short.
pub const RESPONSE_CAPACITY: usize = 256;

/// Packet buffers for endpoint 0.
pub struct ControlBuffers {
    pub rx: PacketBuffers,
    pub tx: PacketBuffers,
}

impl ControlBuffers {
    pub const fn new() -> Self {
        Self {
            rx: PacketBuffers::new(),
            tx: PacketBuffers::new(),
        }
    }
}

impl Default for ControlBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// The part of a reply that hasn't been queued yet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PendingTx {
    /// Where the next packet starts in the response buffer.
    pub offset: usize,
    pub remaining: usize,
    /// A zero-length packet still has to follow the data.
    pub zlp: bool,
}

/// What to do about a vendor request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VendorResponse {
    /// Send this many bytes of the response buffer back (IN requests only).
    Data(usize),
    /// Complete the transfer without data.
    Ack,
    /// Refuse.
    Stall,
}

/// Handles requests with the vendor bit set in `request_type`.
pub trait VendorRequests {
    /// `response` is where the reply to an IN request goes.
    fn vendor_request(&mut self, setup: &SetupPacket, response: &mut [u8]) -> VendorResponse;
}

enum Reply {
    Send(usize),
    Stall,
}

/// The endpoint 0 handler.
pub struct Control<'a> {
    buffers: &'a ControlBuffers,
    descriptors: &'a [DescriptorEntry],
    vendor: Option<&'a mut dyn VendorRequests>,
    response: [u8; RESPONSE_CAPACITY],
    pending: Option<PendingTx>,
    pending_address: Option<u8>,
    configuration: u8,
    /// Next TX slot and toggle we'll use.
    tx: PingPong,
    /// TX slot the controller will use next. Differs from `tx.parity` when
    /// the host stops reading a reply early.
    hw_tx_parity: Parity,
}

impl<'a> Control<'a> {
    pub fn new(buffers: &'a ControlBuffers, descriptors: &'a [DescriptorEntry]) -> Self {
        Self {
            buffers,
            descriptors,
            vendor: None,
            response: [0; RESPONSE_CAPACITY],
            pending: None,
            pending_address: None,
            configuration: 0,
            tx: PingPong::new(DataToggle::Data1),
            hw_tx_parity: Parity::Even,
        }
    }

    pub fn with_vendor(mut self, vendor: &'a mut dyn VendorRequests) -> Self {
        self.vendor = Some(vendor);
        self
    }

    /// Value from the last `SET_CONFIGURATION`; 0 if unconfigured.
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn pending(&self) -> Option<PendingTx> {
        self.pending
    }

    pub fn pending_address(&self) -> Option<u8> {
        self.pending_address
    }

    fn setup(&mut self, io: &mut EndpointIo<'_>, parity: Parity) {
        let slot = io.slot(Direction::Rx, parity);
        let mut raw = [0; 8];
        let setup = slot
            .read_into(&mut raw)
            .and_then(|n| SetupPacket::parse(&raw[..n]));
        slot.rearm(MAX_PACKET, DataToggle::Data1);

        // Whatever we were still sending belongs to a transfer the host has
        // given up on.
        io.slot(Direction::Tx, Parity::Even).disarm();
        io.slot(Direction::Tx, Parity::Odd).disarm();
        self.tx = PingPong {
            parity: self.hw_tx_parity,
            toggle: DataToggle::Data1,
        };
        self.pending = None;
        self.pending_address = None;
        io.set_control(endpoint::CONTROL);

        let setup = match setup {
            Some(setup) => setup,
            None => {
                error!("ep0: SETUP slot unreadable");
                self.stall(io);
                return;
            }
        };
        debug!(
            "ep0: setup {:02x} {:02x} to {:?} value={:04x} index={:04x} length={}",
            setup.request_type,
            setup.request,
            setup.recipient(),
            setup.value.get(),
            setup.index.get(),
            setup.length.get()
        );

        let reply = match setup.kind() {
            RequestKind::Vendor => self.vendor_request(&setup),
            _ => self.standard_request(&setup),
        };
        match reply {
            Reply::Send(len) => self.start_reply(io, len, usize::from(setup.length.get())),
            Reply::Stall => self.stall(io),
        }
    }

    fn standard_request(&mut self, setup: &SetupPacket) -> Reply {
        match (setup.direction(), setup.standard_request()) {
            (UsbDir::Out, Some(StandardRequest::SetAddress)) => {
                // Takes effect once the status stage is done, see
                // `in_complete`.
                self.pending_address = Some((setup.value.get() & 0x7F) as u8);
                Reply::Send(0)
            }
            (UsbDir::Out, Some(StandardRequest::SetConfiguration)) => {
                self.configuration = setup.value.get() as u8;
                debug!("ep0: configuration {}", self.configuration);
                Reply::Send(0)
            }
            (UsbDir::In, Some(StandardRequest::GetDescriptor)) => {
                let (value, index) = (setup.value.get(), setup.index.get());
                match descriptors::find(self.descriptors, value, index) {
                    Some(bytes) => {
                        let len = bytes.len().min(RESPONSE_CAPACITY);
                        self.response[..len].copy_from_slice(&bytes[..len]);
                        Reply::Send(len)
                    }
                    None => {
                        debug!("ep0: no descriptor {:04x}/{:04x}", value, index);
                        Reply::Stall
                    }
                }
            }
            (UsbDir::In, Some(StandardRequest::GetStatus)) => {
                // Bus powered, no remote wakeup, no halted endpoints.
                self.response[..2].fill(0);
                Reply::Send(2)
            }
            (UsbDir::In, Some(StandardRequest::GetConfiguration)) => {
                self.response[0] = self.configuration;
                Reply::Send(1)
            }
            (_, request) => {
                debug!("ep0: unsupported request {:02x} ({:?})", setup.request, request);
                Reply::Stall
            }
        }
    }

    fn vendor_request(&mut self, setup: &SetupPacket) -> Reply {
        let vendor = match self.vendor.as_deref_mut() {
            Some(vendor) => vendor,
            None => {
                warn!("ep0: vendor request {:02x} with no handler", setup.request);
                return Reply::Stall;
            }
        };
        match vendor.vendor_request(setup, &mut self.response) {
            VendorResponse::Data(len) if setup.direction() == UsbDir::In => {
                Reply::Send(len.min(RESPONSE_CAPACITY))
            }
            VendorResponse::Data(_) | VendorResponse::Ack => Reply::Send(0),
            VendorResponse::Stall => Reply::Stall,
        }
    }

    /// Starts sending the first `len` bytes of the response buffer, for a
    /// request that allowed `requested`.
    fn start_reply(&mut self, io: &mut EndpointIo<'_>, len: usize, requested: usize) {
        let len = len.min(requested);
        // An empty reply is still one (empty) packet: that's the status stage
        // of an OUT request.
        let zlp = len % MAX_PACKET == 0 && (len < requested || len == 0);
        self.pending = Some(PendingTx {
            offset: 0,
            remaining: len,
            zlp,
        });
        // Both TX slots are free after a SETUP.
        for _ in 0..2 {
            if !self.send_next(io) {
                break;
            }
        }
    }

    /// Queues the next packet of the pending reply, if there is one.
    fn send_next(&mut self, io: &mut EndpointIo<'_>) -> bool {
        let mut pending = match self.pending {
            Some(pending) => pending,
            None => return false,
        };
        let size = pending.remaining.min(MAX_PACKET);
        if !self.transmit(io, pending.offset, size) {
            return false;
        }
        if size == 0 {
            pending.zlp = false;
        }
        pending.offset += size;
        pending.remaining -= size;
        self.pending = if pending.remaining == 0 && !pending.zlp {
            None
        } else {
            Some(pending)
        };
        true
    }

    fn transmit(&mut self, io: &mut EndpointIo<'_>, offset: usize, size: usize) -> bool {
        let slot = io.slot(Direction::Tx, self.tx.parity);
        if slot.owned_by_controller() {
            error!("ep0: TX slot {:?} still busy", self.tx.parity);
            return false;
        }
        let (parity, toggle) = self.tx.next();
        let buffer = self.buffers.tx.get(parity);
        let data = &self.response[offset..offset + size];
        // Safety: the slot is ours, so the controller isn't reading from the
        // buffer, and it's only handed back once the copy is done.
        unsafe {
            buffer.copy_from_nonoverlapping(data.as_ptr(), size);
            slot.release(buffer, size, toggle);
        }
        true
    }

    fn in_complete(&mut self, io: &mut EndpointIo<'_>, parity: Parity) {
        self.hw_tx_parity = parity.flip();
        self.send_next(io);
        if let Some(address) = self.pending_address.take() {
            debug!("ep0: address {} -> {}", io.controller.address(), address);
            io.controller.set_address(address);
        }
    }

    fn stall(&mut self, io: &mut EndpointIo<'_>) {
        debug!("ep0: stall");
        io.set_control(endpoint::CONTROL | endpoint::STALL);
    }
}

impl EndpointHandler for Control<'_> {
    fn reset(&mut self, io: &mut EndpointIo<'_>) {
        arm_rx(io, &self.buffers.rx, DataToggle::Data0, DataToggle::Data0);
        io.slot(Direction::Tx, Parity::Even).disarm();
        io.slot(Direction::Tx, Parity::Odd).disarm();
        io.set_control(endpoint::CONTROL);

        self.pending = None;
        self.pending_address = None;
        self.configuration = 0;
        self.tx = PingPong::new(DataToggle::Data1);
        self.hw_tx_parity = Parity::Even;
    }

    fn token_done(&mut self, io: &mut EndpointIo<'_>, token: Token) {
        let slot = io.slot(token.direction, token.parity);
        match slot.token() {
            Some(Pid::Setup) => self.setup(io, token.parity),
            Some(Pid::In) => self.in_complete(io, token.parity),
            // Status stage of a reply. Nothing in it, just give the buffer
            // back.
            Some(Pid::Out) => slot.rearm(MAX_PACKET, DataToggle::Data1),
            pid => warn!("ep0: unhandled token {:?}", pid),
        }
        io.controller.resume_tokens();
    }
}
