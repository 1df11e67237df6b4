// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the Kinetis USB-FS function controller.
//!
//! The controller reports everything through one status register, ISTAT.
//! [`UsbDevice::handle_interrupt`] reads it once and deals with whatever bits
//! are set, in a fixed order, acknowledging each (the bits are
//! write-one-to-clear). The interesting one is TOKDNE, "token done", which
//! means a transfer finished on some endpoint; the STAT register says which
//! endpoint, direction and BDT slot, and we pass that on to whichever
//! [`EndpointHandler`] was registered for the endpoint.
//!
//! The register block itself is hidden behind the [`Controller`] trait, both
//! so this can be tested off-target and because the firmware binary is the
//! only thing that knows where the registers live.

use core::cell::UnsafeCell;

use log::{debug, trace, warn};

pub mod bdt;
pub mod bulk;
pub mod control;
pub mod descriptors;
pub mod setup;

#[cfg(test)]
mod fake;

use bdt::{BufferDescriptor, BufferDescriptorTable, Direction, Parity, ENDPOINTS, MAX_PACKET};

/// ISTAT/INTEN bits.
pub mod interrupt {
    pub const USBRST: u8 = 0x01;
    pub const ERROR: u8 = 0x02;
    pub const SOFTOK: u8 = 0x04;
    pub const TOKDNE: u8 = 0x08;
    pub const SLEEP: u8 = 0x10;
    pub const RESUME: u8 = 0x20;
    pub const ATTACH: u8 = 0x40;
    pub const STALL: u8 = 0x80;

    /// Everything we want to hear about once we're on the bus.
    pub const ENABLED: u8 = USBRST | ERROR | SOFTOK | TOKDNE | SLEEP | STALL;
}

/// ENDPTn bits.
pub mod endpoint {
    pub const HSHK: u8 = 0x01;
    pub const STALL: u8 = 0x02;
    pub const TXEN: u8 = 0x04;
    pub const RXEN: u8 = 0x08;

    /// A control endpoint: both directions, with handshaking.
    pub const CONTROL: u8 = RXEN | TXEN | HSHK;
}

/// Access to the controller's registers.
pub trait Controller {
    /// ISTAT.
    fn interrupt_status(&self) -> u8;
    /// Writes `bits` to ISTAT, acknowledging them.
    fn clear_interrupts(&mut self, bits: u8);
    /// ERRSTAT.
    fn error_status(&self) -> u8;
    fn clear_errors(&mut self, bits: u8);
    /// STAT, describing the most recent completed token. Only valid while
    /// TOKDNE is set.
    fn token_status(&self) -> u8;
    fn address(&self) -> u8;
    fn set_address(&mut self, address: u8);
    /// Writes ENDPTn.
    fn set_endpoint_control(&mut self, endpoint: u8, bits: u8);
    /// Resets the controller's odd/even slot pointers so every endpoint
    /// starts over on its even slots.
    fn reset_odd(&mut self);
    /// The controller stops processing tokens after a SETUP until we say
    /// otherwise (TXSUSPENDTOKENBUSY in CTL). This says otherwise.
    fn resume_tokens(&mut self);
    /// Writes INTEN and ERREN.
    fn enable_interrupts(&mut self, interrupts: u8, errors: u8);
}

/// A completed transfer, decoded from STAT.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub endpoint: u8,
    pub direction: Direction,
    pub parity: Parity,
}

impl Token {
    pub const fn from_stat(stat: u8) -> Self {
        Self {
            endpoint: stat >> 4,
            direction: if stat & 0x08 != 0 { Direction::Tx } else { Direction::Rx },
            parity: Parity::from_bit(stat & 0x04 != 0),
        }
    }
}

/// What an endpoint handler gets to work with: its own slots in the BDT and
/// the controller registers.
pub struct EndpointIo<'b> {
    pub number: u8,
    pub bdt: &'b BufferDescriptorTable,
    pub controller: &'b mut dyn Controller,
}

impl<'b> EndpointIo<'b> {
    pub fn slot(&self, direction: Direction, parity: Parity) -> &'b BufferDescriptor {
        self.bdt.slot(self.number, direction, parity)
    }

    pub fn set_control(&mut self, bits: u8) {
        self.controller.set_endpoint_control(self.number, bits);
    }
}

/// Something that runs an endpoint.
pub trait EndpointHandler {
    /// Called on bus reset, after the controller's odd/even pointers have
    /// been reset. Should put the endpoint's slots and control register into
    /// their initial state.
    fn reset(&mut self, _io: &mut EndpointIo<'_>) {}

    /// Called when a transfer completes on this endpoint.
    fn token_done(&mut self, io: &mut EndpointIo<'_>, token: Token);
}

/// A pair of packet buffers, one per parity, for the controller to DMA to or
/// from.
pub struct PacketBuffers {
    buffers: [UnsafeCell<[u8; MAX_PACKET]>; 2],
}

// Safety: the buffers are only reached through raw pointers, handed to the
// controller via the BDT, and touched by the CPU only while the corresponding
// slot is ours.
unsafe impl Sync for PacketBuffers {}

impl PacketBuffers {
    pub const fn new() -> Self {
        Self {
            buffers: [UnsafeCell::new([0; MAX_PACKET]), UnsafeCell::new([0; MAX_PACKET])],
        }
    }

    pub fn get(&self, parity: Parity) -> *mut u8 {
        self.buffers[parity as usize].get() as *mut u8
    }
}

impl Default for PacketBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive slots for `io`'s endpoint, both armed for a full packet.
///
/// Shared by handlers that want to hear from the host as soon as the bus
/// comes up.
pub(crate) fn arm_rx(io: &EndpointIo<'_>, buffers: &PacketBuffers, even: bdt::DataToggle, odd: bdt::DataToggle) {
    // Safety: `buffers` is dedicated to this endpoint's receive side, and
    // the CPU only reads it through the slot once the controller gives it
    // back.
    unsafe {
        io.slot(Direction::Rx, Parity::Even)
            .release(buffers.get(Parity::Even), MAX_PACKET, even);
        io.slot(Direction::Rx, Parity::Odd)
            .release(buffers.get(Parity::Odd), MAX_PACKET, odd);
    }
}

/// The device: the controller, the BDT it uses, and a handler for every
/// endpoint we care about.
pub struct UsbDevice<'a, C> {
    controller: C,
    bdt: &'a BufferDescriptorTable,
    handlers: [Option<&'a mut dyn EndpointHandler>; ENDPOINTS],
}

impl<'a, C: Controller> UsbDevice<'a, C> {
    pub fn new(controller: C, bdt: &'a BufferDescriptorTable) -> Self {
        Self {
            controller,
            bdt,
            handlers: Default::default(),
        }
    }

    /// Registers `handler` for endpoint `number`. Anything already there is
    /// replaced.
    pub fn with_handler(mut self, number: u8, handler: &'a mut dyn EndpointHandler) -> Self {
        self.handlers[usize::from(number) % ENDPOINTS] = Some(handler);
        self
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    pub fn bdt(&self) -> &'a BufferDescriptorTable {
        self.bdt
    }

    /// Gives the controller back, letting go of the handlers.
    pub fn into_controller(self) -> C {
        self.controller
    }

    /// Deals with everything the controller is currently flagging.
    pub fn handle_interrupt(&mut self) {
        let status = self.controller.interrupt_status();

        if status & interrupt::USBRST != 0 {
            self.bus_reset();
            // Nothing else that was pending means anything any more.
            return;
        }

        if status & interrupt::ERROR != 0 {
            let errors = self.controller.error_status();
            warn!("usb: error status {:02x}", errors);
            self.controller.clear_errors(errors);
            self.controller.clear_interrupts(interrupt::ERROR);
        }

        if status & interrupt::SOFTOK != 0 {
            self.controller.clear_interrupts(interrupt::SOFTOK);
        }

        if status & interrupt::TOKDNE != 0 {
            // STAT is only valid until TOKDNE is acknowledged, at which point
            // the controller moves on to the next queued token.
            let token = Token::from_stat(self.controller.token_status());
            trace!("usb: token {:?}", token);
            let mut io = EndpointIo {
                number: token.endpoint,
                bdt: self.bdt,
                controller: &mut self.controller,
            };
            match self.handlers[usize::from(token.endpoint)].as_mut() {
                Some(handler) => handler.token_done(&mut io, token),
                None => unexpected_token(&mut io, token),
            }
            self.controller.clear_interrupts(interrupt::TOKDNE);
        }

        if status & interrupt::SLEEP != 0 {
            debug!("usb: sleep");
            self.controller.clear_interrupts(interrupt::SLEEP);
        }

        if status & interrupt::STALL != 0 {
            debug!("usb: stall");
            self.controller.clear_interrupts(interrupt::STALL);
        }
    }

    fn bus_reset(&mut self) {
        debug!("usb: bus reset");
        self.controller.reset_odd();

        for (number, handler) in self.handlers.iter_mut().enumerate() {
            if let Some(handler) = handler {
                let mut io = EndpointIo {
                    number: number as u8,
                    bdt: self.bdt,
                    controller: &mut self.controller,
                };
                handler.reset(&mut io);
            }
        }

        self.controller.clear_errors(0xFF);
        self.controller.clear_interrupts(0xFF);
        self.controller.set_address(0);
        self.controller.enable_interrupts(interrupt::ENABLED, 0xFF);
    }
}

/// What happens to tokens on endpoints nobody registered for.
fn unexpected_token(io: &mut EndpointIo<'_>, token: Token) {
    let pid = io.slot(token.direction, token.parity).token();
    warn!("usb: unexpected token {:?} ({:?})", token, pid);
    io.controller.resume_tokens();
}
