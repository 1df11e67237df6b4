// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bulk endpoints.
//!
//! The host tools drive the pod entirely through vendor requests on endpoint
//! 0, but the interface advertises a bulk pair, and the host is free to use
//! them. Packets arriving on the OUT endpoint are counted and the buffer goes
//! straight back to the controller; the IN endpoint is enabled but has
//! nothing to say.

use log::{trace, warn};

use super::bdt::{DataToggle, Direction, Parity, Pid, MAX_PACKET};
use super::{arm_rx, endpoint, EndpointHandler, EndpointIo, PacketBuffers, Token};

/// Receiver for a bulk OUT endpoint.
///
/// The even slot always takes DATA0 and the odd slot DATA1: the controller
/// alternates slots and the host alternates toggles, one step per packet, so
/// the pairing holds as long as neither side drops one.
pub struct BulkOut<'a> {
    buffers: &'a PacketBuffers,
    packets: usize,
    bytes: usize,
}

impl<'a> BulkOut<'a> {
    pub fn new(buffers: &'a PacketBuffers) -> Self {
        Self { buffers, packets: 0, bytes: 0 }
    }

    /// Packets received since the last bus reset.
    pub fn packets(&self) -> usize {
        self.packets
    }

    /// Bytes received since the last bus reset.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    const fn toggle_for(parity: Parity) -> DataToggle {
        match parity {
            Parity::Even => DataToggle::Data0,
            Parity::Odd => DataToggle::Data1,
        }
    }
}

impl EndpointHandler for BulkOut<'_> {
    fn reset(&mut self, io: &mut EndpointIo<'_>) {
        arm_rx(
            io,
            self.buffers,
            Self::toggle_for(Parity::Even),
            Self::toggle_for(Parity::Odd),
        );
        io.set_control(endpoint::RXEN | endpoint::HSHK);
        self.packets = 0;
        self.bytes = 0;
    }

    fn token_done(&mut self, io: &mut EndpointIo<'_>, token: Token) {
        let slot = io.slot(token.direction, token.parity);
        match slot.token() {
            Some(Pid::Out) => {
                let len = slot.byte_count();
                trace!("ep{}: {} bytes", io.number, len);
                self.packets += 1;
                self.bytes += len;
                slot.rearm(MAX_PACKET, Self::toggle_for(token.parity));
            }
            pid => warn!("ep{}: unhandled token {:?}", io.number, pid),
        }
        io.controller.resume_tokens();
    }
}

/// A bulk IN endpoint with nothing to send. Both TX slots stay with the CPU,
/// so the controller NAKs every IN.
#[derive(Default)]
pub struct BulkIn;

impl EndpointHandler for BulkIn {
    fn reset(&mut self, io: &mut EndpointIo<'_>) {
        io.slot(Direction::Tx, Parity::Even).disarm();
        io.slot(Direction::Tx, Parity::Odd).disarm();
        io.set_control(endpoint::TXEN | endpoint::HSHK);
    }

    fn token_done(&mut self, io: &mut EndpointIo<'_>, token: Token) {
        warn!("ep{}: unexpected token {:?}", io.number, token);
        io.controller.resume_tokens();
    }
}
