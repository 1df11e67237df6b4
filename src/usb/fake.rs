// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A pretend USB controller, with a pretend host attached.
//!
//! The register half is just fields. The other half plays the controller's
//! side of the BDT: it only ever uses a slot the firmware has given it, it
//! alternates even/odd per endpoint and direction on its own, and when it
//! completes a transfer it writes back the byte count and PID, clears OWN,
//! and raises TOKDNE with STAT pointing at the slot. Like the real thing, it
//! doesn't care what the firmware thinks the parity is.

use super::bdt::{BufferDescriptorTable, DataToggle, Direction, Parity, Pid, DATA1};
use super::{endpoint, interrupt, Controller};

pub struct FakeController {
    pub bdt: &'static BufferDescriptorTable,
    pub istat: u8,
    pub errstat: u8,
    pub stat: u8,
    pub address: u8,
    pub endpt: [u8; 16],
    pub inten: u8,
    pub erren: u8,
    pub odd_resets: usize,
    pub resumes: usize,
    rx_odd: [bool; 16],
    tx_odd: [bool; 16],
}

/// A packet that went over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub toggle: DataToggle,
    pub parity: Parity,
}

impl FakeController {
    pub fn new() -> Self {
        Self {
            bdt: Box::leak(Box::new(BufferDescriptorTable::new())),
            istat: 0,
            errstat: 0,
            stat: 0,
            address: 0,
            endpt: [0; 16],
            inten: 0,
            erren: 0,
            odd_resets: 0,
            resumes: 0,
            rx_odd: [false; 16],
            tx_odd: [false; 16],
        }
    }

    pub fn bus_reset(&mut self) {
        self.istat |= interrupt::USBRST;
    }

    pub fn stalled(&self, ep: u8) -> bool {
        self.endpt[usize::from(ep)] & endpoint::STALL != 0
    }

    /// The host sends a SETUP. Panics if the firmware left nowhere to put it,
    /// since a real device would have dropped off the bus.
    pub fn setup(&mut self, ep: u8, packet: [u8; 8]) -> Parity {
        let parity = self.next(ep, Direction::Rx);
        let slot = self.bdt.slot(ep, Direction::Rx, parity);
        assert!(slot.owned_by_controller(), "SETUP with no receive slot armed");
        assert!(slot.byte_count() >= 8);
        unsafe { slot.buffer().copy_from_nonoverlapping(packet.as_ptr(), 8) };
        self.complete(ep, Direction::Rx, parity, 8, Pid::Setup);
        parity
    }

    /// The host sends `data` in an OUT. `None` if the device NAKed or
    /// stalled.
    pub fn out(&mut self, ep: u8, data: &[u8]) -> Option<Packet> {
        if self.stalled(ep) {
            return None;
        }
        let parity = self.peek(ep, Direction::Rx);
        let slot = self.bdt.slot(ep, Direction::Rx, parity);
        if !slot.owned_by_controller() {
            return None;
        }
        assert!(data.len() <= slot.byte_count(), "babble");
        let toggle = slot.toggle();
        unsafe { slot.buffer().copy_from_nonoverlapping(data.as_ptr(), data.len()) };
        self.next(ep, Direction::Rx);
        self.complete(ep, Direction::Rx, parity, data.len(), Pid::Out);
        Some(Packet { data: data.to_vec(), toggle, parity })
    }

    /// The host asks for an IN. `None` if the device NAKed or stalled.
    pub fn take_in(&mut self, ep: u8) -> Option<Packet> {
        if self.stalled(ep) {
            return None;
        }
        let parity = self.peek(ep, Direction::Tx);
        let slot = self.bdt.slot(ep, Direction::Tx, parity);
        if !slot.owned_by_controller() {
            return None;
        }
        let len = slot.byte_count();
        let toggle = slot.toggle();
        let mut data = vec![0; len];
        if len > 0 {
            unsafe { data.as_mut_ptr().copy_from_nonoverlapping(slot.buffer(), len) };
        }
        self.next(ep, Direction::Tx);
        self.complete(ep, Direction::Tx, parity, len, Pid::In);
        Some(Packet { data, toggle, parity })
    }

    fn odd_flag(&mut self, ep: u8, direction: Direction) -> &mut bool {
        match direction {
            Direction::Rx => &mut self.rx_odd[usize::from(ep)],
            Direction::Tx => &mut self.tx_odd[usize::from(ep)],
        }
    }

    fn peek(&mut self, ep: u8, direction: Direction) -> Parity {
        Parity::from_bit(*self.odd_flag(ep, direction))
    }

    fn next(&mut self, ep: u8, direction: Direction) -> Parity {
        let flag = self.odd_flag(ep, direction);
        let parity = Parity::from_bit(*flag);
        *flag = !*flag;
        parity
    }

    fn complete(&mut self, ep: u8, direction: Direction, parity: Parity, len: usize, pid: Pid) {
        let slot = self.bdt.slot(ep, direction, parity);
        let word = ((len as u32) << 16) | (slot.word() & DATA1) | ((pid as u32) << 2);
        slot.complete(word);
        assert_eq!(self.istat & interrupt::TOKDNE, 0, "previous token not handled");
        self.stat = (ep << 4) | ((direction as u8) << 3) | ((parity as u8) << 2);
        self.istat |= interrupt::TOKDNE;
    }
}

impl Controller for FakeController {
    fn interrupt_status(&self) -> u8 {
        self.istat
    }

    fn clear_interrupts(&mut self, bits: u8) {
        self.istat &= !bits;
    }

    fn error_status(&self) -> u8 {
        self.errstat
    }

    fn clear_errors(&mut self, bits: u8) {
        self.errstat &= !bits;
    }

    fn token_status(&self) -> u8 {
        self.stat
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn set_address(&mut self, address: u8) {
        self.address = address;
    }

    fn set_endpoint_control(&mut self, endpoint: u8, bits: u8) {
        self.endpt[usize::from(endpoint)] = bits;
    }

    fn reset_odd(&mut self) {
        self.rx_odd = [false; 16];
        self.tx_odd = [false; 16];
        self.odd_resets += 1;
    }

    fn resume_tokens(&mut self) {
        self.resumes += 1;
    }

    fn enable_interrupts(&mut self, interrupts: u8, errors: u8) {
        self.inten = interrupts;
        self.erren = errors;
    }
}
