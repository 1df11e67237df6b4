// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The buffer descriptor table.
//!
//! The Kinetis USB-FS controller doesn't have its own packet memory. Instead,
//! it DMAs into and out of ordinary RAM, and finds out where by reading a
//! table of *buffer descriptors* (BDs) that we put somewhere in RAM and tell
//! it about. The table has four slots per endpoint: receive and transmit, and
//! an even and odd slot for each of those. The odd/even thing lets us prepare
//! one packet while the controller is busy with the other ("ping-pong"
//! buffering); the controller alternates between the two on its own, and we
//! have to keep track of which one it's going to use next.
//!
//! Each slot is two words. The first is the control word:
//!
//! ```text
//!  31..26    25..16    7    6      5     4     3    2     1..0
//!  -----  byte count  OWN DATA1  KEEP  NINC  DTS STALL  -----
//!                                \___ TOK_PID (5..2) ___/
//! ```
//!
//! and the second is the buffer address. When `OWN` is set, the slot belongs
//! to the controller and we must not touch it or the buffer it points to.
//! When the controller finishes with it, it writes back the byte count and
//! the PID of the token that used it (in the bits that used to hold the
//! KEEP/NINC/DTS/STALL options) and clears `OWN`.
//!
//! Handing a slot to the controller is the one place in this firmware where
//! memory ordering matters. The address and the rest of the control word
//! must be visible before `OWN` is, so `OWN` is set by the last write, behind
//! a fence. That's handled here, and nothing else in the firmware writes the
//! table directly.

use core::sync::atomic::{fence, Ordering};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use vcell::VolatileCell;

/// Endpoints supported by the controller, including endpoint 0.
pub const ENDPOINTS: usize = 16;

/// Largest packet we ever hand to the controller.
pub const MAX_PACKET: usize = 64;

/// Slot is owned by the controller.
pub const OWN: u32 = 0x80;
/// Send or expect DATA1 rather than DATA0.
pub const DATA1: u32 = 0x40;
/// Controller keeps ownership after the transfer. Only useful for FIFOs.
pub const KEEP: u32 = 0x20;
/// Don't increment the DMA address. Also only useful for FIFOs.
pub const NINC: u32 = 0x10;
/// Have the controller check data toggles for us.
pub const DTS: u32 = 0x08;
/// Answer tokens on this slot with STALL.
pub const STALL: u32 = 0x04;

const BYTE_COUNT_SHIFT: u32 = 16;
const BYTE_COUNT_MASK: u32 = 0x3FF;

/// Token PIDs the controller writes back into a completed slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Pid {
    Out = 0x1,
    Data0 = 0x3,
    In = 0x9,
    Nak = 0xA,
    Data1 = 0xB,
    Setup = 0xD,
    Stall = 0xE,
    DataError = 0xF,
}

/// Which half of an endpoint a slot belongs to, from the controller's point
/// of view: `Rx` is host-to-device (OUT and SETUP), `Tx` is device-to-host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Rx = 0,
    Tx = 1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Parity {
    Even = 0,
    Odd = 1,
}

impl Parity {
    pub const fn flip(self) -> Self {
        match self {
            Parity::Even => Parity::Odd,
            Parity::Odd => Parity::Even,
        }
    }

    pub const fn from_bit(odd: bool) -> Self {
        if odd {
            Parity::Odd
        } else {
            Parity::Even
        }
    }
}

/// The USB data toggle, DATA0 or DATA1.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataToggle {
    Data0,
    Data1,
}

impl DataToggle {
    pub const fn flip(self) -> Self {
        match self {
            DataToggle::Data0 => DataToggle::Data1,
            DataToggle::Data1 => DataToggle::Data0,
        }
    }

    const fn bits(self) -> u32 {
        match self {
            DataToggle::Data0 => 0,
            DataToggle::Data1 => DATA1,
        }
    }
}

/// Tracks the next slot and toggle for one direction of one endpoint.
///
/// The controller uses the even slot first after a reset of its odd/even
/// pointers, then strictly alternates, so a transmitter that hands out slots
/// in order and flips both bits every time stays in step with it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PingPong {
    pub parity: Parity,
    pub toggle: DataToggle,
}

impl PingPong {
    pub const fn new(toggle: DataToggle) -> Self {
        Self { parity: Parity::Even, toggle }
    }

    /// Returns the slot and toggle to use for the next packet, and moves on.
    pub fn next(&mut self) -> (Parity, DataToggle) {
        let current = (self.parity, self.toggle);
        self.parity = self.parity.flip();
        self.toggle = self.toggle.flip();
        current
    }
}

/// One slot in the table.
#[repr(C)]
pub struct BufferDescriptor {
    desc: VolatileCell<u32>,
    addr: VolatileCell<*mut u8>,
}

impl BufferDescriptor {
    const EMPTY: Self = Self {
        desc: VolatileCell::new(0),
        addr: VolatileCell::new(core::ptr::null_mut()),
    };

    /// The raw control word.
    pub fn word(&self) -> u32 {
        self.desc.get()
    }

    pub fn owned_by_controller(&self) -> bool {
        self.desc.get() & OWN != 0
    }

    /// Bytes moved by the last transfer (or, while the controller owns the
    /// slot, the size of the buffer).
    pub fn byte_count(&self) -> usize {
        ((self.desc.get() >> BYTE_COUNT_SHIFT) & BYTE_COUNT_MASK) as usize
    }

    pub fn toggle(&self) -> DataToggle {
        if self.desc.get() & DATA1 != 0 {
            DataToggle::Data1
        } else {
            DataToggle::Data0
        }
    }

    /// PID of the token that completed on this slot. Meaningless while the
    /// controller owns it.
    pub fn token(&self) -> Option<Pid> {
        Pid::from_u32((self.desc.get() >> 2) & 0xF)
    }

    pub fn buffer(&self) -> *mut u8 {
        self.addr.get()
    }

    /// Points the slot at `buffer` and gives it to the controller, to send or
    /// receive `count` bytes with `toggle`.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for `count` bytes of reads and writes, and
    /// nothing may touch those bytes until the slot comes back from the
    /// controller.
    pub unsafe fn release(&self, buffer: *mut u8, count: usize, toggle: DataToggle) {
        self.addr.set(buffer);
        self.give(count, toggle);
    }

    /// Gives the slot back to the controller with the buffer it already had,
    /// e.g. to receive the next packet into the same place.
    pub fn rearm(&self, count: usize, toggle: DataToggle) {
        self.give(count, toggle);
    }

    fn give(&self, count: usize, toggle: DataToggle) {
        let count = (count as u32).min(BYTE_COUNT_MASK);
        // The address (and whatever the caller put in the buffer) has to land
        // before the controller can see OWN.
        fence(Ordering::Release);
        self.desc
            .set((count << BYTE_COUNT_SHIFT) | OWN | DTS | toggle.bits());
    }

    /// Takes the slot back, whether or not the controller was done with it.
    /// Only safe to do with the endpoint's transmitter stopped, which is how
    /// the controller leaves things after a SETUP.
    pub fn disarm(&self) {
        self.desc.set(0);
    }

    /// What the controller does when it's finished with the slot.
    #[cfg(test)]
    pub(crate) fn complete(&self, word: u32) {
        self.desc.set(word);
    }

    /// Copies the data from the last transfer into `out`, returning how much
    /// was copied. Refuses (with `None`) while the controller owns the slot.
    pub fn read_into(&self, out: &mut [u8]) -> Option<usize> {
        if self.owned_by_controller() {
            return None;
        }
        fence(Ordering::Acquire);
        let buffer = self.addr.get();
        if buffer.is_null() {
            return None;
        }
        let len = self.byte_count().min(out.len());
        // Safety: the slot is ours (OWN is clear), so the controller is done
        // with the buffer, and `release` required it to be valid for at least
        // the byte count it was handed.
        unsafe {
            core::ptr::copy_nonoverlapping(buffer as *const u8, out.as_mut_ptr(), len);
        }
        Some(len)
    }
}

/// The whole table. The controller wants it aligned to 512 bytes, because it
/// forms slot addresses by splicing bits into the page registers.
#[repr(C, align(512))]
pub struct BufferDescriptorTable {
    slots: [BufferDescriptor; ENDPOINTS * 4],
}

// Safety: the table is only touched by one execution context plus the
// controller, and every access is volatile.
unsafe impl Sync for BufferDescriptorTable {}

impl BufferDescriptorTable {
    pub const fn new() -> Self {
        Self {
            slots: [BufferDescriptor::EMPTY; ENDPOINTS * 4],
        }
    }

    pub const fn index(endpoint: u8, direction: Direction, parity: Parity) -> usize {
        (endpoint as usize & 0xF) * 4 + direction as usize * 2 + parity as usize
    }

    pub fn slot(&self, endpoint: u8, direction: Direction, parity: Parity) -> &BufferDescriptor {
        &self.slots[Self::index(endpoint, direction, parity)]
    }

    /// Returns every slot to the CPU and forgets its buffer.
    pub fn clear(&self) {
        for slot in &self.slots {
            slot.desc.set(0);
            slot.addr.set(core::ptr::null_mut());
        }
    }
}

impl Default for BufferDescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_index_follows_controller_layout() {
        assert_eq!(BufferDescriptorTable::index(0, Direction::Rx, Parity::Even), 0);
        assert_eq!(BufferDescriptorTable::index(0, Direction::Tx, Parity::Odd), 3);
        assert_eq!(BufferDescriptorTable::index(2, Direction::Rx, Parity::Odd), 9);
        assert_eq!(BufferDescriptorTable::index(15, Direction::Tx, Parity::Odd), 63);
    }

    #[test]
    fn table_is_aligned_for_the_controller() {
        let table = Box::new(BufferDescriptorTable::new());
        assert_eq!(&*table as *const _ as usize % 512, 0);
    }

    #[test]
    fn release_builds_control_word() {
        let table = BufferDescriptorTable::new();
        let mut buffer = [0u8; 64];
        let slot = table.slot(1, Direction::Tx, Parity::Odd);

        unsafe { slot.release(buffer.as_mut_ptr(), 18, DataToggle::Data1) };

        assert_eq!(slot.word(), (18 << 16) | OWN | DATA1 | DTS);
        assert_eq!(slot.buffer(), buffer.as_mut_ptr());
        assert!(slot.owned_by_controller());
        assert_eq!(slot.toggle(), DataToggle::Data1);
    }

    #[test]
    fn controller_owned_slot_cannot_be_read() {
        let table = BufferDescriptorTable::new();
        let mut buffer = [0xAAu8; 8];
        let slot = table.slot(0, Direction::Rx, Parity::Even);
        unsafe { slot.release(buffer.as_mut_ptr(), 8, DataToggle::Data0) };

        let mut out = [0; 8];
        assert_eq!(slot.read_into(&mut out), None);
        assert_eq!(out, [0; 8]);

        // What the controller does when a SETUP lands.
        slot.desc.set((8 << 16) | ((Pid::Setup as u32) << 2));

        assert_eq!(slot.token(), Some(Pid::Setup));
        assert_eq!(slot.read_into(&mut out), Some(8));
        assert_eq!(out, [0xAA; 8]);
    }

    #[test]
    fn short_transfer_reads_only_byte_count() {
        let table = BufferDescriptorTable::new();
        let mut buffer = [1, 2, 3, 4, 5, 6, 7, 8];
        let slot = table.slot(2, Direction::Rx, Parity::Odd);
        unsafe { slot.release(buffer.as_mut_ptr(), 8, DataToggle::Data0) };
        slot.desc.set((3 << 16) | ((Pid::Out as u32) << 2));

        let mut out = [0; 8];
        assert_eq!(slot.read_into(&mut out), Some(3));
        assert_eq!(&out[..3], &[1, 2, 3]);
    }

    #[test]
    fn rearm_keeps_buffer() {
        let table = BufferDescriptorTable::new();
        let mut buffer = [0u8; 64];
        let slot = table.slot(0, Direction::Rx, Parity::Odd);
        unsafe { slot.release(buffer.as_mut_ptr(), 64, DataToggle::Data0) };
        slot.desc.set(0);

        slot.rearm(64, DataToggle::Data1);

        assert_eq!(slot.buffer(), buffer.as_mut_ptr());
        assert_eq!(slot.word(), (64 << 16) | OWN | DATA1 | DTS);
    }

    #[test]
    fn ping_pong_alternates_parity_and_toggle() {
        let mut pp = PingPong::new(DataToggle::Data0);
        let seen: Vec<_> = (0..5).map(|_| pp.next()).collect();
        assert_eq!(
            seen,
            vec![
                (Parity::Even, DataToggle::Data0),
                (Parity::Odd, DataToggle::Data1),
                (Parity::Even, DataToggle::Data0),
                (Parity::Odd, DataToggle::Data1),
                (Parity::Even, DataToggle::Data0),
            ]
        );
    }

    #[test]
    fn unknown_pid_is_none() {
        let table = BufferDescriptorTable::new();
        let slot = table.slot(0, Direction::Rx, Parity::Even);
        slot.desc.set(0x5 << 2);
        assert_eq!(slot.token(), None);
    }
}
