// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A pretend target on the other end of the cable, for tests.
//!
//! The target shifts out one scripted bit per DSCLK period and records every
//! bit the pod clocks in on the rising edge. Line changes and waits go into a
//! shared journal so tests can check the order things happened in.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::pins::Pins;
use super::MESSAGE_BITS;
use crate::delay::Wait;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Breakpoint(bool),
    Reset(bool),
    Ta(bool),
    Wait(u32),
}

pub type Journal = Rc<RefCell<Vec<Event>>>;

pub struct SimTarget {
    clock: bool,
    data_out: bool,
    current: Option<bool>,
    script: VecDeque<bool>,
    fallback: Option<(u32, u32)>,
    /// Bits the pod sent, in order.
    pub received: Vec<bool>,
    /// Rising DSCLK edges seen.
    pub clocks: usize,
    pub breakpoint: bool,
    pub journal: Journal,
}

impl SimTarget {
    pub fn new() -> Self {
        Self {
            clock: false,
            data_out: false,
            current: None,
            script: VecDeque::new(),
            fallback: None,
            received: Vec::new(),
            clocks: 0,
            breakpoint: true,
            journal: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Queues a 17-bit response frame: status bit, then 16 data bits.
    pub fn respond(&mut self, status: bool, data: u16) {
        self.respond_bits(&[status]);
        for i in (0..16).rev() {
            self.script.push_back((data >> i) & 1 != 0);
        }
    }

    pub fn respond_bits(&mut self, bits: &[bool]) {
        self.script.extend(bits.iter().copied());
    }

    /// Once the script runs dry, repeat this frame forever.
    pub fn always(&mut self, status: bool, data: u16) {
        let frame = (u32::from(status) << 16) | u32::from(data);
        self.fallback = Some((frame, 0));
    }

    /// Everything the pod sent, cut into 17-bit frames.
    pub fn received_frames(&self) -> Vec<u32> {
        self.received
            .chunks(MESSAGE_BITS as usize)
            .map(|frame| frame.iter().fold(0, |acc, &b| (acc << 1) | u32::from(b)))
            .collect()
    }

    fn next_bit(&mut self) -> bool {
        if let Some(bit) = self.script.pop_front() {
            return bit;
        }
        match self.fallback.as_mut() {
            Some((frame, index)) => {
                let bit = (*frame >> (MESSAGE_BITS - 1 - *index)) & 1 != 0;
                *index = (*index + 1) % MESSAGE_BITS;
                bit
            }
            // Nobody driving DSO: the pull-up wins.
            None => true,
        }
    }

    fn log(&self, event: Event) {
        self.journal.borrow_mut().push(event);
    }
}

impl Pins for SimTarget {
    fn set_clock(&mut self, high: bool) {
        if high && !self.clock {
            self.received.push(self.data_out);
            self.clocks += 1;
            // Target moves on to its next bit after the edge.
            if self.current.take().is_none() {
                self.next_bit();
            }
        }
        self.clock = high;
    }

    fn set_data_out(&mut self, high: bool) {
        self.data_out = high;
    }

    fn data_in(&mut self) -> bool {
        match self.current {
            Some(bit) => bit,
            None => {
                let bit = self.next_bit();
                self.current = Some(bit);
                bit
            }
        }
    }

    fn set_breakpoint(&mut self, high: bool) {
        self.breakpoint = high;
        self.log(Event::Breakpoint(high));
    }

    fn set_reset(&mut self, asserted: bool) {
        self.log(Event::Reset(asserted));
    }

    fn set_ta(&mut self, asserted: bool) {
        self.log(Event::Ta(asserted));
    }
}

/// Doesn't wait at all, just writes down how long it was asked to.
pub struct SimClock {
    pub journal: Journal,
}

impl Wait for SimClock {
    fn wait_us(&mut self, us: u32) {
        self.journal.borrow_mut().push(Event::Wait(us));
    }

    fn wait_ms(&mut self, ms: u32) {
        self.journal.borrow_mut().push(Event::Wait(ms * 1000));
    }
}

/// A target and a clock sharing one journal.
pub fn bench() -> (SimTarget, SimClock) {
    let target = SimTarget::new();
    let clock = SimClock { journal: target.journal.clone() };
    (target, clock)
}
