// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bit-banged ColdFire BDM transport.
//!
//! BDM is a synchronous serial protocol where the pod supplies the clock
//! (DSCLK) and both sides shift at the same time: every period we put one bit
//! on DSI and pick one bit up from DSO. Everything moves in 17-bit messages.
//! In the pod-to-target direction the first bit is always 0 and the rest is a
//! 16-bit command or data word; in the other direction the first bit is a
//! status bit and the rest is the target's response to the *previous*
//! message.
//!
//! A set status bit with the data word `0x0000` means "not ready, ask again",
//! which is why most of the interesting code here is retry loops. `0x0001`
//! means a bus error on the target and `0xFFFF` an illegal command; neither is
//! worth retrying.
//!
//! Nothing in here yields. A message takes 17 clock periods of a few
//! microseconds each, spent spinning on the timer, and a reset spends 100ms
//! the same way.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::delay::Wait;

mod pins;
#[cfg(test)]
pub(crate) mod sim;

pub use pins::{Edge, Pins, Polarity};

/// Bits in one BDM message, status bit included.
pub const MESSAGE_BITS: u32 = 17;

/// The BDM `NOP` command word. Used as filler whenever we need to clock a
/// message through without asking the target to do anything.
pub const NOP: u16 = 0x0000;

/// Low byte of a "not ready" response.
pub const NOT_READY: u8 = 0x00;

/// Target-side bus error response.
pub const BUS_ERROR: u16 = 0x0001;

/// Illegal command response.
pub const ILLEGAL_COMMAND: u16 = 0xFFFF;

/// Transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The target said "not ready" for the entire retry budget.
    NotReady,
    /// The target set the status bit and answered with something other than
    /// "not ready" (bus error, illegal command). Carries the data word.
    Target(u16),
    /// Couldn't find the frame boundary again.
    Resync,
}

impl Error {
    /// Status byte reported to the host for this failure.
    pub const fn status(self) -> u8 {
        match self {
            Error::NotReady => 1,
            Error::Target(_) => 2,
            Error::Resync => 3,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// What came back from the target during one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// The leading status bit. `false` means the data is valid.
    pub status: bool,
    pub data: u16,
}

impl Response {
    const fn from_bits(bits: u32) -> Self {
        Self {
            status: bits & (1 << 16) != 0,
            data: bits as u16,
        }
    }

    /// Status set with the "come back later" data pattern.
    pub fn is_not_ready(&self) -> bool {
        self.status && self.data as u8 == NOT_READY
    }
}

/// Tunables for the transport.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of message exchanges spent waiting for a not-ready target
    /// before giving up. At least one exchange always happens.
    pub retries: u8,
    /// Single clock pulses tried while hunting for a start bit in
    /// [`Bdm::resync`].
    pub resync_probes: u8,
    /// Time each DSCLK phase is held, in microseconds.
    pub bit_hold_us: u32,
    /// How long BKPT stays asserted for a halt. 700us is enough for a target
    /// clocked at 2kHz and still short enough to fit in one USB frame.
    pub halt_hold_us: u32,
    /// Width of the RSTI pulse.
    pub reset_pulse_ms: u32,
    /// Time allowed after releasing RSTI for a slow RC on the reset line.
    pub reset_settle_ms: u32,
    pub breakpoint: Polarity,
}

impl Default for Config {
    fn default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(feature = "invert-bkpt")] {
                let breakpoint = Polarity::ActiveHigh;
            } else {
                let breakpoint = Polarity::ActiveLow;
            }
        }
        Self {
            retries: 20,
            resync_probes: 18,
            bit_hold_us: 1,
            halt_hold_us: 700,
            reset_pulse_ms: 50,
            reset_settle_ms: 50,
            breakpoint,
        }
    }
}

/// How the target should come out of reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Hold BKPT through the reset so the core stops in debug mode.
    Debug,
    /// Let it run.
    Normal,
}

/// Kind of debug interface the cable is currently driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum TargetType {
    ColdFireBdm = 0,
    Jtag = 1,
}

/// Cable state the host can poll.
///
/// The reset flag is sticky: it's set by whoever watches RSTO when the target
/// resets itself, and only cleared by the pod's own reset sequence or
/// [`Bdm::init`]. Both fields are atomics so the watcher doesn't need a
/// reference to the transport.
pub struct CableStatus {
    target: AtomicU8,
    reset: AtomicBool,
}

impl CableStatus {
    pub const fn new() -> Self {
        Self {
            target: AtomicU8::new(TargetType::ColdFireBdm as u8),
            reset: AtomicBool::new(false),
        }
    }

    pub fn target_type(&self) -> TargetType {
        TargetType::from_u8(self.target.load(Ordering::Relaxed)).unwrap_or(TargetType::ColdFireBdm)
    }

    pub fn set_target_type(&self, target: TargetType) {
        self.target.store(target as u8, Ordering::Relaxed);
    }

    /// Records that the target went through a reset we didn't ask for.
    pub fn note_reset(&self) {
        self.reset.store(true, Ordering::Relaxed);
    }

    pub fn reset_detected(&self) -> bool {
        self.reset.load(Ordering::Relaxed)
    }

    pub fn clear_reset(&self) {
        self.reset.store(false, Ordering::Relaxed);
    }

    /// Packed form sent to the host: target type in bits 2..0, reset flag in
    /// bit 3.
    pub fn to_byte(&self) -> u8 {
        (self.target.load(Ordering::Relaxed) & 0x7) | (u8::from(self.reset_detected()) << 3)
    }
}

impl Default for CableStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// The BDM transport, driving `pins` with timing from `wait`.
pub struct Bdm<'a, P, W> {
    pins: P,
    wait: W,
    config: Config,
    status: &'a CableStatus,
}

impl<'a, P: Pins, W: Wait> Bdm<'a, P, W> {
    pub fn new(pins: P, wait: W, config: Config, status: &'a CableStatus) -> Self {
        Self { pins, wait, config, status }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cable_status(&self) -> &CableStatus {
        self.status
    }

    pub fn pins(&self) -> &P {
        &self.pins
    }

    /// Puts every line in its idle state and forgets about any earlier reset.
    pub fn init(&mut self) {
        self.pins.set_clock(false);
        self.pins.set_data_out(false);
        self.pins.set_breakpoint(self.config.breakpoint.level(false));
        self.pins.set_reset(false);
        self.pins.set_ta(false);
        self.status.clear_reset();
    }

    /// One DSCLK period: present `out`, sample the target, raise the clock.
    fn clock_bit(&mut self, out: bool) -> bool {
        self.pins.set_clock(false);
        self.wait.wait_us(self.config.bit_hold_us);
        self.pins.set_data_out(out);
        // The target shifts its bit out on the falling edge, so it's settled
        // by now.
        let sampled = self.pins.data_in();
        self.wait.wait_us(self.config.bit_hold_us);
        self.pins.set_clock(true);
        self.wait.wait_us(self.config.bit_hold_us);
        sampled
    }

    fn tx8(&mut self, byte: u8) {
        for i in (0..8).rev() {
            self.clock_bit(byte & (1 << i) != 0);
        }
    }

    /// Parks the lines between messages.
    fn end_frame(&mut self) {
        self.pins.set_clock(false);
        self.pins.set_data_out(false);
    }

    /// Shifts the low `count` bits of `bits` out MSB first, returning what
    /// came back in the same order.
    pub fn txrx(&mut self, bits: u32, count: u32) -> u32 {
        let mut result = 0;
        for i in (0..count).rev() {
            result <<= 1;
            result |= u32::from(self.clock_bit((bits >> i) & 1 != 0));
        }
        self.end_frame();
        result
    }

    /// Exchanges one 17-bit message carrying `word`.
    pub fn txrx_message(&mut self, word: u16) -> Response {
        let response = Response::from_bits(self.txrx(u32::from(word), MESSAGE_BITS));
        trace!("bdm: sent {:04x}, got {:?}", word, response);
        response
    }

    /// Sends `word`, returning only the status bit.
    pub fn tx_message(&mut self, word: u16) -> bool {
        self.txrx_message(word).status
    }

    /// Receives one message, sending NOP.
    pub fn rx_message(&mut self) -> Response {
        self.txrx_message(NOP)
    }

    /// Sends `word` and returns the low byte of the response.
    ///
    /// This is how the second word of a command that can fail is sent: if
    /// the target isn't halted it answers not-ready (`00`), bus error (`01`)
    /// or illegal command (`FF`), and the caller wants to know which.
    pub fn tx_message_half_rx(&mut self, word: u16) -> u8 {
        self.txrx_message(word).data as u8
    }

    /// Sends every big-endian word in `data`, ignoring what comes back. A
    /// trailing odd byte is ignored.
    pub fn tx(&mut self, data: &[u8]) {
        for word in data.chunks_exact(2) {
            self.txrx_message(BigEndian::read_u16(word));
        }
    }

    /// Waits for a write-only command to complete, sending `next` each time
    /// we ask. Pass [`NOP`] if there's nothing better to send.
    ///
    /// Only the status bit is checked.
    pub fn wait_ready(&mut self, next: u16) -> Result<()> {
        for _ in 0..self.config.retries.max(1) {
            if !self.tx_message(next) {
                return Ok(());
            }
        }
        debug!("bdm: target still busy after {} tries", self.config.retries);
        Err(Error::NotReady)
    }

    /// Reads one message, asking again while the target says not-ready.
    fn read_with_retry(&mut self, word: u16) -> Result<Response> {
        for _ in 0..self.config.retries.max(1) {
            let response = self.txrx_message(word);
            if !response.status {
                return Ok(response);
            }
            if !response.is_not_ready() {
                debug!("bdm: target error {:04x}", response.data);
                return Err(Error::Target(response.data));
            }
        }
        debug!("bdm: no data after {} tries", self.config.retries);
        Err(Error::NotReady)
    }

    /// Clocks NOPs until the target reports a completed command, catching bus
    /// errors as well as not-ready. Used to drain whatever the target had
    /// left to say.
    pub fn flush(&mut self) -> Result<()> {
        self.read_with_retry(NOP).map(|_| ())
    }

    /// Fills `data` with big-endian response words, one message per word,
    /// retrying each while the target is not ready.
    pub fn rx(&mut self, data: &mut [u8]) -> Result<()> {
        for word in data.chunks_exact_mut(2) {
            let response = self.read_with_retry(NOP)?;
            BigEndian::write_u16(word, response.data);
        }
        Ok(())
    }

    /// Like [`Bdm::rx`], except the last message carries `next` to the
    /// target instead of a NOP, saving a message on command sequences.
    pub fn rxtx(&mut self, data: &mut [u8], next: u16) -> Result<()> {
        let count = data.len() / 2;
        for (i, word) in data.chunks_exact_mut(2).enumerate() {
            let out = if i + 1 == count { next } else { NOP };
            let response = self.read_with_retry(out)?;
            BigEndian::write_u16(word, response.data);
        }
        Ok(())
    }

    /// Gets back in step with the target after noise on DSCLK.
    ///
    /// Three NOPs clear any error the target has latched. The last one should
    /// come back with at least one of its two low bits set; if not, the line
    /// isn't behaving like BDM at all. Then we clock single bits until the
    /// target shows a 0 status bit, which is the start of a message, and
    /// finish that message with two zero bytes.
    pub fn resync(&mut self) -> Result<()> {
        self.tx_message(NOP);
        self.tx_message(NOP);
        let response = self.txrx_message(NOP);
        if response.data & 0x3 == 0 {
            warn!("bdm: resync got {:04x} for a NOP", response.data);
            return Err(Error::Resync);
        }

        for _ in 0..self.config.resync_probes {
            if !self.clock_bit(false) {
                self.tx8(0);
                self.tx8(0);
                self.end_frame();
                return Ok(());
            }
        }
        self.end_frame();
        warn!("bdm: no start bit in {} clocks", self.config.resync_probes);
        Err(Error::Resync)
    }

    /// Stops the target by pulsing BKPT.
    ///
    /// V2 cores ignore the first message after a halt, for reasons nobody has
    /// figured out (it isn't timing), so a flush follows the pulse.
    pub fn halt(&mut self) -> Result<()> {
        debug!("bdm: halt");
        self.pins.set_breakpoint(self.config.breakpoint.level(true));
        self.wait.wait_us(self.config.halt_hold_us);
        self.pins.set_breakpoint(self.config.breakpoint.level(false));
        self.flush()
    }

    /// Pulses RSTI, optionally holding BKPT through it to land in debug mode.
    pub fn reset(&mut self, mode: ResetMode) -> Result<()> {
        debug!("bdm: reset ({:?})", mode);
        self.pins.set_reset(true);
        if mode == ResetMode::Debug {
            self.pins.set_breakpoint(self.config.breakpoint.level(true));
        }
        self.wait.wait_ms(self.config.reset_pulse_ms);
        self.pins.set_reset(false);
        self.wait.wait_ms(self.config.reset_settle_ms);
        self.pins.set_breakpoint(self.config.breakpoint.level(false));

        self.status.clear_reset();
        self.flush()
    }

    /// Asserts TA for `ticks` periods of 10us.
    pub fn assert_ta(&mut self, ticks: u8) {
        self.pins.set_ta(true);
        self.wait.wait_us(10 * u32::from(ticks));
        self.pins.set_ta(false);
    }
}
