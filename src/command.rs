// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! From vendor requests to BDM operations.
//!
//! The host sends every command as a vendor request on endpoint 0, with no
//! data stage. [`CommandBridge`] packs the request into a small command
//! buffer:
//!
//! ```text
//! [request, value_lo, value_hi, index_lo, index_hi, 0, 0, ...]
//! ```
//!
//! and hands it to a [`CommandProcessor`], which does the work, leaves any
//! results in the same buffer, and returns a status byte. For a
//! device-to-host request the host gets back `[status, buffer...]`, cut to
//! the length it asked for. A host-to-device request has nowhere to put a
//! reply, so it's acknowledged if the status is [`status::OK`] and stalled
//! otherwise.
//!
//! [`PodCommands`] is the processor for the cable itself. It only knows
//! about the transport: halting, resetting, moving raw 16-bit words. What the
//! words mean to a particular ColdFire core is the host's business.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::debug;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::bdm::{Bdm, Pins, ResetMode};
use crate::delay::Wait;
use crate::usb::control::{VendorRequests, VendorResponse};
use crate::usb::setup::{SetupPacket, UsbDir};

/// Size of the buffer passed to a [`CommandProcessor`].
pub const COMMAND_BUFFER: usize = 64;

/// Status bytes. Transport failures use [`crate::bdm::Error::status`], which
/// stays below these.
pub mod status {
    pub const OK: u8 = 0x00;
    pub const UNKNOWN_COMMAND: u8 = 0x80;
    pub const BAD_ARGUMENT: u8 = 0x81;
}

/// Runs one command.
pub trait CommandProcessor {
    /// `buffer` holds the command on entry and any results on return.
    fn execute(&mut self, buffer: &mut [u8]) -> u8;
}

/// Turns vendor requests into command buffers for `P`.
pub struct CommandBridge<P> {
    processor: P,
}

impl<P: CommandProcessor> CommandBridge<P> {
    pub fn new(processor: P) -> Self {
        Self { processor }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut P {
        &mut self.processor
    }
}

impl<P: CommandProcessor> VendorRequests for CommandBridge<P> {
    fn vendor_request(&mut self, setup: &SetupPacket, response: &mut [u8]) -> VendorResponse {
        let mut buffer = [0; COMMAND_BUFFER];
        buffer[0] = setup.request;
        LittleEndian::write_u16(&mut buffer[1..3], setup.value.get());
        LittleEndian::write_u16(&mut buffer[3..5], setup.index.get());

        let status = self.processor.execute(&mut buffer);
        debug!("command {:02x}: status {:02x}", setup.request, status);

        match setup.direction() {
            UsbDir::In => match response.split_first_mut() {
                Some((first, rest)) => {
                    *first = status;
                    let n = rest.len().min(buffer.len());
                    rest[..n].copy_from_slice(&buffer[..n]);
                    VendorResponse::Data(1 + n)
                }
                None => VendorResponse::Data(0),
            },
            UsbDir::Out if status == status::OK => VendorResponse::Ack,
            UsbDir::Out => VendorResponse::Stall,
        }
    }
}

/// Commands understood by [`PodCommands`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum PodCommand {
    /// Cable status byte (see [`crate::bdm::CableStatus::to_byte`]) in
    /// `buffer[0]`.
    GetStatus = 0x01,
    /// Put the lines in their idle state and forget about earlier resets.
    Init = 0x02,
    Halt = 0x10,
    /// `value` nonzero resets into debug mode.
    Reset = 0x11,
    Resync = 0x12,
    /// Assert TA for `value` ticks of 10us (at most 255).
    AssertTa = 0x13,
    /// Send `value`; the status bit comes back in `buffer[0]`.
    TxMessage = 0x20,
    /// Send a NOP; status bit in `buffer[0]`, data big-endian in
    /// `buffer[1..3]`.
    RxMessage = 0x21,
    /// Send `value`, results as for `RxMessage`.
    TxRxMessage = 0x22,
    /// Send `value` until the target is ready.
    WaitReady = 0x23,
    /// Read `value` words (retrying each while the target is busy), sending
    /// `index` with the last one. Words land big-endian from `buffer[0]`.
    Read = 0x24,
    /// Drain a busy target with NOPs.
    Flush = 0x25,
    /// Send `value` and return the low byte of the response in `buffer[0]`.
    TxHalfRx = 0x26,
    /// Send `value` then `index`, ignoring the responses.
    TxWords = 0x27,
}

/// Runs cable commands against a BDM transport.
pub struct PodCommands<'a, P, W> {
    bdm: Bdm<'a, P, W>,
}

impl<'a, P: Pins, W: Wait> PodCommands<'a, P, W> {
    pub fn new(bdm: Bdm<'a, P, W>) -> Self {
        Self { bdm }
    }

    pub fn bdm(&self) -> &Bdm<'a, P, W> {
        &self.bdm
    }

    pub fn bdm_mut(&mut self) -> &mut Bdm<'a, P, W> {
        &mut self.bdm
    }

    fn run(
        &mut self,
        command: PodCommand,
        value: u16,
        index: u16,
        out: &mut [u8],
    ) -> crate::bdm::Result<u8> {
        match command {
            PodCommand::GetStatus => {
                out[0] = self.bdm.cable_status().to_byte();
            }
            PodCommand::Init => self.bdm.init(),
            PodCommand::Halt => self.bdm.halt()?,
            PodCommand::Reset => {
                let mode = if value != 0 { ResetMode::Debug } else { ResetMode::Normal };
                self.bdm.reset(mode)?;
            }
            PodCommand::Resync => self.bdm.resync()?,
            PodCommand::AssertTa => {
                let ticks = match u8::try_from(value) {
                    Ok(ticks) => ticks,
                    Err(_) => return Ok(status::BAD_ARGUMENT),
                };
                self.bdm.assert_ta(ticks);
            }
            PodCommand::TxMessage => {
                out[0] = u8::from(self.bdm.tx_message(value));
            }
            PodCommand::RxMessage | PodCommand::TxRxMessage => {
                let word = if command == PodCommand::RxMessage { crate::bdm::NOP } else { value };
                let response = self.bdm.txrx_message(word);
                out[0] = u8::from(response.status);
                BigEndian::write_u16(&mut out[1..3], response.data);
            }
            PodCommand::WaitReady => self.bdm.wait_ready(value)?,
            PodCommand::Read => {
                let words = usize::from(value);
                if words == 0 || words * 2 > out.len() {
                    return Ok(status::BAD_ARGUMENT);
                }
                self.bdm.rxtx(&mut out[..words * 2], index)?;
            }
            PodCommand::Flush => self.bdm.flush()?,
            PodCommand::TxHalfRx => {
                out[0] = self.bdm.tx_message_half_rx(value);
            }
            PodCommand::TxWords => {
                let mut words = [0; 4];
                BigEndian::write_u16(&mut words[..2], value);
                BigEndian::write_u16(&mut words[2..], index);
                self.bdm.tx(&words);
            }
        }
        Ok(status::OK)
    }
}

impl<P: Pins, W: Wait> CommandProcessor for PodCommands<'_, P, W> {
    fn execute(&mut self, buffer: &mut [u8]) -> u8 {
        if buffer.len() < 5 {
            return status::BAD_ARGUMENT;
        }
        let command = match PodCommand::from_u8(buffer[0]) {
            Some(command) => command,
            None => return status::UNKNOWN_COMMAND,
        };
        let value = LittleEndian::read_u16(&buffer[1..3]);
        let index = LittleEndian::read_u16(&buffer[3..5]);
        // Results overwrite the command; we've got everything out of it.
        buffer.fill(0);

        match self.run(command, value, index, buffer) {
            Ok(status) => status,
            Err(e) => {
                debug!("{:?} failed: {:?}", command, e);
                e.status()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bdm::sim::{bench, Event, SimClock, SimTarget};
    use crate::bdm::{CableStatus, Config, Error, Polarity};

    fn commands(
        target: SimTarget,
        clock: SimClock,
        status: &CableStatus,
    ) -> PodCommands<'_, SimTarget, SimClock> {
        let config = Config { retries: 4, breakpoint: Polarity::ActiveLow, ..Config::default() };
        PodCommands::new(Bdm::new(target, clock, config, status))
    }

    fn command(code: u8, value: u16, index: u16) -> [u8; COMMAND_BUFFER] {
        let mut buffer = [0; COMMAND_BUFFER];
        buffer[0] = code;
        LittleEndian::write_u16(&mut buffer[1..3], value);
        LittleEndian::write_u16(&mut buffer[3..5], index);
        buffer
    }

    fn setup(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
        let mut raw = [request_type, request, 0, 0, 0, 0, 0, 0];
        LittleEndian::write_u16(&mut raw[2..4], value);
        LittleEndian::write_u16(&mut raw[4..6], index);
        LittleEndian::write_u16(&mut raw[6..8], length);
        SetupPacket::parse(&raw).unwrap()
    }

    #[test]
    fn status_reports_reset_flag() {
        let (target, clock) = bench();
        let status = CableStatus::new();
        let mut pod = commands(target, clock, &status);
        status.note_reset();

        let mut buffer = command(0x01, 0, 0);
        assert_eq!(pod.execute(&mut buffer), status::OK);
        assert_eq!(buffer[0], 0x08);
    }

    #[test]
    fn unknown_command() {
        let (target, clock) = bench();
        let status = CableStatus::new();
        let mut pod = commands(target, clock, &status);

        let mut buffer = command(0x7E, 0, 0);
        assert_eq!(pod.execute(&mut buffer), status::UNKNOWN_COMMAND);
        assert_eq!(pod.execute(&mut [0x01, 0]), status::BAD_ARGUMENT);
    }

    #[test]
    fn rx_message_returns_status_and_data() {
        let (mut target, clock) = bench();
        target.respond(true, 0xBEEF);
        let status = CableStatus::new();
        let mut pod = commands(target, clock, &status);

        let mut buffer = command(0x21, 0, 0);
        assert_eq!(pod.execute(&mut buffer), status::OK);
        assert_eq!(&buffer[..3], &[1, 0xBE, 0xEF]);
        assert_eq!(pod.bdm().pins().received_frames(), vec![0]);
    }

    #[test]
    fn read_piggybacks_next_command() {
        let (mut target, clock) = bench();
        target.respond(false, 0x0102);
        target.respond(true, 0x0000);
        target.respond(false, 0x0304);
        let status = CableStatus::new();
        let mut pod = commands(target, clock, &status);

        let mut buffer = command(0x24, 2, 0x2980);
        assert_eq!(pod.execute(&mut buffer), status::OK);
        assert_eq!(&buffer[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(pod.bdm().pins().received_frames(), vec![0, 0x2980, 0x2980]);
    }

    #[test]
    fn read_rejects_oversized_count() {
        let (target, clock) = bench();
        let status = CableStatus::new();
        let mut pod = commands(target, clock, &status);

        let mut buffer = command(0x24, 33, 0);
        assert_eq!(pod.execute(&mut buffer), status::BAD_ARGUMENT);
        assert_eq!(pod.bdm().pins().clocks, 0);
    }

    #[test]
    fn busy_target_reports_not_ready() {
        let (mut target, clock) = bench();
        target.always(true, 0x0000);
        let status = CableStatus::new();
        let mut pod = commands(target, clock, &status);

        let mut buffer = command(0x25, 0, 0);
        assert_eq!(pod.execute(&mut buffer), Error::NotReady.status());
        assert_eq!(pod.bdm().pins().clocks, 4 * 17);
    }

    #[test]
    fn ta_takes_ten_microsecond_ticks() {
        let (target, clock) = bench();
        let status = CableStatus::new();
        let mut pod = commands(target, clock, &status);

        let mut buffer = command(0x13, 25, 0);
        assert_eq!(pod.execute(&mut buffer), status::OK);
        let journal = pod.bdm().pins().journal.borrow().clone();
        assert_eq!(journal, vec![Event::Ta(true), Event::Wait(250), Event::Ta(false)]);

        let mut buffer = command(0x13, 256, 0);
        assert_eq!(pod.execute(&mut buffer), status::BAD_ARGUMENT);
    }

    #[test]
    fn tx_words_sends_value_then_index() {
        let (mut target, clock) = bench();
        target.always(false, 0xFFFF);
        let status = CableStatus::new();
        let mut pod = commands(target, clock, &status);

        let mut buffer = command(0x27, 0x2D80, 0x1234);
        assert_eq!(pod.execute(&mut buffer), status::OK);
        assert_eq!(pod.bdm().pins().received_frames(), vec![0x2D80, 0x1234]);
    }

    /// Answers every command with a fixed status and a marker byte.
    struct Canned(u8);

    impl CommandProcessor for Canned {
        fn execute(&mut self, buffer: &mut [u8]) -> u8 {
            buffer[5] = 0x5A;
            self.0
        }
    }

    #[test]
    fn bridge_builds_command_buffer_and_reply() {
        let mut bridge = CommandBridge::new(Canned(status::OK));
        let mut response = [0; 256];

        let reply = bridge.vendor_request(&setup(0xC0, 0x42, 0x1234, 0xABCD, 8), &mut response);

        assert_eq!(reply, VendorResponse::Data(1 + COMMAND_BUFFER));
        assert_eq!(&response[..7], &[0x00, 0x42, 0x34, 0x12, 0xCD, 0xAB, 0x5A]);
    }

    #[test]
    fn bridge_stalls_failed_out_requests() {
        let mut response = [0; 256];

        let mut ok = CommandBridge::new(Canned(status::OK));
        assert_eq!(ok.vendor_request(&setup(0x40, 0x10, 0, 0, 0), &mut response), VendorResponse::Ack);

        let mut failing = CommandBridge::new(Canned(2));
        assert_eq!(
            failing.vendor_request(&setup(0x40, 0x10, 0, 0, 0), &mut response),
            VendorResponse::Stall
        );
    }

    #[test]
    fn halt_through_the_bridge() {
        let (mut target, clock) = bench();
        target.respond(false, 0xFFFF);
        let status = CableStatus::new();
        let mut bridge = CommandBridge::new(commands(target, clock, &status));
        let mut response = [0; 256];

        let reply = bridge.vendor_request(&setup(0xC0, 0x10, 0, 0, 1), &mut response);

        assert_eq!(reply, VendorResponse::Data(1 + COMMAND_BUFFER));
        assert_eq!(response[0], status::OK);
        let journal = bridge.processor().bdm().pins().journal.borrow().clone();
        assert_eq!(&journal[..3], &[Event::Breakpoint(false), Event::Wait(700), Event::Breakpoint(true)]);
    }
}
