// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware core for a Teensy 3.x based ColdFire BDM debug pod.
//!
//! The pod sits between a host computer (on USB) and a target CPU's BDM pins.
//! The host sends debug commands as vendor requests on the control endpoint;
//! the firmware turns them into 17-bit serial messages clocked out by hand on
//! a handful of GPIOs, and sends whatever the target said back to the host.
//!
//! There are two halves to this, and they have almost nothing to do with each
//! other except that one calls the other:
//!
//! - [`usb`] drives the Kinetis USB-FS function controller: the buffer
//!   descriptor table (BDT) that the hardware and firmware pass buffers back
//!   and forth through, and the endpoint 0 control-transfer state machine that
//!   gets us enumerated.
//!
//! - [`bdm`] is the bit-banged transport to the target, including the retry
//!   rules for a target that isn't ready yet and the resynchronization dance
//!   for when the clock line picked up noise.
//!
//! [`command`] is the seam between them: a vendor request becomes a command
//! buffer, a command processor runs it against the transport, and a status
//! byte plus the buffer go back to the host.
//!
//! Everything in here talks to hardware through small traits
//! ([`usb::Controller`], [`bdm::Pins`], [`delay::Countdown`]), so the actual
//! register pokes live in the firmware binary and the protocol logic can be
//! tested on a PC against simulated hardware.

#![cfg_attr(not(test), no_std)]

pub mod bdm;
pub mod command;
pub mod delay;
pub mod usb;
