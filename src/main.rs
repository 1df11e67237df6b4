// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Teensy BDM pod firmware.
//!
//! This turns a Teensy 3.x into a USB-attached debug cable for ColdFire
//! parts. The host tools talk to it entirely in vendor requests on endpoint
//! 0; each request becomes one operation on the BDM wires (halt, reset, send
//! some words, read some words), and the result goes back in the data stage.
//!
//! Like the rest of this crate, it does everything from one loop:
//!
//! - No HALs.
//! - No interrupts. The USB controller's interrupt flags get polled.
//! - No RTOS or executor. A BDM operation blocks the loop until it's done,
//!   which is fine, because the host won't ask for anything else until it
//!   gets its answer.
//!
//! `main` is written to be read top to bottom, the way the chip comes up:
//! clocks, pins, timer, console, USB. The register-level details live in
//! the `kinetis` module, and everything that isn't tied to this particular
//! chip lives in the library half of the crate, where it can be tested on a
//! host.
//!
//! # Pins
//!
//! ```text
//! PTC5   pin 13   LED
//! PTB16  pin 0    UART RX
//! PTB17  pin 1    UART TX (log output, 115200 8N1)
//! PTD0   pin 2    BKPT
//! PTA12  pin 3    DSCLK
//! PTA13  pin 4    DSO (from target)
//! PTD7   pin 5    DSI (to target)
//! PTD2   pin 7    TA (open drain)
//! PTD3   pin 8    RSTO (from target)
//! PTD4   pin 6    RSTI (open drain)
//! ```

#![no_std]
#![no_main]

use cortex_m_rt::{entry, pre_init};
use log::{info, warn, LevelFilter};

use panic_halt as _;

use tbdm_pod::bdm::{Bdm, CableStatus, Config};
use tbdm_pod::command::{CommandBridge, PodCommands};
use tbdm_pod::delay::Delay;
use tbdm_pod::usb::bdt::BufferDescriptorTable;
use tbdm_pod::usb::bulk::{BulkIn, BulkOut};
use tbdm_pod::usb::control::{Control, ControlBuffers};
use tbdm_pod::usb::descriptors::{BULK_IN_ENDPOINT, BULK_OUT_ENDPOINT, DESCRIPTORS};
use tbdm_pod::usb::{PacketBuffers, UsbDevice};

mod kinetis;

cfg_if::cfg_if! {
    if #[cfg(feature = "target-teensy3")] {
        const BOARD: &str = "Teensy 3.x";
        const LOG_LEVEL: LevelFilter = LevelFilter::Info;
    } else {
        compile_error!("missing or unknown target-* feature");
    }
}

/// Flash configuration field, at 0x400.
///
/// Backdoor key and protection bytes are all ones (nothing protected), and
/// FSEC = 0xDE leaves the part unsecured with mass erase enabled. Get this
/// wrong and the chip can lock itself permanently, which is why it's spelled
/// out here instead of computed.
#[link_section = ".flashconfig"]
#[used]
static FLASH_CONFIG: [u8; 16] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, // backdoor key
    0xFF, 0xFF, 0xFF, 0xFF, // FPROT
    0xDE, // FSEC
    0xF9, // FOPT
    0xFF, 0xFF, // FEPROT, FDPROT
];

// Everything the USB controller reads by DMA has to stay put forever, so it
// all lives in statics.
static BDT: BufferDescriptorTable = BufferDescriptorTable::new();
static EP0_BUFFERS: ControlBuffers = ControlBuffers::new();
static BULK_OUT_BUFFERS: PacketBuffers = PacketBuffers::new();

static CABLE_STATUS: CableStatus = CableStatus::new();

/// Runs before `.data` and `.bss` are set up. The watchdog bites within a few
/// milliseconds of reset, and zeroing 64K of RAM could take longer than that.
#[pre_init]
unsafe fn before_main() {
    kinetis::disable_watchdog();
}

#[entry]
fn main() -> ! {
    // We're running on the FLL at about 21MHz, with the watchdog off and
    // every peripheral clock gated.

    //////////////////////////////////////////////////////////////////////////
    // Clocks. Move to the 16MHz crystal and the PLL: 96MHz core, 48MHz bus.
    // The USB controller gets the PLL divided by two later.

    kinetis::configure_clocks();

    //////////////////////////////////////////////////////////////////////////
    // Pins. The LED stays off until USB is up; the cable lines go to their
    // idle levels right away so we don't poke at a target that's already
    // plugged in. Which level that is for BKPT depends on the cable.

    let config = Config::default();
    let mut led = kinetis::Led::new();
    let pins = kinetis::CablePins::new(config.breakpoint);

    //////////////////////////////////////////////////////////////////////////
    // Timing. PIT0 free-runs at the bus clock and every delay in the
    // firmware spins on it.

    let delay = Delay::new(kinetis::Pit0::start(), kinetis::BUS_CLOCK_HZ);

    //////////////////////////////////////////////////////////////////////////
    // Console. From here on, `log` output goes out the UART.

    kinetis::init_logger(LOG_LEVEL);
    info!(
        "{} v{} on {}, core at {}MHz",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        BOARD,
        kinetis::CORE_CLOCK_HZ / 1_000_000
    );

    //////////////////////////////////////////////////////////////////////////
    // BDM. Put the interface into its idle state and wrap it up so vendor
    // requests can drive it.

    let mut bdm = Bdm::new(pins, delay, config, &CABLE_STATUS);
    bdm.init();
    let mut bridge = CommandBridge::new(PodCommands::new(bdm));

    //////////////////////////////////////////////////////////////////////////
    // USB. Bring up the controller, hook up a handler for each endpoint, and
    // only then turn on the pull-up so the host can see us. Nothing gets
    // configured until the host resets the bus; `handle_interrupt` takes it
    // from there.

    let usb = kinetis::Usb0::init(&BDT);

    let mut control = Control::new(&EP0_BUFFERS, &DESCRIPTORS).with_vendor(&mut bridge);
    let mut bulk_in = BulkIn;
    let mut bulk_out = BulkOut::new(&BULK_OUT_BUFFERS);

    let mut device = UsbDevice::new(usb, &BDT)
        .with_handler(0, &mut control)
        .with_handler(BULK_IN_ENDPOINT, &mut bulk_in)
        .with_handler(BULK_OUT_ENDPOINT, &mut bulk_out);

    device.controller_mut().connect();
    led.set(true);
    info!("usb: attached");

    //////////////////////////////////////////////////////////////////////////
    // Main loop. Service the controller, and keep an eye on RSTO so the host
    // can find out the target reset itself behind our back. The LED flips
    // every time that happens.

    loop {
        device.handle_interrupt();

        if kinetis::take_target_reset() {
            warn!("target reset");
            CABLE_STATUS.note_reset();
            led.toggle();
        }
    }
}
