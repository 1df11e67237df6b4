// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The MK20DX256 as wired on a Teensy 3.x.
//!
//! There's no PAC in here, just register addresses out of the reference
//! manual and volatile accesses through `vcell`. Each block of the chip the
//! firmware touches gets a small module of addresses and bits, plus whatever
//! code drives it. The portable parts of the firmware see this only through
//! the `Pins`, `Countdown` and `Controller` traits.

use core::fmt::Write as _;

use log::{LevelFilter, Log, Metadata, Record};
use vcell::VolatileCell;

use tbdm_pod::bdm::{Edge, Pins, Polarity};
use tbdm_pod::delay::Countdown;
use tbdm_pod::usb::bdt::BufferDescriptorTable;
use tbdm_pod::usb::Controller;

/// Core clock after [`configure_clocks`].
pub const CORE_CLOCK_HZ: u32 = 96_000_000;
/// Bus clock after [`configure_clocks`]; this is what the PIT counts.
pub const BUS_CLOCK_HZ: u32 = 48_000_000;

/// Returns the register at `address`.
///
/// # Safety
///
/// `address` has to be a register of type `T` that this firmware owns.
unsafe fn reg<T>(address: usize) -> &'static VolatileCell<T> {
    &*(address as *const VolatileCell<T>)
}

fn modify32(address: usize, f: impl FnOnce(u32) -> u32) {
    let r = unsafe { reg::<u32>(address) };
    r.set(f(r.get()));
}

//////////////////////////////////////////////////////////////////////////////
// Watchdog and clocks

mod wdog {
    pub const UNLOCK: usize = 0x4005_200E;
    pub const STCTRLH: usize = 0x4005_2000;

    pub const KEY1: u16 = 0xC520;
    pub const KEY2: u16 = 0xD928;
    /// ALLOWUPDATE, everything else (including WDOGEN) off.
    pub const DISABLED: u16 = 0x0010;
}

mod sim {
    pub const SOPT2: usize = 0x4004_8004;
    pub const SCGC4: usize = 0x4004_8034;
    pub const SCGC5: usize = 0x4004_8038;
    pub const SCGC6: usize = 0x4004_803C;
    pub const CLKDIV1: usize = 0x4004_8044;
    pub const CLKDIV2: usize = 0x4004_8048;

    pub const SOPT2_USBSRC: u32 = 1 << 18;
    pub const SOPT2_PLLFLLSEL: u32 = 1 << 16;
    pub const SCGC4_USBOTG: u32 = 1 << 18;
    pub const SCGC4_UART0: u32 = 1 << 10;
    /// PORTA through PORTE.
    pub const SCGC5_PORTS: u32 = 0x1F << 9;
    pub const SCGC6_PIT: u32 = 1 << 23;

    /// Core /1, bus /2, flash /4.
    pub const CLKDIV1_96MHZ: u32 = 0x0103_0000;
    /// USB clock is the 96MHz PLL divided by 2.
    pub const CLKDIV2_USB_48MHZ: u32 = 0x02;
}

mod mcg {
    pub const C1: usize = 0x4006_4000;
    pub const C2: usize = 0x4006_4001;
    pub const C5: usize = 0x4006_4004;
    pub const C6: usize = 0x4006_4005;
    pub const S: usize = 0x4006_4006;

    pub const S_OSCINIT: u8 = 0x02;
    pub const S_CLKST_MASK: u8 = 0x0C;
    pub const S_CLKST_EXTERNAL: u8 = 0x08;
    pub const S_CLKST_PLL: u8 = 0x0C;
    pub const S_IREFST: u8 = 0x10;
    pub const S_PLLST: u8 = 0x20;
    pub const S_LOCK: u8 = 0x40;
}

const OSC_CR: usize = 0x4006_5000;

/// Turns the watchdog off. It has to happen within a few cycles of reset, so
/// this runs before RAM is even initialized.
pub fn disable_watchdog() {
    unsafe {
        reg::<u16>(wdog::UNLOCK).set(wdog::KEY1);
        reg::<u16>(wdog::UNLOCK).set(wdog::KEY2);
        // The unlock takes a moment to land.
        cortex_m::asm::nop();
        cortex_m::asm::nop();
        reg::<u16>(wdog::STCTRLH).set(wdog::DISABLED);
    }
}

/// Takes the chip from the reset FLL to the PLL on the 16MHz crystal: core
/// at 96MHz, bus at 48MHz.
pub fn configure_clocks() {
    unsafe {
        // Flash can't run at 96MHz, so set dividers before speeding up.
        reg::<u32>(sim::CLKDIV1).set(sim::CLKDIV1_96MHZ);

        // 10pF load, oscillator on.
        reg::<u8>(OSC_CR).set(0x0A);

        let s = reg::<u8>(mcg::S);

        // FEI -> FBE. Very high range crystal, then run from it directly.
        reg::<u8>(mcg::C2).set(0x24);
        reg::<u8>(mcg::C1).set(0xA0);
        while s.get() & mcg::S_OSCINIT == 0 {}
        while s.get() & mcg::S_IREFST != 0 {}
        while s.get() & mcg::S_CLKST_MASK != mcg::S_CLKST_EXTERNAL {}

        // FBE -> PBE. 16MHz / 4 into the PLL, times 24.
        reg::<u8>(mcg::C5).set(0x03);
        reg::<u8>(mcg::C6).set(0x40);
        while s.get() & mcg::S_PLLST == 0 {}
        while s.get() & mcg::S_LOCK == 0 {}

        // PBE -> PEE.
        reg::<u8>(mcg::C1).set(0x20);
        while s.get() & mcg::S_CLKST_MASK != mcg::S_CLKST_PLL {}
    }

    modify32(sim::SCGC5, |v| v | sim::SCGC5_PORTS);
    modify32(sim::SCGC6, |v| v | sim::SCGC6_PIT);
}

//////////////////////////////////////////////////////////////////////////////
// PIT

mod pit {
    pub const MCR: usize = 0x4003_7000;
    pub const LDVAL0: usize = 0x4003_7100;
    pub const CVAL0: usize = 0x4003_7104;
    pub const TCTRL0: usize = 0x4003_7108;

    pub const TCTRL_TEN: u32 = 0x01;
}

/// PIT channel 0, free-running from `u32::MAX` at the bus clock.
pub struct Pit0(());

impl Pit0 {
    pub fn start() -> Self {
        unsafe {
            reg::<u32>(pit::MCR).set(0);
            reg::<u32>(pit::LDVAL0).set(u32::MAX);
            reg::<u32>(pit::TCTRL0).set(pit::TCTRL_TEN);
        }
        Self(())
    }
}

impl Countdown for Pit0 {
    fn current(&self) -> u32 {
        unsafe { reg::<u32>(pit::CVAL0).get() }
    }
}

//////////////////////////////////////////////////////////////////////////////
// GPIO

const fn port_pcr(port: usize, pin: u32) -> usize {
    0x4004_9000 + 0x1000 * port + 4 * pin as usize
}

const fn port_isfr(port: usize) -> usize {
    0x4004_9000 + 0x1000 * port + 0xA0
}

mod pcr {
    pub const PS: u32 = 1 << 0;
    pub const PE: u32 = 1 << 1;
    pub const SRE: u32 = 1 << 2;
    pub const PFE: u32 = 1 << 4;
    pub const DSE: u32 = 1 << 6;
    pub const MUX_GPIO: u32 = 1 << 8;
    pub const MUX_ALT3: u32 = 3 << 8;
    pub const IRQC_RISING: u32 = 0x9 << 16;
    pub const IRQC_FALLING: u32 = 0xA << 16;
}

#[derive(Copy, Clone)]
struct Gpio {
    port: usize,
    pin: u32,
}

impl Gpio {
    const fn base(self) -> usize {
        0x400F_F000 + 0x40 * self.port
    }

    fn configure(self, pcr: u32) {
        unsafe { reg::<u32>(port_pcr(self.port, self.pin)).set(pcr) }
    }

    fn set(self, high: bool) {
        let offset = if high { 0x04 } else { 0x08 };
        unsafe { reg::<u32>(self.base() + offset).set(1 << self.pin) }
    }

    fn toggle(self) {
        unsafe { reg::<u32>(self.base() + 0x0C).set(1 << self.pin) }
    }

    fn read(self) -> bool {
        unsafe { reg::<u32>(self.base() + 0x10).get() & (1 << self.pin) != 0 }
    }

    fn set_output(self, output: bool) {
        let pin = self.pin;
        modify32(self.base() + 0x14, |v| if output { v | (1 << pin) } else { v & !(1 << pin) });
    }
}

const PORT_A: usize = 0;
const PORT_B: usize = 1;
const PORT_C: usize = 2;
const PORT_D: usize = 3;

const LED: Gpio = Gpio { port: PORT_C, pin: 5 };
const BKPT: Gpio = Gpio { port: PORT_D, pin: 0 };
const DSCLK: Gpio = Gpio { port: PORT_A, pin: 12 };
const DATA_IN: Gpio = Gpio { port: PORT_A, pin: 13 };
const DATA_OUT: Gpio = Gpio { port: PORT_D, pin: 7 };
const TA: Gpio = Gpio { port: PORT_D, pin: 2 };
const RSTO: Gpio = Gpio { port: PORT_D, pin: 3 };
const RSTI: Gpio = Gpio { port: PORT_D, pin: 4 };

/// The activity LED on PTC5.
pub struct Led(());

impl Led {
    pub fn new() -> Self {
        LED.configure(pcr::MUX_GPIO);
        LED.set(false);
        LED.set_output(true);
        Self(())
    }

    pub fn set(&mut self, on: bool) {
        LED.set(on);
    }

    pub fn toggle(&mut self) {
        LED.toggle();
    }
}

/// The BDM connector.
///
/// RSTI and TA are open drain: asserting one drives it low, releasing it
/// turns the pin back into an input and lets the target's pull-up win.
pub struct CablePins(());

impl CablePins {
    /// Sets up the connector with every line at its idle level. The output
    /// latch is written before the direction, so BKPT never glitches into
    /// the asserted state.
    pub fn new(breakpoint: Polarity) -> Self {
        for pin in [DSCLK, DATA_OUT, BKPT] {
            pin.configure(pcr::MUX_GPIO | pcr::DSE);
        }
        DSCLK.set(false);
        DATA_OUT.set(false);
        BKPT.set(breakpoint.idle_level());
        for pin in [DSCLK, DATA_OUT, BKPT] {
            pin.set_output(true);
        }
        DATA_IN.configure(pcr::MUX_GPIO | pcr::PE | pcr::PS);
        for pin in [RSTI, TA] {
            pin.configure(pcr::MUX_GPIO | pcr::PE | pcr::PS);
            pin.set(false);
            pin.set_output(false);
        }
        // The port latches the RSTO edge in ISFR whether or not anyone
        // enables the interrupt.
        let edge = match breakpoint.reset_edge() {
            Edge::Falling => pcr::IRQC_FALLING,
            Edge::Rising => pcr::IRQC_RISING,
        };
        RSTO.configure(pcr::MUX_GPIO | pcr::PE | pcr::PS | edge);
        Self(())
    }
}

/// Whether RSTO has seen a target-reset edge since the last call.
pub fn take_target_reset() -> bool {
    let isfr = unsafe { reg::<u32>(port_isfr(RSTO.port)) };
    let bit = 1 << RSTO.pin;
    if isfr.get() & bit != 0 {
        // Write one to clear.
        isfr.set(bit);
        true
    } else {
        false
    }
}

impl Pins for CablePins {
    fn set_clock(&mut self, high: bool) {
        DSCLK.set(high);
    }

    fn set_data_out(&mut self, high: bool) {
        DATA_OUT.set(high);
    }

    fn data_in(&mut self) -> bool {
        DATA_IN.read()
    }

    fn set_breakpoint(&mut self, high: bool) {
        BKPT.set(high);
    }

    fn set_reset(&mut self, asserted: bool) {
        RSTI.set_output(asserted);
    }

    fn set_ta(&mut self, asserted: bool) {
        TA.set_output(asserted);
    }
}

//////////////////////////////////////////////////////////////////////////////
// UART0 console

mod uart {
    pub const BDH: usize = 0x4006_A000;
    pub const BDL: usize = 0x4006_A001;
    pub const C2: usize = 0x4006_A003;
    pub const S1: usize = 0x4006_A004;
    pub const D: usize = 0x4006_A007;
    pub const C4: usize = 0x4006_A00A;

    pub const C2_TE: u8 = 0x08;
    pub const S1_TDRE: u8 = 0x80;
}

/// Transmit-only UART0 on PTB17, 115200 8N1 off the core clock.
struct Uart0;

impl Uart0 {
    fn init() {
        unsafe { reg::<u32>(port_pcr(PORT_B, 16)) }.set(pcr::MUX_ALT3 | pcr::PE | pcr::PS | pcr::PFE);
        unsafe { reg::<u32>(port_pcr(PORT_B, 17)) }.set(pcr::MUX_ALT3 | pcr::DSE | pcr::SRE);
        modify32(sim::SCGC4, |v| v | sim::SCGC4_UART0);

        // 96MHz / (16 * 115200) = 52 + 3/32.
        unsafe {
            reg::<u8>(uart::C2).set(0);
            reg::<u8>(uart::BDH).set(0);
            reg::<u8>(uart::BDL).set(52);
            reg::<u8>(uart::C4).set(3);
            reg::<u8>(uart::C2).set(uart::C2_TE);
        }
    }

    fn write_byte(byte: u8) {
        let s1 = unsafe { reg::<u8>(uart::S1) };
        while s1.get() & uart::S1_TDRE == 0 {}
        unsafe { reg::<u8>(uart::D) }.set(byte);
    }
}

impl core::fmt::Write for Uart0 {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                Self::write_byte(b'\r');
            }
            Self::write_byte(byte);
        }
        Ok(())
    }
}

/// Blocking logger on the UART. Everything runs in one context, so there's
/// nobody to race with.
struct UartLogger;

impl Log for UartLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(Uart0, "{:<5} {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: UartLogger = UartLogger;

/// Brings up the UART and routes `log` output to it.
pub fn init_logger(level: LevelFilter) {
    Uart0::init();
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

//////////////////////////////////////////////////////////////////////////////
// USB-FS controller

mod usb0 {
    const BASE: usize = 0x4007_2000;

    pub const OTGISTAT: usize = BASE + 0x10;
    pub const ISTAT: usize = BASE + 0x80;
    pub const INTEN: usize = BASE + 0x84;
    pub const ERRSTAT: usize = BASE + 0x88;
    pub const ERREN: usize = BASE + 0x8C;
    pub const STAT: usize = BASE + 0x90;
    pub const CTL: usize = BASE + 0x94;
    pub const ADDR: usize = BASE + 0x98;
    pub const BDTPAGE1: usize = BASE + 0x9C;
    pub const BDTPAGE2: usize = BASE + 0xB0;
    pub const BDTPAGE3: usize = BASE + 0xB4;
    pub const ENDPT0: usize = BASE + 0xC0;
    pub const USBCTRL: usize = BASE + 0x100;
    pub const CONTROL: usize = BASE + 0x108;
    pub const USBTRC0: usize = BASE + 0x10C;

    pub const CTL_USBENSOFEN: u8 = 0x01;
    pub const CTL_ODDRST: u8 = 0x02;
    pub const CTL_TXSUSPENDTOKENBUSY: u8 = 0x20;
    pub const CONTROL_DPPULLUPNONOTG: u8 = 0x10;
    pub const USBTRC0_USBRESET: u8 = 0x80;
    /// Not in the manual, but the reset interrupt is unreliable without it.
    pub const USBTRC0_UNDOCUMENTED: u8 = 0x40;
}

fn usb_reg(address: usize) -> &'static VolatileCell<u8> {
    unsafe { reg::<u8>(address) }
}

/// The USB0 register block.
pub struct Usb0(());

impl Usb0 {
    /// Clocks and resets the controller and points it at `bdt`. The device
    /// stays invisible to the host until [`Usb0::connect`].
    pub fn init(bdt: &'static BufferDescriptorTable) -> Self {
        modify32(sim::SOPT2, |v| v | sim::SOPT2_USBSRC | sim::SOPT2_PLLFLLSEL);
        unsafe { reg::<u32>(sim::CLKDIV2) }.set(sim::CLKDIV2_USB_48MHZ);
        modify32(sim::SCGC4, |v| v | sim::SCGC4_USBOTG);

        let trc = usb_reg(usb0::USBTRC0);
        trc.set(trc.get() | usb0::USBTRC0_USBRESET);
        while trc.get() & usb0::USBTRC0_USBRESET != 0 {}

        // The table is 512-byte aligned, so the low 9 bits aren't stored.
        let table = bdt as *const BufferDescriptorTable as usize;
        usb_reg(usb0::BDTPAGE1).set((table >> 8) as u8);
        usb_reg(usb0::BDTPAGE2).set((table >> 16) as u8);
        usb_reg(usb0::BDTPAGE3).set((table >> 24) as u8);

        usb_reg(usb0::ISTAT).set(0xFF);
        usb_reg(usb0::ERRSTAT).set(0xFF);
        usb_reg(usb0::OTGISTAT).set(0xFF);
        trc.set(trc.get() | usb0::USBTRC0_UNDOCUMENTED);

        usb_reg(usb0::CTL).set(usb0::CTL_USBENSOFEN);
        usb_reg(usb0::USBCTRL).set(0);
        // Until the host resets us, that's the only thing worth hearing.
        usb_reg(usb0::INTEN).set(tbdm_pod::usb::interrupt::USBRST);
        Self(())
    }

    /// Enables the D+ pull-up.
    pub fn connect(&mut self) {
        usb_reg(usb0::CONTROL).set(usb0::CONTROL_DPPULLUPNONOTG);
    }
}

impl Controller for Usb0 {
    fn interrupt_status(&self) -> u8 {
        usb_reg(usb0::ISTAT).get()
    }

    fn clear_interrupts(&mut self, bits: u8) {
        usb_reg(usb0::ISTAT).set(bits);
    }

    fn error_status(&self) -> u8 {
        usb_reg(usb0::ERRSTAT).get()
    }

    fn clear_errors(&mut self, bits: u8) {
        usb_reg(usb0::ERRSTAT).set(bits);
    }

    fn token_status(&self) -> u8 {
        usb_reg(usb0::STAT).get()
    }

    fn address(&self) -> u8 {
        usb_reg(usb0::ADDR).get()
    }

    fn set_address(&mut self, address: u8) {
        usb_reg(usb0::ADDR).set(address);
    }

    fn set_endpoint_control(&mut self, endpoint: u8, bits: u8) {
        usb_reg(usb0::ENDPT0 + 4 * usize::from(endpoint)).set(bits);
    }

    fn reset_odd(&mut self) {
        let ctl = usb_reg(usb0::CTL);
        ctl.set(ctl.get() | usb0::CTL_ODDRST);
        ctl.set(ctl.get() & !usb0::CTL_ODDRST);
    }

    fn resume_tokens(&mut self) {
        let ctl = usb_reg(usb0::CTL);
        ctl.set(ctl.get() & !usb0::CTL_TXSUSPENDTOKENBUSY);
    }

    fn enable_interrupts(&mut self, interrupts: u8, errors: u8) {
        usb_reg(usb0::ERREN).set(errors);
        usb_reg(usb0::INTEN).set(interrupts);
    }
}
