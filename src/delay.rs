// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Busy-wait delays.
//!
//! Both the BDM transport and the reset/halt sequences need minimum hold times
//! on their signals. There's no scheduler to yield to, and the bit timing has
//! to be uninterrupted anyway, so every wait in this firmware is a spin on a
//! free-running countdown timer (PIT channel 0 on the Kinetis parts).

/// A free-running timer that counts *down* and wraps from zero back to its
/// reload value.
pub trait Countdown {
    /// Current value of the counter.
    fn current(&self) -> u32;
}

/// Something that can stall the CPU for a while.
///
/// The BDM engine is generic over this so tests don't have to actually sit
/// around waiting.
pub trait Wait {
    /// Spin for at least `us` microseconds.
    fn wait_us(&mut self, us: u32);

    /// Spin for at least `ms` milliseconds.
    fn wait_ms(&mut self, ms: u32) {
        for _ in 0..ms {
            self.wait_us(1000);
        }
    }
}

/// Busy-wait delay on top of a [`Countdown`].
pub struct Delay<C> {
    timer: C,
    ticks_per_us: u32,
}

impl<C: Countdown> Delay<C> {
    /// Wraps `timer`, which decrements once per cycle of a `clock_hz` clock.
    pub fn new(timer: C, clock_hz: u32) -> Self {
        Self {
            timer,
            // Round up, so a slow clock still gives us at least the requested
            // time rather than nothing at all.
            ticks_per_us: (clock_hz + 999_999) / 1_000_000,
        }
    }

    /// Number of timer ticks that elapse per microsecond.
    pub fn ticks_per_us(&self) -> u32 {
        self.ticks_per_us
    }

    /// Spin until `ticks` timer ticks have passed.
    ///
    /// Elapsed time is computed as `start - now` with wrapping arithmetic,
    /// which is correct across the counter's wrap as long as a single wait is
    /// shorter than a full timer period.
    pub fn wait_ticks(&self, ticks: u32) {
        let start = self.timer.current();
        while start.wrapping_sub(self.timer.current()) < ticks {}
    }
}

impl<C: Countdown> Wait for Delay<C> {
    fn wait_us(&mut self, us: u32) {
        self.wait_ticks(us.saturating_mul(self.ticks_per_us));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Counts down by one every time somebody looks at it.
    struct Ticker {
        value: Cell<u32>,
        reads: Cell<u32>,
    }

    impl Ticker {
        fn starting_at(value: u32) -> Self {
            Self { value: Cell::new(value), reads: Cell::new(0) }
        }
    }

    impl Countdown for &Ticker {
        fn current(&self) -> u32 {
            let v = self.value.get();
            self.value.set(v.wrapping_sub(1));
            self.reads.set(self.reads.get() + 1);
            v
        }
    }

    #[test]
    fn waits_for_requested_ticks() {
        let ticker = Ticker::starting_at(1_000);
        let mut delay = Delay::new(&ticker, 48_000_000);
        assert_eq!(delay.ticks_per_us(), 48);

        delay.wait_us(10);
        // One read for the start value, then one per poll until 480 ticks
        // have gone by.
        assert_eq!(ticker.reads.get(), 481);
    }

    #[test]
    fn survives_counter_wrap() {
        let ticker = Ticker::starting_at(5);
        let delay = Delay::new(&ticker, 1_000_000);

        delay.wait_ticks(20);
        assert_eq!(ticker.reads.get(), 21);
        assert_eq!(ticker.value.get(), 5u32.wrapping_sub(21));
    }

    #[test]
    fn slow_clock_rounds_up() {
        let ticker = Ticker::starting_at(0);
        let delay = Delay::new(&ticker, 32_768);
        assert_eq!(delay.ticks_per_us(), 1);
    }

    #[test]
    fn milliseconds_are_built_from_microseconds() {
        struct Tally(u64);
        impl Wait for Tally {
            fn wait_us(&mut self, us: u32) {
                self.0 += u64::from(us);
            }
        }

        let mut tally = Tally(0);
        tally.wait_ms(50);
        assert_eq!(tally.0, 50_000);
    }
}
