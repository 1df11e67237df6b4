// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The GPIO side of the BDM cable.

/// Lines the transport needs to drive or sample.
///
/// Levels are electrical (`true` = high) for the clock and data lines. The
/// reset and TA lines are open-drain and active low on every target we know
/// about, so those take "asserted" instead and the implementation decides how
/// to get there (usually by flipping the pin direction).
pub trait Pins {
    /// DSCLK, the debug serial clock.
    fn set_clock(&mut self, high: bool);
    /// Data from the pod to the target (the target's DSI).
    fn set_data_out(&mut self, high: bool);
    /// Data from the target to the pod (the target's DSO).
    fn data_in(&mut self) -> bool;
    /// BKPT. Whether high or low means "asserted" depends on the cable, see
    /// [`Polarity`].
    fn set_breakpoint(&mut self, high: bool);
    /// RSTI.
    fn set_reset(&mut self, asserted: bool);
    /// TA.
    fn set_ta(&mut self, asserted: bool);
}

/// Which level on the BKPT pin asserts the target's breakpoint input.
///
/// Plain cables wire the pin straight through, so BKPT is active low. Some
/// cables put an inverting buffer in between.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Polarity {
    ActiveLow,
    ActiveHigh,
}

impl Polarity {
    /// Electrical level that puts the line into the requested state.
    pub const fn level(self, asserted: bool) -> bool {
        match self {
            Polarity::ActiveLow => !asserted,
            Polarity::ActiveHigh => asserted,
        }
    }

    /// Level to park the pin at, before anything else has touched it.
    pub const fn idle_level(self) -> bool {
        self.level(false)
    }

    /// Edge on RSTO that means the target went into reset. A cable that
    /// inverts BKPT runs RSTO through the same buffer.
    pub const fn reset_edge(self) -> Edge {
        match self {
            Polarity::ActiveLow => Edge::Falling,
            Polarity::ActiveHigh => Edge::Rising,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Edge {
    Falling,
    Rising,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straight_cable_idles_high() {
        assert!(Polarity::ActiveLow.idle_level());
        assert!(!Polarity::ActiveLow.level(true));
        assert_eq!(Polarity::ActiveLow.reset_edge(), Edge::Falling);
    }

    #[test]
    fn inverting_cable_idles_low() {
        assert!(!Polarity::ActiveHigh.idle_level());
        assert!(Polarity::ActiveHigh.level(true));
        assert_eq!(Polarity::ActiveHigh.reset_edge(), Edge::Rising);
    }
}
