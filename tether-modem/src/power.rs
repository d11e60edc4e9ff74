//! # power - The modem's two control lines
//!
//! The enable line is pulsed to switch the modem on. The ready line is our
//! side of the serial flow control and is driven low before the pulse so the
//! modem is free to talk to us.

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Drives the modem's digital control inputs.
pub trait PowerPins {
	/// Set the level of the enable (ON/OFF) line.
	fn set_enable(&mut self, high: bool);
	/// Set the level of the ready (RTS) line.
	fn set_ready(&mut self, high: bool);
}

/// For hosts with no GPIO, where the modem is powered some other way. Just
/// logs what would have happened.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoPins;

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl PowerPins for NoPins {
	fn set_enable(&mut self, high: bool) {
		debug!("Enable line {}", level(high));
	}

	fn set_ready(&mut self, high: bool) {
		debug!("Ready line {}", level(high));
	}
}

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************

fn level(high: bool) -> &'static str {
	if high {
		"high"
	} else {
		"low"
	}
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
