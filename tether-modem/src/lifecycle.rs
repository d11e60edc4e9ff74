//! # lifecycle - Powering the modem up and getting it onto the network
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! PowerOff -> PoweringOn -> PowerOn -> Connected, with the enable line
//! pulsed on the way to PowerOn. Configuration or PDP failures send us back
//! to PoweringOn, with an escape sequence first if the modem might still be
//! in data mode.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::mem;
use std::str;
use std::sync::atomic::Ordering;

use hayes::{self, CommandDevice};
use tether::timer::Clock;

use super::{
	CfmSleep, Error, Event, ModemState, PowerPins, ReplyContext, ReqSleep, ServiceUserHandle, Storage,
	TaskContext,
};

// ****************************************************************************
//
// Private Data
//
// ****************************************************************************

/// Each edge of the enable pulse is held this long
const POWER_PULSE_MS: u64 = 1500;
/// Boot time after the pulse before the modem will answer
const POWER_SETTLE_MS: u64 = 15_000;
const REACTIVATE_DELAY_MS: u64 = 1000;
/// Silence needed either side of the escape sequence
const ESCAPE_GUARD_MS: u64 = 1000;
const PDP_ACTIVATE_TIMEOUT_MS: u64 = 10_000;

const ESCAPE_SEQUENCE: &[u8] = b"+++";

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************

impl<D, C, S, P> TaskContext<D, C, S, P>
where
	D: CommandDevice,
	C: Clock,
	S: Storage,
	P: PowerPins,
{
	/// Move to `state` and tell ourselves about it.
	pub(crate) fn set_state(&mut self, state: ModemState) {
		let from = self.state;
		self.force_state(state);
		self.tell(Event::StateChange {
			from: from,
			to: state,
		});
	}

	/// Move to `state` without a `StateChange`. Whoever calls this arranges
	/// the next step themselves.
	fn force_state(&mut self, state: ModemState) {
		if state != self.state {
			info!("{:?} -> {:?}", self.state, state);
		}
		self.state = state;
		self.connected
			.store(state == ModemState::Connected, Ordering::Release);
	}

	pub(crate) fn handle_state_change(&mut self, from: ModemState, to: ModemState) {
		if to != self.state {
			debug!("Stale change {:?} -> {:?} (now {:?})", from, to, self.state);
			return;
		}
		match to {
			ModemState::PowerOff => {
				self.apply_pending_sleep();
				if self.wake_while_powering_off {
					self.wake_while_powering_off = false;
					self.tell(Event::Wake);
				}
			}
			ModemState::PoweringOn => self.tell(Event::Activate(0)),
			ModemState::PowerOn => {
				self.apply_pending_sleep();
				self.tell(Event::Configure);
			}
			ModemState::Connected => {
				if !self.queue.is_empty() && self.exchange.is_none() {
					self.tell(Event::HttpOpen);
				}
			}
			ModemState::PoweringOff => {}
		}
	}

	pub(crate) fn handle_wake(&mut self) {
		match self.state {
			ModemState::PowerOff => self.set_state(ModemState::PoweringOn),
			ModemState::PoweringOff => {
				debug!("Will wake once powered off");
				self.wake_while_powering_off = true;
			}
			_ => debug!("Already awake ({:?})", self.state),
		}
	}

	pub(crate) fn handle_sleep(&mut self, req: ReqSleep, reply_to: ServiceUserHandle) {
		let reply = ReplyContext {
			reply_to: reply_to,
			context: req.context,
		};
		match self.state {
			ModemState::PoweringOn | ModemState::PoweringOff => {
				debug!("Sleep held until {:?} completes", self.state);
				self.sleep_pending.push(reply);
			}
			_ => self.apply_sleep(reply),
		}
	}

	fn apply_pending_sleep(&mut self) {
		for reply in mem::take(&mut self.sleep_pending) {
			self.apply_sleep(reply);
		}
	}

	fn apply_sleep(&self, reply: ReplyContext) {
		warn!("Sleep not implemented - staying {:?}", self.state);
		let cfm = CfmSleep {
			context: reply.context,
			result: Err(Error::NotImplemented),
		};
		reply.reply_to.send_confirm(cfm.into());
	}

	/// One step of the power-on sequence: enable low, high, low, then wait
	/// for the modem to boot.
	pub(crate) fn handle_activate(&mut self, phase: u8) {
		if self.state != ModemState::PoweringOn {
			debug!("Dropping activation step {} in {:?}", phase, self.state);
			return;
		}
		match phase {
			0 => {
				info!("Activating...");
				self.pins.set_ready(false);
				self.pins.set_enable(false);
				self.tell_after(Event::Activate(1), POWER_PULSE_MS);
			}
			1 => {
				self.pins.set_enable(true);
				self.tell_after(Event::Activate(2), POWER_PULSE_MS);
			}
			2 => {
				self.pins.set_enable(false);
				self.tell_after(Event::Activate(3), POWER_SETTLE_MS);
			}
			3 => {
				info!("Activated");
				self.set_state(ModemState::PowerOn);
			}
			_ => warn!("No activation step {}", phase),
		}
	}

	pub(crate) fn handle_configure(&mut self) {
		if self.state != ModemState::PowerOn {
			debug!("Dropping configure in {:?}", self.state);
			return;
		}
		info!("Configuring...");
		match self.configure() {
			Ok(()) => {
				info!("Configure success");
				self.tell(Event::PdpEnable);
			}
			Err(e) => {
				error!("Configure failed: {:?}", e);
				// The modem may be sitting in data mode
				self.force_state(ModemState::PoweringOn);
				self.escape(Event::Activate(0));
			}
		}
	}

	/// Echo off, then flow control off.
	fn configure(&mut self) -> Result<(), Error> {
		for command in &["ATE0", "AT&K=0"] {
			self.at.at(command)?;
			self.at.await_response(&hayes::OK, hayes::DEFAULT_TIMEOUT_MS)?;
		}
		Ok(())
	}

	pub(crate) fn handle_pdp_enable(&mut self) {
		if self.state != ModemState::PowerOn {
			debug!("Dropping PDP enable in {:?}", self.state);
			return;
		}
		info!("PDP context enable...");
		match self.pdp_enable() {
			Ok(()) => {
				info!("PDP enable success");
				self.set_state(ModemState::Connected);
			}
			Err(e) => {
				error!("PDP enable failed: {:?}", e);
				self.reactivate();
			}
		}
	}

	fn pdp_enable(&mut self) -> Result<(), Error> {
		let cid = self.config.context_id;
		self.at.at("AT#SGACT?")?;
		self.at.await_response(&hayes::OK, hayes::DEFAULT_TIMEOUT_MS)?;
		let active = self
			.at
			.lines()
			.filter_map(parse_sgact)
			.any(|(id, stat)| id == cid && stat == 1);
		if active {
			debug!("Context {} already active", cid);
			return Ok(());
		}
		self.at
			.at(&format!("AT+CGDCONT={},\"IP\",\"{}\"", cid, self.config.apn))?;
		self.at.await_response(&hayes::OK, hayes::DEFAULT_TIMEOUT_MS)?;
		self.at.at(&format!("AT#SGACT={},1", cid))?;
		self.at.await_response(&hayes::OK, PDP_ACTIVATE_TIMEOUT_MS)?;
		Ok(())
	}

	/// Get the modem back to command mode, then post `follow_up`.
	pub(crate) fn escape(&mut self, follow_up: Event) {
		debug!("Escape, then {:?}", follow_up);
		self.tell_after(Event::Escape(Box::new(follow_up)), ESCAPE_GUARD_MS);
	}

	pub(crate) fn handle_escape(&mut self, follow_up: Event) {
		if let Err(e) = self.at.write(ESCAPE_SEQUENCE) {
			warn!("Escape not sent: {:?}", e);
		}
		self.tell_after(follow_up, ESCAPE_GUARD_MS);
	}

	/// Drop whatever we were doing and start again from power-on. Whatever
	/// is left at the head of the queue is opened once we reconnect.
	pub(crate) fn reactivate(&mut self) {
		warn!("Reactivating from {:?}", self.state);
		self.abandon_exchange();
		self.force_state(ModemState::PoweringOn);
		self.tell_after(Event::Activate(0), REACTIVATE_DELAY_MS);
	}
}

/// Pick `(cid, stat)` out of a `#SGACT: <cid>,<stat>` line.
fn parse_sgact(line: &[u8]) -> Option<(u8, u8)> {
	let line = str::from_utf8(line).ok()?;
	let mut fields = line.trim().strip_prefix("#SGACT:")?.split(',');
	let cid = fields.next()?.trim().parse().ok()?;
	let stat = fields.next()?.trim().parse().ok()?;
	Some((cid, stat))
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
