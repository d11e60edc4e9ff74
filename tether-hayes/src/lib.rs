//! # hayes - AT command and response handling
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! Talks to a Hayes-compatible modem over a byte channel. Commands go out as
//! plain ASCII. Responses are collected a byte at a time into a fixed-size
//! buffer and checked against a `Predicate` after every byte, until the
//! predicate is satisfied or the time budget runs out.
//!
//! While waiting for bytes, `AtDevice` gives up the processor in short
//! quanta through its `Clock`, so a task using it only ever blocks for the
//! budget it asked for.
//!
//! The buffer holds CRLF-delimited lines; `lines` walks them without
//! touching the buffer.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[macro_use]
extern crate log;
extern crate tether;

use std::fmt;
use std::io;

use tether::timer::Clock;

// ****************************************************************************
//
// Sub-modules
//
// ****************************************************************************

pub mod stream;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// The serial link to the modem. Whatever moves the bytes (a DMA ring, a
/// UART, a TCP bridge) implements this.
pub trait CommandDevice {
	/// Send all of `data`.
	fn write(&mut self, data: &[u8]) -> io::Result<()>;
	/// How many received bytes are waiting to be read.
	fn available(&mut self) -> usize;
	/// Take the next received byte, if there is one.
	fn read_byte(&mut self) -> Option<u8>;
}

/// Decides whether the bytes received so far are the response we are
/// waiting for. Called after every byte, so it must be cheap and must not
/// have side effects.
pub trait Predicate {
	fn test(&self, response: &[u8]) -> bool;
}

/// Matches when the response ends with the given bytes.
#[derive(Debug, Copy, Clone)]
pub struct EndsWith<'a>(pub &'a [u8]);

/// Owns the `CommandDevice` and the response buffer.
pub struct AtDevice<D, C> {
	device: D,
	clock: C,
	buffer: Box<[u8]>,
	/// Bytes read into `buffer` so far
	read: usize,
}

/// Iterates over the CRLF-terminated lines in a response, without the CRLF.
/// A trailing partial line is not returned.
#[derive(Debug, Clone)]
pub struct Lines<'a> {
	rest: &'a [u8],
}

/// All possible AT layer errors
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
	/// The device refused a write
	Io(io::ErrorKind),
	/// The predicate wasn't satisfied in time
	Timeout,
	/// The response didn't fit in the buffer
	BufferFull,
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

pub const OK: EndsWith<'static> = EndsWith(b"OK\r\n");
pub const CONNECT: EndsWith<'static> = EndsWith(b"CONNECT\r\n");
pub const NO_CARRIER: EndsWith<'static> = EndsWith(b"NO CARRIER\r\n");
/// Any complete line.
pub const CRLF: EndsWith<'static> = EndsWith(b"\r\n");

/// Budget for a simple command that only answers `OK`.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// How long to give up the processor for when no bytes are waiting.
pub const POLL_QUANTUM_MS: u64 = 10;

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

/// Walk the CRLF-terminated lines of `buffer`.
pub fn lines(buffer: &[u8]) -> Lines {
	Lines { rest: buffer }
}

impl<D, C> AtDevice<D, C>
where
	D: CommandDevice,
	C: Clock,
{
	/// `capacity` is the longest response we will accept.
	pub fn new(device: D, clock: C, capacity: usize) -> AtDevice<D, C> {
		AtDevice {
			device: device,
			clock: clock,
			buffer: vec![0u8; capacity].into_boxed_slice(),
			read: 0,
		}
	}

	/// Send a command. The line terminator is added for you.
	pub fn at(&mut self, command: &str) -> Result<(), Error> {
		trace!("Tx: {:?}", command);
		self.write(command.as_bytes())?;
		self.write(b"\r\n")
	}

	/// Send raw bytes, with no terminator and no response handling.
	pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
		self.device.write(data).map_err(|e| {
			warn!("Write of {} bytes failed: {}", data.len(), e);
			Error::from(e)
		})
	}

	/// Empty the response buffer, then wait for `predicate`.
	pub fn await_response<P>(&mut self, predicate: &P, timeout_ms: u64) -> Result<(), Error>
	where
		P: Predicate + ?Sized,
	{
		self.clear();
		self.continue_response(predicate, timeout_ms)
	}

	/// Wait for `predicate`, keeping whatever is already in the response
	/// buffer. Use this when polling for a line which might arrive in
	/// pieces.
	pub fn continue_response<P>(&mut self, predicate: &P, timeout_ms: u64) -> Result<(), Error>
	where
		P: Predicate + ?Sized,
	{
		let start = self.clock.now();
		loop {
			while self.device.available() > 0 {
				if self.read == self.buffer.len() {
					warn!("Response buffer full ({} bytes)", self.read);
					return Err(Error::BufferFull);
				}
				match self.device.read_byte() {
					Some(byte) => {
						self.buffer[self.read] = byte;
						self.read += 1;
					}
					None => break,
				}
				if predicate.test(self.response()) {
					trace!("Rx: {:?}", String::from_utf8_lossy(self.response()));
					return Ok(());
				}
			}
			if self.clock.now().saturating_sub(start) >= timeout_ms {
				return Err(Error::Timeout);
			}
			self.clock.pause(POLL_QUANTUM_MS);
		}
	}

	/// Forget everything in the response buffer.
	pub fn clear(&mut self) {
		self.read = 0;
	}

	/// The bytes received since the buffer was last cleared.
	pub fn response(&self) -> &[u8] {
		&self.buffer[..self.read]
	}

	/// The complete lines received since the buffer was last cleared.
	pub fn lines(&self) -> Lines {
		lines(self.response())
	}

	/// Bytes waiting on the device which haven't been read into the
	/// buffer.
	pub fn available(&mut self) -> usize {
		self.device.available()
	}

	/// Move up to `limit` waiting bytes straight from the device to the end
	/// of `dest`, bypassing the response buffer. Returns how many moved.
	pub fn read_raw(&mut self, dest: &mut Vec<u8>, limit: usize) -> usize {
		let mut count = 0;
		while count < limit {
			match self.device.read_byte() {
				Some(byte) => dest.push(byte),
				None => break,
			}
			count += 1;
		}
		count
	}

	pub fn clock(&self) -> &C {
		&self.clock
	}

	pub fn capacity(&self) -> usize {
		self.buffer.len()
	}

	pub fn device(&self) -> &D {
		&self.device
	}

	pub fn device_mut(&mut self) -> &mut D {
		&mut self.device
	}
}

impl<'a> Lines<'a> {
	/// Whatever follows the last line returned.
	pub fn remainder(&self) -> &'a [u8] {
		self.rest
	}
}

impl<'a> Iterator for Lines<'a> {
	type Item = &'a [u8];

	fn next(&mut self) -> Option<&'a [u8]> {
		let end = self.rest.windows(2).position(|w| w == b"\r\n")?;
		let line = &self.rest[..end];
		self.rest = &self.rest[end + 2..];
		Some(line)
	}
}

impl<'a> Predicate for EndsWith<'a> {
	fn test(&self, response: &[u8]) -> bool {
		response.ends_with(self.0)
	}
}

impl<F> Predicate for F
where
	F: Fn(&[u8]) -> bool,
{
	fn test(&self, response: &[u8]) -> bool {
		self(response)
	}
}

impl<D: CommandDevice + ?Sized> CommandDevice for Box<D> {
	fn write(&mut self, data: &[u8]) -> io::Result<()> {
		(**self).write(data)
	}

	fn available(&mut self) -> usize {
		(**self).available()
	}

	fn read_byte(&mut self) -> Option<u8> {
		(**self).read_byte()
	}
}

/// Wrap io::Errors into hayes Errors easily
impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Io(e.kind())
	}
}

/// Don't log the whole buffer
impl<D, C> fmt::Debug for AtDevice<D, C> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(
			f,
			"AtDevice {{ read: {}, capacity: {} }}",
			self.read,
			self.buffer.len()
		)
	}
}

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
