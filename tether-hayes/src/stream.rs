//! # stream - A `CommandDevice` over any byte stream
//!
//! On a host there is no DMA ring buffer to read the modem from. This
//! adapter takes any non-blocking `Read + Write` (typically a `TcpStream` to
//! a serial bridge, set non-blocking) and buffers whatever has arrived so the
//! AT layer can count and take bytes one at a time.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::collections::VecDeque;
use std::io;
use std::io::prelude::*;
use std::thread;
use std::time::Duration;

use super::CommandDevice;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

pub struct StreamDevice<S> {
	stream: S,
	/// Read from the stream but not yet taken
	pending: VecDeque<u8>,
	/// The far end has gone, or the stream failed
	closed: bool,
}

// ****************************************************************************
//
// Private Data
//
// ****************************************************************************

const MAX_READ_LEN: usize = 512;
const WRITE_RETRY_MS: u64 = 1;

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl<S> StreamDevice<S>
where
	S: Read + Write,
{
	/// The stream should be non-blocking, otherwise `available` will stall
	/// until data arrives.
	pub fn new(stream: S) -> StreamDevice<S> {
		StreamDevice {
			stream: stream,
			pending: VecDeque::new(),
			closed: false,
		}
	}

	pub fn get_ref(&self) -> &S {
		&self.stream
	}

	pub fn is_closed(&self) -> bool {
		self.closed
	}

	/// Pull in everything the stream has for us right now.
	fn fill(&mut self) {
		if self.closed {
			return;
		}
		let mut buffer = [0u8; MAX_READ_LEN];
		loop {
			match self.stream.read(&mut buffer) {
				Ok(0) => {
					// Reading zero bytes means the connection is closed
					warn!("Stream closed by far end");
					self.closed = true;
					break;
				}
				Ok(len) => {
					trace!("Read {} octets", len);
					self.pending.extend(&buffer[..len]);
				}
				Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
				Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
				Err(err) => {
					warn!("Read error: {}", err);
					self.closed = true;
					break;
				}
			}
		}
	}
}

impl<S> CommandDevice for StreamDevice<S>
where
	S: Read + Write,
{
	fn write(&mut self, data: &[u8]) -> io::Result<()> {
		let mut sent = 0;
		while sent < data.len() {
			match self.stream.write(&data[sent..]) {
				Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
				Ok(len) => {
					if len < data.len() - sent {
						debug!("Sent {} of {}", len, data.len() - sent);
					}
					sent += len;
				}
				Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
					thread::sleep(Duration::from_millis(WRITE_RETRY_MS));
				}
				Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
				Err(err) => return Err(err),
			}
		}
		self.stream.flush()
	}

	fn available(&mut self) -> usize {
		self.fill();
		self.pending.len()
	}

	fn read_byte(&mut self) -> Option<u8> {
		if self.pending.is_empty() {
			self.fill();
		}
		self.pending.pop_front()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	/// Hands out canned reads, then `WouldBlock` or EOF.
	struct Pipe {
		reads: VecDeque<Vec<u8>>,
		eof: bool,
		written: Vec<u8>,
		/// Accept at most this many bytes per write call
		write_limit: usize,
		blocked_writes: usize,
	}

	impl Pipe {
		fn new(reads: &[&[u8]]) -> Pipe {
			Pipe {
				reads: reads.iter().map(|r| r.to_vec()).collect(),
				eof: false,
				written: Vec::new(),
				write_limit: usize::max_value(),
				blocked_writes: 0,
			}
		}
	}

	impl Read for Pipe {
		fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
			match self.reads.pop_front() {
				Some(data) => {
					buf[..data.len()].copy_from_slice(&data);
					Ok(data.len())
				}
				None if self.eof => Ok(0),
				None => Err(io::ErrorKind::WouldBlock.into()),
			}
		}
	}

	impl Write for Pipe {
		fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
			if self.blocked_writes > 0 {
				self.blocked_writes -= 1;
				return Err(io::ErrorKind::WouldBlock.into());
			}
			let len = buf.len().min(self.write_limit);
			self.written.extend_from_slice(&buf[..len]);
			Ok(len)
		}

		fn flush(&mut self) -> io::Result<()> {
			Ok(())
		}
	}

	#[test]
	fn buffers_what_has_arrived() {
		let mut dev = StreamDevice::new(Pipe::new(&[b"OK", b"\r\n"]));
		assert_eq!(dev.available(), 4);
		assert_eq!(dev.read_byte(), Some(b'O'));
		assert_eq!(dev.available(), 3);
		assert!(!dev.is_closed());
	}

	#[test]
	fn empty_stream_is_not_closed() {
		let mut dev = StreamDevice::new(Pipe::new(&[]));
		assert_eq!(dev.available(), 0);
		assert_eq!(dev.read_byte(), None);
		assert!(!dev.is_closed());
	}

	#[test]
	fn eof_marks_closed() {
		let mut pipe = Pipe::new(&[b"NO CARRIER\r\n"]);
		pipe.eof = true;
		let mut dev = StreamDevice::new(pipe);
		assert_eq!(dev.available(), 12);
		assert!(dev.is_closed());
	}

	#[test]
	fn partial_and_blocked_writes_complete() {
		let mut pipe = Pipe::new(&[]);
		pipe.write_limit = 3;
		pipe.blocked_writes = 2;
		let mut dev = StreamDevice::new(pipe);
		dev.write(b"AT#SGACT?\r\n").unwrap();
		assert_eq!(dev.get_ref().written, b"AT#SGACT?\r\n".to_vec());
	}
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
