//! # transport - HTTP requests through the modem's socket dial
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! One exchange at a time, for the request at the head of the queue:
//!
//! * Open - take the storage bus (file bodies only), dial the host and send
//!   the request head.
//! * Write - the body as a single chunk, a slice per step, then the last
//!   chunk.
//! * ReadStatus / ReadHeader - a line per step.
//! * ReadBody - `Content-Length` bytes, a slice per step.
//! * Over - wait for the server to close, then confirm.
//!
//! Every step that fails sends the modem back to power-on.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::cmp;
use std::io;
use std::str;

use http::header;

use hayes::{self, CommandDevice};
use tether::timer::Clock;

use super::{
	Body, CfmSubmit, Error, Event, HttpRequest, HttpResponse, ModemState, PowerPins, Queued, ReqSubmit,
	ServiceUserHandle, StatusCode, Storage, TaskContext,
};

// ****************************************************************************
//
// Private Types
//
// ****************************************************************************

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Step {
	Open,
	Write,
	ReadStatus,
	ReadHeader,
	ReadBody,
	Over,
}

/// The state of the exchange in flight.
pub(crate) struct Exchange<F> {
	step: Step,
	/// We hold the storage bus
	bus_held: bool,
	file: Option<F>,
	/// The chunk header has gone
	chunk_started: bool,
	/// Body length being sent
	length: u64,
	/// Body bytes still to send, then response body bytes still to read
	remaining: u64,
	/// When the current step started, for the read timeout
	started: u64,
	response: Option<HttpResponse>,
	body_allocated: bool,
}

enum Progress {
	Done,
	More,
	/// Not enough bytes have arrived yet
	Waiting,
}

// ****************************************************************************
//
// Private Data
//
// ****************************************************************************

const DIAL_TIMEOUT_MS: u64 = 10_000;
const CLOSE_TIMEOUT_MS: u64 = 2000;
const BUS_RETRY_MS: u64 = 100;
const HEAD_TO_BODY_MS: u64 = 100;
const WRITE_PACING_MS: u64 = 50;
const WRITE_SLICE_LEN: usize = 128;
/// How long each status/header step waits for a line
const LINE_WAIT_MS: u64 = 100;
const STATUS_RETRY_MS: u64 = 50;
const BODY_SLICE_LEN: usize = 256;
const BODY_POLL_MS: u64 = 10;

/// The whole body when there isn't one
const EMPTY_BODY: &[u8] = b"0\r\n\r\n";
/// End of our single chunk, then the last chunk
const BODY_END: &[u8] = b"\r\n0\r\n\r\n";

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************

impl<F> Exchange<F> {
	fn new(bus_held: bool, now: u64) -> Exchange<F> {
		Exchange {
			step: Step::Open,
			bus_held: bus_held,
			file: None,
			chunk_started: false,
			length: 0,
			remaining: 0,
			started: now,
			response: None,
			body_allocated: false,
		}
	}
}

impl<D, C, S, P> TaskContext<D, C, S, P>
where
	D: CommandDevice,
	C: Clock,
	S: Storage,
	P: PowerPins,
{
	pub(crate) fn handle_submit(&mut self, req: ReqSubmit, reply_to: ServiceUserHandle) {
		info!(
			"Queued {} {}{} ({} ahead)",
			req.request.method,
			req.request.host,
			req.request.path,
			self.queue.len()
		);
		self.queue.push_back(Queued {
			context: req.context,
			request: req.request,
			reply_to: reply_to,
			attempts: 0,
		});
		if self.state != ModemState::Connected {
			self.tell(Event::Wake);
		} else if self.exchange.is_none() {
			self.tell(Event::HttpOpen);
		}
	}

	/// Only true if the exchange in flight is waiting for `step`.
	fn expecting(&self, step: Step) -> bool {
		let current = self.exchange.as_ref().map(|x| x.step);
		if self.state == ModemState::Connected && current == Some(step) {
			true
		} else {
			debug!("Dropping {:?} step (at {:?}, {:?})", step, current, self.state);
			false
		}
	}

	fn set_step(&mut self, step: Step) {
		let now = self.now();
		if let Some(x) = self.exchange.as_mut() {
			trace!("{:?} -> {:?}", x.step, step);
			x.step = step;
			x.started = now;
		}
	}

	pub(crate) fn http_open(&mut self) {
		if self.state != ModemState::Connected {
			debug!("Open waits for connection");
			return;
		}
		if self.exchange.is_some() {
			debug!("Exchange already in flight");
			return;
		}
		let file_upload = match self.queue.front() {
			Some(q) => q.request.is_file_upload(),
			None => {
				debug!("Nothing to send");
				return;
			}
		};
		if file_upload && !self.storage.try_acquire_bus() {
			debug!("Open deferred: {:?}", Error::ResourceBusy);
			self.tell_after(Event::HttpOpen, BUS_RETRY_MS);
			return;
		}
		let now = self.now();
		self.exchange = Some(Exchange::new(file_upload, now));
		if let Some(q) = self.queue.front_mut() {
			q.attempts += 1;
		}
		match self.open() {
			Ok(()) => {
				self.set_step(Step::Write);
				self.tell_after(Event::HttpWrite, HEAD_TO_BODY_MS);
			}
			Err(e) => {
				error!("HTTP open failed: {:?}", e);
				self.exchange_failed(e);
			}
		}
	}

	fn open(&mut self) -> Result<(), Error> {
		let (dial, head) = match self.queue.front() {
			Some(q) => (
				format!(
					"AT#SD={},0,{},\"{}\"",
					self.config.context_id, self.config.port, q.request.host
				),
				render_head(&q.request),
			),
			None => return Err(Error::ProtocolMismatch),
		};
		self.at.at(&dial)?;
		self.at.await_response(&hayes::CONNECT, DIAL_TIMEOUT_MS)?;
		debug!("HTTP request start");
		self.at.write(head.as_bytes())?;
		Ok(())
	}

	pub(crate) fn http_write(&mut self) {
		if !self.expecting(Step::Write) {
			return;
		}
		match self.write_body() {
			Ok(false) => self.tell_after(Event::HttpWrite, WRITE_PACING_MS),
			Ok(true) => {
				debug!("Request sent");
				self.release_storage();
				self.at.clear();
				self.set_step(Step::ReadStatus);
				self.tell_after(Event::HttpReadStatus, WRITE_PACING_MS);
			}
			Err(e) => {
				error!("HTTP write failed: {:?}", e);
				self.exchange_failed(e);
			}
		}
	}

	/// Send the next piece of the body. True once the last chunk has gone.
	fn write_body(&mut self) -> Result<bool, Error> {
		let request = match self.queue.front() {
			Some(q) => &q.request,
			None => return Err(Error::ProtocolMismatch),
		};
		let exchange = match self.exchange.as_mut() {
			Some(x) => x,
			None => return Err(Error::ProtocolMismatch),
		};

		if !exchange.chunk_started {
			exchange.chunk_started = true;
			exchange.length = match request.body {
				Body::Empty => 0,
				Body::Memory(ref data) => data.len() as u64,
				Body::File(ref path) => match (self.storage.length(path), self.storage.open(path)) {
					(Some(length), Some(file)) => {
						exchange.file = Some(file);
						length
					}
					(_, file) => {
						warn!("Can't read {} - sending empty body", path.display());
						if let Some(file) = file {
							self.storage.close(file);
						}
						0
					}
				},
			};
			exchange.remaining = exchange.length;
			info!("Sending {} byte body", exchange.length);
			if exchange.length == 0 {
				self.at.write(EMPTY_BODY)?;
				return Ok(true);
			}
			self.at.write(format!("{:x}\r\n", exchange.length).as_bytes())?;
			return Ok(false);
		}

		if exchange.remaining == 0 {
			self.at.write(BODY_END)?;
			return Ok(true);
		}

		let mut slice = [0u8; WRITE_SLICE_LEN];
		let want = cmp::min(WRITE_SLICE_LEN as u64, exchange.remaining) as usize;
		let count = match request.body {
			Body::Memory(ref data) => {
				let offset = (exchange.length - exchange.remaining) as usize;
				slice[..want].copy_from_slice(&data[offset..offset + want]);
				want
			}
			Body::File(_) => match exchange.file.as_mut() {
				Some(file) => self.storage.read(file, &mut slice[..want])?,
				None => 0,
			},
			Body::Empty => 0,
		};
		if count == 0 {
			// The file got shorter since we sized it
			return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
		}
		exchange.remaining -= count as u64;
		self.at.write(&slice[..count])?;
		Ok(false)
	}

	pub(crate) fn http_read_status(&mut self) {
		if !self.expecting(Step::ReadStatus) {
			return;
		}
		match self.at.continue_response(&hayes::CRLF, LINE_WAIT_MS) {
			Ok(()) => {
				let line = trim_line(self.at.response()).to_vec();
				self.at.clear();
				if line.is_empty() {
					self.tell(Event::HttpReadStatus);
					return;
				}
				match parse_status(&line) {
					Some(status) => {
						debug!("Status {}", status);
						if let Some(x) = self.exchange.as_mut() {
							x.response = Some(HttpResponse::new(status));
						}
						self.set_step(Step::ReadHeader);
						self.tell_after(Event::HttpReadHeader, STATUS_RETRY_MS);
					}
					None => {
						error!("Bad status line {:?}", String::from_utf8_lossy(&line));
						self.exchange_failed(Error::ProtocolMismatch);
					}
				}
			}
			Err(hayes::Error::Timeout) => self.retry_read(Event::HttpReadStatus, STATUS_RETRY_MS),
			Err(e) => {
				error!("Reading status failed: {:?}", e);
				self.exchange_failed(e.into());
			}
		}
	}

	pub(crate) fn http_read_header(&mut self) {
		if !self.expecting(Step::ReadHeader) {
			return;
		}
		match self.at.continue_response(&hayes::CRLF, LINE_WAIT_MS) {
			Ok(()) => {
				let end_of_headers = {
					let line = trim_line(self.at.response());
					if !line.is_empty() {
						if let Some(r) = self.exchange.as_mut().and_then(|x| x.response.as_mut()) {
							apply_header(r, line);
						}
					}
					line.is_empty()
				};
				self.at.clear();
				if end_of_headers {
					self.set_step(Step::ReadBody);
					self.tell(Event::HttpReadBody);
				} else {
					self.tell(Event::HttpReadHeader);
				}
			}
			Err(hayes::Error::Timeout) => self.retry_read(Event::HttpReadHeader, 0),
			Err(e) => {
				error!("Reading headers failed: {:?}", e);
				self.exchange_failed(e.into());
			}
		}
	}

	pub(crate) fn http_read_body(&mut self) {
		if !self.expecting(Step::ReadBody) {
			return;
		}
		match self.read_body() {
			Ok(Progress::Done) => {
				self.set_step(Step::Over);
				self.tell(Event::HttpOver);
			}
			Ok(Progress::More) => self.tell(Event::HttpReadBody),
			Ok(Progress::Waiting) => self.retry_read(Event::HttpReadBody, BODY_POLL_MS),
			Err(e) => {
				error!("Reading body failed: {:?}", e);
				self.exchange_failed(e);
			}
		}
	}

	fn read_body(&mut self) -> Result<Progress, Error> {
		let exchange = self.exchange.as_mut().ok_or(Error::ProtocolMismatch)?;
		let response = exchange.response.as_mut().ok_or(Error::ProtocolMismatch)?;
		if response.chunked {
			warn!("Chunked response - body dropped");
			return Ok(Progress::Done);
		}
		if response.content_length == 0 {
			return Ok(Progress::Done);
		}
		if !exchange.body_allocated {
			if response.content_length > self.config.max_body_len as u64 {
				error!(
					"{} byte body is over the {} byte limit",
					response.content_length, self.config.max_body_len
				);
				return Err(Error::AllocationFailure);
			}
			response
				.body
				.try_reserve_exact(response.content_length as usize)
				.map_err(|_| Error::AllocationFailure)?;
			exchange.body_allocated = true;
			exchange.remaining = response.content_length;
			return Ok(Progress::More);
		}
		let limit = cmp::min(BODY_SLICE_LEN as u64, exchange.remaining) as usize;
		if self.at.available() < limit {
			return Ok(Progress::Waiting);
		}
		let count = self.at.read_raw(&mut response.body, limit);
		exchange.remaining -= count as u64;
		if exchange.remaining == 0 {
			Ok(Progress::Done)
		} else {
			Ok(Progress::More)
		}
	}

	pub(crate) fn http_over(&mut self) {
		if !self.expecting(Step::Over) {
			return;
		}
		if let Err(e) = self.at.await_response(&hayes::NO_CARRIER, CLOSE_TIMEOUT_MS) {
			error!("Connection didn't close: {:?}", e);
			self.exchange_failed(e.into());
			return;
		}
		let response = self.finish_exchange();
		match (self.queue.pop_front(), response) {
			(Some(q), Some(response)) => {
				info!("{} {} -> {}", q.request.method, q.request.path, response.status);
				let cfm = CfmSubmit {
					context: q.context,
					response: response,
				};
				q.reply_to.send_confirm(cfm.into());
			}
			_ => warn!("Exchange over with nobody to tell"),
		}
		if !self.queue.is_empty() {
			self.tell(Event::HttpOpen);
		}
	}

	/// Retry a read step, unless it has run out of time.
	fn retry_read(&mut self, event: Event, delay_ms: u64) {
		let started = self.exchange.as_ref().map_or(0, |x| x.started);
		if self.now().saturating_sub(started) >= self.config.read_timeout_ms {
			error!("Timed out at {:?}", event);
			self.exchange_failed(Error::Hayes(hayes::Error::Timeout));
		} else if delay_ms == 0 {
			self.tell(event);
		} else {
			self.tell_after(event, delay_ms);
		}
	}

	/// Start again from power-on. The request in flight goes again once we
	/// are reconnected, unless it can never succeed or has had all its
	/// attempts, in which case it is dropped without an answer.
	fn exchange_failed(&mut self, e: Error) {
		let hopeless = match e {
			Error::AllocationFailure | Error::ProtocolMismatch => true,
			_ => false,
		};
		let attempts = self.queue.front().map_or(0, |q| q.attempts);
		if hopeless || attempts >= self.config.max_attempts {
			if let Some(q) = self.queue.pop_front() {
				error!(
					"Dropping {} {}{} after {} attempt(s): {:?}",
					q.request.method, q.request.host, q.request.path, attempts, e
				);
			}
		}
		self.reactivate();
	}

	/// Close any open file and give the bus back.
	fn release_storage(&mut self) {
		if let Some(x) = self.exchange.as_mut() {
			if let Some(file) = x.file.take() {
				self.storage.close(file);
			}
			if x.bus_held {
				x.bus_held = false;
				self.storage.release_bus();
			}
		}
	}

	fn finish_exchange(&mut self) -> Option<HttpResponse> {
		self.release_storage();
		self.exchange.take().and_then(|x| x.response)
	}

	/// Throw away the exchange in flight, if any. The request stays queued.
	pub(crate) fn abandon_exchange(&mut self) {
		if self.exchange.is_some() {
			warn!("Abandoning exchange");
			self.finish_exchange();
		}
	}
}

/// Request line and headers, up to and including the blank line.
fn render_head(request: &HttpRequest) -> String {
	format!(
		"{} {} HTTP/1.1\r\nHost: {}\r\nContent-Type: {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
		request.method, request.path, request.host, request.content_type
	)
}

/// The status code from an `HTTP/1.x NNN Reason` line.
fn parse_status(line: &[u8]) -> Option<StatusCode> {
	let line = str::from_utf8(line).ok()?;
	let mut parts = line.splitn(3, ' ');
	let version = parts.next()?;
	if !version.starts_with("HTTP/1.") {
		return None;
	}
	StatusCode::from_bytes(parts.next()?.as_bytes()).ok()
}

/// Pick out the headers we care about. Names are case-insensitive.
fn apply_header(response: &mut HttpResponse, line: &[u8]) {
	let line = match str::from_utf8(line) {
		Ok(line) => line,
		Err(_) => {
			debug!("Skipping non-UTF-8 header");
			return;
		}
	};
	let mut parts = line.splitn(2, ':');
	let name = parts.next().unwrap_or("").trim();
	let value = match parts.next() {
		Some(value) => value.trim(),
		None => return,
	};
	if name.eq_ignore_ascii_case(header::CONTENT_LENGTH.as_str()) {
		match value.parse() {
			Ok(length) => response.content_length = length,
			Err(_) => warn!("Bad Content-Length {:?}", value),
		}
	} else if name.eq_ignore_ascii_case(header::TRANSFER_ENCODING.as_str()) {
		response.chunked = value
			.split(',')
			.any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
	}
}

fn trim_line(line: &[u8]) -> &[u8] {
	if line.ends_with(b"\r\n") {
		&line[..line.len() - 2]
	} else {
		line
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use http::Method;

	#[test]
	fn head_format() {
		let request = HttpRequest::new(Method::POST, "example.com", "/data?file=a.jpg");
		assert_eq!(
			render_head(&request),
			"POST /data?file=a.jpg HTTP/1.1\r\n\
			 Host: example.com\r\n\
			 Content-Type: application/octet-stream\r\n\
			 Transfer-Encoding: chunked\r\n\
			 Connection: close\r\n\r\n"
		);
	}

	#[test]
	fn status_lines() {
		assert_eq!(parse_status(b"HTTP/1.1 200 OK"), Some(StatusCode::OK));
		assert_eq!(parse_status(b"HTTP/1.0 404 Not Found"), Some(StatusCode::NOT_FOUND));
		assert_eq!(parse_status(b"HTTP/1.1 204"), Some(StatusCode::NO_CONTENT));
		assert_eq!(parse_status(b"HTTP/2 200 OK"), None);
		assert_eq!(parse_status(b"HTTP/1.1 abc OK"), None);
		assert_eq!(parse_status(b"NO CARRIER"), None);
		assert_eq!(parse_status(b""), None);
	}

	#[test]
	fn headers_are_case_insensitive() {
		let mut response = HttpResponse::new(StatusCode::OK);
		apply_header(&mut response, b"CONTENT-length:  42 ");
		assert_eq!(response.content_length, 42);
		apply_header(&mut response, b"transfer-encoding: gzip, Chunked");
		assert!(response.chunked);
		apply_header(&mut response, b"Content-Length: lots");
		assert_eq!(response.content_length, 42);
		apply_header(&mut response, b"no colon here");
		apply_header(&mut response, b"Server: tiny");
		assert_eq!(response.content_length, 42);
	}

	#[test]
	fn trims_only_crlf() {
		assert_eq!(trim_line(b"OK\r\n"), b"OK");
		assert_eq!(trim_line(b"\r\n"), b"");
		assert_eq!(trim_line(b"partial"), b"partial");
	}
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
