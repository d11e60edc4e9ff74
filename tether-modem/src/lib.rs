//! # modem - A cellular modem task with an HTTP client
//!
//! Copyright (c) Cambridge Consultants 2018
//! See the top-level COPYRIGHT file for further information and licensing
//!
//! This task owns the modem. It powers it up, configures it, brings up a
//! packet data context and then runs HTTP requests through the modem's
//! socket-dial command, one at a time.
//!
//! Users send a `ReqSubmit` holding an `HttpRequest`. Requests are queued
//! and run strictly in order; the `CfmSubmit` carrying the `HttpResponse` is
//! sent once the server has closed the connection, and only then does the
//! next request start. If the modem is off when a request arrives, it is
//! woken first.
//!
//! Nothing in this task waits on the hardware for long. Each step of the
//! power-up sequence and of an HTTP exchange does a bounded amount of work
//! and then posts itself the message for the next step, often with a delay
//! (see `tether::timer`). Anything that goes wrong during configuration or
//! an exchange restarts the modem from power-on. The request at the head of
//! the queue is not answered in that case; it is tried again from the start
//! once the modem is connected again, up to `Config::max_attempts` times.
//! A request whose response can never be handled (too big, or not HTTP) is
//! dropped straight away, also without an answer.
//!
//! Request bodies are always sent with `Transfer-Encoding: chunked`, either
//! from memory or streamed from a file on `Storage`. Response bodies are read
//! by `Content-Length`; chunked responses are delivered with an empty body.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

extern crate http;
#[macro_use]
extern crate log;
#[macro_use]
extern crate tether;
extern crate tether_hayes as hayes;

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use hayes::{AtDevice, CommandDevice};
use tether::timer::{self, Clock, Scheduler};
use tether::{Context, ServiceUser};

pub use http::{Method, StatusCode};

pub use config::Config;
pub use power::{NoPins, PowerPins};
pub use storage::{FsStorage, Storage, StorageBus};

// ****************************************************************************
//
// Sub-modules
//
// ****************************************************************************

pub mod config;
mod lifecycle;
pub mod power;
pub mod storage;
mod transport;

// ****************************************************************************
//
// Public Messages
//
// ****************************************************************************

/// Offers the `tether::Service` for this module.
pub struct Service;

impl tether::Service for Service {
	type Request = Request;
	type Confirm = Confirm;
	type Indication = Indication;
	type Response = Response;
}

/// Requests that can be sent to the modem task.
#[derive(Debug)]
pub enum Request {
	/// Queue an HTTP request
	Submit(ReqSubmit),
	/// Power the modem down
	Sleep(ReqSleep),
	/// Check the task is alive
	Ping(ReqPing),
}

make_wrapper!(ReqSubmit, Request, Request::Submit);
make_wrapper!(ReqSleep, Request, Request::Sleep);
make_wrapper!(ReqPing, Request, Request::Ping);

/// Confirms sent back by the modem task.
#[derive(Debug)]
pub enum Confirm {
	/// An HTTP request has completed
	Submit(CfmSubmit),
	/// Answer to a ReqSleep
	Sleep(CfmSleep),
	/// Answer to a ReqPing
	Ping(CfmPing),
}

make_wrapper!(CfmSubmit, Confirm, Confirm::Submit);
make_wrapper!(CfmSleep, Confirm, Confirm::Sleep);
make_wrapper!(CfmPing, Confirm, Confirm::Ping);

#[derive(Debug)]
pub enum Indication {}

#[derive(Debug)]
pub enum Response {}

/// Queue an HTTP request. It is sent once the modem is connected and every
/// request queued before it has completed.
#[derive(Debug)]
pub struct ReqSubmit {
	/// Reflected in the cfm
	pub context: Context,
	pub request: HttpRequest,
}

/// Power the modem down. Not supported yet - always answered with
/// `Error::NotImplemented`. If the modem is part way through powering on or
/// off, the answer waits until it has finished.
#[derive(Debug)]
pub struct ReqSleep {
	/// Reflected in the cfm
	pub context: Context,
}

#[derive(Debug)]
pub struct ReqPing {
	/// Reflected in the cfm
	pub context: Context,
}

/// The server's answer to a ReqSubmit.
#[derive(Debug)]
pub struct CfmSubmit {
	/// Reflected from the req
	pub context: Context,
	pub response: HttpResponse,
}

#[derive(Debug)]
pub struct CfmSleep {
	/// Reflected from the req
	pub context: Context,
	pub result: Result<(), Error>,
}

#[derive(Debug)]
pub struct CfmPing {
	/// Reflected from the req
	pub context: Context,
}

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Represents something a modem service user can hold on to to send us
/// messages.
#[derive(Clone)]
pub struct Handle(mpsc::Sender<Incoming>, Arc<AtomicBool>);

/// An HTTP request to run through the modem.
#[derive(Debug, Clone)]
pub struct HttpRequest {
	pub method: Method,
	/// Host name, dialled on the configured port
	pub host: String,
	/// Path and query, e.g. `/data?file=a.jpg`
	pub path: String,
	pub content_type: String,
	pub body: Body,
}

/// Where a request body comes from.
#[derive(Clone)]
pub enum Body {
	Empty,
	Memory(Vec<u8>),
	/// Streamed from `Storage`
	File(PathBuf),
}

/// What came back from the server.
#[derive(Clone)]
pub struct HttpResponse {
	pub status: StatusCode,
	/// From the `Content-Length` header, or zero
	pub content_length: u64,
	/// The server used `Transfer-Encoding: chunked`. The body will be empty.
	pub chunked: bool,
	pub body: Vec<u8>,
}

/// The power and connectivity state of the modem.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ModemState {
	PowerOff,
	PoweringOn,
	PowerOn,
	Connected,
	PoweringOff,
}

/// All possible modem task errors
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
	/// The AT command layer failed - write error, timeout or overlong
	/// response
	Hayes(hayes::Error),
	/// Reading an upload body failed
	Io(io::ErrorKind),
	/// The modem or server said something we didn't understand
	ProtocolMismatch,
	/// The storage bus was taken
	ResourceBusy,
	/// The response body is too big
	AllocationFailure,
	/// Function not implemented yet
	NotImplemented,
}

// ****************************************************************************
//
// Public Data
//
// ****************************************************************************

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

// ****************************************************************************
//
// Private Types
//
// ****************************************************************************

service_map! {
	generate: Incoming,
	service: Service,
	handle: Handle,
	internal: Event,
	used: {}
}

/// The steps the task posts to itself.
#[derive(Debug)]
enum Event {
	/// `set_state` moved us from one state to another
	StateChange { from: ModemState, to: ModemState },
	/// Power up if we aren't already
	Wake,
	/// One step of the power-on pulse
	Activate(u8),
	/// Turn echo and flow control off
	Configure,
	/// Bring up the packet data context
	PdpEnable,
	/// Send the escape sequence, then post the boxed event
	Escape(Box<Event>),
	HttpOpen,
	HttpWrite,
	HttpReadStatus,
	HttpReadHeader,
	HttpReadBody,
	HttpOver,
}

make_wrapper!(Event, Incoming, Incoming::Internal);

/// An entry in the request queue.
struct Queued {
	context: Context,
	request: HttpRequest,
	reply_to: ServiceUserHandle,
	/// Exchanges started for this request so far
	attempts: u32,
}

type ReplyContext = tether::ReplyContext<Service>;

/// One instance per task. Stores all the task data.
struct TaskContext<D, C, S, P>
where
	S: Storage,
{
	config: Config,
	/// The modem's command channel and response buffer
	at: AtDevice<D, C>,
	/// Posts our own events, now or later
	scheduler: Scheduler<Incoming, C>,
	storage: S,
	pins: P,
	state: ModemState,
	/// Shared with every Handle so they can see if we're connected
	connected: Arc<AtomicBool>,
	wake_while_powering_off: bool,
	/// Sleep requests waiting for a power transition to finish
	sleep_pending: Vec<ReplyContext>,
	/// The head is the request in flight (if `exchange` is Some)
	queue: VecDeque<Queued>,
	exchange: Option<transport::Exchange<S::File>>,
}

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

/// Creates a new modem task. Returns an object that can be used to send
/// this task messages. The modem stays off until the first request (or an
/// explicit `wake`).
pub fn make_task<D, C, S, P>(config: Config, device: D, clock: C, storage: S, pins: P) -> Handle
where
	D: CommandDevice + Send + 'static,
	C: Clock + 'static,
	S: Storage + Send + 'static,
	P: PowerPins + Send + 'static,
{
	let (tx, rx) = mpsc::channel();
	let connected = Arc::new(AtomicBool::new(false));
	let handle = Handle(tx.clone(), connected.clone());
	thread::spawn(move || {
		let mut t = TaskContext::new(config, device, clock, storage, pins, tx, connected);
		timer::run(&mut t, &rx);
		warn!("Modem task stopped");
	});
	handle
}

impl Handle {
	/// Queue an HTTP request. The `CfmSubmit` goes to `reply_to`. Returns
	/// false if the task has gone.
	pub fn submit(&self, context: Context, request: HttpRequest, reply_to: &dyn ServiceUser<Service>) -> bool {
		let req = ReqSubmit {
			context: context,
			request: request,
		};
		self.0
			.send(Incoming::Request(req.into(), reply_to.clone()))
			.is_ok()
	}

	/// Power the modem up, if it isn't already.
	pub fn wake(&self) -> bool {
		self.0.send(Event::Wake.into()).is_ok()
	}

	pub fn sleep(&self, context: Context, reply_to: &dyn ServiceUser<Service>) -> bool {
		let req = ReqSleep { context: context };
		self.0
			.send(Incoming::Request(req.into(), reply_to.clone()))
			.is_ok()
	}

	pub fn ping(&self, context: Context, reply_to: &dyn ServiceUser<Service>) -> bool {
		let req = ReqPing { context: context };
		self.0
			.send(Incoming::Request(req.into(), reply_to.clone()))
			.is_ok()
	}

	/// True if the modem has a packet data context up.
	pub fn is_connected(&self) -> bool {
		self.1.load(Ordering::Acquire)
	}
}

impl HttpRequest {
	/// A request with no body.
	pub fn new(method: Method, host: &str, path: &str) -> HttpRequest {
		HttpRequest {
			method: method,
			host: host.to_owned(),
			path: path.to_owned(),
			content_type: CONTENT_TYPE_OCTET_STREAM.to_owned(),
			body: Body::Empty,
		}
	}

	pub fn with_body(mut self, content_type: &str, body: Body) -> HttpRequest {
		self.content_type = content_type.to_owned();
		self.body = body;
		self
	}

	/// The body is streamed from storage, so needs the storage bus.
	pub fn is_file_upload(&self) -> bool {
		match self.body {
			Body::File(_) => true,
			_ => false,
		}
	}
}

impl HttpResponse {
	pub fn new(status: StatusCode) -> HttpResponse {
		HttpResponse {
			status: status,
			content_length: 0,
			chunked: false,
			body: Vec::new(),
		}
	}
}

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
	fn new(
		config: Config,
		device: D,
		clock: C,
		storage: S,
		pins: P,
		us: mpsc::Sender<Incoming>,
		connected: Arc<AtomicBool>,
	) -> TaskContext<D, C, S, P> {
		let at = AtDevice::new(device, clock.clone(), config.buffer_capacity);
		TaskContext {
			config: config,
			at: at,
			scheduler: Scheduler::new(us, clock),
			storage: storage,
			pins: pins,
			state: ModemState::PowerOff,
			connected: connected,
			wake_while_powering_off: false,
			sleep_pending: Vec::new(),
			queue: VecDeque::new(),
			exchange: None,
		}
	}

	fn now(&self) -> u64 {
		self.scheduler.clock().now()
	}

	fn tell(&self, event: Event) {
		self.scheduler.tell(event.into());
	}

	fn tell_after(&mut self, event: Event, delay_ms: u64) {
		self.scheduler.tell_after(event.into(), delay_ms);
	}

	fn handle_modem_req(&mut self, req: Request, reply_to: ServiceUserHandle) {
		match req {
			Request::Submit(x) => self.handle_submit(x, reply_to),
			Request::Sleep(x) => self.handle_sleep(x, reply_to),
			Request::Ping(x) => {
				let cfm = CfmPing { context: x.context };
				reply_to.send_confirm(cfm.into());
			}
		}
	}

	fn handle_event(&mut self, event: Event) {
		match event {
			Event::StateChange { from, to } => self.handle_state_change(from, to),
			Event::Wake => self.handle_wake(),
			Event::Activate(phase) => self.handle_activate(phase),
			Event::Configure => self.handle_configure(),
			Event::PdpEnable => self.handle_pdp_enable(),
			Event::Escape(follow_up) => self.handle_escape(*follow_up),
			Event::HttpOpen => self.http_open(),
			Event::HttpWrite => self.http_write(),
			Event::HttpReadStatus => self.http_read_status(),
			Event::HttpReadHeader => self.http_read_header(),
			Event::HttpReadBody => self.http_read_body(),
			Event::HttpOver => self.http_over(),
		}
	}
}

impl<D, C, S, P> timer::Task for TaskContext<D, C, S, P>
where
	D: CommandDevice,
	C: Clock,
	S: Storage,
	P: PowerPins,
{
	type Message = Incoming;
	type Clock = C;

	/// Handle an incoming message. It might be a `Request` from a user, or
	/// one of our own events coming back to us.
	fn handle(&mut self, msg: Incoming) {
		match msg {
			Incoming::Request(x, reply_to) => {
				debug!("Rx: {:?}", x);
				self.handle_modem_req(x, reply_to);
			}
			Incoming::Response(x) => match x {},
			Incoming::Internal(x) => {
				trace!("Rx: {:?}", x);
				self.handle_event(x);
			}
		}
	}

	fn scheduler(&mut self) -> &mut Scheduler<Incoming, C> {
		&mut self.scheduler
	}
}

/// Wrap AT layer errors easily
impl From<hayes::Error> for Error {
	fn from(e: hayes::Error) -> Error {
		Error::Hayes(e)
	}
}

/// Wrap io::Errors easily
impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Io(e.kind())
	}
}

/// Don't log the contents of the body
impl fmt::Debug for Body {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			Body::Empty => write!(f, "Empty"),
			Body::Memory(ref data) => write!(f, "Memory {{ len: {} }}", data.len()),
			Body::File(ref path) => write!(f, "File({})", path.display()),
		}
	}
}

/// Don't log the contents of the body
impl fmt::Debug for HttpResponse {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(
			f,
			"HttpResponse {{ status: {}, content_length: {}, chunked: {}, body.len: {} }}",
			self.status,
			self.content_length,
			self.chunked,
			self.body.len()
		)
	}
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
