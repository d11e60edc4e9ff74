//! # Tether - Tasks, message-passing and deferred messages.
//!
//! Copyright (c) Cambridge Consultants 2018.
//!
//! Dual MIT/Apache 2.0 licensed. See the top-level COPYRIGHT file for further
//! information and licensing.
//!
//! ## Overview
//!
//! tether is the runtime underneath the modem firmware core. Each subsystem
//! runs as a task: one thread, one message queue, one `TaskContext` holding
//! all of the subsystem's state. A task never blocks waiting for hardware.
//! Instead it performs one bounded step and either finishes or arranges, via
//! its `timer::Scheduler`, to be handed a message later that continues the
//! work. State that must survive between steps lives in the task context,
//! never in locals.
//!
//! ## Messages
//!
//! Messages are defined by each layer in four different types:
//!
//! * Request
//! * Confirm
//! * Indication, and
//! * Response.
//!
//! A layer bundles these as the associated types of a `Service`. Users send
//! `Request`s through a `ServiceProvider` and get `Confirm`s (and unsolicited
//! `Indication`s) back through the `ServiceUser` they supplied. A confirm is
//! the "callback" for a request; it may arrive much later, after the task has
//! stepped through many of its own internal messages.
//!
//! ## Implementing a task
//!
//! A task module provides a `make_task` function which creates the queue,
//! spins up a thread running `timer::run` on the task context and returns a
//! `Handle`. The `service_map!` macro generates the task's incoming message
//! enum and implements `ServiceProvider` on the handle, so long as the handle
//! is a tuple-struct whose first field has a `send` method.
//!
//! ```
//! #[macro_use] extern crate tether;
//! use std::sync::mpsc;
//!
//! pub struct Service;
//!
//! impl tether::Service for Service {
//! 	type Request = Request;
//! 	type Confirm = Confirm;
//! 	type Indication = Indication;
//! 	type Response = Response;
//! }
//!
//! #[derive(Debug)]
//! pub enum Request { Ping }
//! #[derive(Debug)]
//! pub enum Confirm { Ping }
//! #[derive(Debug)]
//! pub enum Indication {}
//! #[derive(Debug)]
//! pub enum Response {}
//!
//! #[derive(Debug)]
//! enum Step { Again }
//!
//! #[derive(Clone)]
//! pub struct Handle(mpsc::Sender<Incoming>);
//!
//! service_map! {
//! 	generate: Incoming,
//! 	service: Service,
//! 	handle: Handle,
//! 	internal: Step,
//! 	used: {}
//! }
//!
//! # fn main() { }
//! ```
//!
//! An application which uses services but does not provide one can use
//! `app_map!` to generate the enum and the `ServiceUser` implementations.

// ****************************************************************************
//
// Macros
//
// ****************************************************************************

/// Implements `From<$v>` for the message enum `$s` by wrapping with `$e`.
#[macro_export]
macro_rules! make_wrapper(
	($v:ident, $s:path, $e:path) => {
		impl ::std::convert::From<$v> for $s {
			fn from(msg: $v) -> $s {
				$e(msg)
			}
		}
	}
);

/// Generates the incoming message enum for an application which only uses
/// services, and implements `ServiceUser` for each one on `$handle_type`.
#[macro_export]
macro_rules! app_map {
	(
		generate: $n:ident,
		handle: $handle_type:ident,
		used: {
			$( $svc:ident: ($svc_type:ident, $cfm_wrapper:ident, $ind_wrapper:ident) ),*
		}
	) => {
		enum $n {
			$(
				$cfm_wrapper(<$svc::$svc_type as $crate::Service>::Confirm),
				$ind_wrapper(<$svc::$svc_type as $crate::Service>::Indication),
			)*
		}

		$(
			impl $crate::ServiceUser<$svc::$svc_type> for $handle_type {
				fn send_confirm(&self, msg: <$svc::$svc_type as $crate::Service>::Confirm) {
					if self.0.send($n::$cfm_wrapper(msg)).is_err() {
						$crate::__log::warn!("Confirm dropped - receiving task has gone");
					}
				}
				fn send_indication(&self, msg: <$svc::$svc_type as $crate::Service>::Indication) {
					if self.0.send($n::$ind_wrapper(msg)).is_err() {
						$crate::__log::warn!("Indication dropped - receiving task has gone");
					}
				}
				fn clone(&self) -> $crate::ServiceUserHandle<$svc::$svc_type> {
					Box::new(::std::clone::Clone::clone(self))
				}
			}
		)*
	}
}

/// Generates the incoming message enum for a task which provides `$svc`,
/// plus a variant for the task's own `$internal` messages (the ones its
/// scheduler posts back to itself), and implements `ServiceProvider` on
/// `$handle_type`.
#[macro_export]
macro_rules! service_map {
	(
		generate: $n:ident,
		service: $svc:ident,
		handle: $handle_type:ident,
		internal: $internal:ident,
		used: {
			$( $used:ident: ($used_type:ident, $cfm_wrapper:ident, $ind_wrapper:ident) ),*
		}
	) => {
		/// A layer specific wrapper around `tether::ServiceUserHandle`. We
		/// use this to talk to our users.
		pub type ServiceUserHandle = $crate::ServiceUserHandle<$svc>;

		#[derive(Debug)]
		enum $n {
			Request(Request, ServiceUserHandle),
			Response(Response),
			Internal($internal),
			$(
				$cfm_wrapper(<$used::$used_type as $crate::Service>::Confirm),
				$ind_wrapper(<$used::$used_type as $crate::Service>::Indication),
			)*
		}

		impl $crate::ServiceProvider<$svc> for $handle_type {
			fn send_request(&self, msg: Request, reply_to: &dyn $crate::ServiceUser<$svc>) {
				if self.0.send($n::Request(msg, reply_to.clone())).is_err() {
					$crate::__log::warn!("Request dropped - task has gone");
				}
			}
			fn send_response(&self, msg: Response) {
				if self.0.send($n::Response(msg)).is_err() {
					$crate::__log::warn!("Response dropped - task has gone");
				}
			}
		}

		$(
			impl $crate::ServiceUser<$used::$used_type> for $handle_type {
				fn send_confirm(&self, msg: <$used::$used_type as $crate::Service>::Confirm) {
					let _ = self.0.send($n::$cfm_wrapper(msg));
				}
				fn send_indication(&self, msg: <$used::$used_type as $crate::Service>::Indication) {
					let _ = self.0.send($n::$ind_wrapper(msg));
				}
				fn clone(&self) -> $crate::ServiceUserHandle<$used::$used_type> {
					Box::new(::std::clone::Clone::clone(self))
				}
			}
		)*
	}
}

// ****************************************************************************
//
// Crates
//
// ****************************************************************************

#[macro_use]
extern crate log;

#[doc(hidden)]
pub extern crate log as __log;

// ****************************************************************************
//
// Sub-modules
//
// ****************************************************************************

pub mod timer;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// Ties together the four message types of one layer.
pub trait Service {
	type Request: std::fmt::Debug;
	type Confirm: std::fmt::Debug;
	type Indication: std::fmt::Debug;
	type Response: std::fmt::Debug;
}

/// This is the trait for a Service Provider.
///
/// A Service Provider can receive requests and responses. Requests carry the
/// `ServiceUser` that the eventual confirm goes back to.
pub trait ServiceProvider<S: Service> {
	/// Call this to send a request to this provider.
	fn send_request(&self, req: S::Request, reply_to: &dyn ServiceUser<S>);
	/// Call this to send a response to this provider.
	fn send_response(&self, rsp: S::Response);
}

/// A Service User consumes the service provided by a Service Provider.
///
/// This means it must handle Indications and Confirms. It must also be
/// cloneable, so that a provider can keep a copy in its queue until the
/// confirm is ready.
///
/// The `clone` function returns the boxed trait, as the trait must be object
/// safe - that is, it cannot refer to `Self`.
pub trait ServiceUser<S: Service> {
	/// Call this to send a confirmation back to the service user.
	fn send_confirm(&self, cfm: S::Confirm);
	/// Call this to send an indication to the service user.
	fn send_indication(&self, ind: S::Indication);
	/// Call this so we can store this user reference in two places.
	fn clone(&self) -> ServiceUserHandle<S>;
}

/// A boxed trait object, which the provider can use to send messages back to
/// the user.
pub type ServiceUserHandle<S> = Box<dyn ServiceUser<S> + Send>;

impl<S: Service> std::fmt::Debug for dyn ServiceUser<S> + Send {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "ServiceUser")
	}
}

/// A type used to passing context between layers. A request carries one and
/// the matching confirm reflects it back, so the user can work out which of
/// its outstanding requests has completed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Context(usize);

/// When handling a request, the process may take some time. The essential
/// details are recorded so that a Confirm can be sent at a later date.
pub struct ReplyContext<S: Service> {
	pub reply_to: ServiceUserHandle<S>,
	pub context: Context,
}

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl Context {
	pub fn new(value: usize) -> Context {
		Context(value)
	}

	pub fn as_usize(&self) -> usize {
		self.0
	}

	/// You can use take to grab a copy of the current value,
	/// while incrementing it ready for the next use.
	pub fn take(&mut self) -> Context {
		let result = Context(self.0);
		self.0 = self.0.wrapping_add(1);
		result
	}
}

impl Default for Context {
	fn default() -> Context {
		Context(0)
	}
}

impl std::fmt::Display for Context {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "Context({})", self.0)
	}
}

impl<S: Service> std::fmt::Debug for ReplyContext<S> {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "ReplyContext({})", self.context)
	}
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
