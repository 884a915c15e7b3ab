use core::fmt::{self, Display};
use core::result;
use std::io;
use std::net::Ipv6Addr;

use thiserror::Error;

/// Why a socket could not be bound. Both cases are expected to clear up on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindFailure {
	/// The port is already taken on the address (`EADDRINUSE`).
	InUse,
	/// The address is not configured on any interface yet (`EADDRNOTAVAIL`).
	NotAvailable,
}

impl Display for BindFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::InUse => "address in use",
			Self::NotAvailable => "address not available",
		})
	}
}

#[derive(Debug, Error)]
pub enum Error {
	/// A tunnel frame or captured packet was malformed.
	#[error("protocol violation: {0}")]
	Protocol(String),

	#[error("flow {0} is already registered")]
	DuplicateFlow(String),

	/// A bounded resource ran out: the port range or the address pool.
	#[error("resource exhausted: {0}")]
	Exhausted(String),

	#[error("transient bind failure: {0}")]
	Transient(BindFailure),

	#[error("helper {0} is not running")]
	HelperUnavailable(String),

	#[error("no route to {0}")]
	Unroutable(Ipv6Addr),

	/// The host interface configuration is unusable.
	#[error("invalid interface configuration: {0}")]
	Config(String),

	#[error("{0} is closed")]
	Closed(String),

	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
}

impl Error {
	/// Whether the process cannot continue after this error without corrupting its flow and address state.
	pub fn is_fatal(&self) -> bool {
		matches!(self, Self::Exhausted(_) | Self::Config(_))
	}
}

#[doc(hidden)]
pub trait Ext<T, E> {
	fn or_log(self, f: impl FnOnce(E)) -> Option<T>;
}

impl<T, E> Ext<T, E> for result::Result<T, E> {
	fn or_log(self, f: impl FnOnce(E)) -> Option<T> {
		match self {
			Ok(v) => Some(v),
			Err(e) => {
				f(e);
				None
			}
		}
	}
}

#[doc(hidden)]
pub trait ExtOpaque<T> {
	fn some_or(self, f: impl FnOnce()) -> Option<T>;
}

impl<T> ExtOpaque<T> for Option<T> {
	fn some_or(self, f: impl FnOnce()) -> Option<T> {
		match self {
			Some(_) => {}
			None => f(),
		}

		self
	}
}

pub type Result<T = (), E = Error> = result::Result<T, E>;

pub use Ext as _;
pub use ExtOpaque as _;
