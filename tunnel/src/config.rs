use std::path::PathBuf;
use std::time::Duration;

use crate::{frame, Uid};

/// Largest frame a session is expected to carry.
pub const TUNNEL_MTU: usize = 1400;

/// Number of virtual addresses kept ready in the pool.
pub const POOL_TARGET: usize = 10;
pub const POOL_BACKOFF: Duration = Duration::from_secs(1);
/// How many backoffs `take` waits through before the pool counts as exhausted.
pub const POOL_ATTEMPTS: u32 = 30;

/// Delay before retrying a bind on an address that is not configured yet.
pub const BIND_RETRY: Duration = Duration::from_secs(2);
pub const BIND_ATTEMPTS: u32 = 30;

/// Silence from a peer after which sending first asks the control plane whether it is still there.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a freshly spawned helper gets to fail before it counts as started.
pub const HELPER_READY: Duration = Duration::from_millis(500);

pub const HELPERS: &str = "/usr/local/libexec/overlay";

pub const LOOPBACK: &str = "lo";

#[derive(Clone, Debug)]
pub struct Config {
	/// The local peer.
	pub local: Uid,
	/// Interface whose unique-local prefix virtual addresses are drawn from.
	pub interface: String,
	/// Interface virtual addresses are routed through once bound.
	pub loopback: String,
	/// Directory holding the privileged helpers.
	pub helpers: PathBuf,
	pub tunnel_mtu: usize,
	pub pool_target: usize,
	pub pool_backoff: Duration,
	pub pool_attempts: u32,
	pub bind_retry: Duration,
	pub bind_attempts: u32,
	pub liveness: Duration,
	pub helper_ready: Duration,
}

impl Config {
	pub fn new(local: Uid, interface: impl Into<String>) -> Self {
		Self {
			local,
			interface: interface.into(),
			loopback: LOOPBACK.into(),
			helpers: HELPERS.into(),
			tunnel_mtu: TUNNEL_MTU,
			pool_target: POOL_TARGET,
			pool_backoff: POOL_BACKOFF,
			pool_attempts: POOL_ATTEMPTS,
			bind_retry: BIND_RETRY,
			bind_attempts: BIND_ATTEMPTS,
			liveness: LIVENESS_TIMEOUT,
			helper_ready: HELPER_READY,
		}
	}

	pub fn helper(&self, name: &str) -> PathBuf {
		self.helpers.join(name)
	}

	/// The largest IPv6 packet that is tunnelled instead of being answered with packet too big.
	pub fn effective_mtu(&self) -> usize {
		self.tunnel_mtu.saturating_sub(frame::HEADER_LEN)
	}
}
