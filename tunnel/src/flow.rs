//! Identifiers shared by both ends of a tunnel.

use core::fmt;
use core::net::Ipv6Addr;
use core::str::FromStr;

use blake2::digest::typenum::U16;
use blake2::{Blake2s, Digest};
use net::Transport;
use utils::error::*;

type Hasher = Blake2s<U16>;

/// A peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct Uid(pub u64);

impl fmt::Display for Uid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(&self.0, f)
	}
}

impl FromStr for Uid {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		s.parse().map(Self).map_err(|_| Error::Config(format!("invalid peer identifier {s:?}")))
	}
}

/// A service a peer offers.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Service {
	pub name: String,
	pub kind: Transport,
	/// The host name the service was advertised under.
	pub host: String,
	pub port: u16,
}

impl Service {
	pub fn new(name: impl Into<String>, kind: Transport, host: impl Into<String>, port: u16) -> Self {
		Self { name: name.into(), kind, host: host.into(), port }
	}
}

/// Identifies a proxied flow on both ends of the tunnel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FlowId(pub [u8; FlowId::LEN]);

impl FlowId {
	pub const LEN: usize = 16;

	/// The flow of a service offered by `provider`. Both peers derive the same value independently.
	pub fn service(provider: Uid, service: &Service) -> Self {
		Self::digest(&[
			provider.0.to_string().as_bytes(),
			service.name.as_bytes(),
			service.kind.name().as_bytes(),
			service.host.as_bytes(),
			&service.port.to_be_bytes(),
		])
	}

	/// The flow of one client of a service, told apart by its source address and port.
	pub fn client(&self, src: Ipv6Addr, port: u16) -> Self {
		Self::digest(&[&self.0, &src.octets(), &port.to_be_bytes()])
	}

	fn digest(parts: &[&[u8]]) -> Self {
		let mut hasher = Hasher::new();

		// Length prefixes keep ("ab", "c") apart from ("a", "bc").
		for part in parts {
			hasher.update((part.len() as u32).to_be_bytes());
			hasher.update(part);
		}

		let mut id = [0; Self::LEN];
		id.copy_from_slice(&hasher.finalize());
		Self(id)
	}
}

impl fmt::Display for FlowId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for b in self.0 {
			write!(f, "{b:02x}")?;
		}

		Ok(())
	}
}

impl fmt::Debug for FlowId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "FlowId({self})")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ssh() -> Service {
		Service::new("ssh", Transport::Stream, "alice.local", 22)
	}

	#[test]
	fn service_flows_are_stable_and_distinct() {
		let a = FlowId::service(Uid(100), &ssh());

		assert_eq!(a, FlowId::service(Uid(100), &ssh()));
		assert_ne!(a, FlowId::service(Uid(200), &ssh()));
		assert_ne!(a, FlowId::service(Uid(100), &Service { port: 2222, ..ssh() }));
		assert_ne!(a, FlowId::service(Uid(100), &Service { kind: Transport::Datagram, ..ssh() }));
	}

	#[test]
	fn client_flows_split_by_source() {
		let flow = FlowId::service(Uid(100), &ssh());
		let src: Ipv6Addr = "fd00::10".parse().unwrap();

		assert_eq!(flow.client(src, 50000), flow.client(src, 50000));
		assert_ne!(flow.client(src, 50000), flow.client(src, 50001));
		assert_ne!(flow.client(src, 50000), flow);
	}

	#[test]
	fn printing() {
		let id = FlowId([0xab; FlowId::LEN]);
		assert_eq!(id.to_string(), "ab".repeat(16));
		assert_eq!("42".parse::<Uid>().unwrap(), Uid(42));
		assert!("x".parse::<Uid>().is_err());
	}
}
