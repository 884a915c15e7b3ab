//! Packet construction for raw injection: IPv6 and its fragment header, ICMPv6, link-layer framing, and the transport
//! header fields that have to be rewritten when a tunnelled packet is put back on the wire.

use core::net::Ipv6Addr;

use ip::{v6, Protocol};
use utils::error::*;

pub mod icmp;
pub mod inject;
pub mod ip;
pub mod link;
#[cfg(feature = "pcap")]
pub mod pcap;
pub mod route;
pub mod tcp;
pub mod udp;

pub use inject::{Injector, Sink};

/// The transport kind of a proxied flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
	Stream,
	Datagram,
}

impl Transport {
	pub fn protocol(self) -> Protocol {
		match self {
			Self::Stream => Protocol::Tcp,
			Self::Datagram => Protocol::Udp,
		}
	}

	pub fn from_protocol(protocol: Protocol) -> Option<Self> {
		match protocol {
			Protocol::Tcp => Some(Self::Stream),
			Protocol::Udp => Some(Self::Datagram),
			_ => None,
		}
	}

	/// The value used on the tunnel wire.
	pub fn sock_type(self) -> u8 {
		match self {
			Self::Stream => 0,
			Self::Datagram => 1,
		}
	}

	pub fn from_sock_type(value: u8) -> Option<Self> {
		match value {
			0 => Some(Self::Stream),
			1 => Some(Self::Datagram),
			_ => None,
		}
	}

	pub fn name(self) -> &'static str {
		match self {
			Self::Stream => "tcp",
			Self::Datagram => "udp",
		}
	}

	fn header_len(self) -> usize {
		match self {
			Self::Stream => tcp::HEADER_LEN,
			Self::Datagram => udp::HEADER_LEN,
		}
	}

	fn checksum_at(self) -> usize {
		match self {
			Self::Stream => tcp::CHECKSUM,
			Self::Datagram => udp::CHECKSUM,
		}
	}

	fn check_len(self, buf: &[u8]) -> Result {
		if buf.len() < self.header_len() {
			return Err(Error::Protocol(format!(
				"{} segment too short: got {} bytes, need at least {}",
				self.name(),
				buf.len(),
				self.header_len()
			)));
		}

		Ok(())
	}

	/// The source and destination ports of a transport segment.
	pub fn ports(self, buf: &[u8]) -> Result<(u16, u16)> {
		self.check_len(buf)?;
		Ok((u16::from_be_bytes([buf[0], buf[1]]), u16::from_be_bytes([buf[2], buf[3]])))
	}

	pub fn set_source_port(self, buf: &mut [u8], port: u16) -> Result {
		self.check_len(buf)?;
		buf[..2].copy_from_slice(&port.to_be_bytes());
		Ok(())
	}

	pub fn set_destination_port(self, buf: &mut [u8], port: u16) -> Result {
		self.check_len(buf)?;
		buf[2..4].copy_from_slice(&port.to_be_bytes());
		Ok(())
	}

	/// Recompute the checksum of a transport segment for the given address pair.
	pub fn seal(self, buf: &mut [u8], src: Ipv6Addr, dst: Ipv6Addr) -> Result {
		self.check_len(buf)?;

		let len: u32 = buf.len().try_into().map_err(|_| Error::Protocol(format!("{} segment too large", self.name())))?;

		let at = self.checksum_at();
		buf[at..at + 2].fill(0);

		let mut csum = v6::pseudo_checksum(src, dst, self.protocol(), len);
		csum.push(buf);

		let mut value = csum.end();

		// An all-zero UDP checksum means "none", which IPv6 forbids.
		if self == Self::Datagram && value == [0, 0] {
			value = [0xff, 0xff];
		}

		buf[at..at + 2].copy_from_slice(&value);

		Ok(())
	}

	/// Whether the segment carries a valid checksum for the given address pair.
	pub fn verify(self, buf: &[u8], src: Ipv6Addr, dst: Ipv6Addr) -> bool {
		let Ok(len) = u32::try_from(buf.len()) else { return false };

		let mut csum = v6::pseudo_checksum(src, dst, self.protocol(), len);
		csum.push(buf);
		csum.end() == [0, 0]
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ip::checksum16;

	const SRC: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1);
	const DST: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2);

	fn udp(payload: &[u8]) -> Vec<u8> {
		let mut buf = Vec::new();
		buf.extend_from_slice(&40000u16.to_be_bytes());
		buf.extend_from_slice(&53u16.to_be_bytes());
		buf.extend_from_slice(&((udp::HEADER_LEN + payload.len()) as u16).to_be_bytes());
		buf.extend_from_slice(&[0xde, 0xad]);
		buf.extend_from_slice(payload);
		buf
	}

	/// Straightforward RFC 1071 over 16-bit big-endian words.
	fn reference(buf: &[u8]) -> u16 {
		let mut sum: u32 = 0;

		for pair in buf.chunks(2) {
			let word = u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0)]);
			sum += word as u32;
		}

		while sum > 0xffff {
			sum = (sum & 0xffff) + (sum >> 16);
		}

		!(sum as u16)
	}

	fn pseudo(len: usize) -> Vec<u8> {
		let mut p = Vec::new();
		p.extend_from_slice(&SRC.octets());
		p.extend_from_slice(&DST.octets());
		p.extend_from_slice(&(len as u32).to_be_bytes());
		p.extend_from_slice(&[0, 0, 0, 17]);
		p
	}

	#[test]
	fn udp_checksum_validates_to_zero() {
		let mut seg = udp(b"hello, tunnel");

		Transport::Datagram.seal(&mut seg, SRC, DST).unwrap();

		let mut zeroed = seg.clone();
		zeroed[6..8].fill(0);
		let expected = reference(&[pseudo(zeroed.len()), zeroed.clone()].concat());

		assert_eq!(u16::from_be_bytes([seg[6], seg[7]]), expected);
		assert_eq!(checksum16(&[pseudo(seg.len()), zeroed].concat()), expected);
		assert_eq!(checksum16(&[pseudo(seg.len()), seg.clone()].concat()), 0);
		assert!(Transport::Datagram.verify(&seg, SRC, DST));

		seg[9] ^= 1;
		assert!(!Transport::Datagram.verify(&seg, SRC, DST));
	}

	#[test]
	fn odd_length_segments() {
		let mut seg = udp(b"odd");
		assert_eq!(seg.len() % 2, 1);

		Transport::Datagram.seal(&mut seg, SRC, DST).unwrap();
		assert!(Transport::Datagram.verify(&seg, SRC, DST));
	}

	#[test]
	fn source_port_rewrite() {
		let mut seg = udp(b"x");
		Transport::Datagram.set_source_port(&mut seg, 60001).unwrap();
		assert_eq!(Transport::Datagram.ports(&seg).unwrap(), (60001, 53));

		Transport::Datagram.set_destination_port(&mut seg, 5353).unwrap();
		assert_eq!(Transport::Datagram.ports(&seg).unwrap(), (60001, 5353));

		assert!(Transport::Stream.ports(&seg).is_err());
	}

	#[test]
	fn wire_values() {
		for kind in [Transport::Stream, Transport::Datagram] {
			assert_eq!(Transport::from_sock_type(kind.sock_type()), Some(kind));
			assert_eq!(Transport::from_protocol(kind.protocol()), Some(kind));
		}

		assert_eq!(Transport::from_sock_type(2), None);
	}
}
