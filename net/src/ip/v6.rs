use core::net::Ipv6Addr;

use bilge::prelude::*;
use utils::error::*;

use super::fragment;
use super::{Checksum, Protocol, Version};

pub const HEADER_LEN: usize = 40;

/// Every IPv6 link has to carry packets of this size.
pub const MIN_MTU: usize = 1280;

pub const HOP_LIMIT: u8 = 64;

#[bitsize(32)]
#[derive(FromBits)]
struct Meta {
	flow: u20,
	class: u8,
	ver: Version,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
	pub class: u8,
	pub flow: u32,
	/// Length of everything after the fixed header.
	pub len: u16,
	pub next: Protocol,
	pub hops: u8,
	pub src: Ipv6Addr,
	pub dst: Ipv6Addr,
}

impl Header {
	pub fn new(next: Protocol, src: Ipv6Addr, dst: Ipv6Addr, len: u16) -> Self {
		Self { class: 0, flow: 0, len, next, hops: HOP_LIMIT, src, dst }
	}

	pub fn encode(&self, buf: &mut Vec<u8>) {
		let meta: u32 = Meta::new(u20::new(self.flow & 0xf_ffff), self.class, Version::V6).into();

		buf.extend_from_slice(&meta.to_be_bytes());
		buf.extend_from_slice(&self.len.to_be_bytes());
		buf.push(self.next.into());
		buf.push(self.hops);
		buf.extend_from_slice(&self.src.octets());
		buf.extend_from_slice(&self.dst.octets());
	}

	/// Decode the fixed header, returning it with the payload it announces.
	pub fn decode(buf: &[u8]) -> Result<(Self, &[u8])> {
		if buf.len() < HEADER_LEN {
			return Err(Error::Protocol(format!("IPv6 header needs {HEADER_LEN} bytes, got {}", buf.len())));
		}

		let meta = Meta::from(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));

		if meta.ver() != Version::V6 {
			return Err(Error::Protocol(format!("not an IPv6 packet: version {:?}", meta.ver())));
		}

		let len = u16::from_be_bytes([buf[4], buf[5]]);

		let payload = buf[HEADER_LEN..]
			.get(..len as usize)
			.ok_or_else(|| Error::Protocol(format!("IPv6 payload truncated: announced {len} bytes, got {}", buf.len() - HEADER_LEN)))?;

		let header = Self {
			class: meta.class(),
			flow: meta.flow().value(),
			len,
			next: Protocol::from(buf[6]),
			hops: buf[7],
			src: addr(&buf[8..24]),
			dst: addr(&buf[24..40]),
		};

		Ok((header, payload))
	}
}

fn addr(b: &[u8]) -> Ipv6Addr {
	let mut octets = [0; 16];
	octets.copy_from_slice(b);
	Ipv6Addr::from(octets)
}

/// A decoded packet whose payload may still be a fragment.
pub struct Packet<'a> {
	pub header: Header,
	pub payload: &'a [u8],
}

/// What an IPv6 payload turned out to be.
pub enum Payload<'a> {
	Whole(Protocol, &'a [u8]),
	Fragment(fragment::Header, &'a [u8]),
}

impl<'a> Packet<'a> {
	pub fn parse(buf: &'a [u8]) -> Result<Self> {
		let (header, payload) = Header::decode(buf)?;
		Ok(Self { header, payload })
	}

	pub fn payload(&self) -> Result<Payload<'a>> {
		match self.header.next {
			Protocol::Fragment => {
				let (frag, data) = fragment::Header::decode(self.payload)?;
				Ok(Payload::Fragment(frag, data))
			}
			next => Ok(Payload::Whole(next, self.payload)),
		}
	}
}

/// Checksum state primed with the IPv6 pseudo-header of an upper-layer message.
pub fn pseudo_checksum(src: Ipv6Addr, dst: Ipv6Addr, next: Protocol, len: u32) -> Checksum {
	let mut csum = Checksum::of(&src.octets());
	csum.push(&dst.octets());
	csum.push(&len.to_be_bytes());
	csum.push(&[0, 0, 0, next.into()]);
	csum
}

/// Whether the address lies in `fc00::/7`.
pub fn is_unique_local(addr: &Ipv6Addr) -> bool {
	addr.segments()[0] & 0xfe00 == 0xfc00
}
