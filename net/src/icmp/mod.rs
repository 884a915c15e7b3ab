use core::net::Ipv6Addr;

use crate::ip::{v6, Protocol};

pub const HEADER_LEN: usize = 8;

pub const PACKET_TOO_BIG: u8 = 2;

/// How much of the offending packet a Packet Too Big message may quote without exceeding the minimum MTU.
pub const QUOTE_LEN: usize = v6::MIN_MTU - v6::HEADER_LEN - HEADER_LEN;

/// Build an ICMPv6 Packet Too Big message advertising `mtu`, quoting the start of the packet that did not fit.
///
/// `src` and `dst` are the addresses of the IPv6 packet that will carry the message; they are part of its checksum.
pub fn too_big(src: Ipv6Addr, dst: Ipv6Addr, mtu: u32, original: &[u8]) -> Vec<u8> {
	let quoted = &original[..original.len().min(QUOTE_LEN)];

	let mut msg = Vec::with_capacity(HEADER_LEN + quoted.len());
	msg.extend_from_slice(&[PACKET_TOO_BIG, 0, 0, 0]);
	msg.extend_from_slice(&mtu.to_be_bytes());
	msg.extend_from_slice(quoted);

	let mut csum = v6::pseudo_checksum(src, dst, Protocol::Icmpv6, msg.len() as u32);
	csum.push(&msg);
	msg[2..4].copy_from_slice(&csum.end());

	msg
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ip::Checksum;

	#[test]
	fn too_big_layout() {
		let src: Ipv6Addr = "fd00::a".parse().unwrap();
		let dst: Ipv6Addr = "fd00::b".parse().unwrap();
		let original = vec![0x60; 2000];

		let msg = too_big(src, dst, 1364, &original);

		assert_eq!(msg.len(), v6::MIN_MTU - v6::HEADER_LEN);
		assert_eq!(msg[0], PACKET_TOO_BIG);
		assert_eq!(msg[1], 0);
		assert_eq!(&msg[4..8], &1364u32.to_be_bytes());

		let mut csum: Checksum = v6::pseudo_checksum(src, dst, Protocol::Icmpv6, msg.len() as u32);
		csum.push(&msg);
		assert_eq!(csum.end(), [0, 0]);
	}

	#[test]
	fn short_packets_are_quoted_whole() {
		let msg = too_big(Ipv6Addr::LOCALHOST, Ipv6Addr::LOCALHOST, 1280, b"tiny");
		assert_eq!(&msg[HEADER_LEN..], b"tiny");
	}
}
