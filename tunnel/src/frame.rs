//! The tunnel framing.
//!
//! Every frame starts with a fixed header, multi-byte fields in network order:
//!
//! | bytes  | field                                   |
//! |--------|-----------------------------------------|
//! | 0      | socket type, 0 for stream, 1 for datagram |
//! | 1      | reserved, written as 0 and ignored      |
//! | 2..4   | payload length                          |
//! | 4..20  | flow identifier                         |
//! | 20..36 | address of the original traffic source  |
//!
//! A frame made of the header alone is a keepalive.

use core::net::Ipv6Addr;

use net::Transport;
use utils::error::*;

use crate::FlowId;

pub const HEADER_LEN: usize = 36;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
	pub kind: Transport,
	pub len: u16,
	pub flow: FlowId,
	pub src: Ipv6Addr,
}

impl Header {
	pub fn encode(&self) -> [u8; HEADER_LEN] {
		encode_header(self.kind, self.len, self.flow, self.src)
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		decode_header(buf)
	}
}

pub fn encode_header(kind: Transport, len: u16, flow: FlowId, src: Ipv6Addr) -> [u8; HEADER_LEN] {
	let mut buf = [0; HEADER_LEN];

	buf[0] = kind.sock_type();
	buf[2..4].copy_from_slice(&len.to_be_bytes());
	buf[4..20].copy_from_slice(&flow.0);
	buf[20..36].copy_from_slice(&src.octets());

	buf
}

pub fn decode_header(buf: &[u8]) -> Result<Header> {
	let Some(b) = buf.get(..HEADER_LEN) else {
		return Err(Error::Protocol(format!("tunnel frame of {} bytes is shorter than its {HEADER_LEN}-byte header", buf.len())));
	};

	let kind = Transport::from_sock_type(b[0]).ok_or_else(|| Error::Protocol(format!("unknown socket type {}", b[0])))?;

	let mut flow = [0; FlowId::LEN];
	flow.copy_from_slice(&b[4..20]);

	let mut src = [0; 16];
	src.copy_from_slice(&b[20..36]);

	Ok(Header {
		kind,
		len: u16::from_be_bytes([b[2], b[3]]),
		flow: FlowId(flow),
		src: Ipv6Addr::from(src),
	})
}

/// Build a complete frame around a payload.
pub fn encode(kind: Transport, flow: FlowId, src: Ipv6Addr, payload: &[u8]) -> Result<Vec<u8>> {
	let len: u16 = payload
		.len()
		.try_into()
		.map_err(|_| Error::Protocol(format!("payload of {} bytes does not fit a tunnel frame", payload.len())))?;

	let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
	buf.extend_from_slice(&encode_header(kind, len, flow, src));
	buf.extend_from_slice(payload);

	Ok(buf)
}

/// A received frame that carries data.
#[derive(Debug)]
pub struct Frame<'a> {
	pub header: Header,
	pub payload: &'a [u8],
}

/// Decode one frame. Keepalives decode to `None`.
pub fn parse(buf: &[u8]) -> Result<Option<Frame<'_>>> {
	let header = decode_header(buf)?;

	if buf.len() == HEADER_LEN {
		return Ok(None);
	}

	let payload = buf[HEADER_LEN..].get(..header.len as usize).ok_or_else(|| {
		Error::Protocol(format!("tunnel frame announces {} payload bytes but carries {}", header.len, buf.len() - HEADER_LEN))
	})?;

	Ok(Some(Frame { header, payload }))
}

/// Splits a byte-stream session into frames.
#[derive(Default)]
pub struct Decoder {
	buf: Vec<u8>,
}

impl Decoder {
	pub fn push(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	/// The next complete frame, header included.
	pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
		if self.buf.len() < HEADER_LEN {
			return Ok(None);
		}

		let header = match decode_header(&self.buf) {
			Ok(header) => header,
			Err(err) => {
				// The stream cannot be resynchronised past a corrupt header.
				self.buf.clear();
				return Err(err);
			}
		};

		let end = HEADER_LEN + header.len as usize;

		if self.buf.len() < end {
			return Ok(None);
		}

		let rest = self.buf.split_off(end);
		Ok(Some(std::mem::replace(&mut self.buf, rest)))
	}

	pub fn buffered(&self) -> usize {
		self.buf.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SRC: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0x10);

	fn flow() -> FlowId {
		FlowId(core::array::from_fn(|i| i as u8))
	}

	#[test]
	fn header_layout() {
		let buf = encode(Transport::Datagram, flow(), SRC, b"payload").unwrap();

		assert_eq!(buf.len(), HEADER_LEN + 7);
		assert_eq!(&buf[..4], &[1, 0, 0, 7]);
		assert_eq!(&buf[4..20], &flow().0);
		assert_eq!(&buf[20..36], &SRC.octets());

		let frame = parse(&buf).unwrap().unwrap();
		assert_eq!(frame.header, Header { kind: Transport::Datagram, len: 7, flow: flow(), src: SRC });
		assert_eq!(frame.payload, b"payload");
	}

	#[test]
	fn reserved_byte_is_ignored() {
		let mut buf = encode_header(Transport::Stream, 0, flow(), SRC);
		buf[1] = 0xff;

		let header = decode_header(&buf).unwrap();
		assert_eq!(header.kind, Transport::Stream);
		assert_eq!(header.encode()[1], 0);
	}

	#[test]
	fn short_and_inconsistent_frames() {
		assert!(matches!(decode_header(&[0; 19]), Err(Error::Protocol(_))));
		assert!(matches!(decode_header(&[0; HEADER_LEN - 1]), Err(Error::Protocol(_))));

		let mut buf = encode(Transport::Stream, flow(), SRC, b"abc").unwrap();
		buf.truncate(HEADER_LEN + 2);
		assert!(parse(&buf).is_err());

		let mut buf = encode_header(Transport::Stream, 0, flow(), SRC);
		buf[0] = 7;
		assert!(decode_header(&buf).is_err());
	}

	#[test]
	fn header_alone_is_keepalive() {
		let buf = encode(Transport::Datagram, flow(), SRC, &[]).unwrap();
		assert!(parse(&buf).unwrap().is_none());
	}

	#[test]
	fn stream_decoder_reframes() {
		let a = encode(Transport::Stream, flow(), SRC, b"first").unwrap();
		let b = encode(Transport::Stream, flow(), SRC, b"second!").unwrap();
		let stream = [a.clone(), b.clone()].concat();

		let mut decoder = Decoder::default();

		decoder.push(&stream[..10]);
		assert_eq!(decoder.next_frame().unwrap(), None);

		decoder.push(&stream[10..a.len() + 3]);
		assert_eq!(decoder.next_frame().unwrap(), Some(a.clone()));
		assert_eq!(decoder.next_frame().unwrap(), None);

		decoder.push(&stream[a.len() + 3..]);
		assert_eq!(decoder.next_frame().unwrap(), Some(b));
		assert_eq!(decoder.buffered(), 0);
	}
}
