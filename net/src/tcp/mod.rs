use bilge::prelude::*;

/// Minimum header length, without options.
pub const HEADER_LEN: usize = 20;

/// Byte offset of the checksum field.
pub(crate) const CHECKSUM: usize = 16;

#[bitsize(16)]
#[derive(FromBits)]
pub struct Control {
	/// No more data from sender.
	fin: bool,
	/// Synchronize sequence numbers.
	syn: bool,
	/// Reset the connection.
	rst: bool,
	/// Push function.
	psh: bool,
	/// Acknowledgment field is significant.
	ack: bool,
	/// Urgent pointer field is significant.
	urg: bool,
	/// ECN-Echo.
	ece: bool,
	/// Congestion Window Reduced.
	cwr: bool,
	reserved: u4,
	/// The number of 32-bit words in the TCP header.
	off: u4,
}

pub struct Header {
	/// The source port number.
	pub src: u16,
	/// The destination port number.
	pub dst: u16,
	/// The sequence number of the first data octet in this segment.
	pub seq: u32,
	/// The next sequence number the sender of the segment is expecting to receive.
	pub ack: u32,
	pub ctl: Control,
}

impl Header {
	pub fn decode(buf: &[u8]) -> Option<Self> {
		let b = buf.get(..HEADER_LEN)?;

		Some(Self {
			src: u16::from_be_bytes([b[0], b[1]]),
			dst: u16::from_be_bytes([b[2], b[3]]),
			seq: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
			ack: u32::from_be_bytes([b[8], b[9], b[10], b[11]]),
			ctl: Control::from(u16::from_be_bytes([b[12], b[13]])),
		})
	}

	/// Whether this segment opens a connection.
	pub fn is_open(&self) -> bool {
		self.ctl.syn() && !self.ctl.ack()
	}

	/// The length of the header including options.
	pub fn len(&self) -> usize {
		4 * self.ctl.off().value() as usize
	}
}
