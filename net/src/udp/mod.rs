pub const HEADER_LEN: usize = 8;

/// Byte offset of the checksum field.
pub(crate) const CHECKSUM: usize = 6;

pub struct Header {
	pub src: u16,
	pub dst: u16,
	pub len: u16,
	pub csum: [u8; 2],
}

impl Header {
	pub fn decode(buf: &[u8]) -> Option<Self> {
		let b = buf.get(..HEADER_LEN)?;

		Some(Self {
			src: u16::from_be_bytes([b[0], b[1]]),
			dst: u16::from_be_bytes([b[2], b[3]]),
			len: u16::from_be_bytes([b[4], b[5]]),
			csum: [b[6], b[7]],
		})
	}
}
