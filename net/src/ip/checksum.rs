/// An implementation of [RFC 1071]'s internet checksum, used by procotols such as TCP, UDP, and ICMPv6.
///
/// [RFC 1071]: [https://datatracker.ietf.org/doc/html/rfc1071]
#[derive(Clone, Default)]
pub struct Checksum {
	acc: u64,
}

impl Checksum {
	/// Create a new checksum calculation state.
	#[inline]
	pub fn of(buffer: &[u8]) -> Self {
		let mut csum = Self::default();
		csum.push(buffer);
		csum
	}

	/// Add bytes to the checksum calcuation.
	///
	/// Only the final push may have a length that is not a multiple of four.
	#[inline]
	pub fn push(&mut self, buffer: &[u8]) {
		let mut chunks = buffer.chunks_exact(4);

		for word in &mut chunks {
			self.push_chunk(&[word[0], word[1], word[2], word[3]]);
		}

		let rem = chunks.remainder();

		if !rem.is_empty() {
			let mut buf = [0; 4];
			buf[..rem.len()].copy_from_slice(rem);
			self.push_chunk(&buf);
		}
	}

	/// Adds a single word to the checksum calculation.
	#[inline]
	pub fn push_chunk(&mut self, word: &[u8; 4]) {
		self.acc += u32::from_ne_bytes(*word) as u64;
	}

	/// Finalize checksum calculation and return its byte-representation, consuming the [`Checksum`] instance.
	#[inline]
	pub fn end(self) -> [u8; 2] {
		let mut acc = self.acc;

		while acc > 0xffff {
			acc = (acc & 0xffff) + (acc >> 16);
		}

		(!(acc as u16)).to_ne_bytes()
	}

	/// Finalize the calculation and return the checksum as a number.
	#[inline]
	pub fn value(self) -> u16 {
		u16::from_be_bytes(self.end())
	}
}

/// The internet checksum of a buffer. The checksum field inside it has to be zero.
pub fn checksum16(buffer: &[u8]) -> u16 {
	Checksum::of(buffer).value()
}
