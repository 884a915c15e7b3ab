//! Packet fragmentation and reassembly.

use core::net::Ipv6Addr;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use bilge::prelude::*;
use utils::error::*;

use super::{v6, Protocol};

pub const HEADER_LEN: usize = 8;

/// How long a partial packet is kept before its fragments are discarded.
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on packets under reassembly at once.
const MAX_PENDING: usize = 256;

#[bitsize(16)]
#[derive(FromBits)]
struct Offset {
	more: bool,
	reserved: u2,
	/// In 8-octet units.
	ofst: u13,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
	pub next: Protocol,
	/// Byte offset of the fragment data. Always a multiple of 8.
	pub offset: usize,
	pub more: bool,
	pub ident: u32,
}

impl Header {
	pub fn encode(&self, buf: &mut Vec<u8>) {
		let ofst: u16 = Offset::new(self.more, u13::new(((self.offset / 8) as u16).min(0x1fff))).into();

		buf.push(self.next.into());
		buf.push(0);
		buf.extend_from_slice(&ofst.to_be_bytes());
		buf.extend_from_slice(&self.ident.to_be_bytes());
	}

	pub fn decode(buf: &[u8]) -> Result<(Self, &[u8])> {
		if buf.len() < HEADER_LEN {
			return Err(Error::Protocol(format!("fragment header needs {HEADER_LEN} bytes, got {}", buf.len())));
		}

		let ofst = Offset::from(u16::from_be_bytes([buf[2], buf[3]]));

		let header = Self {
			next: Protocol::from(buf[0]),
			offset: ofst.ofst().value() as usize * 8,
			more: ofst.more(),
			ident: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
		};

		Ok((header, &buf[HEADER_LEN..]))
	}
}

/// The largest fragment payload that fits a link MTU once the IPv6 and fragment headers are added.
pub fn data_len(mtu: usize) -> usize {
	mtu.saturating_sub(v6::HEADER_LEN + HEADER_LEN) & !7
}

/// Cuts an upper-layer payload into fragments sharing one identification value.
pub struct Split<'a> {
	data: &'a [u8],
	pos: usize,
	step: usize,
	next: Protocol,
	ident: u32,
}

pub fn split(data: &[u8], mtu: usize, next: Protocol, ident: u32) -> Split<'_> {
	Split { data, pos: 0, step: data_len(mtu).max(8), next, ident }
}

impl<'a> Iterator for Split<'a> {
	type Item = (Header, &'a [u8]);

	fn next(&mut self) -> Option<Self::Item> {
		if self.pos >= self.data.len() {
			return None;
		}

		let end = (self.pos + self.step).min(self.data.len());

		let header = Header { next: self.next, offset: self.pos, more: end < self.data.len(), ident: self.ident };
		let chunk = &self.data[self.pos..end];

		self.pos = end;

		Some((header, chunk))
	}
}

/// The identifying attributes of a fragmented packet.
#[derive(Hash, PartialEq, Eq, Clone, Copy, Debug)]
pub struct Key {
	pub src: Ipv6Addr,
	pub dst: Ipv6Addr,
	/// The upper-layer protocol of the reassembled packet.
	pub proto: Protocol,
	pub ident: u32,
}

impl Key {
	pub fn of(header: &v6::Header, frag: &Header) -> Self {
		Self { src: header.src, dst: header.dst, proto: frag.next, ident: frag.ident }
	}
}

/// A single packet fragment.
pub struct Fragment {
	/// Whether there are more fragments.
	pub more: bool,
	/// The byte offset of the fragment.
	pub start: usize,
	/// The byte data of the fragment.
	pub buf: Vec<u8>,
}

impl Fragment {
	pub fn new(header: &Header, data: &[u8]) -> Self {
		Self { more: header.more, start: header.offset, buf: data.to_vec() }
	}

	/// Returns the end offset of this fragment (non-inclusive).
	fn end(&self) -> usize {
		self.start + self.buf.len()
	}
}

/// A partially-reassembled packet.
struct State {
	created: Instant,
	fragments: Vec<Fragment>,
}

impl State {
	/// Attempts to insert a packet fragment into the packet state.
	fn try_insert(&mut self, fragment: Fragment) -> Result<(), Fragment> {
		// A search hit means two fragments start at the same offset.
		let idx = match self.fragments.binary_search_by_key(&fragment.start, |x| x.start) {
			Err(idx) => idx,
			Ok(_) => return Err(fragment),
		};

		if let Some(f) = idx.checked_sub(1).and_then(|i| self.fragments.get(i)) {
			if !f.more || fragment.start < f.end() {
				return Err(fragment);
			}
		}

		if let Some(f) = self.fragments.get(idx) {
			// The final fragment cannot be followed by another one.
			if !fragment.more || f.start < fragment.end() {
				return Err(fragment);
			}
		}

		self.fragments.insert(idx, fragment);

		Ok(())
	}

	/// Try to assemble the fragments into a full packet.
	fn assemble(&self) -> Option<Vec<u8>> {
		if self.fragments.last()?.more {
			return None;
		}

		let mut expected = 0;

		for f in &self.fragments {
			if f.start != expected {
				return None;
			}

			expected = f.end();
		}

		let mut alloc = Vec::with_capacity(expected);

		for f in &self.fragments {
			alloc.extend_from_slice(&f.buf);
		}

		Some(alloc)
	}
}

/// Stores IPv6 packet fragments for reassembly.
#[derive(Default)]
pub struct Store {
	map: HashMap<Key, State>,
}

impl Store {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn pending(&self) -> usize {
		self.map.len()
	}

	/// Consume a packet fragment, returning the upper-layer payload once every fragment has arrived.
	pub fn insert(&mut self, key: Key, fragment: Fragment) -> Result<Option<Vec<u8>>> {
		self.expire(Instant::now());

		match self.map.entry(key) {
			Entry::Occupied(mut slot) => {
				let state = slot.get_mut();

				if state.try_insert(fragment).is_err() {
					slot.remove();
					return Err(Error::Protocol(format!("overlapping fragment in packet {:#x}", key.ident)));
				}

				match state.assemble() {
					Some(buf) => {
						slot.remove();
						Ok(Some(buf))
					}
					None => Ok(None),
				}
			}
			Entry::Vacant(slot) => {
				// An atomic fragment is complete on its own.
				if fragment.start == 0 && !fragment.more {
					return Ok(Some(fragment.buf));
				}

				slot.insert(State { created: Instant::now(), fragments: vec![fragment] });
				Ok(None)
			}
		}
	}

	fn expire(&mut self, now: Instant) {
		self.map.retain(|_, s| now.duration_since(s.created) < REASSEMBLY_TIMEOUT);

		if self.map.len() >= MAX_PENDING {
			if let Some(oldest) = self.map.iter().min_by_key(|(_, s)| s.created).map(|(k, _)| *k) {
				self.map.remove(&oldest);
			}
		}
	}
}
