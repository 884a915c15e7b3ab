//! https://wiki.wireshark.org/Development/LibpcapFileFormat

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use log::warn;
use utils::error::*;
use utils::sync::Lock;

use crate::link::LinkKind;

const SNAPLEN: u32 = u32::MAX;

// 0xa1b23c4d for nanosecond-resolution files, 0xa1b2c3d4 for microsecond
const MAGIC_NANO: u32 = 0xa1b23c4d;
const MAGIC_MICRO: u32 = 0xa1b2c3d4;

const HEADER_LEN: usize = 24;
const RECORD_LEN: usize = 16;

/// Data link type. See <https://www.tcpdump.org/linktypes.html>
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Linktype(pub u32);

impl Linktype {
	/// BSD loopback encapsulation.
	pub const NULL: Self = Self(0);
	pub const ETHERNET: Self = Self(1);
	/// Raw IP; the packet begins with an IPv4 or IPv6 header.
	pub const RAW: Self = Self(101);
}

impl From<LinkKind> for Linktype {
	fn from(kind: LinkKind) -> Self {
		match kind {
			LinkKind::Ethernet => Self::ETHERNET,
			LinkKind::Loopback => Self::NULL,
		}
	}
}

/// Mirrors injected frames into a capture file.
pub struct Writer {
	file: Mutex<File>,
}

impl Writer {
	pub fn new(path: &Path, network: Linktype) -> Result<Self> {
		let mut file = File::create(path).map_err(|err| {
			warn!("Unable to create pcap file {}: {err}", path.display());
			err
		})?;

		let mut header = Vec::with_capacity(HEADER_LEN);
		header.extend_from_slice(&MAGIC_NANO.to_ne_bytes());
		// version 2.4
		header.extend_from_slice(&2u16.to_ne_bytes());
		header.extend_from_slice(&4u16.to_ne_bytes());
		// thiszone, sigfigs
		header.extend_from_slice(&0i32.to_ne_bytes());
		header.extend_from_slice(&0u32.to_ne_bytes());
		header.extend_from_slice(&SNAPLEN.to_ne_bytes());
		header.extend_from_slice(&network.0.to_ne_bytes());

		file.write_all(&header).map_err(|err| {
			warn!("Could not write header to pcap file: {err}");
			err
		})?;

		Ok(Self { file: Mutex::new(file) })
	}

	pub fn log(&self, packet: &[u8]) -> Result {
		let timestamp = SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.map_err(|_| Error::Protocol("system clock is before the UNIX epoch".into()))?;

		let packet_len: u32 = packet.len().try_into().map_err(|_| Error::Protocol("packet length is too large".into()))?;
		let incl_len = packet_len.min(SNAPLEN);

		let ts_sec: u32 = timestamp.as_secs().try_into().map_err(|_| Error::Protocol("timestamp seconds overflow".into()))?;

		let mut record = [0; RECORD_LEN];
		record[0..4].copy_from_slice(&ts_sec.to_ne_bytes());
		record[4..8].copy_from_slice(&timestamp.subsec_nanos().to_ne_bytes());
		record[8..12].copy_from_slice(&incl_len.to_ne_bytes());
		record[12..16].copy_from_slice(&packet_len.to_ne_bytes());

		let mut file = self.file.guard();
		file.write_all(&record)?;
		file.write_all(&packet[..incl_len as usize])?;

		Ok(())
	}
}

/// A PCAP consumer.
pub struct Reader {
	file: File,
	/// Whether the capture is nanosecond-resolution.
	nano: bool,
}

impl Reader {
	/// Construct a new reader and parse the header from a packet capture file.
	pub fn new(path: &Path) -> Result<(Self, Linktype)> {
		let mut file = File::open(path)?;

		let mut buf = [0; HEADER_LEN];
		file.read_exact(&mut buf)?;

		let word = |at: usize| u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
		let half = |at: usize| u16::from_ne_bytes([buf[at], buf[at + 1]]);

		let nano = match word(0) {
			MAGIC_MICRO => false,
			MAGIC_NANO => true,
			n => return Err(Error::Protocol(format!("unsupported PCAP magic number: 0x{n:08X}"))),
		};

		if half(4) != 2 || half(6) != 4 {
			return Err(Error::Protocol(format!("unsupported PCAP version: {}.{}, expected 2.4", half(4), half(6))));
		}

		Ok((Self { file, nano }, Linktype(word(20))))
	}

	pub fn visit(mut self, mut f: impl FnMut(SystemTime, &[u8])) -> Result {
		let mut hdr = [0; RECORD_LEN];
		let mut buf = Vec::new();

		while self.file.read_exact(&mut hdr).is_ok() {
			let word = |at: usize| u32::from_ne_bytes([hdr[at], hdr[at + 1], hdr[at + 2], hdr[at + 3]]);

			let time = SystemTime::UNIX_EPOCH
				+ Duration::from_secs(word(0) as u64)
				+ if self.nano { Duration::from_nanos(word(4) as u64) } else { Duration::from_micros(word(4) as u64) };

			buf.resize(word(8) as usize, 0);
			self.file.read_exact(&mut buf)?;

			f(time, &buf)
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mirror_can_be_read_back() {
		let path = std::env::temp_dir().join(format!("mirror-{}.pcap", std::process::id()));

		let writer = Writer::new(&path, LinkKind::Ethernet.into()).unwrap();
		writer.log(b"first frame").unwrap();
		writer.log(b"second").unwrap();
		drop(writer);

		let (reader, network) = Reader::new(&path).unwrap();
		assert_eq!(network, Linktype::ETHERNET);

		let mut seen = Vec::new();
		reader.visit(|_, frame| seen.push(frame.to_vec())).unwrap();
		std::fs::remove_file(&path).unwrap();

		assert_eq!(seen, [b"first frame".to_vec(), b"second".to_vec()]);
	}
}
