//! Link-layer framing for the interfaces packets are injected on.

use core::fmt;
use core::str::FromStr;
use std::fs;
use std::path::Path;

use log::debug;
use utils::error::*;

pub const ETHERTYPE_IPV6: u16 = 0x86dd;

pub const ETHERNET_LEN: usize = 14;
pub const LOOPBACK_LEN: usize = 4;

/// Address family marker for IPv6 on BSD-style loopback links.
pub const LOOPBACK_IPV6: u32 = 0x1e;

const ARPHRD_ETHER: u32 = 1;
const ARPHRD_LOOPBACK: u32 = 772;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Mac(pub [u8; 6]);

impl fmt::Display for Mac {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let [a, b, c, d, e, g] = self.0;
		write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
	}
}

impl fmt::Debug for Mac {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

impl FromStr for Mac {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		let invalid = || Error::Config(format!("invalid MAC address {s:?}"));

		let mut mac = [0; 6];
		let mut parts = s.trim().split(':');

		for byte in &mut mac {
			let part = parts.next().ok_or_else(invalid)?;
			*byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
		}

		match parts.next() {
			Some(_) => Err(invalid()),
			None => Ok(Self(mac)),
		}
	}
}

/// How frames on an interface are framed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkKind {
	Ethernet,
	/// Null/loopback framing: a 4-byte host-order address family.
	Loopback,
}

impl LinkKind {
	pub fn header_len(self) -> usize {
		match self {
			Self::Ethernet => ETHERNET_LEN,
			Self::Loopback => LOOPBACK_LEN,
		}
	}

	/// The IPv6 packet inside a captured frame, or `None` when the frame carries something else.
	pub fn strip(self, frame: &[u8]) -> Option<&[u8]> {
		match self {
			Self::Ethernet => {
				let ethertype = u16::from_be_bytes([*frame.get(12)?, *frame.get(13)?]);
				(ethertype == ETHERTYPE_IPV6).then(|| &frame[ETHERNET_LEN..])
			}
			Self::Loopback => {
				let family = u32::from_ne_bytes(frame.get(..LOOPBACK_LEN)?.try_into().ok()?);
				(family == LOOPBACK_IPV6).then(|| &frame[LOOPBACK_LEN..])
			}
		}
	}
}

/// A link-layer header ready to be written in front of a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
	Ethernet { src: Mac, dst: Mac },
	Loopback,
}

impl Link {
	pub fn len(&self) -> usize {
		self.kind().header_len()
	}

	pub fn kind(&self) -> LinkKind {
		match self {
			Self::Ethernet { .. } => LinkKind::Ethernet,
			Self::Loopback => LinkKind::Loopback,
		}
	}

	pub fn encode(&self, buf: &mut Vec<u8>) {
		match self {
			Self::Ethernet { src, dst } => {
				buf.extend_from_slice(&dst.0);
				buf.extend_from_slice(&src.0);
				buf.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
			}
			Self::Loopback => buf.extend_from_slice(&LOOPBACK_IPV6.to_ne_bytes()),
		}
	}
}

/// A local network interface packets can be injected on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interface {
	pub name: String,
	pub kind: LinkKind,
	pub mac: Mac,
	pub mtu: usize,
	pub up: bool,
}

impl Interface {
	/// The header for a frame leaving this interface towards `dst`.
	pub fn link(&self, dst: Option<Mac>) -> Link {
		match self.kind {
			LinkKind::Ethernet => Link::Ethernet { src: self.mac, dst: dst.unwrap_or_default() },
			LinkKind::Loopback => Link::Loopback,
		}
	}
}

/// Enumerate Ethernet and loopback interfaces from `/sys/class/net`.
///
/// Linux frames its loopback device as Ethernet with zero addresses, so both come back as [`LinkKind::Ethernet`].
pub fn discover() -> Result<Vec<Interface>> {
	discover_in(Path::new("/sys/class/net"))
}

pub fn discover_in(root: &Path) -> Result<Vec<Interface>> {
	let mut found = Vec::new();

	for entry in fs::read_dir(root)? {
		let entry = entry?;
		let name = entry.file_name().to_string_lossy().into_owned();
		let dir = entry.path();

		let read = |attr: &str| fs::read_to_string(dir.join(attr)).map(|s| s.trim().to_owned());

		let Ok(kind) = read("type").map(|t| t.parse::<u32>().unwrap_or_default()) else { continue };

		if kind != ARPHRD_ETHER && kind != ARPHRD_LOOPBACK {
			debug!("Skipping interface {name} of type {kind}");
			continue;
		}

		let mac = match read("address") {
			Ok(addr) => addr.parse().unwrap_or_default(),
			Err(_) => Mac::default(),
		};

		let mtu = read("mtu").ok().and_then(|m| m.parse().ok()).unwrap_or(1500);

		let up = read("operstate").is_ok_and(|s| s == "up" || s == "unknown");

		found.push(Interface { name, kind: LinkKind::Ethernet, mac, mtu, up });
	}

	found.sort_by(|a, b| a.name.cmp(&b.name));

	Ok(found)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mac_parsing() {
		let mac: Mac = "02:42:ac:11:00:02".parse().unwrap();
		assert_eq!(mac, Mac([0x02, 0x42, 0xac, 0x11, 0x00, 0x02]));
		assert_eq!(mac.to_string(), "02:42:ac:11:00:02");

		assert!("02:42:ac:11:00".parse::<Mac>().is_err());
		assert!("02:42:ac:11:00:02:03".parse::<Mac>().is_err());
		assert!("zz:42:ac:11:00:02".parse::<Mac>().is_err());
	}

	#[test]
	fn ethernet_framing() {
		let src = Mac([2, 0, 0, 0, 0, 1]);
		let dst = Mac([2, 0, 0, 0, 0, 2]);

		let mut frame = Vec::new();
		Link::Ethernet { src, dst }.encode(&mut frame);
		frame.extend_from_slice(&[0x60, 1, 2, 3]);

		assert_eq!(&frame[..6], &dst.0);
		assert_eq!(&frame[6..12], &src.0);
		assert_eq!(LinkKind::Ethernet.strip(&frame), Some(&[0x60, 1, 2, 3][..]));

		frame[12] = 0x08;
		frame[13] = 0x00;
		assert_eq!(LinkKind::Ethernet.strip(&frame), None);
		assert_eq!(LinkKind::Ethernet.strip(&frame[..10]), None);
	}

	#[test]
	fn loopback_framing() {
		let mut frame = Vec::new();
		Link::Loopback.encode(&mut frame);
		frame.push(0x60);

		assert_eq!(frame.len(), LOOPBACK_LEN + 1);
		assert_eq!(LinkKind::Loopback.strip(&frame), Some(&[0x60][..]));
	}

	#[test]
	fn discovers_from_sysfs_layout() {
		let root = std::env::temp_dir().join(format!("net-sysfs-{}", std::process::id()));
		let _ = fs::remove_dir_all(&root);

		for (name, kind, addr, state) in [
			("eth0", "1", "02:42:ac:11:00:02", "up"),
			("lo", "772", "00:00:00:00:00:00", "unknown"),
			("tun0", "65534", "", "up"),
		] {
			let dir = root.join(name);
			fs::create_dir_all(&dir).unwrap();
			fs::write(dir.join("type"), format!("{kind}\n")).unwrap();
			fs::write(dir.join("address"), format!("{addr}\n")).unwrap();
			fs::write(dir.join("mtu"), "1500\n").unwrap();
			fs::write(dir.join("operstate"), format!("{state}\n")).unwrap();
		}

		let found = discover_in(&root).unwrap();
		fs::remove_dir_all(&root).unwrap();

		assert_eq!(found.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(), ["eth0", "lo"]);
		assert_eq!(found[0].mac, Mac([0x02, 0x42, 0xac, 0x11, 0x00, 0x02]));
		assert!(found.iter().all(|i| i.up && i.mtu == 1500 && i.kind == LinkKind::Ethernet));
	}
}
