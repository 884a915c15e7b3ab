use bilge::prelude::*;

mod checksum;

pub mod fragment;
pub mod v6;

pub use checksum::{checksum16, Checksum};

#[bitsize(4)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBits)]
pub enum Version {
	V4 = 4,
	V6 = 6,
	#[fallback]
	Unknown,
}

/// The next-header values this crate needs to tell apart.
#[repr(u8)]
#[bitsize(8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromBits)]
pub enum Protocol {
	Tcp = 6,
	Udp = 17,
	Fragment = 44,
	Icmpv6 = 58,
	#[fallback]
	Unknown(u8),
}
