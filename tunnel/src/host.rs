//! Interface address configuration.

use core::net::Ipv6Addr;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use log::{debug, warn};
use runtime::helper;
use utils::error::*;

/// Exit status of `ifconfighelp` when the address is already configured.
const DUPLICATE: i32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Added {
	Bound,
	Duplicate,
}

pub trait HostConfig: Send + Sync {
	/// The IPv6 addresses configured on an interface, with their prefix lengths.
	fn addresses(&self, interface: &str) -> Result<Vec<(Ipv6Addr, u8)>>;

	fn add_address(&self, interface: &str, addr: Ipv6Addr, len: u8) -> Result<Added>;
}

/// Reads addresses with `ip` and adds them through the privileged `ifconfighelp`.
pub struct Helpers {
	ifconfig: PathBuf,
}

impl Helpers {
	pub fn new(ifconfig: impl Into<PathBuf>) -> Self {
		Self { ifconfig: ifconfig.into() }
	}
}

impl HostConfig for Helpers {
	fn addresses(&self, interface: &str) -> Result<Vec<(Ipv6Addr, u8)>> {
		let output = Command::new("ip").args(["-o", "-6", "addr", "show", "dev", interface]).output()?;

		if !output.status.success() {
			return Err(Error::Config(format!(
				"cannot list addresses of {interface}: {}",
				String::from_utf8_lossy(&output.stderr).trim()
			)));
		}

		Ok(parse_addresses(&String::from_utf8_lossy(&output.stdout)))
	}

	fn add_address(&self, interface: &str, addr: Ipv6Addr, len: u8) -> Result<Added> {
		let mut child = helper::spawn(
			"ifconfighelp",
			Command::new(&self.ifconfig)
				.arg(interface)
				.arg(format!("{addr}/{len}"))
				.stdin(Stdio::null())
				.stdout(Stdio::null()),
		)?;

		let status = child.wait()?;

		match status.code() {
			Some(0) => {
				debug!("Configured {addr}/{len} on {interface}");
				Ok(Added::Bound)
			}
			Some(DUPLICATE) => Ok(Added::Duplicate),
			_ => {
				warn!("ifconfighelp {interface} {addr}/{len} exited with {status}");
				Err(Error::Config(format!("ifconfighelp exited with {status}")))
			}
		}
	}
}

/// Parse the one-line-per-address output of `ip -o -6 addr show`.
pub fn parse_addresses(output: &str) -> Vec<(Ipv6Addr, u8)> {
	output
		.lines()
		.filter_map(|line| {
			let mut words = line.split_whitespace().skip_while(|w| *w != "inet6");
			let (addr, len) = words.nth(1)?.split_once('/')?;
			Some((addr.parse().ok()?, len.parse().ok()?))
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_ip_output() {
		let output = "\
2: eth0    inet6 fd5e:1d2a:33::7/64 scope global \\       valid_lft forever preferred_lft forever
2: eth0    inet6 fd5e:1d2a:33::a1b2/128 scope global \\       valid_lft forever preferred_lft forever
2: eth0    inet6 fe80::42:acff:fe11:2/64 scope link \\       valid_lft forever preferred_lft forever
garbage line
";

		assert_eq!(
			parse_addresses(output),
			[
				("fd5e:1d2a:33::7".parse().unwrap(), 64),
				("fd5e:1d2a:33::a1b2".parse().unwrap(), 128),
				("fe80::42:acff:fe11:2".parse().unwrap(), 64),
			]
		);
	}
}
