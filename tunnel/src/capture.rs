//! Passive capture of traffic addressed to a proxy.
//!
//! One worker thread runs per interface and filter. It strips the link header, reassembles fragments and hands whole
//! transport segments to its proxy, or answers with packet too big when a segment cannot be tunnelled.

use core::fmt;
use core::net::Ipv6Addr;
use std::borrow::Cow;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::{ChildStdout, Command, Stdio};
use std::sync::{Arc, Weak};
use std::thread;

use log::{debug, trace, warn};
use net::ip::fragment::{self, Fragment, Store};
use net::ip::{v6, Protocol};
use net::link::LinkKind;
use net::{Injector, Transport};
use runtime::helper::{self, Process, Stop, Supervisor};
use utils::error::*;

use crate::proxy::Proxy;

/// Selects the packets one proxy is interested in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Filter {
	pub addr: Ipv6Addr,
	pub kind: Transport,
	pub port: u16,
}

impl Filter {
	pub fn matches(&self, dst: Ipv6Addr, next: Protocol, segment: &[u8]) -> bool {
		dst == self.addr
			&& Transport::from_protocol(next) == Some(self.kind)
			&& self.kind.ports(segment).is_ok_and(|(_, dport)| dport == self.port)
	}
}

/// The BPF expression for the capture helper.
impl fmt::Display for Filter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ip6 dst host {} and {} and dst port {}", self.addr, self.kind.name(), self.port)
	}
}

/// A stream of captured link-layer frames.
pub trait Source: Send {
	/// The next frame, or `None` once the capture is closed.
	fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

pub trait Capturer: Send + Sync {
	/// Start capturing on an interface. The returned handle stops the capture, which makes the source return `None`.
	fn open(&self, interface: &str, filter: &Filter) -> Result<(Box<dyn Source>, Arc<dyn Stop>)>;
}

/// Captures through the `capture` helper, which writes length-prefixed frames to its standard output.
pub struct HelperCapturer {
	program: PathBuf,
	supervisor: Arc<Supervisor>,
}

impl HelperCapturer {
	pub fn new(program: impl Into<PathBuf>, supervisor: Arc<Supervisor>) -> Self {
		Self { program: program.into(), supervisor }
	}
}

struct Frames(BufReader<ChildStdout>);

impl Source for Frames {
	fn recv(&mut self) -> Result<Option<Vec<u8>>> {
		Ok(helper::read_frame(&mut self.0)?)
	}
}

impl Capturer for HelperCapturer {
	fn open(&self, interface: &str, filter: &Filter) -> Result<(Box<dyn Source>, Arc<dyn Stop>)> {
		let name = format!("capture[{interface}]");

		let mut child = helper::spawn(
			&name,
			Command::new(&self.program)
				.arg(interface)
				.arg(filter.to_string())
				.stdin(Stdio::null())
				.stdout(Stdio::piped()),
		)?;

		let stdout = child.stdout.take().ok_or_else(|| Error::HelperUnavailable(name.clone()))?;
		let process = Process::new(name, child);

		let weak: Weak<Process> = Arc::downgrade(&process);
		self.supervisor.register(weak);

		let source: Box<dyn Source> = Box::new(Frames(BufReader::new(stdout)));
		let stop: Arc<dyn Stop> = process;

		Ok((source, stop))
	}
}

/// What a worker needs besides its source.
pub struct Target {
	pub proxy: Weak<dyn Proxy>,
	pub filter: Filter,
	pub injector: Arc<Injector>,
	/// Largest IPv6 packet that may be tunnelled.
	pub mtu: usize,
}

pub struct Worker {
	interface: String,
	stop: Arc<dyn Stop>,
}

impl Worker {
	pub fn spawn(capturer: &dyn Capturer, interface: &str, target: Target) -> Result<Self> {
		let link = target.injector.interface(interface).map_or(LinkKind::Ethernet, |i| i.kind);
		let (source, stop) = capturer.open(interface, &target.filter)?;

		debug!("Capturing {} on {interface}", target.filter);

		let name = format!("capture-{interface}-{}", target.filter.port);
		let spawned = thread::Builder::new().name(name).spawn(move || run(source, link, target));

		if let Err(err) = spawned {
			stop.stop();
			return Err(err.into());
		}

		Ok(Self { interface: interface.to_owned(), stop })
	}

	pub fn interface(&self) -> &str {
		&self.interface
	}
}

impl Drop for Worker {
	fn drop(&mut self) {
		self.stop.stop();
	}
}

fn run(mut source: Box<dyn Source>, link: LinkKind, target: Target) {
	let mut store = Store::new();

	loop {
		let frame = match source.recv() {
			Ok(Some(frame)) => frame,
			Ok(None) => break,
			Err(err) => {
				warn!("Capture of {} failed: {err}", target.filter);
				break;
			}
		};

		match handle(&frame, link, &target, &mut store) {
			Ok(true) => {}
			Ok(false) => break,
			Err(err) => warn!("Dropping captured packet: {err}"),
		}
	}

	debug!("Capture of {} stopped", target.filter);
}

/// Returns whether the worker should keep going.
fn handle(frame: &[u8], link: LinkKind, target: &Target, store: &mut Store) -> Result<bool> {
	let Some(packet) = link.strip(frame) else {
		trace!("Ignoring non-IPv6 frame");
		return Ok(true);
	};

	let packet = v6::Packet::parse(packet)?;
	let header = packet.header;

	let (next, segment) = match packet.payload()? {
		v6::Payload::Whole(next, data) => (next, Cow::Borrowed(data)),
		v6::Payload::Fragment(frag, data) => match store.insert(fragment::Key::of(&header, &frag), Fragment::new(&frag, data))? {
			Some(whole) => (frag.next, Cow::Owned(whole)),
			None => return Ok(true),
		},
	};

	if !target.filter.matches(header.dst, next, &segment) {
		return Ok(true);
	}

	let Some(proxy) = target.proxy.upgrade() else { return Ok(false) };

	if v6::HEADER_LEN + segment.len() > target.mtu {
		let original = rebuild(next, header.src, header.dst, &segment)?;

		target.injector.packet_too_big(header.src, header.dst, &original, target.mtu as u32)?;
		return Ok(true);
	}

	proxy.receive_bytes(&segment, target.filter.kind, header.src)?;

	Ok(true)
}

/// The unfragmented packet a segment would have travelled in.
fn rebuild(next: Protocol, src: Ipv6Addr, dst: Ipv6Addr, segment: &[u8]) -> Result<Vec<u8>> {
	let len = u16::try_from(segment.len())
		.map_err(|_| Error::Protocol(format!("reassembled segment of {} bytes exceeds an IPv6 payload", segment.len())))?;

	let mut packet = Vec::with_capacity(v6::HEADER_LEN + segment.len());
	v6::Header::new(next, src, dst, len).encode(&mut packet);
	packet.extend_from_slice(segment);

	Ok(packet)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn filter_expression_and_matching() {
		let addr: Ipv6Addr = "fd00::beef".parse().unwrap();
		let filter = Filter { addr, kind: Transport::Datagram, port: 5353 };

		assert_eq!(filter.to_string(), "ip6 dst host fd00::beef and udp and dst port 5353");

		let mut seg = vec![0; 8];
		seg[2..4].copy_from_slice(&5353u16.to_be_bytes());

		assert!(filter.matches(addr, Protocol::Udp, &seg));
		assert!(!filter.matches(addr, Protocol::Tcp, &seg));
		assert!(!filter.matches(Ipv6Addr::LOCALHOST, Protocol::Udp, &seg));

		seg[3] ^= 1;
		assert!(!filter.matches(addr, Protocol::Udp, &seg));
	}

	#[test]
	fn oversized_reassembly_is_refused() {
		let src: Ipv6Addr = "fd00::1".parse().unwrap();
		let dst: Ipv6Addr = "fd00::2".parse().unwrap();

		let packet = rebuild(Protocol::Udp, src, dst, &[7; 100]).unwrap();
		let (header, payload) = v6::Header::decode(&packet).unwrap();
		assert_eq!((header.len, header.next), (100, Protocol::Udp));
		assert_eq!(payload, &[7; 100]);

		let err = rebuild(Protocol::Udp, src, dst, &vec![0; 70000]).unwrap_err();
		assert!(matches!(err, Error::Protocol(_)));
	}
}
