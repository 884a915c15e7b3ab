//! Raw packet injection.
//!
//! Packets are framed here and handed to a per-interface [`Sink`], in production the privileged `sendRaw` helper,
//! which writes them to the wire unchanged.

use core::net::Ipv6Addr;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use runtime::helper::{Helper, Supervisor};
use utils::error::*;

use crate::icmp;
use crate::ip::{fragment, v6, Protocol};
use crate::link::{Interface, Link};
use crate::route::{Mapping, Resolver};
use crate::Transport;

/// Receives complete link-layer frames for one interface.
pub trait Sink: Send + Sync {
	fn send(&self, frame: &[u8]) -> Result;
}

impl Sink for Helper {
	fn send(&self, frame: &[u8]) -> Result {
		Helper::send(self, frame)
	}
}

struct Egress {
	interface: Interface,
	sink: Arc<dyn Sink>,
	#[cfg(feature = "pcap")]
	mirror: Option<crate::pcap::Writer>,
}

pub struct Injector {
	egress: HashMap<String, Egress>,
	resolver: Arc<dyn Resolver>,
	/// Fragment identification values. One is drawn per fragmented packet.
	ident: AtomicU32,
}

impl Injector {
	pub fn new(resolver: Arc<dyn Resolver>) -> Self {
		Self { egress: HashMap::new(), resolver, ident: AtomicU32::new(rand::random()) }
	}

	/// Start one raw sender per interface and register each with the supervisor.
	///
	/// A sender that fails to start is kept; the first send to it will restart it.
	pub fn spawn(
		interfaces: Vec<Interface>,
		resolver: Arc<dyn Resolver>,
		program: &Path,
		ready: Duration,
		supervisor: &Supervisor,
	) -> Self {
		let mut injector = Self::new(resolver);

		for interface in interfaces {
			let helper = Helper::new(program, [interface.name.as_str()], ready);

			if let Err(err) = helper.start() {
				warn!("Raw sender for {} is not running yet: {err}", interface.name);
			}

			supervisor.register(helper.watch());
			injector.add(interface, Arc::new(helper));
		}

		injector
	}

	pub fn add(&mut self, interface: Interface, sink: Arc<dyn Sink>) {
		debug!("Injecting on {} ({:?}, mtu {})", interface.name, interface.kind, interface.mtu);

		let name = interface.name.clone();

		self.egress.insert(
			name,
			Egress {
				interface,
				sink,
				#[cfg(feature = "pcap")]
				mirror: None,
			},
		);
	}

	/// Mirror every frame injected from now on into `<dir>/<interface>.pcap`.
	#[cfg(feature = "pcap")]
	pub fn mirror(&mut self, dir: &Path) -> Result {
		for (name, egress) in &mut self.egress {
			let path = dir.join(format!("{name}.pcap"));
			egress.mirror = Some(crate::pcap::Writer::new(&path, egress.interface.kind.into())?);
		}

		Ok(())
	}

	pub fn interface(&self, name: &str) -> Option<&Interface> {
		self.egress.get(name).map(|e| &e.interface)
	}

	pub fn resolver(&self) -> &Arc<dyn Resolver> {
		&self.resolver
	}

	/// Rewrite the source port of a transport segment, reseal its checksum and put it on the wire. Returns the number of
	/// frames written.
	pub fn inject(
		&self,
		mapping: &Mapping,
		src: Ipv6Addr,
		dst: Ipv6Addr,
		src_port: u16,
		mut segment: Vec<u8>,
		kind: Transport,
	) -> Result<usize> {
		kind.set_source_port(&mut segment, src_port)?;
		kind.seal(&mut segment, src, dst)?;

		self.emit(mapping, kind.protocol(), src, dst, &segment)
	}

	/// Tell the sender of `original` that it has to fit `mtu`. `src` and `dst` are the addresses of the original packet;
	/// the message travels the opposite way.
	pub fn packet_too_big(&self, src: Ipv6Addr, dst: Ipv6Addr, original: &[u8], mtu: u32) -> Result {
		let mapping = self.resolver.mapping(&src).ok_or(Error::Unroutable(src))?;
		let msg = icmp::too_big(dst, src, mtu, original);

		debug!("Packet of {} bytes from {src} exceeds {mtu}, sending packet too big", original.len());

		self.emit(&mapping, Protocol::Icmpv6, dst, src, &msg).map(drop)
	}

	fn emit(&self, mapping: &Mapping, next: Protocol, src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8]) -> Result<usize> {
		let egress = self.egress.get(&mapping.interface).ok_or(Error::Unroutable(dst))?;
		let mtu = egress.interface.mtu;

		let ident = if v6::HEADER_LEN + payload.len() > mtu { self.ident.fetch_add(1, Ordering::Relaxed) } else { 0 };

		let frames = frames(&egress.interface.link(mapping.mac), next, src, dst, payload, mtu, ident)?;

		for frame in &frames {
			#[cfg(feature = "pcap")]
			if let Some(mirror) = &egress.mirror {
				if let Err(err) = mirror.log(frame) {
					warn!("Unable to mirror frame on {}: {err}", mapping.interface);
				}
			}

			egress.sink.send(frame)?;
		}

		trace!("Injected {} frames for {src} -> {dst} on {}", frames.len(), mapping.interface);

		Ok(frames.len())
	}
}

/// Frame an upper-layer payload for a link, fragmenting it when it does not fit `mtu`.
pub fn frames(link: &Link, next: Protocol, src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8], mtu: usize, ident: u32) -> Result<Vec<Vec<u8>>> {
	if payload.len() > u16::MAX as usize {
		return Err(Error::Protocol(format!("payload of {} bytes cannot be carried by IPv6", payload.len())));
	}

	if v6::HEADER_LEN + payload.len() <= mtu {
		let mut frame = Vec::with_capacity(link.len() + v6::HEADER_LEN + payload.len());
		link.encode(&mut frame);
		v6::Header::new(next, src, dst, payload.len() as u16).encode(&mut frame);
		frame.extend_from_slice(payload);

		return Ok(vec![frame]);
	}

	let frames = fragment::split(payload, mtu, next, ident)
		.map(|(frag, chunk)| {
			let len = fragment::HEADER_LEN + chunk.len();

			let mut frame = Vec::with_capacity(link.len() + v6::HEADER_LEN + len);
			link.encode(&mut frame);
			v6::Header::new(Protocol::Fragment, src, dst, len as u16).encode(&mut frame);
			frag.encode(&mut frame);
			frame.extend_from_slice(chunk);
			frame
		})
		.collect();

	Ok(frames)
}

#[cfg(test)]
mod tests {
	use std::sync::Mutex;

	use super::*;
	use crate::ip::fragment::{Fragment, Key, Store};
	use crate::link::{LinkKind, Mac, ETHERNET_LEN};
	use crate::route::Table;

	#[derive(Default)]
	struct Recorder {
		frames: Mutex<Vec<Vec<u8>>>,
	}

	impl Sink for Recorder {
		fn send(&self, frame: &[u8]) -> Result {
			self.frames.lock().unwrap().push(frame.to_vec());
			Ok(())
		}
	}

	const APP: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0x10);
	const VIRT: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0xbeef, 1);

	fn app() -> Mapping {
		Mapping::new("eth0", Some(Mac([2, 0, 0, 0, 0, 0x10])))
	}

	fn setup(mtu: usize) -> (Injector, Arc<Recorder>) {
		let table = Table::new(vec!["eth0".into()]);
		table.add_mapping(APP, app());

		let recorder = Arc::new(Recorder::default());

		let mut injector = Injector::new(Arc::new(table));
		injector.add(
			Interface { name: "eth0".into(), kind: LinkKind::Ethernet, mac: Mac([2, 0, 0, 0, 0, 1]), mtu, up: true },
			recorder.clone(),
		);

		(injector, recorder)
	}

	fn udp(len: usize) -> Vec<u8> {
		let mut seg = vec![0; udp_len(len)];
		seg[2..4].copy_from_slice(&5353u16.to_be_bytes());
		seg[4..6].copy_from_slice(&(udp_len(len) as u16).to_be_bytes());

		for (i, b) in seg[crate::udp::HEADER_LEN..].iter_mut().enumerate() {
			*b = i as u8;
		}

		seg
	}

	fn udp_len(len: usize) -> usize {
		crate::udp::HEADER_LEN + len
	}

	#[test]
	fn small_segment_is_one_frame() {
		let (injector, recorder) = setup(1500);

		assert_eq!(injector.inject(&app(), VIRT, APP, 40001, udp(100), Transport::Datagram).unwrap(), 1);

		let frames = recorder.frames.lock().unwrap();
		let frame = &frames[0];

		assert_eq!(&frame[..6], &[2, 0, 0, 0, 0, 0x10]);
		assert_eq!(&frame[6..12], &[2, 0, 0, 0, 0, 1]);

		let packet = LinkKind::Ethernet.strip(frame).unwrap();
		let (header, seg) = v6::Header::decode(packet).unwrap();

		assert_eq!((header.src, header.dst, header.next), (VIRT, APP, Protocol::Udp));
		assert_eq!(Transport::Datagram.ports(seg).unwrap(), (40001, 5353));
		assert!(Transport::Datagram.verify(seg, VIRT, APP));
	}

	#[test]
	fn oversized_segment_is_fragmented_and_reassembles() {
		let (injector, recorder) = setup(v6::MIN_MTU);
		let seg = udp(3000 - crate::udp::HEADER_LEN);

		assert_eq!(injector.inject(&app(), VIRT, APP, 40001, seg.clone(), Transport::Datagram).unwrap(), 3);

		let frames = recorder.frames.lock().unwrap();
		let mut store = Store::new();
		let mut whole = None;
		let mut idents = Vec::new();

		for frame in frames.iter() {
			assert!(frame.len() - ETHERNET_LEN <= v6::MIN_MTU);

			let packet = v6::Packet::parse(LinkKind::Ethernet.strip(frame).unwrap()).unwrap();
			let v6::Payload::Fragment(frag, data) = packet.payload().unwrap() else { panic!("expected a fragment") };

			idents.push(frag.ident);

			if let Some(buf) = store.insert(Key::of(&packet.header, &frag), Fragment::new(&frag, data)).unwrap() {
				whole = Some(buf);
			}
		}

		idents.dedup();
		assert_eq!(idents.len(), 1);

		let whole = whole.unwrap();
		assert_eq!(whole.len(), 3000);
		assert_eq!(&whole[crate::udp::HEADER_LEN..], &seg[crate::udp::HEADER_LEN..]);
		assert!(Transport::Datagram.verify(&whole, VIRT, APP));
	}

	#[test]
	fn unroutable_destination_is_refused() {
		let (injector, recorder) = setup(1500);

		let err = injector.packet_too_big("fd00::99".parse().unwrap(), VIRT, &[0x60; 1500], 1280).unwrap_err();
		assert!(matches!(err, Error::Unroutable(_)));

		let err = injector.inject(&Mapping::new("wlan0", None), VIRT, APP, 1, udp(4), Transport::Datagram).unwrap_err();
		assert!(matches!(err, Error::Unroutable(_)));

		assert!(recorder.frames.lock().unwrap().is_empty());
	}

	#[test]
	fn too_big_goes_back_to_the_source() {
		let (injector, recorder) = setup(1500);

		injector.packet_too_big(APP, VIRT, &[0x60; 1500], 1364).unwrap();

		let frames = recorder.frames.lock().unwrap();
		let packet = LinkKind::Ethernet.strip(&frames[0]).unwrap();
		let (header, msg) = v6::Header::decode(packet).unwrap();

		assert_eq!((header.src, header.dst, header.next), (VIRT, APP, Protocol::Icmpv6));
		assert_eq!(msg[0], icmp::PACKET_TOO_BIG);
		assert_eq!(&msg[4..8], &1364u32.to_be_bytes());
		assert!(header.len as usize + v6::HEADER_LEN <= v6::MIN_MTU);
	}

	#[cfg(feature = "pcap")]
	#[test]
	fn injected_frames_are_mirrored() {
		let dir = std::env::temp_dir().join(format!("inject-mirror-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();

		let (mut injector, recorder) = setup(1500);
		injector.mirror(&dir).unwrap();
		injector.inject(&app(), VIRT, APP, 40001, udp(100), Transport::Datagram).unwrap();

		let (reader, _) = crate::pcap::Reader::new(&dir.join("eth0.pcap")).unwrap();
		let mut seen = Vec::new();
		reader.visit(|_, frame| seen.push(frame.to_vec())).unwrap();
		std::fs::remove_dir_all(&dir).unwrap();

		assert_eq!(seen, *recorder.frames.lock().unwrap());
	}
}
