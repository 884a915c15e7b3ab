//! The data-plane connection to one peer.
//!
//! Frames travel over whichever session the role state machine kept. Received frames are dispatched to the proxy
//! owning their flow, creating a [`ProxyClient`] on the fly when the flow names a locally exported service.

use core::net::Ipv6Addr;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, trace, warn};
use net::Transport;
use utils::error::*;
use utils::sync::Lock;

use crate::frame::{self, Decoder, Frame};
use crate::plane::{Attach, Mode, Plane, Session};
use crate::proxy::{Proxy, ProxyClient};
use crate::{Context, FlowId, Uid};

struct Liveness {
	last_recv: Instant,
	last_probe: Option<Instant>,
}

pub struct Connection {
	ctx: Arc<Context>,
	plane: Plane<dyn Session>,
	/// Clients created for flows that arrived over this connection, released together on disconnect.
	clients: Mutex<Vec<Arc<ProxyClient>>>,
	liveness: Mutex<Liveness>,
	decoder: Mutex<Decoder>,
}

impl Connection {
	pub fn new(ctx: Arc<Context>, peer: Uid) -> Arc<Self> {
		let plane = Plane::new(ctx.config.local, peer);

		Arc::new(Self {
			ctx,
			plane,
			clients: Mutex::default(),
			liveness: Mutex::new(Liveness { last_recv: Instant::now(), last_probe: None }),
			decoder: Mutex::default(),
		})
	}

	pub fn peer(&self) -> Uid {
		self.plane.peer()
	}

	pub fn mode(&self) -> Mode {
		self.plane.mode()
	}

	pub fn plane(&self) -> &Plane<dyn Session> {
		&self.plane
	}

	/// Act on the outcome of attaching a session that runs in `mode`. Returns whether it is the one the connection now
	/// runs on.
	pub(crate) fn settle(&self, mode: Mode, outcome: Attach<dyn Session>) -> bool {
		match outcome {
			Attach::Established => {
				debug!("Connection to peer {} established", self.peer());
				self.touch();
				true
			}
			Attach::Resolved { kept, dropped } => {
				debug!("Connection to peer {} keeps its {kept:?} session", self.peer());
				dropped.handle().close();
				kept == mode
			}
			Attach::AlreadyBound(role) => {
				warn!("Peer {} already has a {:?} session, refusing another", self.peer(), role.mode());
				false
			}
		}
	}

	/// Detach the session running in `mode`. Once the connection is closed every client it created is released.
	pub fn detach(&self, mode: Mode) -> bool {
		let Some(session) = self.plane.detach(mode) else { return false };

		session.close();
		self.release_clients();

		debug!("Connection to peer {} closed", self.peer());
		true
	}

	/// The number of live clients created through this connection.
	pub fn clients(&self) -> usize {
		self.clients.guard().len()
	}

	pub fn release_clients(&self) {
		let clients = mem::take(&mut *self.clients.guard());

		if !clients.is_empty() {
			debug!("Releasing {} clients of peer {}", clients.len(), self.peer());
		}

		for client in clients {
			client.stop();
		}
	}

	/// Frame a captured segment and send it to the peer.
	pub fn send_bytes(&self, payload: &[u8], flow: FlowId, kind: Transport, src: Ipv6Addr) -> Result {
		self.check_liveness();

		let frame = frame::encode(kind, flow, src, payload)?;
		self.send_frame(&frame)
	}

	/// Send a frame made of the header alone.
	pub fn keepalive(&self) -> Result {
		let header = frame::encode_header(Transport::Datagram, 0, FlowId::default(), Ipv6Addr::UNSPECIFIED);
		self.send_frame(&header)
	}

	/// Handle one frame received on a datagram session.
	pub fn read_buffer(self: &Arc<Self>, buf: &[u8]) -> Result {
		self.touch();

		match frame::parse(buf)? {
			Some(frame) => self.dispatch(frame),
			None => {
				trace!("Keepalive from peer {}", self.peer());
				Ok(())
			}
		}
	}

	/// Handle bytes received on a stream session. Frames may be split or coalesced arbitrarily.
	pub fn read_stream(self: &Arc<Self>, bytes: &[u8]) -> Result {
		let frames = {
			let mut decoder = self.decoder.guard();
			decoder.push(bytes);

			let mut frames = Vec::new();

			while let Some(frame) = decoder.next_frame()? {
				frames.push(frame);
			}

			frames
		};

		for frame in frames {
			if let Err(err) = self.read_buffer(&frame) {
				if err.is_fatal() {
					self.ctx.fail(&err);
				} else {
					warn!("Dropping frame from peer {}: {err}", self.peer());
				}
			}
		}

		Ok(())
	}

	fn send_frame(&self, frame: &[u8]) -> Result {
		let session = self.plane.active().ok_or_else(|| Error::Closed(format!("connection to peer {}", self.peer())))?;
		session.send(frame)
	}

	fn dispatch(self: &Arc<Self>, frame: Frame<'_>) -> Result {
		let Frame { header, payload } = frame;
		let registry = &self.ctx.registry;

		if let Some(proxy) = registry.lookup(&header.flow) {
			return proxy.send_bytes(payload.to_vec(), header.src);
		}

		let (src_port, _) = header.kind.ports(payload)?;
		let id = header.flow.client(header.src, src_port);

		if let Some(proxy) = registry.lookup(&id) {
			return proxy.send_bytes(payload.to_vec(), header.src);
		}

		let Some(export) = self.ctx.export(&header.flow) else {
			warn!("Dropping frame from peer {} for unknown flow {}", self.peer(), header.flow);
			return Ok(());
		};

		let client = match ProxyClient::new(self.ctx.clone(), self, header.flow, header.src, src_port, header.kind, export) {
			Ok(client) => client,
			Err(Error::DuplicateFlow(_)) => {
				// Another frame of the same client won the race.
				return match registry.lookup(&id) {
					Some(proxy) => proxy.send_bytes(payload.to_vec(), header.src),
					None => Ok(()),
				};
			}
			Err(err) => return Err(err),
		};

		client.run()?;

		self.clients.guard().push(client.clone());
		client.send_bytes(payload.to_vec(), header.src)
	}

	fn touch(&self) {
		let mut liveness = self.liveness.guard();
		liveness.last_recv = Instant::now();
		liveness.last_probe = None;
	}

	/// Ask the control plane to probe a peer that has not been heard from for too long, once per quiet period.
	fn check_liveness(&self) {
		let now = Instant::now();
		let window = self.ctx.config.liveness;

		let probe = {
			let mut liveness = self.liveness.guard();
			let quiet = now.duration_since(liveness.last_recv) > window;
			let due = liveness.last_probe.map_or(true, |at| now.duration_since(at) > window);

			if quiet && due {
				liveness.last_probe = Some(now);
			}

			quiet && due
		};

		if probe {
			debug!("Nothing heard from peer {} for {:?}, requesting a liveness check", self.peer(), window);
			self.ctx.control.alive_check(self.peer());
		}
	}
}
