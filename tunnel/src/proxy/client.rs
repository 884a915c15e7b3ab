use core::net::Ipv6Addr;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info};
use net::route::Mapping;
use net::Transport;
use utils::error::*;
use utils::sync::Lock;

use super::{Export, Listener, Proxy};
use crate::{Connection, Context, FlowId};

/// Stands in for one remote client of a locally exported service.
///
/// Traffic from the tunnel is injected towards the service from a virtual address of its own, so that replies can be
/// captured and matched back to the client.
pub struct ProxyClient {
	ctx: Arc<Context>,
	connection: Weak<Connection>,
	/// The service flow replies are framed under.
	flow: FlowId,
	/// The registry key, derived from the service flow and the client endpoint.
	id: FlowId,
	kind: Transport,
	client: Ipv6Addr,
	client_port: u16,
	target: Export,
	mapping: Mapping,
	address: Ipv6Addr,
	listener: Mutex<Listener>,
}

impl ProxyClient {
	pub fn new(
		ctx: Arc<Context>,
		connection: &Arc<Connection>,
		flow: FlowId,
		client: Ipv6Addr,
		client_port: u16,
		kind: Transport,
		target: Export,
	) -> Result<Arc<Self>> {
		if kind != target.service.kind {
			return Err(Error::Protocol(format!(
				"{} frame for {} service {}",
				kind.name(),
				target.service.kind.name(),
				target.service.name
			)));
		}

		let id = flow.client(client, client_port);

		if ctx.registry.lookup(&id).is_some() {
			return Err(Error::DuplicateFlow(id.to_string()));
		}

		let mapping = ctx.injector.resolver().mapping(&target.addr).ok_or(Error::Unroutable(target.addr))?;
		let address = ctx.pool.take()?;

		let proxy = Arc::new(Self {
			listener: Mutex::new(Listener::idle(client_port)),
			connection: Arc::downgrade(connection),
			ctx,
			flow,
			id,
			kind,
			client,
			client_port,
			target,
			mapping,
			address,
		});

		let weak: Weak<Self> = Arc::downgrade(&proxy);
		proxy.ctx.registry.register(id, weak)?;

		Ok(proxy)
	}

	/// Bind the client's port on the virtual address and capture replies on the interface facing the service.
	pub fn run(self: &Arc<Self>) -> Result {
		let weak: Weak<Self> = Arc::downgrade(self);
		let interfaces = [self.mapping.interface.clone()];

		let listener = Listener::start(&self.ctx, weak, self.kind, self.address, self.client_port, &interfaces)?;
		let port = listener.port;

		*self.listener.guard() = listener;

		info!(
			"Client [{}]:{} of {} appears as [{}]:{port}",
			self.client, self.client_port, self.target.service.name, self.address
		);

		Ok(())
	}

	pub fn stop(&self) {
		self.ctx.registry.unregister(&self.id);
		self.listener.guard().stop();
	}

	pub fn client(&self) -> (Ipv6Addr, u16) {
		(self.client, self.client_port)
	}

	pub fn address(&self) -> Ipv6Addr {
		self.address
	}
}

impl Proxy for ProxyClient {
	fn flow(&self) -> FlowId {
		self.id
	}

	fn kind(&self) -> Transport {
		self.kind
	}

	fn listen(&self) -> (Ipv6Addr, u16) {
		(self.address, self.listener.guard().port)
	}

	fn send_bytes(&self, mut segment: Vec<u8>, _: Ipv6Addr) -> Result {
		let port = self.listener.guard().port;

		self.kind.set_destination_port(&mut segment, self.target.service.port)?;
		self.ctx.injector.inject(&self.mapping, self.address, self.target.addr, port, segment, self.kind).map(drop)
	}

	/// Replies were addressed to the bound port, which may have been escalated. The client expects its own.
	fn receive_bytes(&self, segment: &[u8], kind: Transport, _: Ipv6Addr) -> Result {
		let connection = self.connection.upgrade().ok_or_else(|| Error::Closed(format!("connection of flow {}", self.id)))?;

		let mut segment = segment.to_vec();
		kind.set_destination_port(&mut segment, self.client_port)?;

		connection.send_bytes(&segment, self.flow, kind, self.client)
	}
}

impl Drop for ProxyClient {
	fn drop(&mut self) {
		self.ctx.registry.release(&self.id);
		debug!("Virtual address {} of flow {} stays assigned", self.address, self.id);
	}
}
