use core::net::Ipv6Addr;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info};
use net::Transport;
use utils::error::*;
use utils::sync::Lock;

use super::{Listener, Proxy};
use crate::{Connection, Context, FlowId, Service};

/// Makes a service of a remote peer reachable at a local virtual address.
pub struct ProxyServer {
	ctx: Arc<Context>,
	connection: Arc<Connection>,
	flow: FlowId,
	service: Service,
	address: Ipv6Addr,
	listener: Mutex<Listener>,
}

impl ProxyServer {
	/// Draw a virtual address for `service` of the connection's peer and register the flow.
	pub fn new(ctx: Arc<Context>, connection: Arc<Connection>, service: Service) -> Result<Arc<Self>> {
		let flow = FlowId::service(connection.peer(), &service);

		if ctx.registry.lookup(&flow).is_some() {
			return Err(Error::DuplicateFlow(flow.to_string()));
		}

		let address = ctx.pool.take()?;

		let server = Arc::new(Self {
			listener: Mutex::new(Listener::idle(service.port)),
			ctx,
			connection,
			flow,
			service,
			address,
		});

		let weak: Weak<Self> = Arc::downgrade(&server);
		server.ctx.registry.register(flow, weak)?;

		Ok(server)
	}

	/// Bind the service port on the virtual address and start capturing on every active interface.
	pub fn run(self: &Arc<Self>) -> Result {
		let interfaces = self.ctx.injector.resolver().active_interfaces();
		let weak: Weak<Self> = Arc::downgrade(self);

		let listener = Listener::start(&self.ctx, weak, self.service.kind, self.address, self.service.port, &interfaces)?;
		let port = listener.port;

		*self.listener.guard() = listener;

		info!(
			"Service {} ({}) of peer {} is reachable at [{}]:{port}",
			self.service.name,
			self.service.kind.name(),
			self.connection.peer(),
			self.address
		);

		Ok(())
	}

	pub fn stop(&self) {
		self.ctx.registry.unregister(&self.flow);
		self.listener.guard().stop();
	}

	pub fn service(&self) -> &Service {
		&self.service
	}

	pub fn address(&self) -> Ipv6Addr {
		self.address
	}

	pub fn port(&self) -> u16 {
		self.listener.guard().port
	}

	pub fn connection(&self) -> &Arc<Connection> {
		&self.connection
	}

}

impl Proxy for ProxyServer {
	fn flow(&self) -> FlowId {
		self.flow
	}

	fn kind(&self) -> Transport {
		self.service.kind
	}

	fn listen(&self) -> (Ipv6Addr, u16) {
		(self.address, self.port())
	}

	/// The client is routed per segment; nothing is kept per client.
	fn send_bytes(&self, segment: Vec<u8>, client: Ipv6Addr) -> Result {
		let mapping = self.ctx.injector.resolver().mapping(&client).ok_or(Error::Unroutable(client))?;
		let port = self.port();

		self.ctx.injector.inject(&mapping, self.address, client, port, segment, self.service.kind).map(drop)
	}

	fn receive_bytes(&self, segment: &[u8], kind: Transport, src: Ipv6Addr) -> Result {
		self.connection.send_bytes(segment, self.flow, kind, src)
	}
}

impl Drop for ProxyServer {
	fn drop(&mut self) {
		self.ctx.registry.release(&self.flow);
		debug!("Virtual address {} of flow {} stays assigned", self.address, self.flow);
	}
}
