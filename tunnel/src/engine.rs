//! The per-process data-plane runtime.
//!
//! [`Context`] is the state shared by every connection and proxy. [`Engine`] owns the connection table and the
//! services consumed from peers, and ties their teardown to process shutdown.

use core::net::Ipv6Addr;
use std::mem;
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info, warn};
use net::link;
use net::route::Resolver;
use net::Injector;
use runtime::helper::Supervisor;
use runtime::Shutdown;
use utils::error::*;
use utils::sync::Lock;

use crate::bind::{Binder, HelperBinder};
use crate::capture::{Capturer, HelperCapturer};
use crate::control::ControlPlane;
use crate::host::{self, HostConfig};
use crate::plane::{Mode, Role, Session};
use crate::pool::{AddressPool, Fatal};
use crate::proxy::{Export, Proxy, ProxyServer};
use crate::registry::Registry;
use crate::{Config, Connection, FlowId, Map, Service, Uid};

pub struct Context {
	pub config: Config,
	pub registry: Registry,
	pub pool: AddressPool,
	pub injector: Arc<Injector>,
	pub binder: Arc<dyn Binder>,
	pub capturer: Arc<dyn Capturer>,
	pub control: Arc<dyn ControlPlane>,
	exports: RwLock<Map<FlowId, Export>>,
	fatal: Fatal,
}

impl Context {
	pub fn resolver(&self) -> &Arc<dyn Resolver> {
		self.injector.resolver()
	}

	/// The locally exported service behind `flow`.
	pub fn export(&self, flow: &FlowId) -> Option<Export> {
		self.exports.read().unwrap_or_else(|e| e.into_inner()).get(flow).cloned()
	}

	/// Contain an error raised while handling traffic. Fatal ones end the process.
	pub fn fail(&self, err: &Error) {
		if err.is_fatal() {
			(self.fatal)(err);
		} else {
			warn!("{err}");
		}
	}
}

/// The collaborators of an engine. Production code gets them from [`Engine::with_helpers`].
pub struct Parts {
	pub injector: Arc<Injector>,
	pub binder: Arc<dyn Binder>,
	pub capturer: Arc<dyn Capturer>,
	pub host: Arc<dyn HostConfig>,
	pub control: Arc<dyn ControlPlane>,
	pub fatal: Fatal,
}

/// Route fatal errors to process shutdown.
pub fn exit_on_fatal(shutdown: &Arc<Shutdown>) -> Fatal {
	let shutdown = shutdown.clone();
	Arc::new(move |err: &Error| {
		shutdown.fatal(err);
	})
}

pub struct Engine {
	ctx: Arc<Context>,
	connections: Mutex<Map<Uid, Arc<Connection>>>,
	services: Mutex<Vec<Arc<ProxyServer>>>,
	supervisor: Arc<Supervisor>,
}

impl Engine {
	pub fn new(config: Config, parts: Parts, supervisor: Arc<Supervisor>) -> Arc<Self> {
		let pool = AddressPool::new(&config, parts.host, parts.injector.resolver().clone(), parts.fatal.clone());

		let ctx = Arc::new(Context {
			config,
			registry: Registry::new(),
			pool,
			injector: parts.injector,
			binder: parts.binder,
			capturer: parts.capturer,
			control: parts.control,
			exports: RwLock::default(),
			fatal: parts.fatal,
		});

		Arc::new(Self { ctx, connections: Mutex::default(), services: Mutex::default(), supervisor })
	}

	/// Build an engine on top of the privileged helpers found in the configured directory. Its teardown runs as a
	/// shutdown hook.
	pub fn with_helpers(
		config: Config,
		resolver: Arc<dyn Resolver>,
		control: Arc<dyn ControlPlane>,
		shutdown: &Arc<Shutdown>,
	) -> Result<Arc<Self>> {
		let supervisor = Supervisor::new();

		let interfaces: Vec<_> = link::discover()?.into_iter().filter(|i| i.up).collect();
		info!("Injecting on {} interfaces", interfaces.len());

		let injector = Injector::spawn(interfaces, resolver, &config.helper("sendRaw"), config.helper_ready, &supervisor);

		let parts = Parts {
			injector: Arc::new(injector),
			binder: Arc::new(HelperBinder::new(config.helper("newSocket"), supervisor.clone())),
			capturer: Arc::new(HelperCapturer::new(config.helper("capture"), supervisor.clone())),
			host: Arc::new(host::Helpers::new(config.helper("ifconfighelp"))),
			control,
			fatal: exit_on_fatal(shutdown),
		};

		let engine = Self::new(config, parts, supervisor);
		let weak = Arc::downgrade(&engine);

		shutdown.on_exit(move || {
			if let Some(engine) = weak.upgrade() {
				engine.shutdown();
			}
		});

		Ok(engine)
	}

	pub fn context(&self) -> &Arc<Context> {
		&self.ctx
	}

	/// Start filling the address pool.
	pub fn start(&self) {
		self.ctx.pool.start();
	}

	/// The connection to `peer`, created closed if there is none yet.
	pub fn connection(&self, peer: Uid) -> Arc<Connection> {
		self.connections.guard().entry(peer).or_insert_with(|| Connection::new(self.ctx.clone(), peer)).clone()
	}

	pub fn find(&self, peer: Uid) -> Option<Arc<Connection>> {
		self.connections.guard().get(&peer).cloned()
	}

	/// Attach a session to the connection to `peer`. Returns whether the session is the one in use afterwards.
	///
	/// The table stays locked while the session is attached, so [`Engine::detach`] cannot forget the connection in
	/// between.
	pub fn attach(&self, peer: Uid, role: Role<dyn Session>) -> bool {
		let mode = role.mode();

		let (connection, outcome) = {
			let mut connections = self.connections.guard();
			let connection = connections.entry(peer).or_insert_with(|| Connection::new(self.ctx.clone(), peer)).clone();
			let outcome = connection.plane().attach(role);

			(connection, outcome)
		};

		connection.settle(mode, outcome)
	}

	/// Detach the session running in `mode`. A connection left closed with no service depending on it is forgotten.
	pub fn detach(&self, peer: Uid, mode: Mode) -> bool {
		let Some(connection) = self.find(peer) else { return false };

		if !connection.detach(mode) {
			return false;
		}

		let in_use = self.services.guard().iter().any(|s| s.connection().peer() == peer);

		if !in_use {
			let mut connections = self.connections.guard();

			if connections.get(&peer).is_some_and(|c| c.mode() == Mode::Closed) {
				connections.remove(&peer);
				debug!("Forgot connection to peer {peer}");
			}
		}

		true
	}

	/// Handle a frame received from `peer` on a datagram session.
	pub fn receive(&self, peer: Uid, buf: &[u8]) {
		let Some(connection) = self.find(peer).some_or(|| warn!("Dropping frame from unknown peer {peer}")) else { return };

		if let Err(err) = connection.read_buffer(buf) {
			self.ctx.fail(&err);
		}
	}

	/// Handle bytes received from `peer` on a stream session.
	pub fn receive_stream(&self, peer: Uid, bytes: &[u8]) {
		let Some(connection) = self.find(peer).some_or(|| warn!("Dropping stream data from unknown peer {peer}")) else {
			return;
		};

		if let Err(err) = connection.read_stream(bytes) {
			self.ctx.fail(&err);
		}
	}

	/// Make `service` of `peer` reachable locally. Running out of ports or addresses is fatal here as well.
	pub fn add_service(&self, peer: Uid, service: Service) -> Result<Arc<ProxyServer>> {
		let connection = self.connection(peer);

		let server = ProxyServer::new(self.ctx.clone(), connection, service).and_then(|server| {
			server.run()?;
			Ok(server)
		});

		match server {
			Ok(server) => {
				self.services.guard().push(server.clone());
				Ok(server)
			}
			Err(err) => {
				if err.is_fatal() {
					self.ctx.fail(&err);
				}

				Err(err)
			}
		}
	}

	pub fn remove_service(&self, peer: Uid, service: &Service) -> bool {
		let flow = FlowId::service(peer, service);

		let removed: Vec<_> = {
			let mut services = self.services.guard();
			let (gone, kept) = mem::take(&mut *services).into_iter().partition(|s| s.flow() == flow);
			*services = kept;
			gone
		};

		let found = !removed.is_empty();

		for server in removed {
			server.stop();
		}

		found
	}

	pub fn services(&self) -> Vec<Arc<ProxyServer>> {
		self.services.guard().clone()
	}

	/// Offer a service running at `addr` to peers. Returns the flow they will address it with.
	pub fn export(&self, service: Service, addr: Ipv6Addr) -> FlowId {
		let flow = FlowId::service(self.ctx.config.local, &service);

		info!("Exporting {} ({}) at [{addr}]:{} as flow {flow}", service.name, service.kind.name(), service.port);

		self.ctx.exports.write().unwrap_or_else(|e| e.into_inner()).insert(flow, Export { service, addr });
		flow
	}

	pub fn unexport(&self, flow: &FlowId) -> bool {
		self.ctx.exports.write().unwrap_or_else(|e| e.into_inner()).remove(flow).is_some()
	}

	/// Release every proxy and terminate every helper. Safe to call concurrently with traffic and more than once.
	pub fn shutdown(&self) {
		let connections: Vec<_> = self.connections.guard().values().cloned().collect();

		for connection in connections {
			connection.release_clients();
		}

		let services = mem::take(&mut *self.services.guard());

		for server in services {
			server.stop();
		}

		self.supervisor.stop_all();
	}

	/// Run until SIGINT or SIGTERM, then tear down.
	pub fn run_until_signal(&self, shutdown: &Arc<Shutdown>) -> Result {
		shutdown.install()?;
		self.start();
		shutdown.exec();

		Ok(())
	}
}
