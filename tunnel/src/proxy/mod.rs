//! Endpoints that turn captured host traffic into tunnel frames and tunnel frames back into injected packets.
//!
//! A [`ProxyServer`] stands in for a remote service on the consuming host. A [`ProxyClient`] stands in for one remote
//! client on the providing host.

use core::net::Ipv6Addr;
use std::sync::{Arc, Weak};

use log::{info, warn};
use net::Transport;
use utils::error::*;

use crate::bind::{self, Binding};
use crate::capture::{Filter, Target, Worker};
use crate::{Context, FlowId, Service};

pub mod client;
pub mod server;

pub use client::ProxyClient;
pub use server::ProxyServer;

pub trait Proxy: Send + Sync {
	/// The flow the proxy is registered under.
	fn flow(&self) -> FlowId;

	fn kind(&self) -> Transport;

	/// The local address and the port actually bound.
	fn listen(&self) -> (Ipv6Addr, u16);

	/// Deliver a segment that came out of the tunnel. `peer` is the host-side party of the exchange.
	fn send_bytes(&self, segment: Vec<u8>, peer: Ipv6Addr) -> Result;

	/// Forward a captured segment sent by `src` into the tunnel.
	fn receive_bytes(&self, segment: &[u8], kind: Transport, src: Ipv6Addr) -> Result;
}

/// A locally exported service and the host it actually runs on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Export {
	pub service: Service,
	pub addr: Ipv6Addr,
}

/// The bound port of a running proxy together with its capture workers.
struct Listener {
	port: u16,
	binding: Option<Arc<dyn Binding>>,
	workers: Vec<Worker>,
}

impl Listener {
	fn idle(port: u16) -> Self {
		Self { port, binding: None, workers: Vec::new() }
	}

	/// Bind `port` on `addr`, escalating when it is taken, and capture the matching traffic on every interface given.
	fn start(ctx: &Context, proxy: Weak<dyn Proxy>, kind: Transport, addr: Ipv6Addr, port: u16, interfaces: &[String]) -> Result<Self> {
		let (bound, binding) = bind::bind_with_retry(&*ctx.binder, &ctx.config, kind, addr, port)?;

		if bound != port {
			info!("Port {port} on {addr} is taken, using {bound}");
		}

		let filter = Filter { addr, kind, port: bound };
		let mut workers = Vec::with_capacity(interfaces.len());

		for interface in interfaces {
			let target = Target {
				proxy: proxy.clone(),
				filter,
				injector: ctx.injector.clone(),
				mtu: ctx.config.effective_mtu(),
			};

			match Worker::spawn(&*ctx.capturer, interface, target) {
				Ok(worker) => workers.push(worker),
				Err(err) => warn!("Unable to capture {filter} on {interface}: {err}"),
			}
		}

		if workers.is_empty() && !interfaces.is_empty() {
			binding.release();
			return Err(Error::HelperUnavailable(format!("capture of {filter}")));
		}

		Ok(Self { port: bound, binding: Some(binding), workers })
	}

	fn stop(&mut self) {
		self.workers.clear();

		if let Some(binding) = self.binding.take() {
			binding.release();
		}
	}
}

impl Drop for Listener {
	fn drop(&mut self) {
		self.stop();
	}
}
