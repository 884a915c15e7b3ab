//! Flow id to proxy lookup.
//!
//! The registry never owns a proxy. Entries hold weak references; a proxy removes its own entry when dropped, and an
//! entry whose proxy is already gone counts as absent.

use std::sync::{Arc, Mutex, Weak};

use log::{debug, trace};
use utils::error::*;
use utils::sync::Lock;

use crate::proxy::Proxy;
use crate::{FlowId, Map};

#[derive(Default)]
pub struct Registry {
	map: Mutex<Map<FlowId, Weak<dyn Proxy>>>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a proxy. Fails if a live proxy already owns the flow.
	pub fn register(&self, flow: FlowId, proxy: Weak<dyn Proxy>) -> Result {
		let mut map = self.map.guard();

		if map.get(&flow).is_some_and(|p| p.strong_count() != 0) {
			return Err(Error::DuplicateFlow(flow.to_string()));
		}

		map.insert(flow, proxy);
		trace!("Registered flow {flow}");

		Ok(())
	}

	pub fn lookup(&self, flow: &FlowId) -> Option<Arc<dyn Proxy>> {
		self.map.guard().get(flow).and_then(Weak::upgrade)
	}

	pub fn unregister(&self, flow: &FlowId) {
		if self.map.guard().remove(flow).is_some() {
			debug!("Unregistered flow {flow}");
		}
	}

	/// Drop the entry for `flow` if its proxy is gone. Proxies call this from their destructor, when their own weak
	/// reference can no longer be upgraded; a live proxy that took the flow over in the meantime keeps it.
	pub fn release(&self, flow: &FlowId) {
		let mut map = self.map.guard();

		if map.get(flow).is_some_and(|p| p.strong_count() == 0) {
			map.remove(flow);
			debug!("Released flow {flow}");
		}
	}

	/// The number of flows with a live proxy.
	pub fn len(&self) -> usize {
		self.map.guard().values().filter(|p| p.strong_count() != 0).count()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
