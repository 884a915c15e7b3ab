//! Where an injected packet leaves the host.

use core::net::Ipv6Addr;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::link::Mac;

/// The egress interface for an address and, on Ethernet links, the next-hop hardware address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
	pub interface: String,
	pub mac: Option<Mac>,
}

impl Mapping {
	pub fn new(interface: impl Into<String>, mac: Option<Mac>) -> Self {
		Self { interface: interface.into(), mac }
	}
}

/// Answers routing questions for injection. The production resolver is provided by the embedding host.
pub trait Resolver: Send + Sync {
	fn mapping(&self, addr: &Ipv6Addr) -> Option<Mapping>;

	fn add_mapping(&self, addr: Ipv6Addr, mapping: Mapping);

	/// Names of the interfaces raw frames may be written to.
	fn active_interfaces(&self) -> Vec<String>;
}

/// A static table with an optional catch-all route.
#[derive(Default)]
pub struct Table {
	routes: RwLock<HashMap<Ipv6Addr, Mapping>>,
	fallback: Option<Mapping>,
	interfaces: Vec<String>,
}

impl Table {
	pub fn new(interfaces: Vec<String>) -> Self {
		Self { interfaces, ..Self::default() }
	}

	pub fn with_fallback(mut self, mapping: Mapping) -> Self {
		self.fallback = Some(mapping);
		self
	}
}

impl Resolver for Table {
	fn mapping(&self, addr: &Ipv6Addr) -> Option<Mapping> {
		let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
		routes.get(addr).or(self.fallback.as_ref()).cloned()
	}

	fn add_mapping(&self, addr: Ipv6Addr, mapping: Mapping) {
		self.routes.write().unwrap_or_else(|e| e.into_inner()).insert(addr, mapping);
	}

	fn active_interfaces(&self) -> Vec<String> {
		self.interfaces.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exact_routes_win_over_fallback() {
		let table = Table::new(vec!["eth0".into(), "lo".into()]).with_fallback(Mapping::new("eth0", Some(Mac([2; 6]))));

		let local: Ipv6Addr = "fd00::5".parse().unwrap();
		table.add_mapping(local, Mapping::new("lo", None));

		assert_eq!(table.mapping(&local), Some(Mapping::new("lo", None)));
		assert_eq!(table.mapping(&"fd00::6".parse().unwrap()).unwrap().interface, "eth0");
		assert_eq!(table.active_interfaces(), ["eth0", "lo"]);

		assert_eq!(Table::default().mapping(&local), None);
	}
}
