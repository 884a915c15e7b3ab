//! Virtual address allocation.
//!
//! Addresses are random hosts of the unique-local prefix configured on one interface. Each is checked against the
//! addresses already configured there, bound through the host configuration, routed over loopback, and queued until a
//! proxy takes it. Refills run on a background thread, one at a time.

use core::fmt;
use core::net::Ipv6Addr;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use net::ip::v6;
use net::route::{Mapping, Resolver};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use utils::error::*;
use utils::sync::Lock;

use crate::host::{Added, HostConfig};
use crate::Config;

/// Candidates drawn before a prefix counts as full.
const MAX_CANDIDATES: usize = 64;

/// Receives errors the process cannot continue after.
pub type Fatal = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Prefix {
	addr: Ipv6Addr,
	len: u8,
}

impl Prefix {
	/// Lengths 0 and 128 leave nothing to allocate from, or nothing to route, and mean the interface is misconfigured.
	pub fn new(addr: Ipv6Addr, len: u8) -> Result<Self> {
		if len == 0 || len >= 128 {
			return Err(Error::Config(format!("prefix length {len} of {addr} cannot hold virtual addresses")));
		}

		let mask = u128::MAX << (128 - len);
		Ok(Self { addr: Ipv6Addr::from(u128::from(addr) & mask), len })
	}

	/// The first unique-local prefix among an interface's addresses.
	pub fn discover(addrs: &[(Ipv6Addr, u8)]) -> Result<Self> {
		let (addr, len) = addrs
			.iter()
			.find(|(addr, _)| v6::is_unique_local(addr))
			.ok_or_else(|| Error::Config("no unique-local address is configured".into()))?;

		Self::new(*addr, *len)
	}

	pub fn len(&self) -> u8 {
		self.len
	}

	pub fn contains(&self, addr: &Ipv6Addr) -> bool {
		let mask = u128::MAX << (128 - self.len);
		u128::from(*addr) & mask == u128::from(self.addr)
	}

	/// A random address of the prefix. The all-zero host, the subnet-router anycast address, is never returned.
	pub fn random(&self, rng: &mut impl Rng) -> Ipv6Addr {
		let hosts = u128::MAX >> self.len;

		loop {
			let host = rng.gen::<u128>() & hosts;

			if host != 0 {
				return Ipv6Addr::from(u128::from(self.addr) | host);
			}
		}
	}
}

impl fmt::Display for Prefix {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.addr, self.len)
	}
}

struct Inner {
	interface: String,
	loopback: String,
	target: usize,
	backoff: Duration,
	attempts: u32,
	host: Arc<dyn HostConfig>,
	resolver: Arc<dyn Resolver>,
	queue: Mutex<VecDeque<Ipv6Addr>>,
	rng: Mutex<StdRng>,
	refilling: AtomicBool,
	fatal: Fatal,
}

#[derive(Clone)]
pub struct AddressPool {
	inner: Arc<Inner>,
}

impl AddressPool {
	pub fn new(config: &Config, host: Arc<dyn HostConfig>, resolver: Arc<dyn Resolver>, fatal: Fatal) -> Self {
		Self {
			inner: Arc::new(Inner {
				interface: config.interface.clone(),
				loopback: config.loopback.clone(),
				target: config.pool_target,
				backoff: config.pool_backoff,
				attempts: config.pool_attempts,
				host,
				resolver,
				queue: Mutex::new(VecDeque::with_capacity(config.pool_target)),
				rng: Mutex::new(StdRng::from_entropy()),
				refilling: AtomicBool::new(false),
				fatal,
			}),
		}
	}

	/// Replace the generator seed.
	pub fn seed(&self, seed: u64) {
		*self.inner.rng.guard() = StdRng::seed_from_u64(seed);
	}

	pub fn len(&self) -> usize {
		self.inner.queue.guard().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn target(&self) -> usize {
		self.inner.target
	}

	/// Start filling the pool in the background.
	pub fn start(&self) {
		self.schedule();
	}

	/// Take the oldest queued address, waiting for a refill while the pool is empty.
	pub fn take(&self) -> Result<Ipv6Addr> {
		for attempt in 0..=self.inner.attempts {
			let taken = {
				let mut queue = self.inner.queue.guard();
				queue.pop_front().map(|addr| (addr, queue.len()))
			};

			if let Some((addr, left)) = taken {
				if left < self.inner.target / 2 {
					self.schedule();
				}

				return Ok(addr);
			}

			if attempt == self.inner.attempts {
				break;
			}

			if attempt == 0 {
				warn!("No virtual address available, waiting for the pool to refill");
			}

			self.schedule();
			thread::sleep(self.inner.backoff);
		}

		Err(Error::Exhausted("virtual address pool".into()))
	}

	fn schedule(&self) {
		if self.inner.refilling.swap(true, Ordering::AcqRel) {
			return;
		}

		let inner = self.inner.clone();

		let spawned = thread::Builder::new().name("pool-refill".into()).spawn(move || {
			let result = inner.refill();
			inner.refilling.store(false, Ordering::Release);

			match result {
				Ok(()) => {}
				Err(err) if err.is_fatal() => (inner.fatal)(&err),
				Err(err) => warn!("Refilling the address pool failed: {err}"),
			}
		});

		if let Err(err) = spawned {
			warn!("Unable to start pool refill: {err}");
			self.inner.refilling.store(false, Ordering::Release);
		}
	}
}

impl Inner {
	fn refill(&self) -> Result {
		let prefix = Prefix::discover(&self.host.addresses(&self.interface)?)?;
		debug!("Refilling address pool from {prefix} on {}", self.interface);

		while self.queue.guard().len() < self.target {
			let addr = self.generate(&prefix)?;

			match self.host.add_address(&self.interface, addr, prefix.len())? {
				Added::Duplicate => debug!("{addr} is already configured, drawing another"),
				Added::Bound => {
					self.resolver.add_mapping(addr, Mapping::new(self.loopback.as_str(), None));

					let mut queue = self.queue.guard();

					if queue.len() < self.target {
						queue.push_back(addr);
						info!("Virtual address {addr} ready ({} queued)", queue.len());
					} else {
						debug!("Pool filled up meanwhile, {addr} stays configured but unused");
					}
				}
			}
		}

		Ok(())
	}

	fn generate(&self, prefix: &Prefix) -> Result<Ipv6Addr> {
		let configured: HashSet<Ipv6Addr> = self.host.addresses(&self.interface)?.into_iter().map(|(addr, _)| addr).collect();

		for _ in 0..MAX_CANDIDATES {
			let candidate = prefix.random(&mut *self.rng.guard());

			if !configured.contains(&candidate) && !self.queue.guard().contains(&candidate) {
				return Ok(candidate);
			}
		}

		Err(Error::Exhausted(format!("no free address left in {prefix}")))
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;
	use std::time::Instant;

	use net::route::Table;

	use super::*;
	use crate::Uid;

	#[derive(Default)]
	struct FakeHost {
		addrs: Mutex<Vec<(Ipv6Addr, u8)>>,
		duplicates: AtomicUsize,
	}

	impl FakeHost {
		fn with(addrs: &[(&str, u8)]) -> Arc<Self> {
			let host = Self::default();
			*host.addrs.lock().unwrap() = addrs.iter().map(|(a, l)| (a.parse().unwrap(), *l)).collect();
			Arc::new(host)
		}
	}

	impl HostConfig for FakeHost {
		fn addresses(&self, _: &str) -> Result<Vec<(Ipv6Addr, u8)>> {
			Ok(self.addrs.lock().unwrap().clone())
		}

		fn add_address(&self, _: &str, addr: Ipv6Addr, len: u8) -> Result<Added> {
			let mut addrs = self.addrs.lock().unwrap();

			if addrs.iter().any(|(a, _)| *a == addr) {
				self.duplicates.fetch_add(1, Ordering::SeqCst);
				return Ok(Added::Duplicate);
			}

			addrs.push((addr, len));
			Ok(Added::Bound)
		}
	}

	fn config(target: usize) -> Config {
		let mut config = Config::new(Uid(1), "eth0");
		config.pool_target = target;
		config.pool_backoff = Duration::from_millis(5);
		config.pool_attempts = 400;
		config
	}

	fn no_fatal() -> Fatal {
		Arc::new(|err: &Error| panic!("unexpected fatal error: {err}"))
	}

	#[test]
	fn prefix_validation() {
		let addr: Ipv6Addr = "fd00:1:2:3::9".parse().unwrap();

		assert!(matches!(Prefix::new(addr, 0), Err(Error::Config(_))));
		assert!(matches!(Prefix::new(addr, 128), Err(Error::Config(_))));

		let prefix = Prefix::new(addr, 64).unwrap();
		assert_eq!(prefix.to_string(), "fd00:1:2:3::/64");
		assert!(prefix.contains(&addr));
		assert!(!prefix.contains(&"fd00:1:2:4::9".parse().unwrap()));

		let mut rng = StdRng::seed_from_u64(7);
		for _ in 0..100 {
			let a = prefix.random(&mut rng);
			assert!(prefix.contains(&a));
			assert_ne!(a, "fd00:1:2:3::".parse::<Ipv6Addr>().unwrap());
		}

		let narrow = Prefix::new(addr, 127).unwrap();
		assert_eq!(narrow.random(&mut rng), "fd00:1:2:3::9".parse::<Ipv6Addr>().unwrap());
	}

	#[test]
	fn discovery_skips_link_local() {
		let addrs = [("fe80::1".parse().unwrap(), 64), ("fd12:3456::1".parse().unwrap(), 48)];
		assert_eq!(Prefix::discover(&addrs).unwrap().to_string(), "fd12:3456::/48");

		assert!(Prefix::discover(&addrs[..1]).is_err());
	}

	#[test]
	fn thousand_takes_are_unique_and_bounded() {
		let host = FakeHost::with(&[("fe80::1", 64), ("fd00:aa::1", 112)]);
		let resolver = Arc::new(Table::default());

		let pool = AddressPool::new(&config(10), host.clone(), resolver.clone(), no_fatal());
		pool.seed(1);
		pool.start();

		let seen = Arc::new(Mutex::new(HashSet::new()));
		let prefix = Prefix::new("fd00:aa::".parse().unwrap(), 112).unwrap();

		let takers: Vec<_> = (0..4)
			.map(|_| {
				let pool = pool.clone();
				let seen = seen.clone();

				thread::spawn(move || {
					for _ in 0..250 {
						let addr = pool.take().unwrap();
						assert!(pool.len() <= pool.target());
						assert!(seen.lock().unwrap().insert(addr), "{addr} handed out twice");
					}
				})
			})
			.collect();

		for t in takers {
			t.join().unwrap();
		}

		let seen = seen.lock().unwrap();
		assert_eq!(seen.len(), 1000);
		assert!(seen.iter().all(|a| prefix.contains(a)));
		assert!(pool.len() <= pool.target());

		let any = *seen.iter().next().unwrap();
		assert_eq!(resolver.mapping(&any), Some(Mapping::new("lo", None)));
	}

	#[test]
	fn broken_prefix_is_fatal() {
		let host = FakeHost::with(&[("fd00::1", 128)]);
		let fatal = Arc::new(Mutex::new(None));

		let f = fatal.clone();
		let report: Fatal = Arc::new(move |err: &Error| *f.lock().unwrap() = Some(err.to_string()));

		let mut config = config(2);
		config.pool_attempts = 3;

		let pool = AddressPool::new(&config, host, Arc::new(Table::default()), report);

		assert!(matches!(pool.take(), Err(Error::Exhausted(_))));

		let deadline = Instant::now() + Duration::from_secs(5);
		while fatal.lock().unwrap().is_none() && Instant::now() < deadline {
			thread::sleep(Duration::from_millis(5));
		}

		assert!(fatal.lock().unwrap().as_deref().is_some_and(|e| e.contains("prefix length 128")));
	}
}
