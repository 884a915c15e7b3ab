//! Kernel socket reservations.
//!
//! Captured traffic never reaches a socket, but the kernel still has to see the port as taken on the virtual address,
//! both to keep other programs off it and so it does not answer the flow itself. The `newSocket` helper binds such a
//! socket and holds it until told to let go.

use core::net::Ipv6Addr;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use net::Transport;
use runtime::helper::{self, Stop, Supervisor};
use utils::error::*;
use utils::sync::Lock;

use crate::Config;

/// Ports below this escalate straight to it.
pub const ESCALATION_START: u16 = 60001;

const READY: &str = "OK\n";
const RELEASE_GRACE: Duration = Duration::from_millis(500);

/// A reserved port. Dropping the last handle releases it.
pub trait Binding: Send + Sync {
	fn release(&self);
}

pub trait Binder: Send + Sync {
	fn bind(&self, kind: Transport, addr: Ipv6Addr, port: u16) -> Result<Arc<dyn Binding>>;
}

/// The port to try after `port` was found in use.
pub fn escalate(port: u16) -> Result<u16> {
	let next = if port < ESCALATION_START - 1 { ESCALATION_START as u32 } else { port as u32 + 1 };

	if next >= u16::MAX as u32 {
		return Err(Error::Exhausted(format!("no free port above {port}")));
	}

	Ok(next as u16)
}

/// Bind `port` on `addr`, escalating past ports in use and waiting for the address to come up. Returns the port that
/// was actually bound.
pub fn bind_with_retry(binder: &dyn Binder, config: &Config, kind: Transport, addr: Ipv6Addr, port: u16) -> Result<(u16, Arc<dyn Binding>)> {
	let mut port = port;
	let mut waited = 0;

	loop {
		match binder.bind(kind, addr, port) {
			Ok(binding) => return Ok((port, binding)),
			Err(Error::Transient(BindFailure::InUse)) => {
				let next = escalate(port)?;
				debug!("Port {port} on {addr} is in use, trying {next}");
				port = next;
			}
			Err(Error::Transient(BindFailure::NotAvailable)) if waited < config.bind_attempts => {
				waited += 1;
				debug!("{addr} is not configured yet, retrying in {:?}", config.bind_retry);
				thread::sleep(config.bind_retry);
			}
			Err(err) => return Err(err),
		}
	}
}

/// Binds through the `newSocket` helper.
pub struct HelperBinder {
	program: PathBuf,
	supervisor: Arc<Supervisor>,
}

impl HelperBinder {
	pub fn new(program: impl Into<PathBuf>, supervisor: Arc<Supervisor>) -> Self {
		Self { program: program.into(), supervisor }
	}
}

impl Binder for HelperBinder {
	fn bind(&self, kind: Transport, addr: Ipv6Addr, port: u16) -> Result<Arc<dyn Binding>> {
		let (sock_type, proto) = match kind {
			Transport::Stream => (libc::SOCK_STREAM, libc::IPPROTO_TCP),
			Transport::Datagram => (libc::SOCK_DGRAM, libc::IPPROTO_UDP),
		};

		let mut child = helper::spawn(
			"newSocket",
			Command::new(&self.program)
				.arg(sock_type.to_string())
				.arg(proto.to_string())
				.arg(port.to_string())
				.arg(addr.to_string())
				.stdin(Stdio::piped())
				.stdout(Stdio::piped()),
		)?;

		let mut line = String::new();

		if let Some(stdout) = child.stdout.take() {
			BufReader::new(stdout).read_line(&mut line)?;
		}

		if line == READY {
			let stdin = child.stdin.take().ok_or_else(|| Error::HelperUnavailable("newSocket".into()))?;

			let binding = Arc::new(HelperBinding {
				name: format!("newSocket[{}]:{port}", kind.name()),
				held: Mutex::new(Some((child, stdin))),
			});

			let weak: Weak<HelperBinding> = Arc::downgrade(&binding);
			self.supervisor.register(weak);

			return Ok(binding);
		}

		let status = child.wait()?;

		match status.code() {
			Some(libc::EADDRINUSE) => Err(Error::Transient(BindFailure::InUse)),
			Some(libc::EADDRNOTAVAIL) => Err(Error::Transient(BindFailure::NotAvailable)),
			_ => {
				warn!("newSocket for [{addr}]:{port} exited with {status}");
				Err(Error::Io(std::io::Error::other(format!("newSocket exited with {status}"))))
			}
		}
	}
}

struct HelperBinding {
	name: String,
	held: Mutex<Option<(Child, ChildStdin)>>,
}

impl Binding for HelperBinding {
	fn release(&self) {
		let Some((mut child, mut stdin)) = self.held.guard().take() else { return };

		debug!("Releasing {}", self.name);

		let _ = stdin.write_all(READY.as_bytes()).and_then(|_| stdin.flush());
		drop(stdin);

		let deadline = Instant::now() + RELEASE_GRACE;

		while Instant::now() < deadline {
			if !matches!(child.try_wait(), Ok(None)) {
				return;
			}

			thread::sleep(Duration::from_millis(10));
		}

		warn!("{} did not exit after release, killing it", self.name);
		let _ = child.kill();
		let _ = child.wait();
	}
}

impl Stop for HelperBinding {
	fn stop(&self) {
		self.release();
	}
}

impl Drop for HelperBinding {
	fn drop(&mut self) {
		self.release();
	}
}

#[cfg(test)]
mod tests {
	use std::collections::VecDeque;

	use super::*;
	use crate::Uid;

	struct Released;

	impl Binding for Released {
		fn release(&self) {}
	}

	/// Fails with the scripted errors, then binds.
	struct Scripted {
		failures: Mutex<VecDeque<BindFailure>>,
		tried: Mutex<Vec<u16>>,
	}

	impl Scripted {
		fn new(failures: &[BindFailure]) -> Self {
			Self { failures: Mutex::new(failures.iter().copied().collect()), tried: Mutex::default() }
		}
	}

	impl Binder for Scripted {
		fn bind(&self, _: Transport, _: Ipv6Addr, port: u16) -> Result<Arc<dyn Binding>> {
			self.tried.lock().unwrap().push(port);

			match self.failures.lock().unwrap().pop_front() {
				Some(failure) => Err(Error::Transient(failure)),
				None => Ok(Arc::new(Released)),
			}
		}
	}

	fn config() -> Config {
		let mut config = Config::new(Uid(1), "eth0");
		config.bind_retry = Duration::from_millis(1);
		config.bind_attempts = 3;
		config
	}

	#[test]
	fn escalation() {
		assert_eq!(escalate(22).unwrap(), 60001);
		assert_eq!(escalate(59999).unwrap(), 60001);
		assert_eq!(escalate(60000).unwrap(), 60001);
		assert_eq!(escalate(60001).unwrap(), 60002);
		assert_eq!(escalate(65533).unwrap(), 65534);

		let err = escalate(65534).unwrap_err();
		assert!(matches!(err, Error::Exhausted(_)));
		assert!(err.is_fatal());
	}

	#[test]
	fn busy_ports_escalate() {
		let binder = Scripted::new(&[BindFailure::InUse, BindFailure::InUse]);
		let (port, _) = bind_with_retry(&binder, &config(), Transport::Stream, Ipv6Addr::LOCALHOST, 22).unwrap();

		assert_eq!(port, 60002);
		assert_eq!(*binder.tried.lock().unwrap(), [22, 60001, 60002]);
	}

	#[test]
	fn missing_address_is_waited_for() {
		let binder = Scripted::new(&[BindFailure::NotAvailable, BindFailure::NotAvailable]);
		let (port, _) = bind_with_retry(&binder, &config(), Transport::Datagram, Ipv6Addr::LOCALHOST, 53).unwrap();
		assert_eq!(port, 53);

		let binder = Scripted::new(&[BindFailure::NotAvailable; 4]);
		let err = bind_with_retry(&binder, &config(), Transport::Datagram, Ipv6Addr::LOCALHOST, 53).err().unwrap();
		assert!(matches!(err, Error::Transient(BindFailure::NotAvailable)));
		assert!(!err.is_fatal());
	}

	#[test]
	fn port_ceiling_is_fatal() {
		let binder = Scripted::new(&[BindFailure::InUse; 3]);
		let err = bind_with_retry(&binder, &config(), Transport::Stream, Ipv6Addr::LOCALHOST, 65533).err().unwrap();
		assert!(err.is_fatal());
	}
}
