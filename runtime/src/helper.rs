//! Supervision of the privileged helper processes.
//!
//! Raw sockets, socket binding and interface configuration all live in separate executables. This module starts them,
//! frames the byte streams exchanged with them, restarts the long-running ones when they die and kills everything on
//! shutdown.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use utils::error::*;
use utils::sync::Lock;

/// How often a starting helper is checked for an early exit.
const READY_POLL: Duration = Duration::from_millis(10);

/// Anything the supervisor can terminate.
pub trait Stop: Send + Sync {
	fn stop(&self);
}

/// Tracks every helper spawned by the process so that shutdown can terminate them synchronously.
#[derive(Default)]
pub struct Supervisor {
	entries: Mutex<Vec<Weak<dyn Stop>>>,
}

impl Supervisor {
	pub fn new() -> Arc<Self> {
		Arc::default()
	}

	pub fn register(&self, entry: Weak<dyn Stop>) {
		let mut entries = self.entries.guard();
		entries.retain(|e| e.strong_count() != 0);
		entries.push(entry);
	}

	/// Stop every helper that is still alive.
	pub fn stop_all(&self) {
		let entries = std::mem::take(&mut *self.entries.guard());

		let live: Vec<_> = entries.iter().filter_map(Weak::upgrade).collect();
		info!("Stopping {} helper processes", live.len());

		for entry in live {
			entry.stop();
		}
	}
}

/// Spawn a helper, forwarding its standard error into the log.
pub fn spawn(name: &str, cmd: &mut Command) -> Result<Child> {
	let mut child = cmd.stderr(Stdio::piped()).spawn().map_err(|err| {
		warn!("Unable to start helper {name}: {err}");
		Error::Io(err)
	})?;

	if let Some(stderr) = child.stderr.take() {
		let name = name.to_owned();
		let forward = thread::Builder::new().name(format!("{name}-stderr")).spawn(move || {
			for line in BufReader::new(stderr).lines() {
				match line {
					Ok(line) => warn!("Helper {name} reported: {line}"),
					Err(_) => break,
				}
			}
		});

		if let Err(err) = forward {
			warn!("Unable to forward helper stderr: {err}");
		}
	}

	Ok(child)
}

/// Write one length-prefixed frame.
pub fn write_frame<W: Write>(w: &mut W, frame: &[u8]) -> io::Result<()> {
	let len: u32 = frame
		.len()
		.try_into()
		.map_err(|_| io::Error::new(ErrorKind::InvalidInput, "frame length overflows u32"))?;

	w.write_all(&len.to_be_bytes())?;
	w.write_all(frame)?;
	w.flush()
}

/// Read one length-prefixed frame. Returns `None` on a clean end of stream.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
	let mut len = [0; 4];

	match r.read_exact(&mut len) {
		Ok(()) => {}
		Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
		Err(err) => return Err(err),
	}

	let mut buf = vec![0; u32::from_be_bytes(len) as usize];
	r.read_exact(&mut buf)?;

	Ok(Some(buf))
}

/// A one-shot or long-lived child with no streaming interface.
pub struct Process {
	name: String,
	child: Mutex<Option<Child>>,
}

impl Process {
	pub fn new(name: impl Into<String>, child: Child) -> Arc<Self> {
		Arc::new(Self { name: name.into(), child: Mutex::new(Some(child)) })
	}

	/// Wait for the process to exit on its own.
	pub fn wait(&self) -> Result<ExitStatus> {
		let child = self.child.guard().take();

		match child {
			Some(mut child) => Ok(child.wait()?),
			None => Err(Error::HelperUnavailable(self.name.clone())),
		}
	}
}

impl Stop for Process {
	fn stop(&self) {
		if let Some(mut child) = self.child.guard().take() {
			debug!("Killing helper {}", self.name);
			kill(&mut child);
		}
	}
}

fn kill(child: &mut Child) {
	let _ = child.kill();
	let _ = child.wait();
}

/// The child handle and its standard input are locked separately: a writer blocked on a helper that stopped reading
/// must not keep [`Stop::stop`] from killing it.
struct Inner {
	name: String,
	program: PathBuf,
	args: Vec<OsString>,
	ready: Duration,
	child: Mutex<Option<Child>>,
	stdin: Mutex<Option<ChildStdin>>,
	restarting: AtomicBool,
	stopped: AtomicBool,
}

impl Inner {
	fn spawn(&self) -> Result<(Child, ChildStdin)> {
		let mut child = spawn(
			&self.name,
			Command::new(&self.program).args(&self.args).stdin(Stdio::piped()).stdout(Stdio::null()),
		)?;

		let deadline = Instant::now() + self.ready;

		while Instant::now() < deadline {
			if let Some(status) = child.try_wait()? {
				warn!("Helper {} exited during startup with {status}", self.name);
				return Err(Error::HelperUnavailable(self.name.clone()));
			}

			thread::sleep(READY_POLL);
		}

		let stdin = child.stdin.take().ok_or_else(|| Error::HelperUnavailable(self.name.clone()))?;

		Ok((child, stdin))
	}

	fn start(&self) -> Result {
		let (mut child, stdin) = self.spawn()?;

		if self.stopped.load(Ordering::Acquire) {
			kill(&mut child);
			return Err(Error::HelperUnavailable(self.name.clone()));
		}

		if let Some(mut old) = self.child.guard().replace(child) {
			kill(&mut old);
		}

		*self.stdin.guard() = Some(stdin);

		info!("Helper {} started", self.name);

		Ok(())
	}

	fn is_alive(&self) -> bool {
		self.child.guard().as_mut().is_some_and(|c| matches!(c.try_wait(), Ok(None)))
	}

	fn kill(&self) {
		if let Some(mut child) = self.child.guard().take() {
			debug!("Killing helper {}", self.name);
			kill(&mut child);
		}
	}
}

impl Stop for Inner {
	fn stop(&self) {
		self.stopped.store(true, Ordering::Release);
		self.kill();
	}
}

/// A long-running helper fed with length-prefixed frames on its standard input.
///
/// A send to a dead helper is dropped and a restart is started in the background; frames sent while it restarts are
/// lost, not queued.
#[derive(Clone)]
pub struct Helper {
	inner: Arc<Inner>,
}

impl Helper {
	pub fn new<I, A>(program: impl Into<PathBuf>, args: I, ready: Duration) -> Self
	where
		I: IntoIterator<Item = A>,
		A: Into<OsString>,
	{
		let program = program.into();

		let name = program
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_else(|| program.display().to_string());

		let args: Vec<OsString> = args.into_iter().map(Into::into).collect();

		let name = match args.first() {
			Some(arg) => format!("{name}[{}]", arg.to_string_lossy()),
			None => name,
		};

		Self {
			inner: Arc::new(Inner {
				name,
				program,
				args,
				ready,
				child: Mutex::new(None),
				stdin: Mutex::new(None),
				restarting: AtomicBool::new(false),
				stopped: AtomicBool::new(false),
			}),
		}
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	/// Start the helper, waiting at most the readiness window for it to settle.
	pub fn start(&self) -> Result {
		self.inner.start()
	}

	/// A handle for the supervisor.
	pub fn watch(&self) -> Weak<dyn Stop> {
		let weak: Weak<Inner> = Arc::downgrade(&self.inner);
		weak
	}

	pub fn is_alive(&self) -> bool {
		self.inner.is_alive()
	}

	/// Hand one frame to the helper.
	pub fn send(&self, frame: &[u8]) -> Result {
		let alive = self.inner.is_alive();
		let mut stdin = self.inner.stdin.guard();

		let written = match stdin.as_mut() {
			Some(_) if !alive => Err(io::Error::new(ErrorKind::BrokenPipe, "helper has exited")),
			Some(w) => write_frame(w, frame),
			None => Err(io::Error::new(ErrorKind::NotConnected, "helper is not running")),
		};

		match written {
			Ok(()) => Ok(()),
			Err(err) => {
				stdin.take();
				drop(stdin);

				self.inner.kill();

				warn!("Dropping frame for helper {}: {err}", self.inner.name);
				self.restart();

				Err(Error::HelperUnavailable(self.inner.name.clone()))
			}
		}
	}

	/// Terminate the helper. It will not be restarted afterwards.
	pub fn stop(&self) {
		self.inner.stop();
	}

	fn restart(&self) {
		if self.inner.stopped.load(Ordering::Acquire) || self.inner.restarting.swap(true, Ordering::AcqRel) {
			return;
		}

		let inner = self.inner.clone();

		let spawned = thread::Builder::new().name(format!("restart-{}", self.inner.name)).spawn(move || {
			if let Err(err) = inner.start() {
				warn!("Restarting helper {} failed: {err}", inner.name);
			}

			inner.restarting.store(false, Ordering::Release);
		});

		if let Err(err) = spawned {
			warn!("Unable to schedule restart of helper {}: {err}", self.inner.name);
			self.inner.restarting.store(false, Ordering::Release);
		}
	}
}
