use core::fmt::Display;
use std::io;
use std::mem;
use std::process;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use log::{error, info};
use utils::error::*;
use utils::sync::Lock;

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
	requested: bool,
	hooks: Vec<Hook>,
	/// Some thread took the hooks and is running them.
	tearing_down: bool,
	/// The hooks have run.
	done: bool,
}

/// Process-wide shutdown coordination.
///
/// Teardown hooks run exactly once, in reverse registration order, whichever of a signal, an explicit request or a
/// fatal error gets there first.
#[derive(Default)]
pub struct Shutdown {
	state: Mutex<State>,
	cond: Condvar,
}

impl Shutdown {
	pub fn new() -> Arc<Self> {
		Arc::default()
	}

	/// Route SIGINT and SIGTERM to this instance. Only one handler can be installed per process.
	pub fn install(self: &Arc<Self>) -> Result {
		let this = self.clone();

		ctrlc::set_handler(move || this.request()).map_err(|err| {
			error!("Error occurred while setting the signal handler: {err}");
			Error::Io(io::Error::new(io::ErrorKind::Other, err))
		})
	}

	/// Register a teardown step.
	pub fn on_exit(&self, hook: impl FnOnce() + Send + 'static) {
		self.state.guard().hooks.push(Box::new(hook));
	}

	/// Ask the process to shut down. Wakes every waiter; does not run the hooks itself.
	pub fn request(&self) {
		self.state.guard().requested = true;
		self.cond.notify_all();
	}

	pub fn is_requested(&self) -> bool {
		self.state.guard().requested
	}

	/// Block until shutdown is requested.
	pub fn wait(&self) {
		let mut state = self.state.guard();

		while !state.requested {
			state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
		}
	}

	/// Run the registered teardown hooks. A call made while another thread runs them returns once that run is over;
	/// later calls are no-ops.
	pub fn run_hooks(&self) {
		let hooks = {
			let mut state = self.state.guard();

			if state.tearing_down || state.done {
				while !state.done {
					state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
				}

				return;
			}

			state.tearing_down = true;
			mem::take(&mut state.hooks)
		};

		for hook in hooks.into_iter().rev() {
			hook();
		}

		let mut state = self.state.guard();
		state.tearing_down = false;
		state.done = true;
		drop(state);

		self.cond.notify_all();
	}

	/// Block until shutdown is requested, then tear down.
	pub fn exec(&self) {
		self.wait();
		info!("Shutting down");
		self.run_hooks();
	}

	/// Terminate the process after an unrecoverable error.
	pub fn fatal(&self, err: &dyn Display) -> ! {
		error!("Fatal: {err}");
		self.request();
		self.run_hooks();
		process::exit(1)
	}
}
