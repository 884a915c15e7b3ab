//! The role state machine shared by every per-peer connection.
//!
//! A peer can be reached over a session we opened (outbound, `Emitting`) or one it opened to us (inbound,
//! `Receiving`). When both exist at once the connection briefly holds `Both` and resolves it straight away: the side
//! whose own identifier is smaller keeps the inbound session, the other keeps the outbound one, so both ends agree
//! without talking to each other.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use utils::error::*;
use utils::sync::Lock;

use crate::Uid;

/// An established, authenticated session to a peer.
pub trait Session: Send + Sync {
	fn send(&self, frame: &[u8]) -> Result;

	/// Tear the session down. Called at most once, outside of any connection lock.
	fn close(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
	Closed,
	Emitting,
	Receiving,
	Both,
}

/// A session together with the direction it was opened in.
pub enum Role<T: ?Sized> {
	Outbound(Arc<T>),
	Inbound(Arc<T>),
}

impl<T: ?Sized> Role<T> {
	pub fn mode(&self) -> Mode {
		match self {
			Self::Outbound(_) => Mode::Emitting,
			Self::Inbound(_) => Mode::Receiving,
		}
	}

	pub fn handle(&self) -> &Arc<T> {
		match self {
			Self::Outbound(h) | Self::Inbound(h) => h,
		}
	}
}

impl<T: ?Sized> Clone for Role<T> {
	fn clone(&self) -> Self {
		match self {
			Self::Outbound(h) => Self::Outbound(h.clone()),
			Self::Inbound(h) => Self::Inbound(h.clone()),
		}
	}
}

/// The outcome of [`Plane::attach`].
pub enum Attach<T: ?Sized> {
	/// The connection was closed and now runs on this role.
	Established,
	/// Both roles were attached and one was dropped. The caller closes `dropped`.
	Resolved { kept: Mode, dropped: Role<T> },
	/// The role is already attached, or both are. The session is handed back untouched.
	AlreadyBound(Role<T>),
}

enum State<T: ?Sized> {
	Closed,
	Emitting(Arc<T>),
	Receiving(Arc<T>),
}

impl<T: ?Sized> State<T> {
	fn mode(&self) -> Mode {
		match self {
			Self::Closed => Mode::Closed,
			Self::Emitting(_) => Mode::Emitting,
			Self::Receiving(_) => Mode::Receiving,
		}
	}
}

pub struct Plane<T: ?Sized> {
	local: Uid,
	peer: Uid,
	state: Mutex<State<T>>,
	resolutions: AtomicUsize,
}

impl<T: ?Sized> Plane<T> {
	pub fn new(local: Uid, peer: Uid) -> Self {
		Self { local, peer, state: Mutex::new(State::Closed), resolutions: AtomicUsize::new(0) }
	}

	pub fn peer(&self) -> Uid {
		self.peer
	}

	pub fn mode(&self) -> Mode {
		self.state.guard().mode()
	}

	/// How many times both roles had to be resolved down to one.
	pub fn resolutions(&self) -> usize {
		self.resolutions.load(Ordering::Relaxed)
	}

	pub fn attach(&self, role: Role<T>) -> Attach<T> {
		let mut state = self.state.guard();
		let from = state.mode();

		let (next, outcome) = match (mem::replace(&mut *state, State::Closed), role) {
			(State::Closed, Role::Outbound(h)) => (State::Emitting(h), Attach::Established),
			(State::Closed, Role::Inbound(h)) => (State::Receiving(h), Attach::Established),
			(State::Emitting(outbound), Role::Inbound(inbound)) | (State::Receiving(inbound), Role::Outbound(outbound)) => {
				self.transition(from, Mode::Both);
				self.resolutions.fetch_add(1, Ordering::Relaxed);

				if self.local < self.peer {
					(State::Receiving(inbound), Attach::Resolved { kept: Mode::Receiving, dropped: Role::Outbound(outbound) })
				} else {
					(State::Emitting(outbound), Attach::Resolved { kept: Mode::Emitting, dropped: Role::Inbound(inbound) })
				}
			}
			(current, role) => {
				debug!("Peer {} already has a {:?} session", self.peer, role.mode());
				*state = current;
				return Attach::AlreadyBound(role);
			}
		};

		let to = next.mode();
		*state = next;

		self.transition(if from == Mode::Closed { from } else { Mode::Both }, to);

		outcome
	}

	/// Detach the session running in `mode`, closing the connection. Returns the detached session.
	pub fn detach(&self, mode: Mode) -> Option<Arc<T>> {
		let mut state = self.state.guard();

		if state.mode() != mode {
			return None;
		}

		let session = match mem::replace(&mut *state, State::Closed) {
			State::Emitting(h) | State::Receiving(h) => Some(h),
			State::Closed => None,
		};

		self.transition(mode, Mode::Closed);

		session
	}

	/// The session frames are sent on, if any.
	pub fn active(&self) -> Option<Arc<T>> {
		match &*self.state.guard() {
			State::Emitting(h) | State::Receiving(h) => Some(h.clone()),
			State::Closed => None,
		}
	}

	fn transition(&self, from: Mode, to: Mode) {
		trace!("Peer {} plane {from:?} -> {to:?}", self.peer);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicBool;
	use std::thread;

	use super::*;

	#[derive(Default)]
	struct Fake {
		closed: AtomicBool,
	}

	impl Session for Fake {
		fn send(&self, _: &[u8]) -> Result {
			Ok(())
		}

		fn close(&self) {
			self.closed.store(true, Ordering::SeqCst);
		}
	}

	fn both(local: u64, peer: u64, outbound_first: bool) -> (Plane<dyn Session>, Arc<Fake>, Arc<Fake>, Mode) {
		let plane: Plane<dyn Session> = Plane::new(Uid(local), Uid(peer));
		let outbound = Arc::new(Fake::default());
		let inbound = Arc::new(Fake::default());

		let o: Arc<dyn Session> = outbound.clone();
		let i: Arc<dyn Session> = inbound.clone();

		let (first, second) = if outbound_first { (Role::Outbound(o), Role::Inbound(i)) } else { (Role::Inbound(i), Role::Outbound(o)) };

		assert!(matches!(plane.attach(first), Attach::Established));

		let Attach::Resolved { kept, dropped } = plane.attach(second) else { panic!("expected a resolution") };
		assert_eq!(dropped.mode() == Mode::Emitting, kept == Mode::Receiving);
		dropped.handle().close();

		assert_eq!(plane.resolutions(), 1);
		assert_eq!(plane.mode(), kept);

		(plane, outbound, inbound, kept)
	}

	#[test]
	fn smaller_side_keeps_receiving() {
		for outbound_first in [true, false] {
			let (_, outbound, inbound, kept) = both(100, 200, outbound_first);
			assert_eq!(kept, Mode::Receiving);
			assert!(outbound.closed.load(Ordering::SeqCst));
			assert!(!inbound.closed.load(Ordering::SeqCst));

			let (_, outbound, inbound, kept) = both(200, 100, outbound_first);
			assert_eq!(kept, Mode::Emitting);
			assert!(!outbound.closed.load(Ordering::SeqCst));
			assert!(inbound.closed.load(Ordering::SeqCst));
		}
	}

	#[test]
	fn same_role_twice_is_rejected() {
		let plane: Plane<dyn Session> = Plane::new(Uid(1), Uid(2));

		let first: Arc<dyn Session> = Arc::new(Fake::default());
		let second: Arc<dyn Session> = Arc::new(Fake::default());

		assert!(matches!(plane.attach(Role::Outbound(first)), Attach::Established));
		assert!(matches!(plane.attach(Role::Outbound(second)), Attach::AlreadyBound(_)));
		assert_eq!(plane.mode(), Mode::Emitting);
		assert_eq!(plane.resolutions(), 0);
	}

	#[test]
	fn detach_closes() {
		let (plane, _, _, kept) = both(100, 200, true);

		let other = if kept == Mode::Emitting { Mode::Receiving } else { Mode::Emitting };
		assert!(plane.detach(other).is_none());
		assert!(plane.detach(kept).is_some());
		assert_eq!(plane.mode(), Mode::Closed);
		assert!(plane.active().is_none());

		// Closed is terminal until something attaches again.
		let again: Arc<dyn Session> = Arc::new(Fake::default());
		assert!(matches!(plane.attach(Role::Inbound(again)), Attach::Established));
	}

	#[test]
	fn racing_attaches_resolve_once() {
		for _ in 0..50 {
			let plane: Arc<Plane<dyn Session>> = Arc::new(Plane::new(Uid(100), Uid(200)));

			let handles: Vec<_> = [true, false]
				.into_iter()
				.map(|outbound| {
					let plane = plane.clone();
					thread::spawn(move || {
						let session: Arc<dyn Session> = Arc::new(Fake::default());
						let role = if outbound { Role::Outbound(session) } else { Role::Inbound(session) };
						matches!(plane.attach(role), Attach::Resolved { .. })
					})
				})
				.collect();

			let resolved = handles.into_iter().map(|h| h.join().unwrap()).filter(|r| *r).count();

			assert_eq!(resolved, 1);
			assert_eq!(plane.resolutions(), 1);
			assert_eq!(plane.mode(), Mode::Receiving);
		}
	}
}
