//! The data plane of a peer-to-peer overlay: services offered by a peer appear locally on virtual IPv6 addresses,
//! traffic sent to them is captured, framed and carried over an authenticated session to the peer, which re-injects it
//! towards the real service and sends the replies back the same way.

pub mod bind;
pub mod capture;
pub mod config;
pub mod connection;
pub mod control;
pub mod engine;
pub mod flow;
pub mod frame;
pub mod host;
pub mod plane;
pub mod pool;
pub mod proxy;
pub mod registry;

pub use config::Config;
pub use connection::Connection;
pub use engine::{Context, Engine, Parts};
pub use flow::{FlowId, Service, Uid};
pub use plane::{Mode, Role, Session};

/// Hash map used for every keyed table in the engine.
pub(crate) type Map<K, V> = hashbrown::HashMap<K, V, ahash::RandomState>;
