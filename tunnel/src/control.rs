use crate::Uid;

/// The control plane as seen from the data plane.
pub trait ControlPlane: Send + Sync {
	/// Probe a peer that has gone quiet. Whether to tear anything down is up to the control plane.
	fn alive_check(&self, peer: Uid);
}
