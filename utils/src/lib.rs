/// Error-handling utilities.
pub mod error;
/// Synchronisation helpers.
pub mod sync;
