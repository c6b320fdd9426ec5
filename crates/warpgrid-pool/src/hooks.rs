//! Lifecycle callbacks.

use std::time::Instant;

use crate::driver::DriverError;

/// Identity of a pooled connection, passed to hook callbacks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub partition: usize,
    pub created_at: Instant,
}

/// Callbacks invoked at connection lifecycle transitions.
///
/// All methods default to no-ops. Hooks run on whichever thread drives
/// the transition (caller, release worker, or maintenance task) and must
/// not block.
pub trait ConnectionHook: Send + Sync {
    /// A new physical connection was opened.
    fn on_acquire(&self, _connection: &ConnectionInfo) {}

    /// A connection was handed to a caller.
    fn on_check_out(&self, _connection: &ConnectionInfo) {}

    /// A connection finished its release and is free again.
    fn on_check_in(&self, _connection: &ConnectionInfo) {}

    /// A physical connection was closed and removed from its partition.
    fn on_destroy(&self, _connection: &ConnectionInfo) {}

    /// Opening a physical connection failed.
    fn on_acquire_fail(&self, _error: &DriverError) {}
}
