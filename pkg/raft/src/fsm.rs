//! The trait boundary between the replicated log and the caller's state
//! machine.
//!
//! The engine only ever calls `apply` for committed `command` entries and
//! `snapshot`/`restore` around compaction; it never inspects the bytes it
//! hands back and forth.

use crate::error::Result;

/// A deterministic state machine driven by the committed log.
///
/// Implementations must be deterministic: given the same sequence of
/// `apply` calls, every replica must reach the same state and return
/// equivalent results.
pub trait Fsm: Send + 'static {
    /// Applies one committed command entry, returning an opaque result
    /// made available to whoever proposed it (if anyone is still waiting).
    fn apply(&mut self, index: crate::types::LogIndex, command: &[u8]) -> Result<Vec<u8>>;

    /// Serializes the current state for a snapshot.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replaces the current state with `state` recovered from a snapshot or
    /// `InstallSnapshot`.
    fn restore(&mut self, state: &[u8]) -> Result<()>;
}
