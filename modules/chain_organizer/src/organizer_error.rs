//! Error types for organizer operations.

use forkline_common::StoreError;

/// Errors returned by [`Organizer`](crate::organizer::Organizer) operations.
///
/// Validation and connectivity outcomes are never errors; only
/// infrastructure trouble escapes.
#[derive(Debug, thiserror::Error)]
pub enum OrganizerError {
    /// The organizer has not been started, or has been stopped.
    #[error("organizer is not running")]
    Stopped,

    /// The chain store failed; the canonical chain is unchanged.
    #[error("chain store failed: {0}")]
    Store(#[from] StoreError),
}
