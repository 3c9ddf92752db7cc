//! Error types for room registry operations

use thiserror::Error;

/// Rooms result type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by registry operations.
///
/// The in-memory registry never fails; the variant exists so that
/// registries backed by a fallible store (a remote or persistent one)
/// fit behind the same contract.
#[derive(Debug, Error)]
pub enum Error {
    #[error("backing store error: {0}")]
    Store(String),
}
