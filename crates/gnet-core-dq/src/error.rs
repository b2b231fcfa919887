//! Engine errors.

use thiserror::Error;

/// Errors surfaced to callers of the dynamic query engine.
///
/// Most conditions the engine meets (no candidates, message drops, silent
/// leaves, MUID collisions) are not errors to the caller: the query simply
/// ends with fewer results and the outcome is accounted in the statistics.
#[derive(Debug, Error)]
pub enum DqError {
    /// The local node is not (or no longer) an ultrapeer.
    #[error("not an ultrapeer, dynamic querying unavailable")]
    NotUltrapeer,
    /// The engine has been closed.
    #[error("dynamic query engine is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, DqError>;
