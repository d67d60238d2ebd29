//! Errors returned to callers of the ring.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// Gossip has not converged yet.
    #[error("ring is not stable yet")]
    NotStable,

    /// No member that holds the key is up.
    #[error("no replica is available for key {0:?}")]
    NoReplica(String),

    /// The chosen replica did not answer in time.
    #[error("{member} did not answer within {timeout:?}")]
    Timeout { member: String, timeout: Duration },

    /// The request was dropped before an answer arrived.
    #[error("request to {0} was cancelled")]
    Cancelled(String),

    /// The ring runtime has stopped.
    #[error("ring has shut down")]
    Shutdown,
}
