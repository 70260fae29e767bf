//! Error types for the cluster control plane.

use std::io;
use thiserror::Error;

/// Result type alias for control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the control plane.
#[derive(Error, Debug)]
pub enum Error {
    /// Cluster-integrity violations (mismatched UUID, duplicate node ID).
    #[error("cluster integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    /// Cluster membership errors.
    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Rebalance round errors.
    #[error("rebalance error: {0}")]
    Rebalance(#[from] RebalanceError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation was aborted.
    #[error("operation aborted")]
    Aborted,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Cluster-integrity errors. Fatal for the offending request and never
/// silently ignored.
#[derive(Error, Debug)]
pub enum IntegrityError {
    /// A joining node advertises metadata from a different cluster.
    #[error("UUID mismatch: local {local_uuid} (node {local}), incoming {peer_uuid} (node {peer})")]
    UuidMismatch {
        local: String,
        local_uuid: String,
        peer: String,
        peer_uuid: String,
    },

    /// Two live nodes claim the same daemon ID.
    #[error("duplicate node ID {id:?} ({existing}, {incoming})")]
    DuplicateId {
        id: String,
        existing: String,
        incoming: String,
    },
}

/// Cluster membership errors.
#[derive(Error, Debug)]
pub enum MembershipError {
    /// Node not found in the cluster map. Terminal 404.
    #[error("node {0:?} does not exist in the cluster map")]
    NodeNotFound(String),

    /// A mutating verb reached a non-primary proxy and could not be forwarded.
    #[error("{self_id} is not the primary ({primary_id}): cannot {verb}")]
    NotPrimary {
        self_id: String,
        primary_id: String,
        verb: String,
    },

    /// Node is already under maintenance.
    #[error("node {0:?} is already in maintenance")]
    AlreadyInMaintenance(String),

    /// Node is not under maintenance.
    #[error("node {0:?} is not under maintenance")]
    NotInMaintenance(String),

    /// The primary cannot be removed or put in maintenance.
    #[error("node {0:?} is primary, cannot perform {1:?}")]
    NodeIsPrimary(String, String),

    /// Join failed.
    #[error("join failed: {0}")]
    JoinFailed(String),

    /// A handover phase was rejected by a peer.
    #[error("failed to set primary {id}: {peer} returned an error in the {phase} phase: {details}")]
    HandoverRejected {
        id: String,
        peer: String,
        phase: String,
        details: String,
    },
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed mid-exchange.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer returned an error response.
    #[error("peer {peer} replied {code}: {message}")]
    PeerError {
        peer: String,
        code: u16,
        message: String,
    },

    /// The peer returned a response of the wrong kind.
    #[error("unexpected response from {0}")]
    UnexpectedResponse(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Frame too large or malformed.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Rebalance round errors.
#[derive(Error, Debug)]
pub enum RebalanceError {
    /// A round with this ID (or newer) already ran.
    #[error("stale rebalance g{incoming} (current g{current})")]
    StaleRound { incoming: i64, current: i64 },

    /// Rebalancing is disabled by configuration.
    #[error("rebalance is disabled by configuration")]
    Disabled,

    /// Not enough active targets to rebalance.
    #[error("not enough active targets ({0})")]
    NotEnoughTargets(usize),

    /// A peer failed to reach the required stage in time.
    #[error("timed out waiting for {peer} to reach stage {stage}")]
    StageTimeout { peer: String, stage: String },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(NetworkError::Io(e))
    }
}

impl Error {
    /// HTTP-ish status code carried in wire error replies.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Integrity(_) => 409,
            Error::Membership(MembershipError::NodeNotFound(_)) => 404,
            Error::Membership(MembershipError::NotPrimary { .. }) => 421,
            Error::Membership(_) => 400,
            Error::Network(_) => 502,
            Error::Rebalance(_) => 409,
            Error::Config(_) => 400,
            Error::Aborted | Error::Timeout => 503,
            Error::Internal(_) => 500,
        }
    }

    /// True when the error represents a transient transport condition worth
    /// retrying (as opposed to a definitive peer rejection).
    pub fn is_unreachable(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Network(NetworkError::ConnectionFailed { .. }) => true,
            Error::Network(NetworkError::ConnectionClosed) => true,
            Error::Network(NetworkError::Io(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err = Error::Membership(MembershipError::NodeNotFound("t1".to_string()));
        assert_eq!(err.status_code(), 404);

        let err = Error::Integrity(IntegrityError::DuplicateId {
            id: "t1".to_string(),
            existing: "t[t1]".to_string(),
            incoming: "t[t1]".to_string(),
        });
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn test_unreachable_classification() {
        assert!(Error::Timeout.is_unreachable());
        assert!(Error::Network(NetworkError::ConnectionClosed).is_unreachable());
        assert!(!Error::Membership(MembershipError::NodeNotFound("x".into())).is_unreachable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::Membership(MembershipError::NotPrimary {
            self_id: "p2".to_string(),
            primary_id: "p1".to_string(),
            verb: "join".to_string(),
        });
        let s = err.to_string();
        assert!(s.contains("p2"));
        assert!(s.contains("p1"));
    }
}
