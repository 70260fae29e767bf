//! Wire message types for intra-cluster communication.
//!
//! All control-plane traffic is length-framed JSON: a 4-byte big-endian
//! length prefix followed by one serialized [`ControlMsg`]. Metadata
//! documents ride inside [`RevPair`] payloads and carry their own `uuid`
//! and integer `version` fields.

use crate::error::{Error, NetworkError, Result};
use crate::meta::RevPair;
use crate::rebalance::{RebStatus, Stage};
use crate::types::{Action, JoinVerb, NodeId, NodeRegMeta, WhatQuery};
use serde::{Deserialize, Serialize};

/// Maximum accepted frame size (a metasync batch with a large Smap stays
/// well under this).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Every message exchanged between nodes, requests and replies alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMsg {
    // ---- requests ----
    /// Join/keepalive family, addressed to the primary.
    Join {
        verb: JoinVerb,
        meta: NodeRegMeta,
        #[serde(default)]
        non_electable: bool,
    },
    /// A metasync batch: one atomic round trip carrying all changed pairs.
    SyncMeta {
        caller: NodeId,
        pairs: Vec<RevPair>,
    },
    /// Fire-and-forget pre-announcement of forthcoming changes.
    PreAnnounce {
        caller: NodeId,
        pairs: Vec<RevPair>,
    },
    /// Health probe; with `reb_status` the reply carries the rebalance status.
    Health {
        #[serde(default)]
        reb_status: bool,
    },
    /// Push notification: `caller` reached `stage` of round `reb_id`.
    StagePush {
        caller: NodeId,
        reb_id: i64,
        stage: Stage,
    },
    /// Administrative cluster action, addressed to a proxy.
    Act(Action),
    /// Node-level application of an action (the daemon surface the cluster
    /// handlers fan out to).
    DaemonAct(Action),
    /// Terminal status of a long-running activity, target -> IC member.
    XactNotif {
        caller: NodeId,
        uuid: String,
        aborted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<String>,
    },
    /// Primary handover, prepare or commit phase.
    SetPrimary {
        id: NodeId,
        prepare: bool,
    },
    /// Read-only daemon query, aggregated by the proxy.
    DaemonQuery {
        what: WhatQuery,
    },
    /// One rebalanced object (the `Mover` wire). The reply is the ACK.
    ObjPut {
        caller: NodeId,
        reb_id: i64,
        name: String,
        data: Vec<u8>,
    },
    /// Self-initiated removal; `caller_id` must equal `id`.
    Unreg {
        id: NodeId,
        caller_id: NodeId,
    },
    /// Notification ownership-table transfer between IC members.
    OwnershipTbl {
        caller: NodeId,
        entries: Vec<crate::notify::NotifEntry>,
    },

    // ---- replies ----
    /// Generic success.
    Ok,
    /// Join accepted; carries current metadata for a self-registering node
    /// and the rebalance ID for a user-register.
    JoinAccepted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<NodeRegMeta>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reb_id: Option<i64>,
    },
    /// Health reply.
    HealthReply {
        smap_version: i64,
        started: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reb: Option<RebStatus>,
    },
    /// Opaque JSON payload (daemon queries, xaction snapshots).
    Blob {
        value: serde_json::Value,
    },
    /// ACK for an [`ControlMsg::ObjPut`].
    ObjAck {
        name: String,
    },
    /// Error reply.
    Err {
        code: u16,
        message: String,
    },
}

impl ControlMsg {
    /// Build an error reply from a control-plane error.
    pub fn from_err(e: &Error) -> ControlMsg {
        ControlMsg::Err {
            code: e.status_code(),
            message: e.to_string(),
        }
    }

    /// Turn a reply into `Ok(())`, mapping `Err` replies onto
    /// [`NetworkError::PeerError`].
    pub fn expect_ok(self, peer: &str) -> Result<()> {
        match self {
            ControlMsg::Ok => Ok(()),
            other => other.reject(peer).map(|_| ()),
        }
    }

    /// Reject any reply that is not an error as "unexpected"; surface error
    /// replies as typed errors. Helper for typed reply extraction.
    pub fn reject(self, peer: &str) -> Result<ControlMsg> {
        match self {
            ControlMsg::Err { code, message } => Err(Error::Network(NetworkError::PeerError {
                peer: peer.to_string(),
                code,
                message,
            })),
            _ => Err(Error::Network(NetworkError::UnexpectedResponse(
                peer.to_string(),
            ))),
        }
    }
}

/// Encode a message to its JSON body.
pub fn encode_message(msg: &ControlMsg) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode a message from a JSON body.
pub fn decode_message(data: &[u8]) -> Result<ControlMsg> {
    serde_json::from_slice(data)
        .map_err(|e| Error::Network(NetworkError::Serialization(e.to_string())))
}

/// Frame a message with its length prefix for TCP transmission.
pub fn frame_message(msg: &ControlMsg) -> Result<Vec<u8>> {
    let data = encode_message(msg)?;
    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&(data.len() as u32).to_be_bytes());
    framed.extend_from_slice(&data);
    Ok(framed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let msg = ControlMsg::Health { reb_status: true };
        let encoded = encode_message(&msg).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        assert!(matches!(decoded, ControlMsg::Health { reb_status: true }));
    }

    #[test]
    fn test_frame_layout() {
        let msg = ControlMsg::Ok;
        let framed = frame_message(&msg).unwrap();
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);
        assert!(matches!(decode_message(&framed[4..]).unwrap(), ControlMsg::Ok));
    }

    #[test]
    fn test_err_reply_surfaces_as_peer_error() {
        let reply = ControlMsg::Err {
            code: 404,
            message: "node \"t9\" does not exist".to_string(),
        };
        let err = reply.expect_ok("t1").unwrap_err();
        match err {
            Error::Network(NetworkError::PeerError { code, .. }) => assert_eq!(code, 404),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unexpected_reply() {
        let reply = ControlMsg::Blob {
            value: serde_json::json!({"x": 1}),
        };
        assert!(reply.expect_ok("t1").is_err());
    }
}
