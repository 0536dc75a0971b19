//! Participant identity and registry records.

use std::fmt;

use chrono::{DateTime, Utc};
use derive_more::{AsRef, Display, From, Into};
use serde::{Deserialize, Serialize};

/// Length in bytes of a node's public key material.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// A stable identifier for a participating institution.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id from an institution identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Opaque public key material supplied by a node at registration.
///
/// The coordinator never performs asymmetric cryptography with this key; it
/// is registry data handed to the external decryption authority.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef, From, Into)]
pub struct NodePublicKey([u8; PUBLIC_KEY_LENGTH]);

impl NodePublicKey {
    /// Creates a public key from raw bytes.
    ///
    /// Returns `None` if the slice does not have the expected length.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PUBLIC_KEY_LENGTH {
            return None;
        }
        let mut buf = [0_u8; PUBLIC_KEY_LENGTH];
        buf.copy_from_slice(bytes);
        Some(Self(buf))
    }

    /// Returns the key material as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePublicKey({})", self)
    }
}

/// Lifecycle status of a registered node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// The node has registered but has not yet been seen alive.
    Registered,
    /// The node has proven liveness via a heartbeat and may be invited to
    /// rounds.
    Active,
    /// The node has been suspended by an operator. Suspension is permanent
    /// until an explicit external reinstatement; there is no automatic
    /// un-suspension.
    Suspended {
        /// The operator-supplied suspension reason.
        reason: String,
    },
}

/// The registry record for a participating institution.
///
/// Nodes are never deleted, only suspended, so the registry doubles as an
/// audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// The stable node identifier.
    pub id: NodeId,
    /// The node's public key material.
    pub public_key: NodePublicKey,
    /// When the node registered.
    pub registered_at: DateTime<Utc>,
    /// When the node last sent a heartbeat, if ever.
    pub last_seen: Option<DateTime<Utc>>,
    /// The node's lifecycle status.
    pub status: NodeStatus,
}

impl Node {
    /// Whether the node is currently eligible to be invited to a round.
    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_roundtrip_and_display() {
        let key = NodePublicKey::from_slice(&[0xab; PUBLIC_KEY_LENGTH]).unwrap();
        assert_eq!(key.as_slice().len(), PUBLIC_KEY_LENGTH);
        assert_eq!(key.to_string(), "ab".repeat(PUBLIC_KEY_LENGTH));
    }

    #[test]
    fn public_key_rejects_wrong_length() {
        assert!(NodePublicKey::from_slice(&[0_u8; 16]).is_none());
    }

    #[test]
    fn suspended_node_is_not_active() {
        let node = Node {
            id: NodeId::from("hospital-a"),
            public_key: NodePublicKey::from_slice(&[0_u8; PUBLIC_KEY_LENGTH]).unwrap(),
            registered_at: Utc::now(),
            last_seen: None,
            status: NodeStatus::Suspended {
                reason: "key rotation pending".to_string(),
            },
        };
        assert!(!node.is_active());
    }
}
