//! Peer contact records.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::Identifier;

/// Another node as known to the routing table.
///
/// Two contacts are equal when their ids match. A peer that restarts keeps
/// its `machine_id` but may come back with a new id or endpoint; see
/// [`Contact::same_peer`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    /// Position in the identifier space.
    pub id: Identifier,
    /// Network address, `host:port` for the TCP transport.
    pub endpoint: String,
    /// Last successful interaction.
    pub last_seen: DateTime<Utc>,
    /// Stable identity of the machine behind the endpoint. Empty when unknown.
    #[serde(default)]
    pub machine_id: String,
    /// Logical groups (file buckets) this peer participates in.
    #[serde(default)]
    pub buckets: BTreeSet<String>,
}

impl Contact {
    /// Create a contact seen just now.
    pub fn new(id: Identifier, endpoint: impl Into<String>, machine_id: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            last_seen: Utc::now(),
            machine_id: machine_id.into(),
            buckets: BTreeSet::new(),
        }
    }

    /// Builder-style helper to declare group membership.
    pub fn with_buckets<I, S>(mut self, buckets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.buckets.extend(buckets.into_iter().map(Into::into));
        self
    }

    /// Record a successful interaction.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Whether both records describe the same peer.
    ///
    /// Machine identity wins when both sides know it, otherwise ids decide.
    pub fn same_peer(&self, other: &Contact) -> bool {
        if !self.machine_id.is_empty() && !other.machine_id.is_empty() {
            self.machine_id == other.machine_id
        } else {
            self.id == other.id
        }
    }

    /// Whether the peer advertises membership of `bucket`.
    pub fn in_bucket(&self, bucket: &str) -> bool {
        self.buckets.contains(bucket)
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_follows_identifier_only() {
        let id = Identifier::hash(b"peer");
        let a = Contact::new(id, "10.0.0.1:7000", "machine-a");
        let b = Contact::new(id, "10.0.0.2:7000", "machine-b");
        assert_eq!(a, b);
    }

    #[test]
    fn same_peer_prefers_machine_identity() {
        let a = Contact::new(Identifier::hash(b"one"), "10.0.0.1:7000", "box");
        let b = Contact::new(Identifier::hash(b"two"), "10.0.0.1:7001", "box");
        assert!(a.same_peer(&b));

        let anon = Contact::new(Identifier::hash(b"one"), "10.0.0.9:7000", "");
        assert!(a.same_peer(&anon));
        assert!(!b.same_peer(&anon));
    }
}
