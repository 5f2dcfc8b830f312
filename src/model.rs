//! Core data model: channels, peers, priorities and pending transfers.
//!
//! Numeric codes are chosen for PostgreSQL SMALLINT storage; the public
//! API only ever sees the typed enums.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generate a prefixed random id, e.g. `channel-2f9c…`.
pub fn generate_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

/// Peer role within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Producer => "PRODUCER",
            Role::Consumer => "CONSUMER",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "PRODUCER" => Some(Role::Producer),
            "CONSUMER" => Some(Role::Consumer),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Producer selection priority.
///
/// Ordered: `Primary > Backup > Excluded`. Priority only ever moves down
/// (one level per `decrement_priority`), and `Excluded` is terminal: such
/// a peer is never selectable as a producer again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Primary,
    Backup,
    Excluded,
}

impl Priority {
    /// Numeric value for SMALLINT storage.
    ///
    /// Any stored negative value maps back to `Excluded`, so the column
    /// stays compatible with plain `priority - 1` style history.
    #[inline]
    pub fn value(&self) -> i16 {
        match self {
            Priority::Primary => 10,
            Priority::Backup => 5,
            Priority::Excluded => -1,
        }
    }

    pub fn from_value(v: i16) -> Self {
        if v >= 10 {
            Priority::Primary
        } else if v >= 0 {
            Priority::Backup
        } else {
            Priority::Excluded
        }
    }

    /// One level down. `Excluded` stays `Excluded`.
    pub fn decremented(&self) -> Self {
        match self {
            Priority::Primary => Priority::Backup,
            Priority::Backup | Priority::Excluded => Priority::Excluded,
        }
    }

    /// Usable for producer selection.
    #[inline]
    pub fn is_usable(&self) -> bool {
        !matches!(self, Priority::Excluded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Primary => "PRIMARY",
            Priority::Backup => "BACKUP",
            Priority::Excluded => "EXCLUDED",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque data-format attribute carried by a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataScheme {
    pub data_format: String,
    pub scheme_content: String,
}

/// Where a peer's data actually lives: a live slot endpoint or an
/// external object-storage location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerEndpoint {
    Slot { peer_url: String },
    Storage { storage_uri: String },
}

/// Serializable peer descriptor, stored as JSON in the `description`
/// column and handed out verbatim over the RPC surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescription {
    pub peer_id: String,
    pub endpoint: PeerEndpoint,
}

impl PeerDescription {
    pub fn slot(peer_id: impl Into<String>, peer_url: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            endpoint: PeerEndpoint::Slot {
                peer_url: peer_url.into(),
            },
        }
    }

    pub fn storage(peer_id: impl Into<String>, storage_uri: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            endpoint: PeerEndpoint::Storage {
                storage_uri: storage_uri.into(),
            },
        }
    }

    #[inline]
    pub fn is_storage(&self) -> bool {
        matches!(self.endpoint, PeerEndpoint::Storage { .. })
    }

    /// Live slot URL, if this peer is slot-backed.
    pub fn slot_url(&self) -> Option<&str> {
        match &self.endpoint {
            PeerEndpoint::Slot { peer_url } => Some(peer_url),
            PeerEndpoint::Storage { .. } => None,
        }
    }

    pub fn storage_uri(&self) -> Option<&str> {
        match &self.endpoint {
            PeerEndpoint::Storage { storage_uri } => Some(storage_uri),
            PeerEndpoint::Slot { .. } => None,
        }
    }
}

/// A logical conduit between producer slot(s) and consumer slot(s) for one
/// data exchange of a workflow graph execution.
///
/// The tuple (owner_id, execution_id, storage_producer_uri,
/// storage_consumer_uri) identifies at most one channel; `id` is a
/// surrogate key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub owner_id: String,
    pub execution_id: String,
    pub workflow_name: String,
    pub data_scheme: Option<DataScheme>,
    pub storage_producer_uri: Option<String>,
    pub storage_consumer_uri: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One registered endpoint of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    pub channel_id: String,
    pub role: Role,
    pub description: PeerDescription,
    pub priority: Priority,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
}

/// One outstanding "instruct the consumer to start pulling from the
/// producer" obligation. Both peers belong to `channel_id`. While the row
/// exists, neither peer can be unbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransfer {
    pub channel_id: String,
    pub producer: Peer,
    pub consumer: Peer,
}

/// Channel plus materialized peer descriptions, for status reporting only.
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub channel: Channel,
    pub producers: Vec<PeerDescription>,
    pub consumers: Vec<PeerDescription>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering_and_decrement() {
        assert_eq!(Priority::Primary.decremented(), Priority::Backup);
        assert_eq!(Priority::Backup.decremented(), Priority::Excluded);
        assert_eq!(Priority::Excluded.decremented(), Priority::Excluded);

        assert!(Priority::Primary.is_usable());
        assert!(Priority::Backup.is_usable());
        assert!(!Priority::Excluded.is_usable());
    }

    #[test]
    fn test_priority_value_roundtrip() {
        for p in [Priority::Primary, Priority::Backup, Priority::Excluded] {
            assert_eq!(Priority::from_value(p.value()), p);
        }
        // Legacy negative sentinels all mean excluded
        assert_eq!(Priority::from_value(-7), Priority::Excluded);
        assert_eq!(Priority::from_value(4), Priority::Backup);
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::from_str_opt("PRODUCER"), Some(Role::Producer));
        assert_eq!(Role::from_str_opt("CONSUMER"), Some(Role::Consumer));
        assert_eq!(Role::from_str_opt("producer"), None);
        assert_eq!(Role::from_str_opt(""), None);
    }

    #[test]
    fn test_peer_description_json_roundtrip() {
        let slot = PeerDescription::slot("peer-1", "http://10.0.0.3:9876");
        let json = serde_json::to_string(&slot).unwrap();
        let back: PeerDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(slot, back);
        assert!(!slot.is_storage());
        assert_eq!(slot.slot_url(), Some("http://10.0.0.3:9876"));

        let storage = PeerDescription::storage("peer-2", "s3://bucket/key");
        assert!(storage.is_storage());
        assert_eq!(storage.storage_uri(), Some("s3://bucket/key"));
        assert_eq!(storage.slot_url(), None);
    }

    #[test]
    fn test_generate_id_prefix() {
        let id = generate_id("channel");
        assert!(id.starts_with("channel-"));
        assert_ne!(generate_id("channel"), id);
    }
}
