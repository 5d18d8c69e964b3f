//! Data model: peer addresses, discovered peers, messages, conversations, connection state.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::ChatFrame;

/// Stable identifier of a radio device, in hardware-address string form (e.g. `AA:BB:CC:DD:EE:FF`).
/// Normalised to trimmed upper case so the same device always maps to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl AsRef<str>) -> Self {
        PeerAddress(address.as_ref().trim().to_ascii_uppercase())
    }

    /// Random locally administered address, used when the host has no fixed one configured.
    pub fn random_local() -> Self {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[0] = (bytes[0] | 0x02) & !0x01;
        let parts: Vec<String> = bytes.iter().map(|b| format!("{:02X}", b)).collect();
        PeerAddress(parts.join(":"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        PeerAddress::new(s)
    }
}

impl From<String> for PeerAddress {
    fn from(s: String) -> Self {
        PeerAddress::new(s)
    }
}

/// A peer seen during discovery. Replaced, never duplicated, when the same address reappears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    pub address: PeerAddress,
    /// May be empty when the radio has not resolved a name yet.
    pub display_name: String,
    pub bonded: bool,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        MessageId(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryState {
    /// Delivered and Failed are final.
    pub fn is_terminal(self) -> bool {
        !matches!(self, DeliveryState::Pending)
    }
}

/// One chat message. Immutable once Delivered or Failed, except for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub peer: PeerAddress,
    pub direction: Direction,
    pub body: String,
    /// Local creation time: send time for Sent, receipt time for Received.
    pub timestamp: DateTime<Utc>,
    /// Sender's clock for Received messages.
    #[serde(default)]
    pub remote_timestamp: Option<DateTime<Utc>>,
    /// Id the sender gave a Received message. Not unique locally: a peer may repeat it.
    #[serde(default)]
    pub remote_id: Option<Uuid>,
    pub delivery: DeliveryState,
    /// Why a send failed, when `delivery` is Failed.
    #[serde(default)]
    pub failure: Option<String>,
}

impl Message {
    /// New outgoing message, Pending until the write completes.
    pub fn outgoing(peer: PeerAddress, body: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            peer,
            direction: Direction::Sent,
            body: body.into(),
            timestamp: now,
            remote_timestamp: None,
            remote_id: None,
            delivery: DeliveryState::Pending,
            failure: None,
        }
    }

    /// Message decoded off the wire from `peer`. Received messages are Delivered on arrival
    /// and get a fresh local id; the sender's id is kept as `remote_id`.
    pub fn incoming(peer: PeerAddress, frame: ChatFrame, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            peer,
            direction: Direction::Received,
            body: frame.body,
            timestamp: now,
            remote_timestamp: Utc.timestamp_millis_opt(frame.sent_at_ms).single(),
            remote_id: Some(frame.id),
            delivery: DeliveryState::Delivered,
            failure: None,
        }
    }

    /// Sender-relative fields carried on the wire.
    pub fn to_frame(&self) -> ChatFrame {
        ChatFrame {
            body: self.body.clone(),
            sent_at_ms: self.timestamp.timestamp_millis(),
            id: self.id.0,
        }
    }
}

/// Ordered message history with one peer. Insertion order is chronological.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub peer: PeerAddress,
    #[serde(default)]
    pub display_name: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    pub fn new(peer: PeerAddress) -> Self {
        Self {
            peer,
            display_name: None,
            messages: Vec::new(),
            unread_count: 0,
        }
    }

    /// Preview line for a conversation list.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Name to show for this peer: discovered name, else the address.
    pub fn title(&self) -> &str {
        match &self.display_name {
            Some(name) if !name.is_empty() => name,
            _ => self.peer.as_str(),
        }
    }
}

/// Connection state as seen by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting(PeerAddress),
    Connected(PeerAddress),
    Disconnecting(PeerAddress),
    Failed(PeerAddress, String),
}

impl ConnectionState {
    pub fn peer(&self) -> Option<&PeerAddress> {
        match self {
            ConnectionState::Idle | ConnectionState::Scanning => None,
            ConnectionState::Connecting(p)
            | ConnectionState::Connected(p)
            | ConnectionState::Disconnecting(p)
            | ConnectionState::Failed(p, _) => Some(p),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Scanning => write!(f, "scanning"),
            ConnectionState::Connecting(p) => write!(f, "connecting to {}", p),
            ConnectionState::Connected(p) => write!(f, "connected to {}", p),
            ConnectionState::Disconnecting(p) => write!(f, "disconnecting from {}", p),
            ConnectionState::Failed(p, reason) => write!(f, "connection to {} failed: {}", p, reason),
        }
    }
}

/// Everything a consumer renders, published on every relevant change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSnapshot {
    pub connection: ConnectionState,
    /// Per-peer states that are not Idle, ordered by address.
    pub sessions: Vec<ConnectionState>,
    pub scanning: bool,
    /// Set when the radio is off or permission was denied; the user must act on it.
    pub radio_error: Option<String>,
    /// Most-recently-seen first.
    pub peers: Vec<DiscoveredPeer>,
    /// Most recent activity first.
    pub conversations: Vec<Conversation>,
}

impl Default for ChatSnapshot {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Idle,
            sessions: Vec::new(),
            scanning: false,
            radio_error: None,
            peers: Vec::new(),
            conversations: Vec::new(),
        }
    }
}

impl ChatSnapshot {
    pub fn conversation(&self, peer: &PeerAddress) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.peer == peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_normalised() {
        assert_eq!(PeerAddress::new(" aa:bb "), PeerAddress::new("AA:BB"));
        assert_eq!(PeerAddress::from("aa:bb").as_str(), "AA:BB");
    }

    #[test]
    fn random_local_address_is_locally_administered_unicast() {
        let addr = PeerAddress::random_local();
        assert_eq!(addr.as_str().len(), 17);
        let first = u8::from_str_radix(&addr.as_str()[..2], 16).unwrap();
        assert_eq!(first & 0x02, 0x02);
        assert_eq!(first & 0x01, 0);
    }

    #[test]
    fn incoming_keeps_sender_fields() {
        let now = Utc::now();
        let sent = Message::outgoing("AA:BB".into(), "hi", now);
        let received = Message::incoming("CC:DD".into(), sent.to_frame(), Utc::now());
        assert_eq!(received.remote_id, Some(sent.id.0));
        assert_ne!(received.id, sent.id);
        assert_eq!(received.body, "hi");
        assert_eq!(received.direction, Direction::Received);
        assert_eq!(
            received.remote_timestamp.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );
    }

    #[test]
    fn title_falls_back_to_address() {
        let mut c = Conversation::new("AA:BB".into());
        assert_eq!(c.title(), "AA:BB");
        c.display_name = Some("Phone".into());
        assert_eq!(c.title(), "Phone");
    }
}
