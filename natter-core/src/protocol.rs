//! Natter wire protocol: frame payloads, discovery advert, link handshake, version.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::PeerAddress;

/// Current protocol version. Carried in adverts and the link handshake, never in chat frames.
pub const PROTOCOL_VERSION: u8 = 1;

/// Well-known service identifier both ends look for; no negotiation beyond this.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e617474_6572_4c00_8000_00805f9b34fb);

/// Payload of one chat frame. Encoding is bincode in field order; framing is length-prefix (see wire module).
///
/// `body` comes first so any receiver can recover it. Decoders ignore trailing bytes, so a
/// newer sender may append fields without breaking older receivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFrame {
    pub body: String,
    /// Sender's clock, milliseconds since the Unix epoch.
    pub sent_at_ms: i64,
    pub id: Uuid,
}

/// Discovery: advertise presence and where to open a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advert {
    pub protocol_version: u8,
    pub address: PeerAddress,
    pub display_name: String,
    pub link_port: u16,
}

/// First frame in each direction on a fresh link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub service: Uuid,
    pub protocol_version: u8,
    pub address: PeerAddress,
}

impl Hello {
    pub fn new(address: PeerAddress) -> Self {
        Self {
            service: SERVICE_UUID,
            protocol_version: PROTOCOL_VERSION,
            address,
        }
    }

    /// True when the other end speaks the same service.
    pub fn is_compatible(&self) -> bool {
        self.service == SERVICE_UUID && self.protocol_version == PROTOCOL_VERSION
    }
}
