//! Natter messaging core.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod connection;
pub mod discovery;
pub mod error;
pub mod model;
pub mod protocol;
pub mod store;
pub mod wire;
pub mod core;

pub use connection::{DialId, LinkId, LinkVerdict, Origin};
pub use crate::core::{CoreConfig, NatterCore, OutboundAction, Outgoing};
pub use discovery::Sighting;
pub use error::{LinkError, SendError};
pub use model::{
    ChatSnapshot, ConnectionState, Conversation, DeliveryState, Direction, DiscoveredPeer,
    Message, MessageId, PeerAddress,
};
pub use protocol::{Advert, ChatFrame, Hello, PROTOCOL_VERSION, SERVICE_UUID};
pub use store::{ConversationStore, StoreError};
pub use wire::{decode_frame, encode_frame, FrameDecoder, FrameEncodeError, FramingError};
