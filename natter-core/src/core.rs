//! Host-driven API: NatterCore receives events from the host, returns actions.
//!
//! The host owns sockets, scan handles and timers. It reports what happened (a sighting, a
//! completed dial, a decoded frame, a write result) and carries out the returned actions.
//! All state that consumers see lives here and is read through [`NatterCore::snapshot`].

use chrono::{DateTime, Duration, Utc};

use crate::connection::{ConnectionManager, DialId, LinkAction, LinkId, LinkVerdict, Origin};
use crate::discovery::{PeerRegistry, ScanControl, Sighting, DEFAULT_PEER_RETENTION_SECS};
use crate::error::{LinkError, SendError};
use crate::model::{ChatSnapshot, DeliveryState, Message, MessageId, PeerAddress};
use crate::protocol::ChatFrame;
use crate::store::ConversationStore;
use crate::wire::{self, DEFAULT_MAX_FRAME_LEN};

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// How long a peer stays listed after its last sighting.
    pub peer_retention: Duration,
    /// Largest chat frame payload sent or accepted.
    pub max_frame_len: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            peer_retention: Duration::seconds(DEFAULT_PEER_RETENTION_SECS),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Start a timed scan cycle tagged `cycle`; report sightings and the end with the same tag.
    BeginScan { cycle: u64 },
    /// Abort the running scan cycle.
    CancelScan { cycle: u64 },
    /// Open an outgoing link to the peer's service; report the result with the same `dial`.
    Dial { peer: PeerAddress, dial: DialId },
    /// Abort an in-flight dial.
    CancelDial(PeerAddress),
    /// Stop the read loop, drop queued writes, release the socket; then report `on_link_closed`.
    Close { peer: PeerAddress, link: LinkId },
}

impl From<LinkAction> for OutboundAction {
    fn from(a: LinkAction) -> Self {
        match a {
            LinkAction::Dial { peer, dial } => OutboundAction::Dial { peer, dial },
            LinkAction::CancelDial(p) => OutboundAction::CancelDial(p),
            LinkAction::Close { peer, link } => OutboundAction::Close { peer, link },
        }
    }
}

/// An accepted send: write `frame` on `link`, then report `on_write_complete` for `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub id: MessageId,
    pub link: LinkId,
    pub frame: Vec<u8>,
}

/// Main coordinator. Host passes events; core returns actions.
pub struct NatterCore {
    connections: ConnectionManager,
    registry: PeerRegistry,
    scan: ScanControl,
    store: ConversationStore,
    radio_error: Option<String>,
    max_frame_len: u32,
    dirty: bool,
}

impl NatterCore {
    pub fn new() -> Self {
        Self::with_store(ConversationStore::new(), CoreConfig::default())
    }

    pub fn with_store(store: ConversationStore, config: CoreConfig) -> Self {
        Self {
            connections: ConnectionManager::new(),
            registry: PeerRegistry::with_retention(config.peer_retention),
            scan: ScanControl::default(),
            store,
            radio_error: None,
            max_frame_len: config.max_frame_len,
            dirty: false,
        }
    }

    pub fn max_frame_len(&self) -> u32 {
        self.max_frame_len
    }

    // ---- discovery ----

    /// Idempotent: a second call while scanning returns no action.
    pub fn start_scan(&mut self) -> Vec<OutboundAction> {
        match self.scan.start() {
            Some(cycle) => {
                self.radio_error = None;
                vec![OutboundAction::BeginScan { cycle }]
            }
            None => vec![],
        }
    }

    /// Idempotent. Leaves any connection alone.
    pub fn stop_scan(&mut self) -> Vec<OutboundAction> {
        self.scan
            .stop()
            .map(|cycle| OutboundAction::CancelScan { cycle })
            .into_iter()
            .collect()
    }

    /// A sighting from `cycle`. Late sightings from a cancelled cycle are dropped.
    pub fn on_sighting(&mut self, cycle: u64, sighting: Sighting, now: DateTime<Utc>) -> bool {
        if self.scan.current() != Some(cycle) {
            return false;
        }
        if self
            .store
            .set_display_name(&sighting.address, &sighting.display_name)
        {
            self.dirty = true;
        }
        self.registry.on_sighting(sighting, now)
    }

    /// `cycle` ended on its own (time ceiling reached) or failed. A radio-level failure is
    /// surfaced as such rather than as an empty peer list; other failures only end the cycle.
    pub fn on_scan_ended(
        &mut self,
        cycle: u64,
        result: Result<(), LinkError>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.scan.finish(cycle) {
            return false;
        }
        match result {
            Ok(()) => {
                let removed = self.registry.prune(now);
                if !removed.is_empty() {
                    log::debug!("Dropped {} peer(s) not seen this cycle", removed.len());
                }
            }
            Err(e) if e.is_radio() => {
                log::warn!("Scan failed: {}", e);
                self.radio_error = Some(e.to_string());
            }
            Err(e) => log::warn!("Scan stopped early: {}", e),
        }
        true
    }

    // ---- connections ----

    pub fn connect(&mut self, peer: &PeerAddress) -> Vec<OutboundAction> {
        if peer.is_empty() {
            log::warn!("Ignoring connect to empty address");
            return vec![];
        }
        self.connections
            .connect(peer)
            .into_iter()
            .map(OutboundAction::from)
            .collect()
    }

    /// Dial `dial` to `peer` failed. Results of abandoned or replaced dials are ignored.
    pub fn on_dial_failed(&mut self, peer: &PeerAddress, dial: DialId, reason: LinkError) -> bool {
        let radio_error = reason.is_radio().then(|| reason.to_string());
        if !self.connections.dial_failed(peer, dial, reason) {
            return false;
        }
        if radio_error.is_some() {
            self.radio_error = radio_error;
        }
        true
    }

    /// A link to `peer` is up. On acceptance the conversation is created if this is the first contact.
    pub fn on_link_up(&mut self, peer: &PeerAddress, origin: Origin) -> LinkVerdict {
        let verdict = self.connections.link_up(peer, origin);
        if let LinkVerdict::Accept { .. } = verdict {
            if self.store.get(peer).is_none() {
                self.store.ensure(peer);
                self.dirty = true;
            }
            if let Some(found) = self.registry.get(peer) {
                let name = found.display_name.clone();
                if self.store.set_display_name(peer, &name) {
                    self.dirty = true;
                }
            }
            self.radio_error = None;
        }
        verdict
    }

    /// Read or write side of `link` failed. Sends still queued on it are marked Failed.
    pub fn on_link_down(&mut self, peer: &PeerAddress, link: LinkId, reason: LinkError) -> bool {
        let reason_text = reason.to_string();
        if !self.connections.link_down(peer, link, reason) {
            return false;
        }
        if self.store.fail_pending(peer, &reason_text) > 0 {
            self.dirty = true;
        }
        true
    }

    pub fn disconnect(&mut self, peer: &PeerAddress) -> Vec<OutboundAction> {
        self.connections
            .disconnect(peer)
            .into_iter()
            .map(OutboundAction::from)
            .collect()
    }

    pub fn on_link_closed(&mut self, peer: &PeerAddress, link: LinkId) -> bool {
        if !self.connections.closed(peer, link) {
            return false;
        }
        if self.store.fail_pending(peer, "disconnected") > 0 {
            self.dirty = true;
        }
        true
    }

    // ---- messages ----

    /// Append a Pending message right away, then hand the host a frame to write.
    ///
    /// Without an active link the message stays in history marked Failed and
    /// `SendError::NotConnected` is returned. Empty address or body is rejected before
    /// anything is stored.
    pub fn send_message(
        &mut self,
        peer: &PeerAddress,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Outgoing, SendError> {
        if peer.is_empty() {
            return Err(SendError::InvalidInput("empty peer address"));
        }
        if body.trim().is_empty() {
            return Err(SendError::InvalidInput("empty message body"));
        }
        let message = Message::outgoing(peer.clone(), body, now);
        let id = message.id;
        let frame = message.to_frame();
        self.store.append(peer, message);
        self.dirty = true;

        let Some(link) = self.connections.active_link(peer) else {
            self.fail(peer, id, &LinkError::NotConnected);
            return Err(SendError::NotConnected(peer.clone()));
        };
        match wire::encode_frame_with_limit(&frame, self.max_frame_len) {
            Ok(frame) => Ok(Outgoing { id, link, frame }),
            Err(e) => {
                let reason = LinkError::Framing(e.to_string());
                self.fail(peer, id, &reason);
                Err(SendError::Failed { reason })
            }
        }
    }

    pub fn on_write_complete(
        &mut self,
        peer: &PeerAddress,
        id: MessageId,
        result: Result<(), LinkError>,
    ) -> bool {
        let changed = match result {
            Ok(()) => self
                .store
                .set_delivery(peer, id, DeliveryState::Delivered, None),
            Err(e) => self
                .store
                .set_delivery(peer, id, DeliveryState::Failed, Some(e.to_string())),
        };
        self.dirty |= changed;
        changed
    }

    /// A frame decoded on `link`. Frames from a link that no longer owns the peer are dropped.
    pub fn on_frame(
        &mut self,
        peer: &PeerAddress,
        link: LinkId,
        frame: ChatFrame,
        now: DateTime<Utc>,
    ) -> Option<MessageId> {
        if self.connections.active_link(peer) != Some(link) {
            log::debug!("Dropping frame from stale link {} of {}", link, peer);
            return None;
        }
        let message = Message::incoming(peer.clone(), frame, now);
        let id = message.id;
        self.store.append(peer, message);
        self.dirty = true;
        Some(id)
    }

    pub fn delete_message(&mut self, peer: &PeerAddress, id: MessageId) -> bool {
        let changed = self.store.delete_message(peer, id);
        self.dirty |= changed;
        changed
    }

    pub fn delete_conversation(&mut self, peer: &PeerAddress) -> bool {
        let changed = self.store.delete_conversation(peer);
        self.dirty |= changed;
        changed
    }

    pub fn mark_read(&mut self, peer: &PeerAddress) -> bool {
        let changed = self.store.mark_read(peer);
        self.dirty |= changed;
        changed
    }

    // ---- lifecycle ----

    /// Stop scanning and tear down every dial and link. Sends that never got confirmed are
    /// marked Failed.
    pub fn shutdown(&mut self) -> Vec<OutboundAction> {
        let mut actions = self.stop_scan();
        actions.extend(
            self.connections
                .shutdown()
                .into_iter()
                .map(OutboundAction::from),
        );
        let peers: Vec<PeerAddress> = self
            .store
            .snapshot()
            .into_iter()
            .map(|c| c.peer)
            .collect();
        for peer in peers {
            if self.store.fail_pending(&peer, "service stopped") > 0 {
                self.dirty = true;
            }
        }
        actions
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let scanning = self.scan.is_scanning();
        ChatSnapshot {
            connection: self.connections.current(scanning),
            sessions: self.connections.sessions(),
            scanning,
            radio_error: self.radio_error.clone(),
            peers: self.registry.list(),
            conversations: self.store.snapshot(),
        }
    }

    /// True once after any change that should be persisted.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    fn fail(&mut self, peer: &PeerAddress, id: MessageId, reason: &LinkError) {
        self.store
            .set_delivery(peer, id, DeliveryState::Failed, Some(reason.to_string()));
    }
}

impl Default for NatterCore {
    fn default() -> Self {
        Self::new()
    }
}
