//! Connection state machine: at most one live link per peer address.
//!
//! The host reports dial results, inbound links and link failures; the manager decides which
//! link wins and what the host must tear down. First completion wins: an outgoing dial and an
//! inbound accept for the same peer race, the first to report `link_up` is adopted and the
//! other is rejected or cancelled. Each dial carries a `DialId`, so the result of a dial the
//! user already abandoned cannot touch a newer attempt. There is no automatic reconnection.

use std::collections::HashMap;

use crate::error::LinkError;
use crate::model::{ConnectionState, PeerAddress};

/// Host-side identity of one accepted socket, so reports from a replaced link can be ignored.
pub type LinkId = u64;

/// Tag of one outgoing dial attempt.
pub type DialId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Completed by the dial tagged with this id.
    Outgoing(DialId),
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Connecting { dial: DialId },
    Connected { link: LinkId },
    Disconnecting { link: LinkId },
    Failed(LinkError),
}

/// What the host must do with a link that just completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkVerdict {
    /// Adopt the link under `link`. When `cancel_dial` is set an outgoing dial for the same
    /// peer lost the race and must be aborted.
    Accept { link: LinkId, cancel_dial: bool },
    /// Another link already owns this peer (or nobody asked for it): close this one.
    Reject,
}

/// Work for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    Dial { peer: PeerAddress, dial: DialId },
    CancelDial(PeerAddress),
    Close { peer: PeerAddress, link: LinkId },
}

#[derive(Debug, Default)]
pub struct ConnectionManager {
    slots: HashMap<PeerAddress, Slot>,
    /// Peer the user last acted on; its state is the one reported as "the" connection.
    focus: Option<PeerAddress>,
    next_link: LinkId,
    next_dial: DialId,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle/Failed → Connecting. No-op while a dial or link for the peer is already in progress.
    pub fn connect(&mut self, peer: &PeerAddress) -> Vec<LinkAction> {
        self.focus = Some(peer.clone());
        match self.slots.get(peer) {
            Some(Slot::Connecting { .. })
            | Some(Slot::Connected { .. })
            | Some(Slot::Disconnecting { .. }) => vec![],
            None | Some(Slot::Failed(_)) => {
                self.next_dial += 1;
                let dial = self.next_dial;
                self.slots.insert(peer.clone(), Slot::Connecting { dial });
                vec![LinkAction::Dial {
                    peer: peer.clone(),
                    dial,
                }]
            }
        }
    }

    /// A socket for `peer` completed its handshake.
    ///
    /// Outgoing links are only adopted while that same dial is wanted; a dial that completes
    /// after the user gave up (or retried) is rejected. Inbound links are adopted unless the
    /// peer already has a link.
    pub fn link_up(&mut self, peer: &PeerAddress, origin: Origin) -> LinkVerdict {
        let cancel_dial = match (self.slots.get(peer), origin) {
            (Some(Slot::Connected { .. }), _) | (Some(Slot::Disconnecting { .. }), _) => {
                return LinkVerdict::Reject
            }
            (Some(Slot::Connecting { dial }), Origin::Outgoing(done)) if *dial == done => false,
            (_, Origin::Outgoing(_)) => return LinkVerdict::Reject,
            (Some(Slot::Connecting { .. }), Origin::Incoming) => true,
            (_, Origin::Incoming) => false,
        };
        self.next_link += 1;
        let link = self.next_link;
        self.slots.insert(peer.clone(), Slot::Connected { link });
        if matches!(origin, Origin::Outgoing(_)) || !self.focus_is_busy() {
            self.focus = Some(peer.clone());
        }
        LinkVerdict::Accept { link, cancel_dial }
    }

    /// Connecting → Failed. Ignored if `dial` is stale (an inbound link won, the user
    /// disconnected, or a newer dial replaced it).
    pub fn dial_failed(&mut self, peer: &PeerAddress, dial: DialId, reason: LinkError) -> bool {
        if self.slots.get(peer) == Some(&Slot::Connecting { dial }) {
            self.slots.insert(peer.clone(), Slot::Failed(reason));
            true
        } else {
            false
        }
    }

    /// The read loop or writer of `link` saw an error or end-of-stream.
    /// Connected → Failed; a link we were already closing just goes Idle.
    pub fn link_down(&mut self, peer: &PeerAddress, link: LinkId, reason: LinkError) -> bool {
        match self.slots.get(peer) {
            Some(Slot::Connected { link: current, .. }) if *current == link => {
                self.slots.insert(peer.clone(), Slot::Failed(reason));
                true
            }
            Some(Slot::Disconnecting { link: current }) if *current == link => {
                self.slots.remove(peer);
                true
            }
            _ => false,
        }
    }

    /// User-initiated teardown. Connected → Disconnecting (host closes, then calls `closed`);
    /// Connecting → Idle with the dial cancelled; Failed → Idle.
    pub fn disconnect(&mut self, peer: &PeerAddress) -> Vec<LinkAction> {
        match self.slots.get(peer).cloned() {
            Some(Slot::Connected { link }) => {
                self.slots
                    .insert(peer.clone(), Slot::Disconnecting { link });
                vec![LinkAction::Close {
                    peer: peer.clone(),
                    link,
                }]
            }
            Some(Slot::Connecting { .. }) => {
                self.slots.remove(peer);
                vec![LinkAction::CancelDial(peer.clone())]
            }
            Some(Slot::Failed(_)) => {
                self.slots.remove(peer);
                vec![]
            }
            Some(Slot::Disconnecting { .. }) | None => vec![],
        }
    }

    /// Host finished closing `link`: Disconnecting → Idle.
    pub fn closed(&mut self, peer: &PeerAddress, link: LinkId) -> bool {
        match self.slots.get(peer) {
            Some(Slot::Disconnecting { link: current }) if *current == link => {
                self.slots.remove(peer);
                true
            }
            _ => false,
        }
    }

    /// Tear everything down: every dial cancelled, every link closed, all peers Idle.
    pub fn shutdown(&mut self) -> Vec<LinkAction> {
        let mut actions = Vec::new();
        for (peer, slot) in self.slots.drain() {
            match slot {
                Slot::Connecting { .. } => actions.push(LinkAction::CancelDial(peer)),
                Slot::Connected { link } | Slot::Disconnecting { link } => {
                    actions.push(LinkAction::Close { peer, link })
                }
                Slot::Failed(_) => {}
            }
        }
        self.focus = None;
        actions
    }

    /// The adopted link for `peer`, if connected.
    pub fn active_link(&self, peer: &PeerAddress) -> Option<LinkId> {
        match self.slots.get(peer) {
            Some(Slot::Connected { link }) => Some(*link),
            _ => None,
        }
    }

    pub fn state_of(&self, peer: &PeerAddress) -> ConnectionState {
        match self.slots.get(peer) {
            None => ConnectionState::Idle,
            Some(Slot::Connecting { .. }) => ConnectionState::Connecting(peer.clone()),
            Some(Slot::Connected { .. }) => ConnectionState::Connected(peer.clone()),
            Some(Slot::Disconnecting { .. }) => ConnectionState::Disconnecting(peer.clone()),
            Some(Slot::Failed(reason)) => ConnectionState::Failed(peer.clone(), reason.to_string()),
        }
    }

    /// The single state a consumer shows: the focused peer's state when it is not Idle, else
    /// any live link, else Scanning or Idle.
    pub fn current(&self, scanning: bool) -> ConnectionState {
        if let Some(peer) = &self.focus {
            let state = self.state_of(peer);
            if state != ConnectionState::Idle {
                return state;
            }
        }
        let mut connected: Vec<&PeerAddress> = self
            .slots
            .iter()
            .filter(|(_, s)| matches!(s, Slot::Connected { .. }))
            .map(|(p, _)| p)
            .collect();
        connected.sort();
        if let Some(peer) = connected.first() {
            return ConnectionState::Connected((*peer).clone());
        }
        if scanning {
            ConnectionState::Scanning
        } else {
            ConnectionState::Idle
        }
    }

    /// Every peer that is not Idle, ordered by address.
    pub fn sessions(&self) -> Vec<ConnectionState> {
        let mut peers: Vec<&PeerAddress> = self.slots.keys().collect();
        peers.sort();
        peers.into_iter().map(|p| self.state_of(p)).collect()
    }

    fn focus_is_busy(&self) -> bool {
        self.focus
            .as_ref()
            .map(|p| {
                matches!(
                    self.slots.get(p),
                    Some(Slot::Connecting { .. }) | Some(Slot::Connected { .. })
                )
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerAddress {
        PeerAddress::new(s)
    }

    /// Connect and return the tag of the dial it started.
    fn dial(m: &mut ConnectionManager, p: &PeerAddress) -> DialId {
        match m.connect(p).as_slice() {
            [LinkAction::Dial { dial, .. }] => *dial,
            other => panic!("expected a dial, got {:?}", other),
        }
    }

    fn accepted(verdict: LinkVerdict) -> LinkId {
        match verdict {
            LinkVerdict::Accept { link, .. } => link,
            LinkVerdict::Reject => panic!("expected accept"),
        }
    }

    #[test]
    fn connect_then_link_up_is_connected() {
        let mut m = ConnectionManager::new();
        let p = peer("AA:BB");
        let d = dial(&mut m, &p);
        assert_eq!(m.current(false), ConnectionState::Connecting(p.clone()));
        let verdict = m.link_up(&p, Origin::Outgoing(d));
        assert!(matches!(verdict, LinkVerdict::Accept { cancel_dial: false, .. }));
        assert_eq!(m.current(false), ConnectionState::Connected(p.clone()));
        assert!(m.active_link(&p).is_some());
    }

    #[test]
    fn connect_while_connecting_is_noop() {
        let mut m = ConnectionManager::new();
        let p = peer("AA:BB");
        m.connect(&p);
        assert!(m.connect(&p).is_empty());
    }

    #[test]
    fn dial_failure_goes_failed_not_connecting() {
        let mut m = ConnectionManager::new();
        let p = peer("AA:BB");
        let d = dial(&mut m, &p);
        assert!(m.dial_failed(&p, d, LinkError::ConnectTimeout));
        assert_eq!(
            m.current(false),
            ConnectionState::Failed(p.clone(), "connect timed out".into())
        );
        // explicit retry is allowed from Failed, under a new tag
        let retry = dial(&mut m, &p);
        assert_ne!(retry, d);
    }

    #[test]
    fn result_of_abandoned_dial_cannot_touch_the_retry() {
        let mut m = ConnectionManager::new();
        let p = peer("AA:BB");
        let first = dial(&mut m, &p);
        m.disconnect(&p);
        let second = dial(&mut m, &p);

        assert!(!m.dial_failed(&p, first, LinkError::ConnectRejected("refused".into())));
        assert_eq!(m.state_of(&p), ConnectionState::Connecting(p.clone()));
        assert_eq!(m.link_up(&p, Origin::Outgoing(first)), LinkVerdict::Reject);
        assert_eq!(m.state_of(&p), ConnectionState::Connecting(p.clone()));

        accepted(m.link_up(&p, Origin::Outgoing(second)));
        assert!(m.state_of(&p).is_connected());
    }

    #[test]
    fn socket_failure_after_connect_goes_failed() {
        let mut m = ConnectionManager::new();
        let p = peer("AA:BB");
        let d = dial(&mut m, &p);
        let link = accepted(m.link_up(&p, Origin::Outgoing(d)));
        assert!(m.link_down(&p, link, LinkError::SocketIo("reset".into())));
        assert!(matches!(m.state_of(&p), ConnectionState::Failed(_, _)));
        assert_eq!(m.active_link(&p), None);
    }

    #[test]
    fn incoming_wins_race_and_cancels_dial() {
        let mut m = ConnectionManager::new();
        let p = peer("AA:BB");
        let d = dial(&mut m, &p);
        let verdict = m.link_up(&p, Origin::Incoming);
        assert!(matches!(verdict, LinkVerdict::Accept { cancel_dial: true, .. }));
        // the losing outgoing link is rejected, never a second Connected
        assert_eq!(m.link_up(&p, Origin::Outgoing(d)), LinkVerdict::Reject);
        // and a late dial failure cannot knock the winner over
        assert!(!m.dial_failed(&p, d, LinkError::ConnectTimeout));
        assert!(m.state_of(&p).is_connected());
    }

    #[test]
    fn second_incoming_rejected() {
        let mut m = ConnectionManager::new();
        let p = peer("AA:BB");
        assert!(matches!(m.link_up(&p, Origin::Incoming), LinkVerdict::Accept { .. }));
        assert_eq!(m.link_up(&p, Origin::Incoming), LinkVerdict::Reject);
    }

    #[test]
    fn outgoing_after_user_cancel_rejected() {
        let mut m = ConnectionManager::new();
        let p = peer("AA:BB");
        let d = dial(&mut m, &p);
        assert_eq!(m.disconnect(&p), vec![LinkAction::CancelDial(p.clone())]);
        assert_eq!(m.link_up(&p, Origin::Outgoing(d)), LinkVerdict::Reject);
        assert_eq!(m.state_of(&p), ConnectionState::Idle);
    }

    #[test]
    fn disconnect_goes_through_disconnecting_to_idle() {
        let mut m = ConnectionManager::new();
        let p = peer("AA:BB");
        let d = dial(&mut m, &p);
        let link = accepted(m.link_up(&p, Origin::Outgoing(d)));
        assert_eq!(
            m.disconnect(&p),
            vec![LinkAction::Close {
                peer: p.clone(),
                link
            }]
        );
        assert_eq!(m.current(false), ConnectionState::Disconnecting(p.clone()));
        assert!(m.closed(&p, link));
        assert_eq!(m.current(false), ConnectionState::Idle);
    }

    #[test]
    fn stale_link_reports_ignored() {
        let mut m = ConnectionManager::new();
        let p = peer("AA:BB");
        let d = dial(&mut m, &p);
        let first = accepted(m.link_up(&p, Origin::Outgoing(d)));
        m.link_down(&p, first, LinkError::SocketIo("eof".into()));
        let d = dial(&mut m, &p);
        m.link_up(&p, Origin::Outgoing(d));
        assert!(!m.link_down(&p, first, LinkError::SocketIo("late".into())));
        assert!(m.state_of(&p).is_connected());
    }

    #[test]
    fn scanning_shown_only_without_focused_activity() {
        let mut m = ConnectionManager::new();
        assert_eq!(m.current(true), ConnectionState::Scanning);
        let p = peer("AA:BB");
        m.connect(&p);
        assert_eq!(m.current(true), ConnectionState::Connecting(p));
    }

    #[test]
    fn shutdown_closes_everything() {
        let mut m = ConnectionManager::new();
        let a = peer("AA:01");
        let b = peer("AA:02");
        let d = dial(&mut m, &a);
        m.link_up(&a, Origin::Outgoing(d));
        m.connect(&b);
        let actions = m.shutdown();
        assert_eq!(actions.len(), 2);
        assert!(actions.contains(&LinkAction::CancelDial(b)));
        assert_eq!(m.current(false), ConnectionState::Idle);
        assert!(m.sessions().is_empty());
    }
}
