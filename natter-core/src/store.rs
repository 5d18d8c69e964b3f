//! Conversation store: the single writable record of every conversation, keyed by peer address,
//! with JSON persistence so history survives a restart.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::{Conversation, DeliveryState, Direction, Message, MessageId, PeerAddress};

const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt store file: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("unsupported store format version {0}")]
    Version(u32),
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    conversations: Vec<Conversation>,
}

/// All conversations. Mutated only by its owner; consumers get cloned snapshots.
#[derive(Debug, Default, Clone)]
pub struct ConversationStore {
    conversations: HashMap<PeerAddress, Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the conversation for `peer` if it does not exist yet.
    pub fn ensure(&mut self, peer: &PeerAddress) -> &mut Conversation {
        self.conversations
            .entry(peer.clone())
            .or_insert_with(|| Conversation::new(peer.clone()))
    }

    /// Add `message` at the end of `peer`'s history, creating the conversation if absent.
    /// Received messages count as unread.
    pub fn append(&mut self, peer: &PeerAddress, message: Message) {
        let conversation = self.ensure(peer);
        if message.direction == Direction::Received {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }
        conversation.messages.push(message);
    }

    /// Remove exactly that message. Absent ids (or peers) are a no-op. Returns whether anything was removed.
    pub fn delete_message(&mut self, peer: &PeerAddress, id: MessageId) -> bool {
        let Some(conversation) = self.conversations.get_mut(peer) else {
            return false;
        };
        let before = conversation.messages.len();
        conversation.messages.retain(|m| m.id != id);
        before != conversation.messages.len()
    }

    /// Remove the whole conversation. No-op if absent.
    pub fn delete_conversation(&mut self, peer: &PeerAddress) -> bool {
        self.conversations.remove(peer).is_some()
    }

    /// Pending → Delivered/Failed. Terminal states never change. Returns whether the message changed.
    pub fn set_delivery(
        &mut self,
        peer: &PeerAddress,
        id: MessageId,
        state: DeliveryState,
        failure: Option<String>,
    ) -> bool {
        let Some(message) = self
            .conversations
            .get_mut(peer)
            .and_then(|c| c.messages.iter_mut().find(|m| m.id == id))
        else {
            return false;
        };
        if message.delivery.is_terminal() {
            return false;
        }
        message.delivery = state;
        message.failure = failure;
        true
    }

    /// Mark every Pending send to `peer` as Failed (the link they were queued on is gone).
    pub fn fail_pending(&mut self, peer: &PeerAddress, reason: &str) -> usize {
        let Some(conversation) = self.conversations.get_mut(peer) else {
            return 0;
        };
        let mut n = 0;
        for m in conversation
            .messages
            .iter_mut()
            .filter(|m| m.delivery == DeliveryState::Pending)
        {
            m.delivery = DeliveryState::Failed;
            m.failure = Some(reason.to_string());
            n += 1;
        }
        n
    }

    pub fn mark_read(&mut self, peer: &PeerAddress) -> bool {
        match self.conversations.get_mut(peer) {
            Some(c) if c.unread_count > 0 => {
                c.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    /// Remember the discovered name for an existing conversation.
    pub fn set_display_name(&mut self, peer: &PeerAddress, name: &str) -> bool {
        match self.conversations.get_mut(peer) {
            Some(c) if !name.is_empty() && c.display_name.as_deref() != Some(name) => {
                c.display_name = Some(name.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, peer: &PeerAddress) -> Option<&Conversation> {
        self.conversations.get(peer)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Immutable copy of every conversation, most recent activity first.
    pub fn snapshot(&self) -> Vec<Conversation> {
        let mut out: Vec<Conversation> = self.conversations.values().cloned().collect();
        out.sort_by(|a, b| {
            let ta = a.last_message().map(|m| m.timestamp);
            let tb = b.last_message().map(|m| m.timestamp);
            tb.cmp(&ta).then_with(|| a.peer.cmp(&b.peer))
        });
        out
    }

    /// Load from `path`. Sends that were still Pending when the process stopped are marked Failed.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let data = fs::read(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: StoreFile = serde_json::from_slice(&data)?;
        if file.version != STORE_FORMAT_VERSION {
            return Err(StoreError::Version(file.version));
        }
        let mut store = Self::new();
        for conversation in file.conversations {
            store
                .conversations
                .insert(conversation.peer.clone(), conversation);
        }
        let peers: Vec<PeerAddress> = store.conversations.keys().cloned().collect();
        for peer in peers {
            store.fail_pending(&peer, "interrupted before delivery");
        }
        Ok(store)
    }

    /// Load, falling back to an empty store when the file is missing or unreadable. A corrupt
    /// or newer-format file is moved aside first, so the next save cannot overwrite it.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(store) => {
                log::info!(
                    "Loaded {} conversation(s) from {}",
                    store.len(),
                    path.display()
                );
                store
            }
            Err(StoreError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No conversation store at {}, starting empty", path.display());
                Self::new()
            }
            Err(e @ (StoreError::Corrupt(_) | StoreError::Version(_))) => {
                let aside = set_aside_path(path);
                match fs::rename(path, &aside) {
                    Ok(()) => log::warn!(
                        "Ignoring conversation store {}: {}; kept as {}",
                        path.display(),
                        e,
                        aside.display()
                    ),
                    Err(rename) => log::error!(
                        "Ignoring conversation store {}: {}; could not move it aside: {}",
                        path.display(),
                        e,
                        rename
                    ),
                }
                Self::new()
            }
            Err(e) => {
                log::warn!("Ignoring conversation store {}: {}", path.display(), e);
                Self::new()
            }
        }
    }

    /// Write to `path` atomically: temp file in the same directory, then rename over.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let mut conversations: Vec<Conversation> = self.conversations.values().cloned().collect();
        conversations.sort_by(|a, b| a.peer.cmp(&b.peer));
        let file = StoreFile {
            version: STORE_FORMAT_VERSION,
            conversations,
        };
        let data = serde_json::to_vec_pretty(&file)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &data).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }
}

/// `<path>.corrupt-<unix seconds>`, with a counter if that name is taken.
fn set_aside_path(path: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().timestamp();
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".corrupt-{}", stamp));
    let mut aside = PathBuf::from(&name);
    let mut n = 1;
    while aside.exists() {
        let mut next = name.clone();
        next.push(format!(".{}", n));
        aside = PathBuf::from(next);
        n += 1;
    }
    aside
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn sent(peer: &str, body: &str) -> Message {
        Message::outgoing(peer.into(), body, Utc::now())
    }

    #[test]
    fn append_keeps_order_per_peer_under_interleaving() {
        let mut store = ConversationStore::new();
        let p: PeerAddress = "AA:01".into();
        let q: PeerAddress = "AA:02".into();
        let a = sent("AA:01", "A");
        let x = sent("AA:02", "X");
        let b = sent("AA:01", "B");
        store.append(&p, a.clone());
        store.append(&q, x);
        store.append(&p, b.clone());
        assert_eq!(store.get(&p).unwrap().messages, vec![a, b]);
    }

    #[test]
    fn delete_twice_equals_once_and_unknown_is_noop() {
        let mut store = ConversationStore::new();
        let p: PeerAddress = "AA:01".into();
        let a = sent("AA:01", "A");
        let b = sent("AA:01", "B");
        store.append(&p, a.clone());
        store.append(&p, b.clone());
        assert!(store.delete_message(&p, a.id));
        let once = store.get(&p).unwrap().clone();
        assert!(!store.delete_message(&p, a.id));
        assert_eq!(store.get(&p).unwrap(), &once);
        assert!(!store.delete_message(&p, MessageId::new()));
        assert!(!store.delete_message(&"FF:FF".into(), b.id));
        assert_eq!(store.get(&p).unwrap().messages, vec![b]);
    }

    #[test]
    fn terminal_delivery_is_immutable() {
        let mut store = ConversationStore::new();
        let p: PeerAddress = "AA:01".into();
        let m = sent("AA:01", "hi");
        store.append(&p, m.clone());
        assert!(store.set_delivery(&p, m.id, DeliveryState::Delivered, None));
        assert!(!store.set_delivery(&p, m.id, DeliveryState::Failed, Some("late".into())));
        assert_eq!(store.get(&p).unwrap().messages[0].delivery, DeliveryState::Delivered);
    }

    #[test]
    fn received_counts_unread_until_marked_read() {
        let mut store = ConversationStore::new();
        let p: PeerAddress = "AA:01".into();
        let frame = sent("AA:01", "yo").to_frame();
        store.append(&p, Message::incoming(p.clone(), frame.clone(), Utc::now()));
        store.append(&p, Message::incoming(p.clone(), frame, Utc::now()));
        assert_eq!(store.get(&p).unwrap().unread_count, 2);
        assert!(store.mark_read(&p));
        assert_eq!(store.get(&p).unwrap().unread_count, 0);
        assert!(!store.mark_read(&p));
    }

    #[test]
    fn snapshot_is_detached_and_sorted_by_activity() {
        let mut store = ConversationStore::new();
        let now = Utc::now();
        store.append(&"AA:01".into(), Message::outgoing("AA:01".into(), "old", now));
        store.append(
            &"AA:02".into(),
            Message::outgoing("AA:02".into(), "new", now + Duration::seconds(5)),
        );
        let snap = store.snapshot();
        store.delete_conversation(&"AA:02".into());
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].peer, PeerAddress::from("AA:02"));
    }

    #[test]
    fn save_and_load_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("conversations.json");
        let mut store = ConversationStore::new();
        let p: PeerAddress = "AA:01".into();
        let delivered = sent("AA:01", "done");
        let pending = sent("AA:01", "in flight");
        store.append(&p, delivered.clone());
        store.set_delivery(&p, delivered.id, DeliveryState::Delivered, None);
        store.append(&p, pending.clone());
        store.save(&path).unwrap();

        let loaded = ConversationStore::load(&path).unwrap();
        let c = loaded.get(&p).unwrap();
        assert_eq!(c.messages.len(), 2);
        assert_eq!(c.messages[0].delivery, DeliveryState::Delivered);
        assert_eq!(c.messages[1].id, pending.id);
        assert_eq!(c.messages[1].delivery, DeliveryState::Failed);
    }

    #[test]
    fn corrupt_or_missing_file_yields_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.json");
        assert!(ConversationStore::load_or_default(&missing).is_empty());
        let corrupt = dir.path().join("bad.json");
        std::fs::write(&corrupt, b"{ not json").unwrap();
        assert!(matches!(
            ConversationStore::load(&corrupt),
            Err(StoreError::Corrupt(_))
        ));
        assert!(ConversationStore::load_or_default(&corrupt).is_empty());
    }

    #[test]
    fn unreadable_file_is_moved_aside_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversations.json");
        let newer = br#"{"version": 99, "conversations": []}"#;
        std::fs::write(&path, newer).unwrap();

        let store = ConversationStore::load_or_default(&path);
        assert!(store.is_empty());
        assert!(!path.exists());
        store.save(&path).unwrap();

        let kept: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(std::fs::read(&kept[0]).unwrap(), newer.to_vec());
    }
}
