//! Connection Registry (C5): indices by terminal id and by peer IP,
//! shared negotiation state across multiple sockets of one device. See
//! `SPEC_FULL.md` §4.5.
//!
//! Grounded on `knightofdemons-a9-v720/src/types.rs`'s `CameraManager`
//! (`HashMap<IpAddr, Arc<RwLock<..>>>`, `get_or_create_camera`/
//! `get_camera` naming), generalized to two independent indices and to
//! copying negotiation state rather than sharing the connection object.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex};

/// Commands the external API / other sessions can send to a live
/// session without touching its internals directly.
#[derive(Debug)]
pub enum SessionCommand {
    QueryStoredVideos,
    RequestDownload {
        channel: u8,
        start_bcd: [u8; 6],
        end_bcd: [u8; 6],
    },
    Close,
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: u64,
    pub terminal_id: Option<String>,
    pub peer: IpAddr,
    pub authenticated: bool,
    pub video_request_sent: bool,
    pub has_video_list: bool,
    pub stored_videos: Vec<crate::messages::StoredVideoEntry>,
}

struct SessionEntry {
    snapshot: SessionSnapshot,
    commands: mpsc::Sender<SessionCommand>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<u64, SessionEntry>,
    by_terminal: HashMap<String, HashSet<u64>>,
    by_peer_ip: HashMap<IpAddr, HashSet<u64>>,
}

pub struct Registry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(RegistryInner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a freshly accepted connection before its terminal id is
    /// known. Only `by_peer_ip` is joined at this point.
    pub async fn register_new(&self, id: u64, peer: IpAddr, commands: mpsc::Sender<SessionCommand>) {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(
            id,
            SessionEntry {
                snapshot: SessionSnapshot {
                    id,
                    terminal_id: None,
                    peer,
                    authenticated: false,
                    video_request_sent: false,
                    has_video_list: false,
                    stored_videos: Vec::new(),
                },
                commands,
            },
        );
        inner.by_peer_ip.entry(peer).or_default().insert(id);
    }

    /// Called the first time a parsed frame carries a non-empty
    /// terminal id. Joins `by_terminal` and copies "video request
    /// already sent" state from any existing session of the same
    /// device, per §4.5.
    pub async fn identify(&self, id: u64, terminal_id: &str) -> bool {
        let mut inner = self.inner.lock().await;

        let mut adopt_video_sent = false;
        if let Some(existing_ids) = inner.by_terminal.get(terminal_id) {
            for other_id in existing_ids {
                if let Some(other) = inner.sessions.get(other_id) {
                    if other.snapshot.video_request_sent {
                        adopt_video_sent = true;
                    }
                }
            }
        }

        inner
            .by_terminal
            .entry(terminal_id.to_string())
            .or_default()
            .insert(id);

        if let Some(entry) = inner.sessions.get_mut(&id) {
            entry.snapshot.terminal_id = Some(terminal_id.to_string());
            if adopt_video_sent {
                entry.snapshot.video_request_sent = true;
            }
        }

        adopt_video_sent
    }

    pub async fn mark_authenticated(&self, id: u64) {
        self.with_snapshot(id, |s| s.authenticated = true).await;
    }

    pub async fn mark_video_request_sent(&self, id: u64) {
        self.with_snapshot(id, |s| s.video_request_sent = true).await;
    }

    pub async fn set_stored_videos(&self, id: u64, entries: Vec<crate::messages::StoredVideoEntry>) {
        self.with_snapshot(id, |s| {
            s.has_video_list = true;
            s.stored_videos = entries;
        })
        .await;
    }

    async fn with_snapshot(&self, id: u64, f: impl FnOnce(&mut SessionSnapshot)) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.sessions.get_mut(&id) {
            f(&mut entry.snapshot);
        }
    }

    /// Remove a closed session from every index.
    pub async fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.sessions.remove(&id) else {
            return;
        };
        inner
            .by_peer_ip
            .entry(entry.snapshot.peer)
            .and_modify(|set| {
                set.remove(&id);
            });
        if let Some(terminal_id) = &entry.snapshot.terminal_id {
            inner
                .by_terminal
                .entry(terminal_id.clone())
                .and_modify(|set| {
                    set.remove(&id);
                });
        }
    }

    pub async fn list_devices(&self) -> Vec<SessionSnapshot> {
        let inner = self.inner.lock().await;
        inner.sessions.values().map(|e| e.snapshot.clone()).collect()
    }

    /// Current number of live sessions, for `max_device_connections` (§6).
    pub async fn session_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.sessions.len()
    }

    pub async fn command_senders_for(&self, terminal_id: &str) -> Vec<mpsc::Sender<SessionCommand>> {
        let inner = self.inner.lock().await;
        let Some(ids) = inner.by_terminal.get(terminal_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| inner.sessions.get(id))
            .map(|e| e.commands.clone())
            .collect()
    }

    pub async fn snapshot(&self, terminal_id: &str) -> Option<SessionSnapshot> {
        let inner = self.inner.lock().await;
        inner
            .by_terminal
            .get(terminal_id)?
            .iter()
            .filter_map(|id| inner.sessions.get(id))
            .map(|e| e.snapshot.clone())
            .next()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn register_new_joins_peer_ip_index_only() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.register_new(1, ip(), tx).await;

        let devices = registry.list_devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].terminal_id, None);
    }

    #[tokio::test]
    async fn identify_joins_terminal_index_and_copies_video_state() {
        let registry = Registry::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);

        registry.register_new(1, ip(), tx1).await;
        registry.identify(1, "013812345678").await;
        registry.mark_video_request_sent(1).await;

        registry.register_new(2, ip(), tx2).await;
        let adopted = registry.identify(2, "013812345678").await;
        assert!(adopted);

        let snap = registry.snapshot("013812345678").await;
        assert!(snap.is_some());
    }

    #[tokio::test]
    async fn remove_clears_both_indices() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.register_new(1, ip(), tx).await;
        registry.identify(1, "013812345678").await;

        registry.remove(1).await;
        assert!(registry.list_devices().await.is_empty());
        assert!(registry.snapshot("013812345678").await.is_none());
    }

    #[tokio::test]
    async fn session_count_tracks_register_and_remove() {
        let registry = Registry::new();
        let (tx, _rx) = mpsc::channel(1);
        assert_eq!(registry.session_count().await, 0);
        registry.register_new(1, ip(), tx).await;
        assert_eq!(registry.session_count().await, 1);
        registry.remove(1).await;
        assert_eq!(registry.session_count().await, 0);
    }
}
