//! Core-to-outside facade (§6): the interface the excluded HTTP/UI
//! collaborator consumes. Plain async methods over the Registry and
//! Frame Bus — no `axum` dependency, since the HTTP surface itself is
//! out of scope.
//!
//! Grounded on the *shape* of
//! `knightofdemons-a9-v720/src/web/camera_endpoints.rs`'s handlers (one
//! method per external operation, reading the Registry and writing to
//! a session's command channel).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::bus::{FrameBus, FrameSubscription, SubscriptionFilter};
use crate::messages::StoredVideoEntry;
use crate::registry::{Registry, SessionCommand};

#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub terminal_id: Option<String>,
    pub peer: IpAddr,
    pub authenticated: bool,
    pub has_video_list: bool,
    pub stored_count: usize,
}

impl DeviceSummary {
    fn from_snapshot(s: crate::registry::SessionSnapshot) -> Self {
        DeviceSummary {
            terminal_id: s.terminal_id,
            peer: s.peer,
            authenticated: s.authenticated,
            has_video_list: s.has_video_list,
            stored_count: s.stored_videos.len(),
        }
    }
}

pub struct Api {
    registry: Arc<Registry>,
    bus: Arc<FrameBus>,
}

impl Api {
    pub fn new(registry: Arc<Registry>, bus: Arc<FrameBus>) -> Self {
        Api { registry, bus }
    }

    pub async fn list_devices(&self) -> Vec<DeviceSummary> {
        self.registry
            .list_devices()
            .await
            .into_iter()
            .map(DeviceSummary::from_snapshot)
            .collect()
    }

    /// Triggers a 0x9205 query on every live session for the terminal;
    /// returns once at least one send succeeds or after a bounded wait.
    pub async fn query_stored_videos(&self, terminal_id: &str) -> bool {
        let senders = self.registry.command_senders_for(terminal_id).await;
        if senders.is_empty() {
            return false;
        }
        let mut any_sent = false;
        for sender in senders {
            if timeout(Duration::from_secs(1), sender.send(SessionCommand::QueryStoredVideos))
                .await
                .is_ok()
            {
                any_sent = true;
            }
        }
        any_sent
    }

    pub async fn list_stored_videos(&self, terminal_id: &str) -> Vec<StoredVideoEntry> {
        self.registry
            .snapshot(terminal_id)
            .await
            .map(|s| s.stored_videos)
            .unwrap_or_default()
    }

    pub async fn request_download(
        &self,
        terminal_id: &str,
        channel: u8,
        start_bcd: [u8; 6],
        end_bcd: [u8; 6],
    ) -> bool {
        let senders = self.registry.command_senders_for(terminal_id).await;
        if senders.is_empty() {
            return false;
        }
        let mut any_sent = false;
        for sender in senders {
            let cmd = SessionCommand::RequestDownload {
                channel,
                start_bcd,
                end_bcd,
            };
            if sender.send(cmd).await.is_ok() {
                any_sent = true;
            }
        }
        any_sent
    }

    pub async fn subscribe_frames(&self, filter: SubscriptionFilter) -> FrameSubscription {
        self.bus.subscribe(filter).await
    }
}
