//! UDP listener(s): one task per bound port, each owning a small table
//! of per-peer sessions (no lock needed — the task is the only owner).
//! Also carries the RTP/H.264 Annex-B diagnostic fallback classifier for
//! UDP packets that bypass 1078 framing entirely (§6).
//!
//! Grounded on `knightofdemons-a9-v720/src/net/udp.rs`'s
//! `run_udp_socket`/`recv_loop` per-port task spawn, and
//! `UdpStreamingReceiver::is_video_data`'s JPEG/H.264-start-code
//! sniffing, which is the direct model for [`looks_like_raw_video`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::bus::FrameBus;
use crate::codec::{self, ExtractOutcome};
use crate::config::AppConfig;
use crate::registry::Registry;
use crate::session::{Session, SessionConfig};

const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// A session tracked by one UDP listener, alongside the peer address its
/// outbound frames are sent back to.
struct UdpPeer {
    session: Session,
    addr: SocketAddr,
}

pub async fn run(port: u16, registry: Arc<Registry>, bus: Arc<FrameBus>, config: Arc<AppConfig>) -> std::io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
    info!(port, "auxiliary UDP socket bound");

    let mut sessions: HashMap<IpAddr, UdpPeer> = HashMap::new();
    let mut buf = vec![0u8; 65536];
    let mut ticker = interval(TICK_INTERVAL);

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, peer) = received?;
                let packet = &buf[..n];

                match codec::extract(packet) {
                    Ok(ExtractOutcome::Frame { frame, .. }) => {
                        let entry = sessions.entry(peer.ip()).or_insert_with(|| UdpPeer {
                            session: new_session_for(peer, &config),
                            addr: peer,
                        });
                        entry.addr = peer;
                        ensure_registered(&mut entry.session, peer, &registry).await;
                        let outgoing = entry.session.handle_frame(frame, Instant::now(), &registry, &bus).await;
                        send_outgoing(&socket, &mut entry.session, peer, outgoing).await;
                    }
                    _ => {
                        if looks_like_raw_video(packet) {
                            if let Some(entry) = sessions.get(&peer.ip()) {
                                let device_id = entry.session.terminal_id.clone().unwrap_or_default();
                                if !device_id.is_empty() {
                                    bus.publish(&device_id, 0, 0, packet.to_vec(), None).await;
                                    continue;
                                }
                            }
                            debug!(%peer, "raw video UDP packet from unidentified peer; dropped");
                        } else {
                            debug!(%peer, "UDP packet did not parse as a framed message or raw video");
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                for entry in sessions.values_mut() {
                    let outgoing = entry.session.tick(now, &registry).await;
                    if !outgoing.is_empty() {
                        send_outgoing(&socket, &mut entry.session, entry.addr, outgoing).await;
                    }
                }
            }
        }
    }
}

async fn send_outgoing(
    socket: &UdpSocket,
    session: &mut Session,
    peer: SocketAddr,
    outgoing: Vec<crate::session::Outgoing>,
) {
    for framed in session.frame_all(outgoing) {
        if let Err(err) = socket.send_to(&framed, peer).await {
            warn!(session = session.id, %peer, %err, "udp send failed");
        }
    }
}

fn new_session_for(peer: SocketAddr, config: &AppConfig) -> Session {
    let session_config = SessionConfig {
        video_server_ip: config.video_server_ip_octets(),
        video_tcp_port: config.video_tcp_port,
        video_udp_port: config.video_udp_port,
        try_video_list_first: config.try_video_list_first,
        frame_chain_timeout: config.duration_frame_chain_timeout(),
        list_buffer_timeout: config.duration_list_buffer_timeout(),
        video_nego_timeout: config.duration_video_nego_timeout(),
        query_cooldown: config.duration_query_cooldown(),
    };
    Session::new(0, peer.ip(), session_config)
}

async fn ensure_registered(session: &mut Session, peer: SocketAddr, registry: &Registry) {
    if session.id == 0 {
        session.id = registry.allocate_id();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        registry.register_new(session.id, peer.ip(), tx).await;
    }
}

/// Best-effort diagnostic classifier (§6, §9 Open Questions): an RTP v2
/// header (first octet's high two bits `0b10`, payload type 96..127) or
/// an H.264 Annex-B start code (`00 00 01` / `00 00 00 01`) followed by
/// a NAL unit type in 1..8.
pub fn looks_like_raw_video(data: &[u8]) -> bool {
    if data.len() >= 2 {
        let version_bits = data[0] >> 6;
        let payload_type = data[1] & 0x7F;
        if version_bits == 0b10 && (96..=127).contains(&payload_type) {
            return true;
        }
    }

    if data.len() >= 5 && data[0] == 0 && data[1] == 0 {
        if data[2] == 1 {
            let nal_type = data[3] & 0x1F;
            return (1..=8).contains(&nal_type);
        }
        if data.len() >= 5 && data[2] == 0 && data[3] == 1 {
            let nal_type = data[4] & 0x1F;
            return (1..=8).contains(&nal_type);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_rtp_v2_header() {
        let packet = [0x80u8, 96, 0, 1, 0, 0, 0, 0];
        assert!(looks_like_raw_video(&packet));
    }

    #[test]
    fn detects_h264_annex_b_three_byte_start_code() {
        let packet = [0x00, 0x00, 0x01, 0x05, 0xAA];
        assert!(looks_like_raw_video(&packet));
    }

    #[test]
    fn detects_h264_annex_b_four_byte_start_code() {
        let packet = [0x00, 0x00, 0x00, 0x01, 0x07, 0xAA];
        assert!(looks_like_raw_video(&packet));
    }

    #[test]
    fn rejects_arbitrary_bytes() {
        let packet = [0x12, 0x34, 0x56, 0x78];
        assert!(!looks_like_raw_video(&packet));
    }
}
