//! TCP accept loop and per-connection task. Grounded on
//! `knightofdemons-a9-v720/src/net/tcp.rs`'s `accept_loop`/
//! `handle_tcp_connection` split (one task per accepted connection).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::bus::FrameBus;
use crate::codec::{self, ExtractOutcome};
use crate::config::AppConfig;
use crate::registry::{Registry, SessionCommand};
use crate::session::{Session, SessionConfig, VideoNegState};

const INBOX_CAP: usize = 64 * 1024;
const TICK_INTERVAL: Duration = Duration::from_millis(500);
const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn run(
    bind_host: String,
    bind_port: u16,
    registry: Arc<Registry>,
    bus: Arc<FrameBus>,
    config: Arc<AppConfig>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind((bind_host.as_str(), bind_port)).await?;
    info!(bind_host, bind_port, "device TCP listener bound");

    loop {
        let (stream, peer) = listener.accept().await?;

        if registry.session_count().await >= config.max_device_connections {
            warn!(%peer, cap = config.max_device_connections, "max_device_connections exceeded; closing");
            drop(stream);
            continue;
        }

        let registry = registry.clone();
        let bus = bus.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer, registry, bus, config).await {
                warn!(%peer, %err, "tcp connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
    bus: Arc<FrameBus>,
    config: Arc<AppConfig>,
) -> std::io::Result<()> {
    let id = registry.allocate_id();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(16);
    registry.register_new(id, peer.ip(), cmd_tx).await;
    info!(session = id, %peer, "device connected");

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
    let mut session = Session::new(id, peer.ip(), session_config);

    let mut inbox: Vec<u8> = Vec::with_capacity(4096);
    let mut read_buf = [0u8; 4096];
    let mut ticker = interval(TICK_INTERVAL);
    let idle_timeout = config.duration_message_idle_timeout();
    let mut last_activity = Instant::now();

    let result = loop {
        tokio::select! {
            read = stream.read(&mut read_buf) => {
                match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => {
                        last_activity = Instant::now();
                        inbox.extend_from_slice(&read_buf[..n]);
                        if let Err(err) = drain_frames(&mut inbox, &mut session, &mut stream, &registry, &bus).await {
                            break Err(err);
                        }
                        if inbox.len() > INBOX_CAP {
                            warn!(session = id, "inbox exceeded bound with no resolvable frame; closing");
                            break Ok(());
                        }
                    }
                    Err(err) => break Err(err),
                }
            }
            _ = ticker.tick() => {
                if last_activity.elapsed() > idle_timeout {
                    debug!(session = id, "idle timeout; closing");
                    break Ok(());
                }
                let outgoing = session.tick(Instant::now(), &registry).await;
                if !outgoing.is_empty() {
                    if let Err(err) = write_all_framed(&mut stream, &mut session, outgoing).await {
                        break Err(err);
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SessionCommand::Close) | None => break Ok(()),
                    Some(SessionCommand::QueryStoredVideos) => {
                        let outgoing = vec![session.force_list_query(Instant::now())];
                        if let Err(err) = write_all_framed(&mut stream, &mut session, outgoing).await {
                            break Err(err);
                        }
                    }
                    Some(SessionCommand::RequestDownload { channel, start_bcd, end_bcd }) => {
                        let outgoing = vec![crate::session::Outgoing {
                            message_id: crate::messages::MSG_VIDEO_DOWNLOAD_REQUEST,
                            body: crate::messages::build_video_download_request(
                                crate::messages::VideoDownloadRequest {
                                    channel,
                                    start_bcd,
                                    end_bcd,
                                    alarm: 0,
                                    video_type: 0xFF,
                                    storage: 0,
                                },
                            ),
                        }];
                        if let Err(err) = write_all_framed(&mut stream, &mut session, outgoing).await {
                            break Err(err);
                        }
                    }
                }
            }
        }
    };

    registry.remove(id).await;
    info!(session = id, %peer, "device disconnected");
    result
}

async fn drain_frames(
    inbox: &mut Vec<u8>,
    session: &mut Session,
    stream: &mut TcpStream,
    registry: &Registry,
    bus: &FrameBus,
) -> std::io::Result<()> {
    loop {
        match codec::extract(inbox) {
            Ok(ExtractOutcome::Frame { frame, consumed }) => {
                inbox.drain(..consumed);
                let outgoing = session.handle_frame(frame, Instant::now(), registry, bus).await;
                if !outgoing.is_empty() {
                    write_all_framed(stream, session, outgoing).await?;
                }
            }
            Ok(ExtractOutcome::Resync(n)) => {
                inbox.drain(..n);
            }
            Ok(ExtractOutcome::NeedMore) => break,
            Err(err) => {
                error!(%err, "codec error while extracting frame");
                break;
            }
        }
    }
    Ok(())
}

/// Frame and write every outgoing message. A plain write error transitions
/// the session's video state to `Failed` but does not close the
/// connection — the session keeps reading to drain telemetry until EOF
/// (§4.4/§7). A write that cannot drain within `WRITE_DRAIN_TIMEOUT` is
/// treated as fatal and closes the connection (§5 "Back-pressure").
async fn write_all_framed(
    stream: &mut TcpStream,
    session: &mut Session,
    outgoing: Vec<crate::session::Outgoing>,
) -> std::io::Result<()> {
    for framed in session.frame_all(outgoing) {
        match tokio::time::timeout(WRITE_DRAIN_TIMEOUT, stream.write_all(&framed)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(session = session.id, %err, "write failed; marking video negotiation failed");
                session.video_nego = VideoNegState::Failed(format!("write error: {err}"));
                return Ok(());
            }
            Err(_) => {
                warn!(session = session.id, "write did not drain within 2s; closing");
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write did not drain within 2s",
                ));
            }
        }
    }
    Ok(())
}
