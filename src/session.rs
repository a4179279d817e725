//! Device Session (C4): per-connection lifecycle state machine and
//! video-negotiation sub-machine. See `SPEC_FULL.md` §4.4.
//!
//! Grounded on `knightofdemons-a9-v720/src/camera_session.rs` (state
//! enum + `Display`/`get_state_string` idiom) and `src/router/tcp.rs`
//! (the `match header.cmd { ... }` dispatch shape, transitions
//! performed inline with the write-response step).

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::bus::FrameBus;
use crate::codec::{self, Fragmentation};
use crate::messages::{
    self, is_list_init_marker, looks_like_complete_list, parse_auth_info, parse_general_ack,
    parse_register_info, AckResult, GeneralAck, LocationRecord, StoredVideoEntry,
    VideoControlOrData, VideoDataFrame, MSG_AUTH, MSG_AUTH_ACK, MSG_GENERAL_ACK, MSG_HEARTBEAT,
    MSG_HEARTBEAT_ACK, MSG_LIST_QUERY, MSG_LOCATION, MSG_LOCATION_ACK, MSG_LOGOUT, MSG_REGISTER,
    MSG_REGISTER_ACK, MSG_VIDEO_CONTROL, MSG_VIDEO_DATA_1, MSG_VIDEO_DATA_H264_1,
    MSG_VIDEO_DATA_H264_2, MSG_VIDEO_REQUEST,
};
use crate::reassembler::{LiveReassembler, ListOutcome, ListReassembler};
use crate::registry::Registry;

/// Candidate video-request configurations, tried in order (§4.4).
pub const CANDIDATE_CONFIGS: [(u8, u8, u8); 5] = [
    (1, 1, 0),
    (0, 1, 0),
    (1, 0, 0),
    (0, 0, 0),
    (1, 1, 1),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    New,
    Identified,
    Registered,
    Authed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::New => "NEW",
            LifecycleState::Identified => "IDENTIFIED",
            LifecycleState::Registered => "REGISTERED",
            LifecycleState::Authed => "AUTHED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoNegState {
    Idle,
    Requested(usize),
    Confirmed(usize),
    ControlSent(usize),
    AwaitingData(usize),
    Streaming,
    Failed(String),
}

impl fmt::Display for VideoNegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoNegState::Idle => write!(f, "IDLE"),
            VideoNegState::Requested(k) => write!(f, "REQUESTED({k})"),
            VideoNegState::Confirmed(k) => write!(f, "CONFIRMED({k})"),
            VideoNegState::ControlSent(k) => write!(f, "CONTROL_SENT({k})"),
            VideoNegState::AwaitingData(k) => write!(f, "AWAITING_DATA({k})"),
            VideoNegState::Streaming => write!(f, "STREAMING"),
            VideoNegState::Failed(reason) => write!(f, "FAILED({reason})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub video_server_ip: Option<[u8; 4]>,
    pub video_tcp_port: u16,
    pub video_udp_port: u16,
    pub try_video_list_first: bool,
    pub frame_chain_timeout: Duration,
    pub list_buffer_timeout: Duration,
    pub video_nego_timeout: Duration,
    pub query_cooldown: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            video_server_ip: None,
            video_tcp_port: 2222,
            video_udp_port: 2221,
            try_video_list_first: false,
            frame_chain_timeout: Duration::from_secs(5),
            list_buffer_timeout: Duration::from_secs(10),
            video_nego_timeout: Duration::from_secs(5),
            query_cooldown: Duration::from_secs(30),
        }
    }
}

/// A single outbound message produced while handling a frame or tick.
pub struct Outgoing {
    pub message_id: u16,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct DownloadBuffer {
    chunks: Vec<u8>,
}

pub struct Session {
    pub id: u64,
    pub peer: IpAddr,
    pub terminal_id: Option<String>,
    pub lifecycle: LifecycleState,
    pub video_nego: VideoNegState,
    sequence: u16,
    location_msg_count: u32,
    last_query_ts: Option<Instant>,
    last_known_location: Option<LocationRecord>,
    video_attempt_started_at: Option<Instant>,
    first_identified_at: Option<Instant>,
    registered_at: Option<Instant>,
    list_query_sent: bool,

    live: LiveReassembler,
    list: ListReassembler,
    stored_videos: Vec<StoredVideoEntry>,
    download_buffers: HashMap<(u8, String), DownloadBuffer>,

    config: SessionConfig,
}

impl Session {
    pub fn new(id: u64, peer: IpAddr, config: SessionConfig) -> Self {
        Session {
            id,
            peer,
            terminal_id: None,
            lifecycle: LifecycleState::New,
            video_nego: VideoNegState::Idle,
            sequence: 0,
            location_msg_count: 0,
            last_query_ts: None,
            last_known_location: None,
            video_attempt_started_at: None,
            first_identified_at: None,
            registered_at: None,
            list_query_sent: false,
            live: LiveReassembler::new(config.frame_chain_timeout),
            list: ListReassembler::new(config.list_buffer_timeout),
            stored_videos: Vec::new(),
            download_buffers: HashMap::new(),
            config,
        }
    }

    fn next_sequence(&mut self) -> u16 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }

    /// Handle one parsed frame, updating state and the shared Registry
    /// and Frame Bus, and returning the outbound messages this frame
    /// produced (in order).
    pub async fn handle_frame(
        &mut self,
        frame: codec::Frame,
        now: Instant,
        registry: &Registry,
        bus: &FrameBus,
    ) -> Vec<Outgoing> {
        if !frame.checksum_ok {
            warn!(session = self.id, message_id = frame.message_id, "BCC mismatch; dispatching anyway");
        }

        if self.terminal_id.is_none() && !frame.terminal_phone.is_empty() {
            self.identify(frame.terminal_phone.clone(), now, registry).await;
        }

        let mut out = Vec::new();
        match frame.message_id {
            MSG_GENERAL_ACK => {
                if let Ok(ack) = parse_general_ack(&frame.body) {
                    self.handle_general_ack(ack);
                }
            }
            MSG_HEARTBEAT => {
                out.push(Outgoing {
                    message_id: MSG_HEARTBEAT_ACK,
                    body: Vec::new(),
                });
            }
            MSG_LOGOUT => {
                // No response required; session stays open until socket close.
            }
            MSG_REGISTER => {
                if let Ok(_info) = parse_register_info(&frame.body) {
                    self.lifecycle = LifecycleState::Registered;
                    self.registered_at = Some(now);
                    let auth_code = b"AUTHCODE00000000".to_vec();
                    out.push(Outgoing {
                        message_id: MSG_REGISTER_ACK,
                        body: messages::build_register_ack(0, &auth_code),
                    });
                } else {
                    out.push(Outgoing {
                        message_id: MSG_REGISTER_ACK,
                        body: messages::build_register_ack(2, &[]),
                    });
                }
            }
            MSG_AUTH => {
                let _info = parse_auth_info(&frame.body);
                self.lifecycle = LifecycleState::Authed;
                registry.mark_authenticated(self.id).await;
                out.push(Outgoing {
                    message_id: MSG_AUTH_ACK,
                    body: vec![AckResult::Ok as u8],
                });
            }
            MSG_LOCATION => {
                if let Ok((record, _rest)) = LocationRecord::parse(&frame.body) {
                    debug!(
                        session = self.id,
                        lat = record.latitude,
                        lon = record.longitude,
                        time = ?record.time_utc(),
                        "location update"
                    );
                    self.last_known_location = Some(record);
                    self.location_msg_count += 1;
                }
                out.push(Outgoing {
                    message_id: MSG_LOCATION_ACK,
                    body: vec![AckResult::Ok as u8],
                });
            }
            messages::MSG_1205 => {
                self.handle_0x1205(&frame.body, now, registry, bus, &mut out).await;
            }
            MSG_VIDEO_DATA_1 | MSG_VIDEO_DATA_H264_1 | MSG_VIDEO_DATA_H264_2 => {
                self.handle_video_data(frame.message_id, &frame.body, now, bus).await;
            }
            MSG_VIDEO_CONTROL => match messages::parse_video_control_or_data(&frame.body) {
                Ok(VideoControlOrData::Data(data_frame)) => {
                    self.apply_video_data_frame(data_frame, now, bus).await;
                }
                Ok(VideoControlOrData::Control(_)) => {
                    debug!(session = self.id, "ignoring terminal-originated 0x9202 control echo");
                }
                Err(err) => debug!(session = self.id, %err, "malformed 0x9202"),
            },
            other => {
                debug!(
                    session = self.id,
                    message_id = format!("{other:#06x}"),
                    body = hex::encode(&frame.body),
                    "unhandled message id"
                );
            }
        }

        out
    }

    async fn identify(&mut self, terminal_id: String, now: Instant, registry: &Registry) {
        self.terminal_id = Some(terminal_id.clone());
        self.lifecycle = LifecycleState::Identified;
        self.first_identified_at = Some(now);
        let adopted_video_sent = registry.identify(self.id, &terminal_id).await;
        if adopted_video_sent && self.video_nego == VideoNegState::Idle {
            self.video_nego = VideoNegState::Streaming;
        }
    }

    fn handle_general_ack(&mut self, ack: GeneralAck) {
        let requested_k = match self.video_nego {
            VideoNegState::Requested(k) => Some(k),
            _ => None,
        };
        let control_sent_k = match self.video_nego {
            VideoNegState::ControlSent(k) => Some(k),
            _ => None,
        };

        match (ack.reply_id, requested_k, control_sent_k) {
            (MSG_VIDEO_REQUEST, Some(k), _) => {
                self.video_nego = if ack.result == AckResult::Ok {
                    VideoNegState::Confirmed(k)
                } else {
                    VideoNegState::Failed(format!("9101 nacked for config {k}"))
                };
            }
            (MSG_VIDEO_CONTROL, _, Some(k)) => {
                self.video_nego = if ack.result == AckResult::Ok {
                    VideoNegState::AwaitingData(k)
                } else {
                    VideoNegState::Failed(format!("9202 nacked for config {k}"))
                };
            }
            (MSG_LIST_QUERY, _, _) => {
                // Ack for the list query itself; no state change beyond
                // pacing, which is tracked by `last_query_ts`.
            }
            _ => {}
        }
    }

    async fn handle_0x1205(
        &mut self,
        body: &[u8],
        now: Instant,
        registry: &Registry,
        bus: &FrameBus,
        out: &mut Vec<Outgoing>,
    ) {
        if let Some(count) = is_list_init_marker(body) {
            let flushed = self.list.init(count, now);
            if !flushed.is_empty() {
                self.stored_videos = flushed;
            }
            return;
        }

        if self.list.has_assembly() {
            match self.list.ingest_continuation(body, now) {
                ListOutcome::Complete(entries) => {
                    self.stored_videos = entries.clone();
                    registry.set_stored_videos(self.id, entries).await;
                    out.push(Outgoing {
                        message_id: MSG_GENERAL_ACK,
                        body: messages::build_general_ack(GeneralAck {
                            reply_seq: 0,
                            reply_id: MSG_LIST_QUERY,
                            result: AckResult::Ok,
                        }),
                    });
                }
                ListOutcome::Pending => {}
            }
            return;
        }

        if let Some(count) = looks_like_complete_list(body) {
            let mut entries = Vec::new();
            let mut offset = 2;
            for _ in 0..count {
                if offset + StoredVideoEntry::SIZE > body.len() {
                    break;
                }
                if let Ok(entry) = StoredVideoEntry::parse(&body[offset..offset + StoredVideoEntry::SIZE]) {
                    entries.push(entry);
                }
                offset += StoredVideoEntry::SIZE;
            }
            self.stored_videos = entries.clone();
            registry.set_stored_videos(self.id, entries).await;
            out.push(Outgoing {
                message_id: MSG_GENERAL_ACK,
                body: messages::build_general_ack(GeneralAck {
                    reply_seq: 0,
                    reply_id: MSG_LIST_QUERY,
                    result: AckResult::Ok,
                }),
            });
            return;
        }

        // Otherwise, treat as stored-video-data for an in-flight download.
        self.handle_download_chunk(body, bus).await;
    }

    async fn handle_download_chunk(&mut self, body: &[u8], bus: &FrameBus) {
        let chunk = match messages::VideoDataChunk::parse(body) {
            Ok(chunk) => chunk,
            Err(err) => {
                debug!(session = self.id, %err, "stored-video-data chunk shorter than fixed prefix; dropping");
                return;
            }
        };

        let key = (chunk.channel, messages::bcd_to_timestamp(&chunk.time_bcd));
        let buf = self.download_buffers.entry(key).or_default();
        buf.chunks.extend_from_slice(&chunk.video_data);

        // Republish immediately so viewers can watch the download in
        // flight, not just once it completes (§4.4).
        let device_id = self.terminal_id.clone().unwrap_or_default();
        bus.publish(
            &device_id,
            chunk.channel,
            chunk.data_type,
            chunk.video_data.clone(),
            Some(chunk.location),
        )
        .await;
    }

    async fn handle_video_data(&mut self, message_id: u16, body: &[u8], now: Instant, bus: &FrameBus) {
        match VideoDataFrame::parse(message_id, body) {
            Ok(frame) => self.apply_video_data_frame(frame, now, bus).await,
            Err(err) => debug!(session = self.id, %err, "malformed video data frame"),
        }
    }

    async fn apply_video_data_frame(&mut self, frame: VideoDataFrame, now: Instant, bus: &FrameBus) {
        // Any actual video data settles the negotiation, whatever stage it
        // was at — a 9101 ack can be lost or redundant, but a data packet
        // is unambiguous proof the device is streaming the requested config.
        if !matches!(self.video_nego, VideoNegState::Idle | VideoNegState::Streaming) {
            self.video_nego = VideoNegState::Streaming;
        }

        if let Some(assembled) = self.live.ingest(frame, now) {
            let device_id = self.terminal_id.clone().unwrap_or_default();
            bus.publish(
                &device_id,
                assembled.channel,
                assembled.data_type,
                assembled.payload,
                self.last_known_location,
            )
            .await;
        }
    }

    /// Timer-driven work: negotiation retries/timeouts and list-query
    /// pacing. Called periodically by the owning connection task.
    pub async fn tick(&mut self, now: Instant, registry: &Registry) -> Vec<Outgoing> {
        let mut out = Vec::new();

        match self.video_nego {
            VideoNegState::Idle => {
                if self.lifecycle == LifecycleState::Authed || self.location_msg_count >= 2 {
                    out.extend(self.start_negotiation(now));
                    registry.mark_video_request_sent(self.id).await;
                }
            }
            VideoNegState::Confirmed(k) => {
                if self.nego_timed_out(now) {
                    out.extend(self.retry_negotiation(k, now));
                    registry.mark_video_request_sent(self.id).await;
                } else {
                    out.push(Outgoing {
                        message_id: MSG_VIDEO_CONTROL,
                        body: messages::build_video_control(messages::VideoControl {
                            control_type: 1,
                            channel: CANDIDATE_CONFIGS[k].0,
                            data_type: CANDIDATE_CONFIGS[k].1,
                            stream_type: CANDIDATE_CONFIGS[k].2,
                        }),
                    });
                    out.push(Outgoing {
                        message_id: MSG_HEARTBEAT_ACK,
                        body: Vec::new(),
                    });
                    self.video_nego = VideoNegState::ControlSent(k);
                }
            }
            // REQUESTED/CONTROL_SENT/AWAITING_DATA share one deadline: the
            // whole attempt at candidate `k` must reach STREAMING within
            // `video_nego_timeout` of when `k` was first requested, or the
            // next candidate is tried.
            VideoNegState::Requested(k) | VideoNegState::ControlSent(k) | VideoNegState::AwaitingData(k) => {
                if self.nego_timed_out(now) {
                    out.extend(self.retry_negotiation(k, now));
                    registry.mark_video_request_sent(self.id).await;
                }
            }
            _ => {}
        }

        if let Some(query) = self.maybe_trigger_list_query(now) {
            out.push(query);
        }

        if let Some(flushed) = self.list.tick(now) {
            if !flushed.is_empty() {
                self.stored_videos = flushed;
            }
        }

        out
    }

    fn nego_timed_out(&self, now: Instant) -> bool {
        self.video_attempt_started_at
            .map(|started| now.duration_since(started) >= self.config.video_nego_timeout)
            .unwrap_or(false)
    }

    fn start_negotiation(&mut self, now: Instant) -> Vec<Outgoing> {
        self.video_nego = VideoNegState::Requested(0);
        self.video_attempt_started_at = Some(now);
        vec![self.build_video_request(0)]
    }

    fn retry_negotiation(&mut self, failed_k: usize, now: Instant) -> Vec<Outgoing> {
        let next_k = failed_k + 1;
        if next_k >= CANDIDATE_CONFIGS.len() {
            self.video_nego = VideoNegState::Failed("exhausted candidate configurations".into());
            return Vec::new();
        }
        self.video_nego = VideoNegState::Requested(next_k);
        self.video_attempt_started_at = Some(now);
        vec![self.build_video_request(next_k)]
    }

    fn build_video_request(&self, k: usize) -> Outgoing {
        let (channel, data_type, stream_type) = CANDIDATE_CONFIGS[k];
        let ip = self.config.video_server_ip.unwrap_or([0, 0, 0, 0]);
        Outgoing {
            message_id: MSG_VIDEO_REQUEST,
            body: messages::build_video_request(messages::VideoRequest {
                ip,
                tcp_port: self.config.video_tcp_port,
                udp_port: self.config.video_udp_port,
                channel,
                data_type,
                stream_type,
            }),
        }
    }

    fn maybe_trigger_list_query(&mut self, now: Instant) -> Option<Outgoing> {
        if self.list_query_sent {
            if let Some(last) = self.last_query_ts {
                if now.duration_since(last) < self.config.query_cooldown && !self.list.has_assembly() {
                    return None;
                }
            }
        }

        let should_fire = match (self.first_identified_at, self.registered_at) {
            (Some(identified_at), _) if now.duration_since(identified_at) >= Duration::from_millis(1500) => true,
            (_, Some(registered_at)) if now.duration_since(registered_at) >= Duration::from_secs(2) => true,
            _ => self.location_msg_count >= 2,
        };

        if !should_fire {
            return None;
        }
        if let Some(last) = self.last_query_ts {
            if now.duration_since(last) < self.config.query_cooldown {
                return None;
            }
        }

        self.last_query_ts = Some(now);
        self.list_query_sent = true;
        Some(Outgoing {
            message_id: MSG_LIST_QUERY,
            body: messages::build_list_query(0xFF, 0xFF, None, None),
        })
    }

    pub fn stored_videos(&self) -> &[StoredVideoEntry] {
        &self.stored_videos
    }

    /// Force an out-of-band 0x9205 query, bypassing the cooldown —
    /// used by the external `Api::query_stored_videos` call.
    pub fn force_list_query(&mut self, now: Instant) -> Outgoing {
        self.last_query_ts = Some(now);
        self.list_query_sent = true;
        Outgoing {
            message_id: MSG_LIST_QUERY,
            body: messages::build_list_query(0xFF, 0xFF, None, None),
        }
    }
}

/// Build a framed byte vector for one outbound message, stamping the
/// session's own monotonically increasing sequence counter.
pub fn frame_outgoing(
    out: &Outgoing,
    terminal_id: &str,
    sequence: u16,
    fragmentation: Option<Fragmentation>,
) -> Result<Vec<u8>, codec::CodecError> {
    codec::build(out.message_id, terminal_id, sequence, &out.body, fragmentation)
}

impl Session {
    /// Frame and return every outbound message produced by a call,
    /// consuming this session's sequence counter in order.
    pub fn frame_all(&mut self, outgoing: Vec<Outgoing>) -> Vec<Vec<u8>> {
        let terminal_id = self.terminal_id.clone().unwrap_or_else(|| "0".repeat(12));
        outgoing
            .into_iter()
            .filter_map(|msg| {
                let seq = self.next_sequence();
                frame_outgoing(&msg, &terminal_id, seq, None).ok()
            })
            .collect()
    }
}

pub type SharedBus = Arc<FrameBus>;
pub type SharedRegistry = Arc<Registry>;
