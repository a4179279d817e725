//! Typed records for every recognised JT/T 808 / JT/T 1078 message id.
//! See `SPEC_FULL.md` §4.2. Grounded on
//! `knightofdemons-a9-v720/src/protocol.rs`'s flat-struct-plus-parse/
//! serialize pairing, and on `original_source/jt808_protocol.py` /
//! `jtt1078_parser.py` for exact field offsets.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::codec::bcd_to_phone;

pub const MSG_GENERAL_ACK: u16 = 0x0001;
pub const MSG_HEARTBEAT: u16 = 0x0002;
pub const MSG_LOGOUT: u16 = 0x0003;
pub const MSG_REGISTER: u16 = 0x0100;
pub const MSG_AUTH: u16 = 0x0102;
pub const MSG_LOCATION: u16 = 0x0200;
pub const MSG_1205: u16 = 0x1205;
pub const MSG_UPLOAD_INIT: u16 = 0x1206;
pub const MSG_AUTH_ACK: u16 = 0x8001;
pub const MSG_HEARTBEAT_ACK: u16 = 0x8002;
pub const MSG_LOCATION_ACK: u16 = 0x8003;
pub const MSG_REGISTER_ACK: u16 = 0x8100;
pub const MSG_VIDEO_REQUEST: u16 = 0x9101;
pub const MSG_VIDEO_DOWNLOAD_REQUEST: u16 = 0x9102;
pub const MSG_VIDEO_DATA_1: u16 = 0x9201;
pub const MSG_VIDEO_CONTROL: u16 = 0x9202;
pub const MSG_LIST_QUERY: u16 = 0x9205;
pub const MSG_VIDEO_DATA_H264_1: u16 = 0x9206;
pub const MSG_VIDEO_DATA_H264_2: u16 = 0x9207;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("body too short for message {message_id:#06x}: got {got}, need at least {need}")]
    TooShort {
        message_id: u16,
        got: usize,
        need: usize,
    },
    #[error("unrecognised message id {0:#06x}")]
    Unrecognised(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckResult {
    Ok = 0,
    Fail = 1,
    BadMessage = 2,
    Unsupported = 3,
}

impl AckResult {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => AckResult::Ok,
            1 => AckResult::Fail,
            2 => AckResult::BadMessage,
            _ => AckResult::Unsupported,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralAck {
    pub reply_seq: u16,
    pub reply_id: u16,
    pub result: AckResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInfo {
    pub province: u16,
    pub city: u16,
    pub manufacturer: [u8; 5],
    pub model: [u8; 20],
    pub terminal_id: [u8; 16],
    pub plate_color: u8,
    pub plate: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub auth_code: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationRecord {
    pub alarm: u32,
    pub status: u32,
    pub latitude: i32,
    pub longitude: i32,
    pub altitude: u16,
    pub speed: u16,
    pub heading: u16,
    pub time_bcd: [u8; 6],
}

impl LocationRecord {
    pub const LEN: usize = 28;

    pub fn parse(body: &[u8]) -> Result<(Self, &[u8]), MessageError> {
        if body.len() < Self::LEN {
            return Err(MessageError::TooShort {
                message_id: MSG_LOCATION,
                got: body.len(),
                need: Self::LEN,
            });
        }
        let mut cursor = &body[..Self::LEN];
        let alarm = cursor.get_u32();
        let status = cursor.get_u32();
        let latitude = cursor.get_i32();
        let longitude = cursor.get_i32();
        let altitude = cursor.get_u16();
        let speed = cursor.get_u16();
        let heading = cursor.get_u16();
        let mut time_bcd = [0u8; 6];
        cursor.copy_to_slice(&mut time_bcd);
        Ok((
            LocationRecord {
                alarm,
                status,
                latitude,
                longitude,
                altitude,
                speed,
                heading,
                time_bcd,
            },
            &body[Self::LEN..],
        ))
    }

    pub fn time_str(&self) -> String {
        bcd_to_timestamp(&self.time_bcd)
    }

    /// Decode the BCD `YYMMDDHHmmss` field into a real UTC timestamp, for
    /// logging and the external API — `None` if the device sent a BCD
    /// value that isn't a valid calendar date.
    pub fn time_utc(&self) -> Option<chrono::NaiveDateTime> {
        let digit_pair = |b: u8| (b >> 4) as u32 * 10 + (b & 0x0F) as u32;
        let year = 2000 + digit_pair(self.time_bcd[0]) as i32;
        let month = digit_pair(self.time_bcd[1]);
        let day = digit_pair(self.time_bcd[2]);
        let hour = digit_pair(self.time_bcd[3]);
        let minute = digit_pair(self.time_bcd[4]);
        let second = digit_pair(self.time_bcd[5]);
        chrono::NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredVideoEntry {
    pub channel: u8,
    pub start_time_bcd: [u8; 6],
    pub end_time_bcd: [u8; 6],
    pub alarm_mask: u32,
    pub video_type: u8,
}

impl StoredVideoEntry {
    pub const SIZE: usize = 18;

    pub fn parse(src: &[u8]) -> Result<Self, MessageError> {
        if src.len() < Self::SIZE {
            return Err(MessageError::TooShort {
                message_id: MSG_1205,
                got: src.len(),
                need: Self::SIZE,
            });
        }
        let channel = src[0];
        let mut start_time_bcd = [0u8; 6];
        start_time_bcd.copy_from_slice(&src[1..7]);
        let mut end_time_bcd = [0u8; 6];
        end_time_bcd.copy_from_slice(&src[7..13]);
        let mut alarm_cursor = &src[13..17];
        let alarm_mask = alarm_cursor.get_u32();
        let video_type = src[17];
        Ok(StoredVideoEntry {
            channel,
            start_time_bcd,
            end_time_bcd,
            alarm_mask,
            video_type,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(self.channel);
        out.extend_from_slice(&self.start_time_bcd);
        out.extend_from_slice(&self.end_time_bcd);
        out.extend_from_slice(&self.alarm_mask.to_be_bytes());
        out.push(self.video_type);
    }
}

/// Resolved interpretation of an 0x1205 body, per §4.3's disambiguation
/// rule (length + session context, never a single-shot type tag).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredVideoBody {
    ListInit { count: u16 },
    ListContinuation(Vec<u8>),
    DataChunk(VideoDataChunk),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDataChunk {
    pub channel: u8,
    pub data_type: u8,
    pub stream_type: u8,
    pub codec_type: u8,
    pub location: LocationRecord,
    pub time_bcd: [u8; 6],
    pub video_data: Vec<u8>,
}

impl VideoDataChunk {
    pub const PREFIX_LEN: usize = 1 + 1 + 1 + 1 + LocationRecord::LEN + 6;

    pub fn parse(body: &[u8]) -> Result<Self, MessageError> {
        if body.len() < Self::PREFIX_LEN {
            return Err(MessageError::TooShort {
                message_id: MSG_1205,
                got: body.len(),
                need: Self::PREFIX_LEN,
            });
        }
        let channel = body[0];
        let data_type = body[1];
        let stream_type = body[2];
        let codec_type = body[3];
        let (location, _rest) = LocationRecord::parse(&body[4..4 + LocationRecord::LEN])?;
        let time_bcd_start = 4 + LocationRecord::LEN;
        let mut time_bcd = [0u8; 6];
        time_bcd.copy_from_slice(&body[time_bcd_start..time_bcd_start + 6]);
        let video_data = body[Self::PREFIX_LEN..].to_vec();
        Ok(VideoDataChunk {
            channel,
            data_type,
            stream_type,
            codec_type,
            location,
            time_bcd,
            video_data,
        })
    }
}

impl StoredVideoBody {
    /// Resolve the 0x1205 body's polymorphism: an init marker, a
    /// continuation of an assembly already in flight (or a complete
    /// one-shot list, which the caller still needs session context to
    /// tell apart from a true continuation), or a stored-video-data
    /// chunk.
    pub fn classify(body: &[u8], list_assembly_in_progress: bool) -> Option<Self> {
        if let Some(count) = is_list_init_marker(body) {
            return Some(StoredVideoBody::ListInit { count });
        }
        if list_assembly_in_progress || looks_like_complete_list(body).is_some() {
            return Some(StoredVideoBody::ListContinuation(body.to_vec()));
        }
        VideoDataChunk::parse(body).ok().map(StoredVideoBody::DataChunk)
    }
}

/// Heuristic used only when no list assembly is already in flight
/// (§4.3 "Detection of a non-fragmented list").
pub fn looks_like_complete_list(body: &[u8]) -> Option<u16> {
    if body.len() < 2 {
        return None;
    }
    let count = u16::from_be_bytes([body[0], body[1]]);
    if count > 1000 {
        return None;
    }
    let expected = 2 + 18 * count as usize;
    if (body.len() as i64 - expected as i64).unsigned_abs() <= 10 {
        Some(count)
    } else {
        None
    }
}

/// True for the 6-octet `<count:u16><0x00 0x00 0x00 0x00>` init marker.
pub fn is_list_init_marker(body: &[u8]) -> Option<u16> {
    if body.len() == 6 && body[2..6] == [0, 0, 0, 0] {
        let count = u16::from_be_bytes([body[0], body[1]]);
        if count > 0 && count <= 1000 {
            return Some(count);
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoPackageType {
    Start,
    Middle,
    End,
}

impl VideoPackageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(VideoPackageType::Start),
            1 => Some(VideoPackageType::Middle),
            2 => Some(VideoPackageType::End),
            _ => None,
        }
    }
}

/// Body schema shared by 0x9201/0x9206/0x9207, and by 0x9202 when it is
/// acting as a data frame rather than a control frame (≥13 octets).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDataFrame {
    pub channel: u8,
    pub data_type: u8,
    pub package_type: VideoPackageType,
    pub timestamp_bcd: [u8; 6],
    pub last_interval: u16,
    pub last_size: u16,
    pub payload: Vec<u8>,
}

impl VideoDataFrame {
    pub const PREFIX_LEN: usize = 13;

    pub fn parse(message_id: u16, body: &[u8]) -> Result<Self, MessageError> {
        if body.len() < Self::PREFIX_LEN {
            return Err(MessageError::TooShort {
                message_id,
                got: body.len(),
                need: Self::PREFIX_LEN,
            });
        }
        let channel = body[0];
        let data_type = body[1];
        let package_type = VideoPackageType::from_u8(body[2]).unwrap_or(VideoPackageType::Middle);
        let mut timestamp_bcd = [0u8; 6];
        timestamp_bcd.copy_from_slice(&body[3..9]);
        let last_interval = u16::from_be_bytes([body[9], body[10]]);
        let last_size = u16::from_be_bytes([body[11], body[12]]);
        let payload = body[Self::PREFIX_LEN..].to_vec();
        Ok(VideoDataFrame {
            channel,
            data_type,
            package_type,
            timestamp_bcd,
            last_interval,
            last_size,
            payload,
        })
    }

    pub fn timestamp_key(&self) -> String {
        bcd_to_timestamp(&self.timestamp_bcd)
    }
}

/// 0x9202's control variant (4 octets).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoControl {
    pub control_type: u8,
    pub channel: u8,
    pub data_type: u8,
    pub stream_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoControlOrData {
    Control(VideoControl),
    Data(VideoDataFrame),
}

/// Resolves 0x9202's length-based polymorphism (§4.2).
pub fn parse_video_control_or_data(body: &[u8]) -> Result<VideoControlOrData, MessageError> {
    if body.len() >= VideoDataFrame::PREFIX_LEN {
        return Ok(VideoControlOrData::Data(VideoDataFrame::parse(
            MSG_VIDEO_CONTROL,
            body,
        )?));
    }
    if body.len() < 4 {
        return Err(MessageError::TooShort {
            message_id: MSG_VIDEO_CONTROL,
            got: body.len(),
            need: 4,
        });
    }
    Ok(VideoControlOrData::Control(VideoControl {
        control_type: body[0],
        channel: body[1],
        data_type: body[2],
        stream_type: body[3],
    }))
}

pub fn build_video_control(ctrl: VideoControl) -> Vec<u8> {
    vec![
        ctrl.control_type,
        ctrl.channel,
        ctrl.data_type,
        ctrl.stream_type,
    ]
}

/// Body for a server→terminal 0x9101 live-video request (exactly 12
/// octets past the `ip_len` prefix, per §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoRequest {
    pub ip: [u8; 4],
    pub tcp_port: u16,
    pub udp_port: u16,
    pub channel: u8,
    pub data_type: u8,
    pub stream_type: u8,
}

pub fn build_video_request(req: VideoRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + 2 + 2 + 1 + 1 + 1);
    out.push(4u8); // ip_len
    out.extend_from_slice(&req.ip);
    out.extend_from_slice(&req.tcp_port.to_be_bytes());
    out.extend_from_slice(&req.udp_port.to_be_bytes());
    out.push(req.channel);
    out.push(req.data_type);
    out.push(req.stream_type);
    out
}

/// Body for server→terminal 0x9205 (stored-video-list query).
pub fn build_list_query(channel: u8, video_type: u8, start: Option<[u8; 6]>, end: Option<[u8; 6]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(14);
    out.push(channel);
    out.push(video_type);
    out.extend_from_slice(&start.unwrap_or([0xFF; 6]));
    out.extend_from_slice(&end.unwrap_or([0xFF; 6]));
    out
}

/// Body for server→terminal 0x9102 (stored-video download request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoDownloadRequest {
    pub channel: u8,
    pub start_bcd: [u8; 6],
    pub end_bcd: [u8; 6],
    pub alarm: u32,
    pub video_type: u8,
    pub storage: u8,
}

pub fn build_video_download_request(req: VideoDownloadRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(19);
    out.push(req.channel);
    out.extend_from_slice(&req.start_bcd);
    out.extend_from_slice(&req.end_bcd);
    out.extend_from_slice(&req.alarm.to_be_bytes());
    out.push(req.video_type);
    out.push(req.storage);
    out
}

pub fn build_general_ack(ack: GeneralAck) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.extend_from_slice(&ack.reply_seq.to_be_bytes());
    out.extend_from_slice(&ack.reply_id.to_be_bytes());
    out.push(ack.result as u8);
    out
}

pub fn build_register_ack(result: u16, auth_code: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + auth_code.len());
    out.extend_from_slice(&result.to_be_bytes());
    out.extend_from_slice(auth_code);
    out
}

pub fn parse_general_ack(body: &[u8]) -> Result<GeneralAck, MessageError> {
    if body.len() < 5 {
        return Err(MessageError::TooShort {
            message_id: MSG_GENERAL_ACK,
            got: body.len(),
            need: 5,
        });
    }
    let reply_seq = u16::from_be_bytes([body[0], body[1]]);
    let reply_id = u16::from_be_bytes([body[2], body[3]]);
    let result = AckResult::from_u8(body[4]);
    Ok(GeneralAck {
        reply_seq,
        reply_id,
        result,
    })
}

pub fn parse_register_info(body: &[u8]) -> Result<RegisterInfo, MessageError> {
    const FIXED: usize = 2 + 2 + 5 + 20 + 16 + 1;
    if body.len() < FIXED {
        return Err(MessageError::TooShort {
            message_id: MSG_REGISTER,
            got: body.len(),
            need: FIXED,
        });
    }
    let province = u16::from_be_bytes([body[0], body[1]]);
    let city = u16::from_be_bytes([body[2], body[3]]);
    let mut manufacturer = [0u8; 5];
    manufacturer.copy_from_slice(&body[4..9]);
    let mut model = [0u8; 20];
    model.copy_from_slice(&body[9..29]);
    let mut terminal_id = [0u8; 16];
    terminal_id.copy_from_slice(&body[29..45]);
    let plate_color = body[45];
    let plate = body[46..].to_vec();
    Ok(RegisterInfo {
        province,
        city,
        manufacturer,
        model,
        terminal_id,
        plate_color,
        plate,
    })
}

pub fn parse_auth_info(body: &[u8]) -> AuthInfo {
    AuthInfo {
        auth_code: body.to_vec(),
    }
}

/// Decode a 6-octet BCD timestamp (`YYMMDDHHmmss`) into a digit string.
/// Mirrors `original_source/jt808_protocol.py`'s `parse_location_data`
/// and `jtt1078_parser.py`'s `parse_video_data` BCD handling.
pub fn bcd_to_timestamp(bcd: &[u8; 6]) -> String {
    let mut s = String::with_capacity(12);
    for &b in bcd {
        s.push_str(&format!("{}{}", b >> 4, b & 0x0F));
    }
    s
}

pub fn timestamp_to_bcd(digits: &str) -> [u8; 6] {
    let mut nibbles: Vec<u8> = digits
        .chars()
        .filter_map(|c| c.to_digit(10).map(|d| d as u8))
        .collect();
    nibbles.resize(12, 0);
    let mut out = [0u8; 6];
    for i in 0..6 {
        out[i] = (nibbles[i * 2] << 4) | nibbles[i * 2 + 1];
    }
    out
}
