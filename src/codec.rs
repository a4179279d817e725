//! JT/T 808 framing: byte stuffing, BCC checksum, frame extraction and
//! message building. See `SPEC_FULL.md` §4.1 / spec.md §4.1.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

pub const FLAG: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const ESCAPE_FLAG: u8 = 0x02;
const ESCAPE_ESCAPE: u8 = 0x01;

const HEADER_MIN: usize = 2 + 2 + 6 + 2; // message_id + attributes + phone + sequence
const FRAG_HEADER: usize = 2 + 2; // package_items + package_number
const MAX_BODY_LEN: usize = 1023;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("header too short: {0} bytes")]
    HeaderTooShort(usize),
    #[error("declared body length {declared} exceeds remaining {remaining} bytes")]
    BodyTooLong { declared: usize, remaining: usize },
    #[error("body length {0} exceeds maximum of {MAX_BODY_LEN}")]
    BodyTooLarge(usize),
    #[error("package_number {package_number} exceeds package_items {package_items}")]
    BadFragmentation {
        package_number: u16,
        package_items: u16,
    },
}

/// A fully parsed, already-unstuffed JT/T 808 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: u16,
    pub terminal_phone: String,
    pub sequence: u16,
    pub fragmentation: Option<Fragmentation>,
    pub body: Vec<u8>,
    /// False when the BCC did not match; the frame is still returned —
    /// per spec.md §4.1/§7 BCC mismatch is downgraded to a warning, not
    /// a rejection.
    pub checksum_ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragmentation {
    pub package_items: u16,
    pub package_number: u16,
}

/// Result of scanning a read buffer for the next complete frame.
#[derive(Debug)]
pub enum ExtractOutcome {
    /// A complete frame was found; `consumed` bytes should be dropped
    /// from the front of the caller's buffer.
    Frame { frame: Frame, consumed: usize },
    /// No second flag found yet; caller should wait for more bytes.
    NeedMore,
    /// Garbage preceded the first flag; caller should drop `n` bytes and
    /// re-invoke `extract`.
    Resync(usize),
}

/// Replace `0x7D 0x02 -> 0x7E` and `0x7D 0x01 -> 0x7D`. A stray `0x7D` not
/// followed by `0x01`/`0x02` is passed through verbatim, matching the
/// leniency observed in real firmware (and in the Python reference
/// parser this was distilled from).
pub fn unstuff(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        if src[i] == ESCAPE && i + 1 < src.len() {
            match src[i + 1] {
                ESCAPE_FLAG => {
                    out.push(FLAG);
                    i += 2;
                }
                ESCAPE_ESCAPE => {
                    out.push(ESCAPE);
                    i += 2;
                }
                _ => {
                    out.push(src[i]);
                    i += 1;
                }
            }
        } else {
            out.push(src[i]);
            i += 1;
        }
    }
    out
}

/// Inverse of [`unstuff`]: escape every interior `0x7E`/`0x7D`.
pub fn stuff(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    for &b in src {
        match b {
            FLAG => out.extend_from_slice(&[ESCAPE, ESCAPE_FLAG]),
            ESCAPE => out.extend_from_slice(&[ESCAPE, ESCAPE_ESCAPE]),
            _ => out.push(b),
        }
    }
    out
}

/// BCC: the XOR of every octet in `span`.
pub fn xor_checksum(span: &[u8]) -> u8 {
    span.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Scan `buf` for the first fully delimited frame.
pub fn extract(buf: &[u8]) -> Result<ExtractOutcome, CodecError> {
    let Some(flag_start) = buf.iter().position(|&b| b == FLAG) else {
        return Ok(ExtractOutcome::NeedMore);
    };
    if flag_start > 0 {
        return Ok(ExtractOutcome::Resync(flag_start));
    }

    let Some(rel_end) = buf[flag_start + 1..].iter().position(|&b| b == FLAG) else {
        return Ok(ExtractOutcome::NeedMore);
    };
    let flag_end = flag_start + 1 + rel_end;
    let consumed = flag_end + 1;

    if flag_end == flag_start + 1 {
        // Back-to-back flags with nothing between: skip past the first
        // and let the caller re-scan from the second.
        return Ok(ExtractOutcome::Resync(1));
    }

    let interior = &buf[flag_start + 1..flag_end];
    let unstuffed = unstuff(interior);

    match parse_interior(&unstuffed) {
        Ok(frame) => Ok(ExtractOutcome::Frame { frame, consumed }),
        Err(_) => {
            // Structural error: discard through flag_end and let the
            // caller continue scanning (spec.md §7 "Framing" policy).
            Ok(ExtractOutcome::Resync(consumed))
        }
    }
}

fn parse_interior(data: &[u8]) -> Result<Frame, CodecError> {
    if data.len() < HEADER_MIN + 1 {
        return Err(CodecError::HeaderTooShort(data.len()));
    }

    let checksum_span_end = data.len() - 1;
    let received_checksum = data[checksum_span_end];
    let checksum_ok = xor_checksum(&data[..checksum_span_end]) == received_checksum;

    let mut cursor = &data[..checksum_span_end];
    let message_id = cursor.get_u16();
    let attributes = cursor.get_u16();
    let body_len = (attributes & 0x03FF) as usize;
    let fragmented = (attributes >> 13) & 0x1 == 1;

    if cursor.remaining() < 6 + 2 {
        return Err(CodecError::HeaderTooShort(data.len()));
    }
    let mut phone_bytes = [0u8; 6];
    cursor.copy_to_slice(&mut phone_bytes);
    let terminal_phone = bcd_to_phone(&phone_bytes);
    let sequence = cursor.get_u16();

    let fragmentation = if fragmented {
        if cursor.remaining() < FRAG_HEADER {
            return Err(CodecError::HeaderTooShort(data.len()));
        }
        let package_items = cursor.get_u16();
        let package_number = cursor.get_u16();
        Some(Fragmentation {
            package_items,
            package_number,
        })
    } else {
        None
    };

    if cursor.remaining() < body_len {
        return Err(CodecError::BodyTooLong {
            declared: body_len,
            remaining: cursor.remaining(),
        });
    }
    let body = cursor[..body_len].to_vec();

    Ok(Frame {
        message_id,
        terminal_phone,
        sequence,
        fragmentation,
        body,
        checksum_ok,
    })
}

/// Build a complete, stuffed, flag-delimited frame.
pub fn build(
    message_id: u16,
    terminal_phone: &str,
    sequence: u16,
    body: &[u8],
    fragmentation: Option<Fragmentation>,
) -> Result<Vec<u8>, CodecError> {
    if body.len() > MAX_BODY_LEN {
        return Err(CodecError::BodyTooLarge(body.len()));
    }
    if let Some(frag) = fragmentation {
        if frag.package_number > frag.package_items {
            return Err(CodecError::BadFragmentation {
                package_number: frag.package_number,
                package_items: frag.package_items,
            });
        }
    }

    let mut attributes: u16 = body.len() as u16 & 0x03FF;
    if fragmentation.is_some() {
        attributes |= 1 << 13;
    }

    let mut interior = BytesMut::with_capacity(HEADER_MIN + FRAG_HEADER + body.len() + 1);
    interior.put_u16(message_id);
    interior.put_u16(attributes);
    interior.put_slice(&phone_to_bcd(terminal_phone));
    interior.put_u16(sequence);
    if let Some(frag) = fragmentation {
        interior.put_u16(frag.package_items);
        interior.put_u16(frag.package_number);
    }
    interior.put_slice(body);

    let checksum = xor_checksum(&interior);
    interior.put_u8(checksum);

    let stuffed = stuff(&interior);
    let mut framed = Vec::with_capacity(stuffed.len() + 2);
    framed.push(FLAG);
    framed.extend_from_slice(&stuffed);
    framed.push(FLAG);
    Ok(framed)
}

/// Decode 6 BCD octets into a 12-digit terminal id string. A trailing
/// nibble of `0xF` is padding and is dropped.
pub fn bcd_to_phone(bytes: &[u8; 6]) -> String {
    let mut s = String::with_capacity(12);
    for &b in bytes {
        let hi = b >> 4;
        let lo = b & 0x0F;
        if hi != 0xF {
            s.push(std::char::from_digit(hi as u32, 16).unwrap_or('0'));
        }
        if lo != 0xF {
            s.push(std::char::from_digit(lo as u32, 16).unwrap_or('0'));
        }
    }
    s
}

/// Encode a terminal id string into 6 BCD octets, padding unused nibbles
/// with `0xF`.
pub fn phone_to_bcd(phone: &str) -> [u8; 6] {
    let digits: Vec<u8> = phone
        .chars()
        .filter_map(|c| c.to_digit(16).map(|d| d as u8))
        .collect();
    let mut out = [0xFFu8; 6];
    for i in 0..6 {
        let hi = digits.get(i * 2).copied();
        let lo = digits.get(i * 2 + 1).copied();
        match (hi, lo) {
            (Some(h), Some(l)) => out[i] = (h << 4) | l,
            (Some(h), None) => out[i] = (h << 4) | 0x0F,
            _ => out[i] = 0xFF,
        }
    }
    out
}
