//! Fragment reassembly: live-video chains (0x9201/0x9202/0x9206/0x9207)
//! and fragmented stored-video-list responses (0x1205). See
//! `SPEC_FULL.md` §4.3.
//!
//! Grounded on `knightofdemons-a9-v720/src/types.rs`'s `StreamBuffer`
//! (fragment accumulation keyed by start/middle/end markers) and
//! `src/router/udp.rs`'s `periodic_incomplete_frame_task` (the watchdog
//! model for list-assembly flushing).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::messages::{StoredVideoEntry, VideoDataFrame, VideoPackageType};

const MAX_LIVE_CHAINS: usize = 32;

/// A chain of fragments for one live-video frame, keyed by
/// `(channel, timestamp)` (or `(channel, sequence)` when no timestamp
/// is available).
#[derive(Debug)]
struct LiveChain {
    data_type: u8,
    payload: Vec<u8>,
    last_activity: Instant,
    degraded: bool,
}

/// A fully reassembled live-video frame, ready for the Frame Bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFrame {
    pub channel: u8,
    pub data_type: u8,
    pub payload: Vec<u8>,
    pub degraded: bool,
}

pub struct LiveReassembler {
    chains: HashMap<(u8, String), LiveChain>,
    chain_timeout: Duration,
}

impl LiveReassembler {
    pub fn new(chain_timeout: Duration) -> Self {
        LiveReassembler {
            chains: HashMap::new(),
            chain_timeout,
        }
    }

    fn key_for(frame: &VideoDataFrame) -> (u8, String) {
        (frame.channel, frame.timestamp_key())
    }

    /// Feed one parsed video-data frame in. Returns `Some` exactly when
    /// an `end` packet completes a chain.
    pub fn ingest(&mut self, frame: VideoDataFrame, now: Instant) -> Option<AssembledFrame> {
        self.evict_stale(now);

        let key = Self::key_for(&frame);
        match frame.package_type {
            VideoPackageType::Start => {
                self.make_room(now);
                self.chains.insert(
                    key,
                    LiveChain {
                        data_type: frame.data_type,
                        payload: frame.payload,
                        last_activity: now,
                        degraded: false,
                    },
                );
                None
            }
            VideoPackageType::Middle => {
                if let Some(chain) = self.chains.get_mut(&key) {
                    chain.payload.extend_from_slice(&frame.payload);
                    chain.last_activity = now;
                } else {
                    self.make_room(now);
                    self.chains.insert(
                        key,
                        LiveChain {
                            data_type: frame.data_type,
                            payload: frame.payload,
                            last_activity: now,
                            degraded: true,
                        },
                    );
                }
                None
            }
            VideoPackageType::End => {
                if let Some(mut chain) = self.chains.remove(&key) {
                    chain.payload.extend_from_slice(&frame.payload);
                    Some(AssembledFrame {
                        channel: key.0,
                        data_type: chain.data_type,
                        payload: chain.payload,
                        degraded: chain.degraded,
                    })
                } else {
                    Some(AssembledFrame {
                        channel: key.0,
                        data_type: frame.data_type,
                        payload: frame.payload,
                        degraded: true,
                    })
                }
            }
        }
    }

    fn evict_stale(&mut self, now: Instant) {
        let timeout = self.chain_timeout;
        self.chains
            .retain(|_, chain| now.duration_since(chain.last_activity) <= timeout);
    }

    fn make_room(&mut self, now: Instant) {
        self.evict_stale(now);
        if self.chains.len() < MAX_LIVE_CHAINS {
            return;
        }
        if let Some(oldest_key) = self
            .chains
            .iter()
            .min_by_key(|(_, c)| c.last_activity)
            .map(|(k, _)| k.clone())
        {
            self.chains.remove(&oldest_key);
        }
    }

    #[cfg(test)]
    fn chain_count(&self) -> usize {
        self.chains.len()
    }
}

/// In-flight fragmented stored-video-list buffer (§4.3).
struct ListAssembly {
    expected_count: u16,
    expected_bytes: usize,
    received: Vec<u8>,
    last_activity: Instant,
}

pub struct ListReassembler {
    assembly: Option<ListAssembly>,
    stale_after: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListOutcome {
    /// The list is still being accumulated.
    Pending,
    /// Accumulated bytes reached the expected size; entries parsed.
    Complete(Vec<StoredVideoEntry>),
}

impl ListReassembler {
    pub fn new(stale_after: Duration) -> Self {
        ListReassembler {
            assembly: None,
            stale_after,
        }
    }

    pub fn has_assembly(&self) -> bool {
        self.assembly.is_some()
    }

    /// Start (or supersede) a list assembly from the 6-octet init marker.
    pub fn init(&mut self, count: u16, now: Instant) -> Vec<StoredVideoEntry> {
        let flushed = self.flush_best_effort();
        self.assembly = Some(ListAssembly {
            expected_count: count,
            expected_bytes: StoredVideoEntry::SIZE * count as usize,
            received: Vec::new(),
            last_activity: now,
        });
        flushed
    }

    /// Feed a continuation body. Strips a duplicate leading count if
    /// present, per §4.3.
    pub fn ingest_continuation(&mut self, body: &[u8], now: Instant) -> ListOutcome {
        let stale = self
            .assembly
            .as_ref()
            .map(|a| now.duration_since(a.last_activity) > self.stale_after)
            .unwrap_or(false);
        if stale {
            self.flush_best_effort();
            return ListOutcome::Pending;
        }

        let Some(assembly) = self.assembly.as_mut() else {
            return ListOutcome::Pending;
        };

        let mut chunk = body;
        if chunk.len() >= 2 {
            let leading = u16::from_be_bytes([chunk[0], chunk[1]]);
            if leading == assembly.expected_count {
                chunk = &chunk[2..];
            }
        }
        assembly.received.extend_from_slice(chunk);
        assembly.last_activity = now;

        if assembly.received.len() >= assembly.expected_bytes {
            let entries = parse_entries(&assembly.received, assembly.expected_count);
            self.assembly = None;
            ListOutcome::Complete(entries)
        } else {
            ListOutcome::Pending
        }
    }

    /// Called by the 2s background watchdog (§4.3): flush any assembly
    /// whose `last_activity` is stale.
    pub fn tick(&mut self, now: Instant) -> Option<Vec<StoredVideoEntry>> {
        let stale = self
            .assembly
            .as_ref()
            .map(|a| now.duration_since(a.last_activity) > self.stale_after)
            .unwrap_or(false);
        if stale {
            Some(self.flush_best_effort())
        } else {
            None
        }
    }

    fn flush_best_effort(&mut self) -> Vec<StoredVideoEntry> {
        match self.assembly.take() {
            Some(assembly) => parse_entries(&assembly.received, assembly.expected_count),
            None => Vec::new(),
        }
    }
}

fn parse_entries(bytes: &[u8], max_count: u16) -> Vec<StoredVideoEntry> {
    let mut out = Vec::new();
    let mut offset = 0;
    while out.len() < max_count as usize && offset + StoredVideoEntry::SIZE <= bytes.len() {
        if let Ok(entry) = StoredVideoEntry::parse(&bytes[offset..offset + StoredVideoEntry::SIZE]) {
            out.push(entry);
        }
        offset += StoredVideoEntry::SIZE;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(channel: u8, package_type: VideoPackageType, payload: &[u8]) -> VideoDataFrame {
        VideoDataFrame {
            channel,
            data_type: 0,
            package_type,
            timestamp_bcd: [0x22, 0x01, 0x04, 0x15, 0x30, 0x00],
            last_interval: 0,
            last_size: 0,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn start_middle_end_concatenates_in_order() {
        let mut r = LiveReassembler::new(Duration::from_secs(5));
        let now = Instant::now();
        assert!(r.ingest(frame(1, VideoPackageType::Start, b"P0"), now).is_none());
        assert!(r.ingest(frame(1, VideoPackageType::Middle, b"P1"), now).is_none());
        let done = r.ingest(frame(1, VideoPackageType::End, b"P2"), now).unwrap();
        assert_eq!(done.payload, b"P0P1P2");
        assert!(!done.degraded);
    }

    #[test]
    fn distinct_keys_do_not_interfere() {
        let mut r = LiveReassembler::new(Duration::from_secs(5));
        let now = Instant::now();
        let mut f1 = frame(1, VideoPackageType::Start, b"A");
        f1.timestamp_bcd = [0x22, 0x01, 0x04, 0x15, 0x30, 0x00];
        let mut f2 = frame(2, VideoPackageType::Start, b"B");
        f2.timestamp_bcd = [0x22, 0x01, 0x04, 0x15, 0x31, 0x00];

        r.ingest(f1, now);
        r.ingest(f2, now);
        assert_eq!(r.chain_count(), 2);

        let mut e1 = frame(1, VideoPackageType::End, b"X");
        e1.timestamp_bcd = [0x22, 0x01, 0x04, 0x15, 0x30, 0x00];
        let done = r.ingest(e1, now).unwrap();
        assert_eq!(done.payload, b"AX");
        assert_eq!(r.chain_count(), 1);
    }

    #[test]
    fn missed_start_is_marked_degraded_but_still_flushed() {
        let mut r = LiveReassembler::new(Duration::from_secs(5));
        let now = Instant::now();
        assert!(r.ingest(frame(1, VideoPackageType::Middle, b"M"), now).is_none());
        let done = r.ingest(frame(1, VideoPackageType::End, b"E"), now).unwrap();
        assert_eq!(done.payload, b"ME");
        assert!(done.degraded);
    }

    #[test]
    fn stale_chain_is_evicted_without_emission() {
        let mut r = LiveReassembler::new(Duration::from_secs(5));
        let t0 = Instant::now();
        r.ingest(frame(1, VideoPackageType::Start, b"A"), t0);
        assert_eq!(r.chain_count(), 1);

        let t1 = t0 + Duration::from_secs(6);
        // Any ingest call triggers eviction of stale chains first.
        let mut other = frame(2, VideoPackageType::Start, b"B");
        other.timestamp_bcd = [0x22, 0x01, 0x04, 0x15, 0x31, 0x00];
        r.ingest(other, t1);
        assert_eq!(r.chain_count(), 1);
    }

    #[test]
    fn list_assembly_emits_exact_count() {
        let mut r = ListReassembler::new(Duration::from_secs(10));
        let now = Instant::now();
        r.init(2, now);

        let entry_a = StoredVideoEntry {
            channel: 1,
            start_time_bcd: [0x22, 0x01, 0x04, 0x15, 0x30, 0x00],
            end_time_bcd: [0x22, 0x01, 0x04, 0x16, 0x00, 0x00],
            alarm_mask: 0,
            video_type: 0,
        };
        let entry_b = StoredVideoEntry {
            channel: 2,
            start_time_bcd: [0x22, 0x01, 0x04, 0x17, 0x00, 0x00],
            end_time_bcd: [0x22, 0x01, 0x04, 0x18, 0x00, 0x00],
            alarm_mask: 0,
            video_type: 0,
        };
        let mut bytes = Vec::new();
        entry_a.write(&mut bytes);
        entry_b.write(&mut bytes);

        match r.ingest_continuation(&bytes, now) {
            ListOutcome::Complete(entries) => {
                assert_eq!(entries, vec![entry_a, entry_b]);
            }
            ListOutcome::Pending => panic!("expected Complete"),
        }
        assert!(!r.has_assembly());
    }

    #[test]
    fn list_assembly_strips_duplicate_leading_count() {
        let mut r = ListReassembler::new(Duration::from_secs(10));
        let now = Instant::now();
        r.init(1, now);

        let entry = StoredVideoEntry {
            channel: 1,
            start_time_bcd: [0; 6],
            end_time_bcd: [0; 6],
            alarm_mask: 0,
            video_type: 0,
        };
        let mut bytes = vec![0x00, 0x01];
        entry.write(&mut bytes);

        match r.ingest_continuation(&bytes, now) {
            ListOutcome::Complete(entries) => assert_eq!(entries, vec![entry]),
            ListOutcome::Pending => panic!("expected Complete"),
        }
    }

    #[test]
    fn stale_assembly_is_superseded() {
        let mut r = ListReassembler::new(Duration::from_secs(10));
        let t0 = Instant::now();
        r.init(5, t0);
        r.ingest_continuation(&[0u8; 9], t0);

        let t1 = t0 + Duration::from_secs(11);
        let flushed = r.init(2, t1);
        // Only 9 of 90 expected bytes were received; best-effort flush
        // yields zero complete entries.
        assert!(flushed.is_empty());
        assert!(r.has_assembly());
    }

    #[test]
    fn watchdog_flushes_stale_assembly() {
        let mut r = ListReassembler::new(Duration::from_secs(10));
        let t0 = Instant::now();
        r.init(1, t0);
        assert!(r.tick(t0 + Duration::from_secs(5)).is_none());
        assert!(r.tick(t0 + Duration::from_secs(11)).is_some());
        assert!(!r.has_assembly());
    }
}
