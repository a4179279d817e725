use std::sync::Arc;

use anyhow::Result;
use tracing::info;

mod api;
mod bus;
mod codec;
mod config;
mod messages;
mod net;
mod reassembler;
mod registry;
mod session;
mod telemetry;

use bus::FrameBus;
use config::AppConfig;
use registry::Registry;

const CONFIG_PATH: &str = "config.json";
const BUS_SUBSCRIBER_QUEUE_CAP: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_telemetry();

    let config = Arc::new(AppConfig::load(CONFIG_PATH)?);
    let registry = Arc::new(Registry::new());
    let bus = Arc::new(FrameBus::new(BUS_SUBSCRIBER_QUEUE_CAP));

    info!(
        tcp_port = config.device_tcp_port,
        udp_port = config.device_udp_port,
        "starting jt808 engine"
    );

    // Every listener reports its outcome on this channel; none are
    // expected to return while the process runs, so the first message
    // received here is always a fatal bind or accept failure (§7).
    let (exit_tx, mut exit_rx) = tokio::sync::mpsc::channel::<(&'static str, std::io::Result<()>)>(4);

    spawn_listener(&exit_tx, "device-tcp", {
        let registry = registry.clone();
        let bus = bus.clone();
        let config = config.clone();
        net::tcp::run(config.device_tcp_host.clone(), config.device_tcp_port, registry, bus, config)
    });

    let mut udp_ports = vec![config.device_udp_port];
    udp_ports.extend(config.aux_udp_ports.iter().copied());
    udp_ports.sort_unstable();
    udp_ports.dedup();

    for port in udp_ports {
        spawn_listener(&exit_tx, "device-udp", {
            let registry = registry.clone();
            let bus = bus.clone();
            let config = config.clone();
            net::udp::run(port, registry, bus, config)
        });
    }
    drop(exit_tx);

    if let Some((name, result)) = exit_rx.recv().await {
        match result {
            Ok(()) => info!(listener = name, "listener exited cleanly"),
            Err(err) => anyhow::bail!("listener {name} failed: {err}"),
        }
    }

    Ok(())
}

fn spawn_listener(
    exit_tx: &tokio::sync::mpsc::Sender<(&'static str, std::io::Result<()>)>,
    name: &'static str,
    fut: impl std::future::Future<Output = std::io::Result<()>> + Send + 'static,
) {
    let exit_tx = exit_tx.clone();
    tokio::spawn(async move {
        let result = fut.await;
        let _ = exit_tx.send((name, result)).await;
    });
}

/// End-to-end scenarios, driven purely against in-process types (no
/// sockets) — the S1-S6 walkthroughs.
#[cfg(test)]
mod scenario_tests {
    use std::net::IpAddr;
    use std::time::{Duration, Instant};

    use crate::bus::{FrameBus, SubscriptionFilter};
    use crate::codec::{self, ExtractOutcome};
    use crate::messages::{
        self, AckResult, GeneralAck, StoredVideoEntry, MSG_GENERAL_ACK, MSG_HEARTBEAT,
        MSG_HEARTBEAT_ACK, MSG_LIST_QUERY, MSG_LOCATION, MSG_LOCATION_ACK, MSG_REGISTER,
        MSG_REGISTER_ACK, MSG_VIDEO_DATA_1, MSG_VIDEO_REQUEST,
    };
    use crate::registry::Registry;
    use crate::session::{Session, SessionConfig};

    fn ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn extract_one(framed: &[u8]) -> codec::Frame {
        match codec::extract(framed).unwrap() {
            ExtractOutcome::Frame { frame, .. } => frame,
            other => panic!("expected a complete frame, got {other:?}"),
        }
    }

    /// S1 - Heartbeat round-trip.
    #[tokio::test]
    async fn s1_heartbeat_round_trip() {
        let registry = Registry::new();
        let bus = FrameBus::new(8);
        let mut session = Session::new(1, ip(), SessionConfig::default());

        let framed = codec::build(MSG_HEARTBEAT, "012345678901", 42, &[], None).unwrap();
        let frame = extract_one(&framed);
        assert!(frame.checksum_ok);

        let out = session.handle_frame(frame, Instant::now(), &registry, &bus).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message_id, MSG_HEARTBEAT_ACK);
        assert!(out[0].body.is_empty());

        let framed_out = session.frame_all(out);
        assert_eq!(framed_out.len(), 1);
        let reply = extract_one(&framed_out[0]);
        assert_eq!(reply.message_id, MSG_HEARTBEAT_ACK);
        assert_eq!(reply.terminal_phone, "012345678901");
    }

    /// S2 - Registration success.
    #[tokio::test]
    async fn s2_registration_success() {
        let registry = Registry::new();
        let bus = FrameBus::new(8);
        let mut session = Session::new(1, ip(), SessionConfig::default());

        let mut model = b"DC100".to_vec();
        model.resize(20, b' ');
        let terminal_id = b"ABC0000000000001";
        assert_eq!(terminal_id.len(), 16);

        let mut body = Vec::new();
        body.extend_from_slice(&31u16.to_be_bytes());
        body.extend_from_slice(&100u16.to_be_bytes());
        body.extend_from_slice(b"ACME1");
        body.extend_from_slice(&model);
        body.extend_from_slice(terminal_id);
        body.push(1); // plate_color
        body.extend_from_slice("AB-12345".as_bytes());

        let framed = codec::build(MSG_REGISTER, "012345678901", 1, &body, None).unwrap();
        let frame = extract_one(&framed);

        let out = session.handle_frame(frame, Instant::now(), &registry, &bus).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message_id, MSG_REGISTER_ACK);
        assert_eq!(&out[0].body[0..2], &[0x00, 0x00]);
        assert_eq!(out[0].body.len(), 2 + 16);
        assert_eq!(session.lifecycle, crate::session::LifecycleState::Registered);
    }

    /// S3 - Location + auto-query.
    #[tokio::test]
    async fn s3_location_triggers_single_auto_query() {
        let registry = Registry::new();
        let bus = FrameBus::new(8);
        let mut session = Session::new(1, ip(), SessionConfig::default());

        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&31_000_000i32.to_be_bytes());
        body.extend_from_slice(&121_000_000i32.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&[0x22, 0x01, 0x04, 0x15, 0x30, 0x00]);

        let t0 = Instant::now();
        for seq in [1u16, 2u16] {
            let framed = codec::build(MSG_LOCATION, "012345678901", seq, &body, None).unwrap();
            let frame = extract_one(&framed);
            let out = session.handle_frame(frame, t0, &registry, &bus).await;
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].message_id, MSG_LOCATION_ACK);
        }

        let ticked = session.tick(t0, &registry).await;
        let queries: Vec<_> = ticked.iter().filter(|o| o.message_id == MSG_LIST_QUERY).collect();
        assert_eq!(queries.len(), 1);
        assert_eq!(
            queries[0].body,
            messages::build_list_query(0xFF, 0xFF, None, None)
        );

        // No second query inside the cooldown window, even with more ticks.
        let ticked2 = session.tick(t0 + Duration::from_secs(5), &registry).await;
        assert!(ticked2.iter().all(|o| o.message_id != MSG_LIST_QUERY));
    }

    /// S4 - Fragmented stored-video list.
    #[tokio::test]
    async fn s4_fragmented_list_reassembles_and_acks_once() {
        let registry = Registry::new();
        let bus = FrameBus::new(8);
        let mut session = Session::new(1, ip(), SessionConfig::default());
        let t0 = Instant::now();

        let (cmd_tx, _cmd_rx) = tokio::sync::mpsc::channel(1);
        registry.register_new(1, ip(), cmd_tx).await;

        let entries = [
            StoredVideoEntry {
                channel: 1,
                start_time_bcd: [0x22, 0x01, 0x04, 0x10, 0x00, 0x00],
                end_time_bcd: [0x22, 0x01, 0x04, 0x11, 0x00, 0x00],
                alarm_mask: 0,
                video_type: 0,
            },
            StoredVideoEntry {
                channel: 2,
                start_time_bcd: [0x22, 0x01, 0x04, 0x12, 0x00, 0x00],
                end_time_bcd: [0x22, 0x01, 0x04, 0x13, 0x00, 0x00],
                alarm_mask: 0,
                video_type: 0,
            },
            StoredVideoEntry {
                channel: 1,
                start_time_bcd: [0x22, 0x01, 0x04, 0x14, 0x00, 0x00],
                end_time_bcd: [0x22, 0x01, 0x04, 0x15, 0x00, 0x00],
                alarm_mask: 0,
                video_type: 0,
            },
        ];
        let mut all_bytes = Vec::new();
        for e in &entries {
            e.write(&mut all_bytes);
        }
        assert_eq!(all_bytes.len(), 54);
        let (chunk_b, chunk_c) = all_bytes.split_at(30);

        // Frame A: init marker.
        let init_body = [0x00, 0x03, 0x00, 0x00, 0x00, 0x00];
        let frame_a = extract_one(&codec::build(messages::MSG_1205, "012345678901", 10, &init_body, None).unwrap());
        let out_a = session.handle_frame(frame_a, t0, &registry, &bus).await;
        assert!(out_a.is_empty());

        // Frame B: first continuation.
        let frame_b = extract_one(&codec::build(messages::MSG_1205, "012345678901", 11, chunk_b, None).unwrap());
        let out_b = session.handle_frame(frame_b, t0, &registry, &bus).await;
        assert!(out_b.is_empty());

        // Frame C: final continuation completes the assembly.
        let frame_c = extract_one(&codec::build(messages::MSG_1205, "012345678901", 12, chunk_c, None).unwrap());
        let out_c = session.handle_frame(frame_c, t0, &registry, &bus).await;
        assert_eq!(out_c.len(), 1);
        assert_eq!(out_c[0].message_id, MSG_GENERAL_ACK);
        let ack = messages::parse_general_ack(&out_c[0].body).unwrap();
        assert_eq!(ack.reply_id, MSG_LIST_QUERY);
        assert_eq!(ack.result, AckResult::Ok);

        assert_eq!(session.stored_videos(), &entries);
        let snapshot = registry.snapshot("012345678901").await.unwrap();
        assert_eq!(snapshot.stored_videos, entries);
    }

    /// S5 - Live video frame reassembly.
    #[tokio::test]
    async fn s5_live_video_frame_reassembly() {
        let registry = Registry::new();
        let bus = FrameBus::new(8);
        let sub = bus.subscribe(SubscriptionFilter::all()).await;
        let mut session = Session::new(1, ip(), SessionConfig::default());
        let t0 = Instant::now();

        for (package_type, payload) in [(0u8, b"P0".to_vec()), (1, b"P1".to_vec()), (2, b"P2".to_vec())] {
            let mut body = vec![1u8, 7, package_type];
            body.extend_from_slice(&[0x22, 0x01, 0x04, 0x15, 0x30, 0x00]);
            body.extend_from_slice(&0u16.to_be_bytes());
            body.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            body.extend_from_slice(&payload);
            let framed = codec::build(MSG_VIDEO_DATA_1, "012345678901", 1, &body, None).unwrap();
            let frame = extract_one(&framed);
            session.handle_frame(frame, t0, &registry, &bus).await;
        }

        let event = sub.recv().await;
        assert_eq!(event.payload, b"P0P1P2");
        assert_eq!(event.data_type, 7);

        // A fourth frame at the same timestamp with package_type=start begins
        // a fresh chain rather than appending to the destroyed one.
        let mut body = vec![1u8, 7, 0u8];
        body.extend_from_slice(&[0x22, 0x01, 0x04, 0x15, 0x30, 0x00]);
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(b"P3");
        let framed = codec::build(MSG_VIDEO_DATA_1, "012345678901", 1, &body, None).unwrap();
        let frame = extract_one(&framed);
        session.handle_frame(frame, t0, &registry, &bus).await;

        // A bare `start` with no matching `end` never publishes.
        let no_event = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(no_event.is_err());
    }

    /// S6 - Negotiation retry, then silence once data arrives.
    #[tokio::test]
    async fn s6_negotiation_retries_then_settles_on_data() {
        let registry = Registry::new();
        let bus = FrameBus::new(8);
        let mut session = Session::new(1, ip(), SessionConfig::default());
        session.lifecycle = crate::session::LifecycleState::Authed;
        let t0 = Instant::now();

        let first = session.tick(t0, &registry).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message_id, MSG_VIDEO_REQUEST);

        let ack_body = messages::build_general_ack(GeneralAck {
            reply_seq: 0,
            reply_id: MSG_VIDEO_REQUEST,
            result: AckResult::Ok,
        });
        let framed = codec::build(MSG_GENERAL_ACK, "012345678901", 2, &ack_body, None).unwrap();
        let ack_frame = extract_one(&framed);
        session.handle_frame(ack_frame, t0, &registry, &bus).await;

        // 5s pass with no data: retry to the next candidate config.
        let t1 = t0 + Duration::from_secs(6);
        let retry = session.tick(t1, &registry).await;
        assert!(retry.iter().any(|o| o.message_id == MSG_VIDEO_REQUEST));
        assert_eq!(session.video_nego, crate::session::VideoNegState::Requested(1));

        // A data packet arriving now settles negotiation; a further 5s tick
        // must not re-fire 0x9101 again.
        let mut body = vec![0u8, 1, 2u8]; // channel 0, data_type 1, package_type=end
        body.extend_from_slice(&[0x22, 0x01, 0x04, 0x15, 0x30, 0x00]);
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&1u16.to_be_bytes());
        body.push(0xAA);
        let framed = codec::build(MSG_VIDEO_DATA_1, "012345678901", 3, &body, None).unwrap();
        let data_frame = extract_one(&framed);
        session.handle_frame(data_frame, t1, &registry, &bus).await;

        let t2 = t1 + Duration::from_secs(6);
        let after = session.tick(t2, &registry).await;
        assert!(after.iter().all(|o| o.message_id != MSG_VIDEO_REQUEST));
    }
}
