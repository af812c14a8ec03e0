use super::*;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex as TokioMutex;
use util::marshal::Marshal;

use crate::mock::MockTrackWriter;
use crate::sequencer::PacketMeta;
use crate::track::TrackLocalContext;

const DT_SSRC: u32 = 0x7777_0000;

#[derive(Default)]
struct MockReceiver {
    rtcp: TokioMutex<Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>>,
    switches: TokioMutex<Vec<usize>>,
    retransmits: TokioMutex<Vec<Vec<PacketMeta>>>,
    bitrates: [u64; 3],
    max_temporal: [i32; 3],
    available: [bool; 3],
}

impl MockReceiver {
    fn new_arc(bitrates: [u64; 3], available: [bool; 3]) -> Arc<Self> {
        Arc::new(MockReceiver {
            bitrates,
            available,
            max_temporal: [2, 2, 2],
            ..Default::default()
        })
    }

    async fn rtcp_count(&self) -> usize {
        self.rtcp.lock().await.len()
    }
}

#[async_trait]
impl Receiver for MockReceiver {
    fn track_id(&self) -> &str {
        "video"
    }
    fn stream_id(&self) -> &str {
        "stream"
    }
    fn codec(&self) -> crate::track::RtpCodecCapability {
        vp8_codec()
    }
    fn kind(&self) -> crate::track::TrackKind {
        crate::track::TrackKind::Video
    }
    fn ssrc(&self, _layer: usize) -> u32 {
        0x1111
    }
    fn is_simulcast(&self) -> bool {
        true
    }
    fn get_bitrate(&self) -> [u64; 3] {
        self.bitrates
    }
    fn get_max_temporal_layer(&self) -> [i32; 3] {
        self.max_temporal
    }
    fn has_spatial_layer(&self, layer: usize) -> bool {
        layer < 3 && self.available[layer]
    }
    async fn add_down_track(&self, _track: Arc<DownTrack>, _best_quality_first: bool) {}
    async fn switch_down_track(&self, _track: &Arc<DownTrack>, layer: usize) -> Result<()> {
        self.switches.lock().await.push(layer);
        Ok(())
    }
    async fn delete_down_track(&self, _layer: usize, _id: &str) {}
    async fn send_rtcp(&self, pkts: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>) {
        self.rtcp.lock().await.extend(pkts);
    }
    async fn retransmit_packets(
        &self,
        _track: Arc<DownTrack>,
        packets: Vec<PacketMeta>,
    ) -> Result<()> {
        self.retransmits.lock().await.push(packets);
        Ok(())
    }
    async fn get_sender_report_time(&self, _layer: usize) -> (u32, u64) {
        (90_000, 0xe000_0000_0000_0000)
    }
}

fn vp8_codec() -> crate::track::RtpCodecCapability {
    crate::track::RtpCodecCapability {
        mime_type: "video/VP8".to_string(),
        clock_rate: 90000,
        ..Default::default()
    }
}

// Arrival stamps grow in construction order, like wall clock would.
fn next_arrival() -> i64 {
    use std::sync::atomic::AtomicI64;
    static CLOCK: AtomicI64 = AtomicI64::new(0);
    1_700_000_000_000_000_000 + CLOCK.fetch_add(1, Ordering::SeqCst) * 10_000_000
}

fn ext_packet(ssrc: u32, sn: u16, ts: u32, key_frame: bool) -> ExtPacket {
    ExtPacket {
        head: true,
        cycle: 0,
        arrival: next_arrival(),
        packet: rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: 96,
                sequence_number: sn,
                timestamp: ts,
                ssrc,
                ..Default::default()
            },
            payload: Bytes::from(vec![0x10, if key_frame { 0x00 } else { 0x01 }, 0xaa]),
        },
        key_frame,
        payload: Vp8::default(),
    }
}

fn vp8_ext_packet(ssrc: u32, sn: u16, ts: u32, pic_id: u16, tid: u8, key_frame: bool) -> ExtPacket {
    // X + I + L + T, 15-bit picture id so rewrites stay in-place
    let payload = vec![
        0x90,
        0xe0,
        0x80 | ((pic_id >> 8) as u8 & 0x7f),
        (pic_id & 0xff) as u8,
        0x01, // TL0PICIDX
        tid << 6,
        if key_frame { 0x00 } else { 0x01 },
        0xaa,
    ];
    let mut vp8 = Vp8::default();
    vp8.unmarshal(&payload).unwrap();
    assert_eq!(vp8.picture_id, pic_id);
    ExtPacket {
        head: true,
        cycle: 0,
        arrival: next_arrival(),
        packet: rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: 96,
                sequence_number: sn,
                timestamp: ts,
                ssrc,
                ..Default::default()
            },
            payload: Bytes::from(payload),
        },
        key_frame,
        payload: vp8,
    }
}

async fn new_simple_track(
    recv: &Arc<MockReceiver>,
) -> (Arc<DownTrack>, Arc<MockTrackWriter>) {
    let recv_dyn: Arc<dyn Receiver + Send + Sync> = Arc::clone(recv) as _;
    let dt = Arc::new(DownTrack::new(
        vp8_codec(),
        Arc::downgrade(&recv_dyn),
        "peer-a".to_string(),
        "video".to_string(),
        "stream".to_string(),
        SimulcastConfig::default(),
    ));
    let writer = MockTrackWriter::new();
    dt.bind(TrackLocalContext {
        id: "video".to_string(),
        params: Default::default(),
        ssrc: DT_SSRC,
        payload_type: 100,
        write_stream: Arc::clone(&writer) as Arc<dyn TrackLocalWriter>,
    })
    .await;
    (dt, writer)
}

#[tokio::test]
async fn test_simple_rewrite_holds_until_keyframe() {
    let recv = MockReceiver::new_arc([0; 3], [true, false, false]);
    let (dt, writer) = new_simple_track(&recv).await;

    // bound video starts resynced: delta frames are withheld, PLI goes up
    dt.write_rtp(&ext_packet(0x1111, 100, 10_000, false), 0)
        .await
        .unwrap();
    assert!(writer.written().is_empty());
    assert_eq!(recv.rtcp_count().await, 1);

    dt.write_rtp(&ext_packet(0x1111, 101, 13_000, true), 0)
        .await
        .unwrap();
    for sn in 102u16..106 {
        dt.write_rtp(&ext_packet(0x1111, sn, sn as u32 * 100, false), 0)
            .await
            .unwrap();
    }

    let out = writer.written();
    assert_eq!(out.len(), 5);
    // ssrc and payload type rewritten, sequence numbers shifted by a
    // constant offset with no rollback
    for (i, p) in out.iter().enumerate() {
        assert_eq!(p.header.ssrc, DT_SSRC);
        assert_eq!(p.header.payload_type, 100);
        if i > 0 {
            let diff = p.header.sequence_number.wrapping_sub(out[i - 1].header.sequence_number);
            assert_eq!(diff, 1);
        }
    }
    assert_eq!(out[0].header.sequence_number, 101);
    // payload bytes untouched
    assert_eq!(&out[0].payload[..], &[0x10, 0x00, 0xaa]);
}

#[tokio::test]
async fn test_mute_drops_and_resyncs() {
    let recv = MockReceiver::new_arc([0; 3], [true, false, false]);
    let (dt, writer) = new_simple_track(&recv).await;

    dt.write_rtp(&ext_packet(0x1111, 10, 1000, true), 0)
        .await
        .unwrap();
    assert_eq!(writer.written().len(), 1);

    dt.mute(true);
    dt.write_rtp(&ext_packet(0x1111, 11, 2000, false), 0)
        .await
        .unwrap();
    assert_eq!(writer.written().len(), 1);

    dt.mute(false);
    // resumes only on a keyframe
    dt.write_rtp(&ext_packet(0x1111, 12, 3000, false), 0)
        .await
        .unwrap();
    assert_eq!(writer.written().len(), 1);
    dt.write_rtp(&ext_packet(0x1111, 13, 4000, true), 0)
        .await
        .unwrap();
    let out = writer.written();
    assert_eq!(out.len(), 2);
    // gap closed: output stays contiguous over the muted stretch
    assert_eq!(
        out[1].header.sequence_number,
        out[0].header.sequence_number.wrapping_add(1)
    );
}

#[tokio::test]
async fn test_nack_translated_through_sequencer() {
    let recv = MockReceiver::new_arc([0; 3], [true, false, false]);
    let (dt, writer) = new_simple_track(&recv).await;

    for sn in 50u16..60 {
        dt.write_rtp(&ext_packet(0x1111, sn, sn as u32 * 90, sn == 50), 0)
            .await
            .unwrap();
    }
    let out = writer.written();
    let nacked: Vec<u16> = out[2..5].iter().map(|p| p.header.sequence_number).collect();

    let nack = TransportLayerNack {
        sender_ssrc: 1,
        media_ssrc: DT_SSRC,
        nacks: vec![
            rtcp::transport_feedbacks::transport_layer_nack::NackPair {
                packet_id: nacked[0],
                lost_packets: 0b11,
            },
        ],
    };
    let raw = nack.marshal().unwrap();
    dt.handle_rtcp(&raw).await.unwrap();

    let retransmits = recv.retransmits.lock().await;
    assert_eq!(retransmits.len(), 1);
    let metas = &retransmits[0];
    assert_eq!(metas.len(), 3);
    assert_eq!(metas[0].source_seq_no, 52);
    assert_eq!(metas[1].source_seq_no, 53);
    assert_eq!(metas[2].source_seq_no, 54);
    assert_eq!(metas[0].target_seq_no, nacked[0]);
}

#[tokio::test]
async fn test_pli_forwarded_with_source_ssrc() {
    let recv = MockReceiver::new_arc([0; 3], [true, false, false]);
    let (dt, _writer) = new_simple_track(&recv).await;

    dt.write_rtp(&ext_packet(0x1111, 10, 1000, true), 0)
        .await
        .unwrap();

    let pli = PictureLossIndication {
        sender_ssrc: 9,
        media_ssrc: DT_SSRC,
    };
    let raw = pli.marshal().unwrap();
    dt.handle_rtcp(&raw).await.unwrap();

    let rtcp = recv.rtcp.lock().await;
    let fwd = rtcp
        .iter()
        .find_map(|p| p.as_any().downcast_ref::<PictureLossIndication>())
        .unwrap();
    // media ssrc rewritten to the upstream source
    assert_eq!(fwd.media_ssrc, 0x1111);
    assert_eq!(fwd.sender_ssrc, DT_SSRC);
}

async fn new_simulcast_track(
    recv: &Arc<MockReceiver>,
    temporal: bool,
) -> (Arc<DownTrack>, Arc<MockTrackWriter>) {
    let recv_dyn: Arc<dyn Receiver + Send + Sync> = Arc::clone(recv) as _;
    let dt = Arc::new(DownTrack::new(
        vp8_codec(),
        Arc::downgrade(&recv_dyn),
        "peer-a".to_string(),
        "video".to_string(),
        "stream".to_string(),
        SimulcastConfig {
            best_quality_first: true,
            enable_temporal_layer: temporal,
            ..Default::default()
        },
    ));
    dt.set_track_type(DownTrackType::SimulcastDownTrack);
    dt.set_initial_layers(2, 2);
    dt.set_max_layers(2, 2);
    dt.set_last_ssrc(0x2222);
    let writer = MockTrackWriter::new();
    dt.bind(TrackLocalContext {
        id: "video".to_string(),
        params: Default::default(),
        ssrc: DT_SSRC,
        payload_type: 100,
        write_stream: Arc::clone(&writer) as Arc<dyn TrackLocalWriter>,
    })
    .await;
    std::mem::forget(recv_dyn);
    (dt, writer)
}

#[tokio::test]
async fn test_simulcast_downswitch_keeps_stream_contiguous() {
    let recv = MockReceiver::new_arc([900_000, 450_000, 150_000], [true, true, true]);
    let (dt, writer) = new_simulcast_track(&recv, false).await;

    // high layer running
    dt.write_rtp(&ext_packet(0x2222, 1000, 90_000, true), 2)
        .await
        .unwrap();
    for sn in 1001u16..1005 {
        dt.write_rtp(&ext_packet(0x2222, sn, 90_000 + sn as u32, false), 2)
            .await
            .unwrap();
    }
    assert_eq!(writer.written().len(), 5);

    // 30% loss reported: request a downswitch
    let rr = ReceiverReport {
        reports: vec![rtcp::reception_report::ReceptionReport {
            ssrc: DT_SSRC,
            fraction_lost: 77,
            ..Default::default()
        }],
        ..Default::default()
    };
    let raw = rr.marshal().unwrap();
    dt.handle_rtcp(&raw).await.unwrap();
    assert_eq!(*recv.switches.lock().await, vec![1]);
    assert_eq!(dt.target_spatial_layer(), 1);
    assert_eq!(dt.current_spatial_layer(), 2);

    // receiver commits on the next keyframe of layer 1
    dt.switch_spatial_layer_done(1);
    // non-target leftovers from the old layer are dropped
    dt.write_rtp(&ext_packet(0x2222, 1005, 95_000, false), 2)
        .await
        .unwrap();
    assert_eq!(writer.written().len(), 5);

    dt.write_rtp(&ext_packet(0x3333, 500, 40_000, true), 1)
        .await
        .unwrap();
    for sn in 501u16..504 {
        dt.write_rtp(&ext_packet(0x3333, sn, 40_000 + sn as u32, false), 1)
            .await
            .unwrap();
    }

    let out = writer.written();
    assert_eq!(out.len(), 9);
    for (i, p) in out.iter().enumerate() {
        assert_eq!(p.header.ssrc, DT_SSRC);
        if i > 0 {
            // monotonic, no rollback, single-step across the switch
            let diff = p.header.sequence_number.wrapping_sub(out[i - 1].header.sequence_number);
            assert_eq!(diff, 1, "packet {i}");
            let ts_diff = p.header.timestamp.wrapping_sub(out[i - 1].header.timestamp);
            assert!(ts_diff < 1 << 31, "timestamp rollback at {i}");
        }
    }
    // the packet at the switch point is the layer-1 keyframe
    assert!(out[5].payload[1] & 0x01 == 0);
}

#[tokio::test]
async fn test_simulcast_waits_for_keyframe_and_asks() {
    let recv = MockReceiver::new_arc([0; 3], [true, true, true]);
    let (dt, writer) = new_simulcast_track(&recv, false).await;

    // resync active: a delta frame cannot start the stream
    dt.write_rtp(&ext_packet(0x2222, 1, 1000, false), 2)
        .await
        .unwrap();
    assert!(writer.written().is_empty());
    assert!(recv.rtcp_count().await >= 1);

    dt.write_rtp(&ext_packet(0x2222, 2, 2000, true), 2)
        .await
        .unwrap();
    assert_eq!(writer.written().len(), 1);
}

#[tokio::test]
async fn test_upswitch_requires_headroom_and_availability() {
    let recv = MockReceiver::new_arc([150_000, 450_000, 900_000], [true, true, false]);
    let (dt, _writer) = new_simulcast_track(&recv, false).await;
    dt.set_initial_layers(1, 2);
    dt.set_last_ssrc(0x2222);
    dt.write_rtp(&ext_packet(0x2222, 1, 1000, true), 1)
        .await
        .unwrap();

    // clean link, plenty of estimate, but layer 2 is not available
    let remb = ReceiverEstimatedMaximumBitrate {
        sender_ssrc: 1,
        bitrate: 2_000_000.0,
        ssrcs: vec![DT_SSRC],
    };
    let raw = remb.marshal().unwrap();
    dt.handle_rtcp(&raw).await.unwrap();
    assert!(recv.switches.lock().await.is_empty());
}

#[tokio::test]
async fn test_vp8_picture_id_continuity_across_resume() {
    let recv = MockReceiver::new_arc([0; 3], [true, true, true]);
    let (dt, writer) = new_simulcast_track(&recv, true).await;

    // first keyframe anchors at picture id 100
    dt.write_rtp(&vp8_ext_packet(0x2222, 10, 1000, 100, 0, true), 2)
        .await
        .unwrap();
    dt.write_rtp(&vp8_ext_packet(0x2222, 11, 2000, 101, 0, false), 2)
        .await
        .unwrap();

    // upstream stops and resumes with a reset picture id on a new ssrc
    dt.set_initial_layers(2, 2);
    dt.write_rtp(&vp8_ext_packet(0x4444, 900, 50_000, 5, 0, true), 2)
        .await
        .unwrap();
    dt.write_rtp(&vp8_ext_packet(0x4444, 901, 51_000, 6, 0, false), 2)
        .await
        .unwrap();

    let out = writer.written();
    assert_eq!(out.len(), 4);
    let pic_ids: Vec<u16> = out
        .iter()
        .map(|p| {
            let mut vp8 = Vp8::default();
            vp8.unmarshal(&p.payload).unwrap();
            vp8.picture_id
        })
        .collect();
    // rewritten ids keep counting across the reset
    assert_eq!(pic_ids, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_vp8_temporal_filter_drops_and_stays_gapless() {
    let recv = MockReceiver::new_arc([0; 3], [true, true, true]);
    let (dt, writer) = new_simulcast_track(&recv, true).await;
    // only temporal layer 0 wanted
    dt.set_initial_layers(2, 0);

    dt.write_rtp(&vp8_ext_packet(0x2222, 100, 1000, 50, 0, true), 2)
        .await
        .unwrap();
    dt.write_rtp(&vp8_ext_packet(0x2222, 101, 2000, 51, 1, false), 2)
        .await
        .unwrap(); // dropped
    dt.write_rtp(&vp8_ext_packet(0x2222, 102, 3000, 52, 0, false), 2)
        .await
        .unwrap();

    let out = writer.written();
    assert_eq!(out.len(), 2);
    assert_eq!(
        out[1].header.sequence_number,
        out[0].header.sequence_number.wrapping_add(1)
    );
}

#[tokio::test]
async fn test_sender_report_extrapolates() {
    let recv = MockReceiver::new_arc([0; 3], [true, false, false]);
    let (dt, _writer) = new_simple_track(&recv).await;
    dt.write_rtp(&ext_packet(0x1111, 10, 1000, true), 0)
        .await
        .unwrap();

    let sr = dt.create_sender_report().await.unwrap();
    assert_eq!(sr.ssrc, DT_SSRC);
    assert_eq!(sr.packet_count, 1);
    assert!(sr.ntp_time > 0xe000_0000_0000_0000);

    let sdes = dt.create_sdes_chunk();
    assert_eq!(sdes.source, DT_SSRC);
    assert_eq!(&sdes.items[0].text[..], b"stream");
}
