use super::*;

use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;
use util::marshal::Marshal;

use buffer::{Options, RtcpFeedback, RtpParameters};

use crate::mock::MockTrackWriter;
use crate::simulcast::SimulcastConfig;
use crate::track::TrackLocalContext;

const WAIT: Duration = Duration::from_secs(2);

fn vp8_codec() -> RtpCodecCapability {
    RtpCodecCapability {
        mime_type: "video/VP8".to_string(),
        clock_rate: 90000,
        rtcp_feedback: vec![RtcpFeedback {
            typ: "nack".to_string(),
            parameter: String::new(),
        }],
        ..Default::default()
    }
}

fn remote_track(rid: &str, ssrc: u32) -> RemoteTrack {
    RemoteTrack {
        id: "cam".to_string(),
        stream_id: "alice-stream".to_string(),
        rid: rid.to_string(),
        ssrc,
        codec: vp8_codec(),
        params: RtpParameters {
            header_extensions: vec![],
            codecs: vec![vp8_codec()],
        },
    }
}

fn vp8_raw(ssrc: u32, sn: u16, ts: u32, key_frame: bool) -> Vec<u8> {
    let pkt = rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 96,
            sequence_number: sn,
            timestamp: ts,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::from(vec![0x10, if key_frame { 0x00 } else { 0x01 }, 0xaa, 0xbb]),
    };
    pkt.marshal().unwrap().to_vec()
}

async fn new_buffer(ssrc: u32) -> Arc<Buffer> {
    let video_pool = Arc::new(BytePool::new(100 * 1500));
    let audio_pool = Arc::new(BytePool::new(25 * 1500));
    let buff = Arc::new(Buffer::new(ssrc, video_pool, audio_pool));
    buff.bind(
        RtpParameters {
            header_extensions: vec![],
            codecs: vec![vp8_codec()],
        },
        Options::default(),
    )
    .await;
    buff
}

fn new_receiver(
    track: &RemoteTrack,
) -> (
    Arc<TrackReceiver>,
    mpsc::Receiver<Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>>,
) {
    let (tx, rx) = mpsc::channel(10);
    let recv = TrackReceiver::new(track, "alice".to_string(), tx);
    (recv, rx)
}

async fn bind_down_track(
    recv: &Arc<TrackReceiver>,
    ssrc: u32,
) -> (Arc<DownTrack>, Arc<MockTrackWriter>) {
    let recv_dyn: Arc<dyn Receiver + Send + Sync> = Arc::clone(recv) as _;
    let dt = Arc::new(DownTrack::new(
        vp8_codec(),
        Arc::downgrade(&recv_dyn),
        "bob".to_string(),
        "cam".to_string(),
        "alice-stream".to_string(),
        SimulcastConfig::default(),
    ));
    let writer = MockTrackWriter::new();
    dt.bind(TrackLocalContext {
        id: "cam".to_string(),
        params: Default::default(),
        ssrc,
        payload_type: 100,
        write_stream: Arc::clone(&writer) as Arc<dyn crate::track::TrackLocalWriter>,
    })
    .await;
    recv.add_down_track(Arc::clone(&dt), false).await;
    (dt, writer)
}

#[tokio::test]
async fn test_fan_out_rewrites_and_orders() {
    let track = remote_track("", 500);
    let (recv, _rtcp_rx) = new_receiver(&track);
    let buff = new_buffer(500).await;
    recv.add_up_track(track.clone(), Arc::clone(&buff), false)
        .await;

    let (_dt, writer) = bind_down_track(&recv, 0xbb00_0001).await;
    let mut out = writer.subscribe();

    buff.write(&vp8_raw(500, 100, 9_000, true)).await.unwrap();
    for sn in 101u16..105 {
        buff.write(&vp8_raw(500, sn, 9_000 + sn as u32, false))
            .await
            .unwrap();
    }

    let mut last_sn = None;
    for _ in 0..5 {
        let pkt = timeout(WAIT, out.recv()).await.unwrap().unwrap();
        assert_eq!(pkt.header.ssrc, 0xbb00_0001);
        assert_eq!(pkt.header.payload_type, 100);
        if let Some(prev) = last_sn {
            assert_eq!(pkt.header.sequence_number.wrapping_sub(prev), 1);
        }
        last_sn = Some(pkt.header.sequence_number);
    }

    recv.close_tracks().await;
}

#[tokio::test]
async fn test_pending_switch_commits_on_keyframe() {
    let track_low = remote_track("q", 501);
    let track_mid = remote_track("h", 502);
    let (recv, mut rtcp_rx) = new_receiver(&track_low);

    let buff_low = new_buffer(501).await;
    let buff_mid = new_buffer(502).await;
    recv.add_up_track(track_low.clone(), Arc::clone(&buff_low), false)
        .await;
    recv.add_up_track(track_mid.clone(), Arc::clone(&buff_mid), false)
        .await;
    assert!(recv.is_simulcast());
    assert!(recv.has_spatial_layer(0) && recv.has_spatial_layer(1));

    let (dt, writer) = bind_down_track(&recv, 0xbb00_0002).await;
    assert_eq!(dt.current_spatial_layer(), 0);
    let mut out = writer.subscribe();

    buff_low.write(&vp8_raw(501, 10, 1_000, true)).await.unwrap();
    let first = timeout(WAIT, out.recv()).await.unwrap().unwrap();

    dt.switch_spatial_layer(1, false).await.unwrap();
    assert_eq!(dt.target_spatial_layer(), 1);

    // a delta frame on the target layer cannot commit; the receiver nags
    // the publisher for a keyframe instead
    buff_mid
        .write(&vp8_raw(502, 800, 2_000, false))
        .await
        .unwrap();
    let pkts = timeout(WAIT, rtcp_rx.recv()).await.unwrap().unwrap();
    assert!(pkts[0]
        .as_any()
        .downcast_ref::<PictureLossIndication>()
        .is_some());

    buff_mid
        .write(&vp8_raw(502, 801, 3_000, true))
        .await
        .unwrap();
    let switched = timeout(WAIT, out.recv()).await.unwrap().unwrap();
    assert_eq!(dt.current_spatial_layer(), 1);
    // contiguous with the packet sent from the old layer
    assert_eq!(
        switched.header.sequence_number,
        first.header.sequence_number.wrapping_add(1)
    );
    // the track lives in exactly one slot
    assert_eq!(recv.down_tracks[0].load().len(), 0);
    assert_eq!(recv.down_tracks[1].load().len(), 1);
    {
        let state = recv.write_state.lock().await;
        assert!(state.pending_tracks.iter().all(|p| p.is_empty()));
    }

    recv.close_tracks().await;
}

#[tokio::test]
async fn test_dying_down_track_is_removed() {
    let track = remote_track("", 503);
    let (recv, _rtcp_rx) = new_receiver(&track);
    let buff = new_buffer(503).await;
    recv.add_up_track(track.clone(), Arc::clone(&buff), false)
        .await;

    let (dt, writer) = bind_down_track(&recv, 0xbb00_0003).await;
    let (closed_tx, mut closed_rx) = mpsc::channel::<()>(1);
    dt.on_close(Box::new(move || {
        let tx = closed_tx.clone();
        Box::pin(async move {
            let _ = tx.send(()).await;
        })
    }))
    .await;

    let mut out = writer.subscribe();
    buff.write(&vp8_raw(503, 10, 1_000, true)).await.unwrap();
    timeout(WAIT, out.recv()).await.unwrap().unwrap();

    writer.kill();
    buff.write(&vp8_raw(503, 11, 2_000, false)).await.unwrap();

    timeout(WAIT, closed_rx.recv()).await.unwrap().unwrap();
    assert_eq!(recv.down_tracks[0].load().len(), 0);

    recv.close_tracks().await;
}

#[tokio::test]
async fn test_nack_retransmits_from_bucket() {
    let track = remote_track("", 504);
    let (recv, _rtcp_rx) = new_receiver(&track);
    let buff = new_buffer(504).await;
    recv.add_up_track(track.clone(), Arc::clone(&buff), false)
        .await;

    let (dt, writer) = bind_down_track(&recv, 0xbb00_0004).await;
    let mut out = writer.subscribe();

    buff.write(&vp8_raw(504, 40, 1_000, true)).await.unwrap();
    for sn in 41u16..45 {
        buff.write(&vp8_raw(504, sn, 1_000 + sn as u32, false))
            .await
            .unwrap();
    }
    let mut delivered = Vec::new();
    for _ in 0..5 {
        delivered.push(timeout(WAIT, out.recv()).await.unwrap().unwrap());
    }

    // the subscriber claims it lost the third packet
    let lost = &delivered[2];
    let nack = rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack {
        sender_ssrc: 1,
        media_ssrc: 0xbb00_0004,
        nacks: vec![
            rtcp::transport_feedbacks::transport_layer_nack::NackPair {
                packet_id: lost.header.sequence_number,
                lost_packets: 0,
            },
        ],
    };
    let raw = nack.marshal().unwrap();
    dt.handle_rtcp(&raw).await.unwrap();

    let rtx = timeout(WAIT, out.recv()).await.unwrap().unwrap();
    assert_eq!(rtx.header.sequence_number, lost.header.sequence_number);
    assert_eq!(rtx.header.timestamp, lost.header.timestamp);
    assert_eq!(rtx.header.ssrc, 0xbb00_0004);
    assert_eq!(rtx.payload, lost.payload);

    recv.close_tracks().await;
}
