use super::*;

use bytes::Bytes;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use util::marshal::Marshal;

use crate::params::{RtcpFeedback, RtpCodecCapability, RtpHeaderExtensionParameter};

const SSRC: u32 = 0x1234_5678;

fn new_buffer() -> Arc<Buffer> {
    let video_pool = Arc::new(BytePool::new(100 * crate::bucket::MAX_PKT_SIZE));
    let audio_pool = Arc::new(BytePool::new(25 * crate::bucket::MAX_PKT_SIZE));
    Arc::new(Buffer::new(SSRC, video_pool, audio_pool))
}

fn vp8_params(feedback: &[(&str, &str)], exts: &[(&str, u8)]) -> RtpParameters {
    RtpParameters {
        header_extensions: exts
            .iter()
            .map(|(uri, id)| RtpHeaderExtensionParameter {
                uri: uri.to_string(),
                id: *id,
            })
            .collect(),
        codecs: vec![RtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            rtcp_feedback: feedback
                .iter()
                .map(|(t, p)| RtcpFeedback {
                    typ: t.to_string(),
                    parameter: p.to_string(),
                })
                .collect(),
            ..Default::default()
        }],
    }
}

fn vp8_packet(sn: u16, ts: u32, key_frame: bool) -> Vec<u8> {
    let first_payload_octet = if key_frame { 0x00 } else { 0x01 };
    let pkt = rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 96,
            sequence_number: sn,
            timestamp: ts,
            ssrc: SSRC,
            ..Default::default()
        },
        payload: Bytes::from(vec![0x10, first_payload_octet, 0xaa, 0xbb]),
    };
    pkt.marshal().unwrap().to_vec()
}

#[tokio::test]
async fn test_ordered_read_and_keyframe_flag() {
    let buf = new_buffer();
    buf.bind(vp8_params(&[], &[]), Options::default()).await;

    buf.write(&vp8_packet(10, 1000, true)).await.unwrap();
    buf.write(&vp8_packet(11, 2000, false)).await.unwrap();

    let ep = buf.read_extended().await.unwrap();
    assert_eq!(ep.packet.header.sequence_number, 10);
    assert!(ep.key_frame);
    assert!(ep.head);

    let ep = buf.read_extended().await.unwrap();
    assert_eq!(ep.packet.header.sequence_number, 11);
    assert!(!ep.key_frame);

    buf.close().await;
}

#[tokio::test]
async fn test_pending_packets_replayed_on_bind() {
    let buf = new_buffer();
    buf.write(&vp8_packet(5, 500, true)).await.unwrap();
    buf.write(&vp8_packet(6, 600, false)).await.unwrap();

    buf.bind(vp8_params(&[], &[]), Options::default()).await;
    let ep = buf.read_extended().await.unwrap();
    assert_eq!(ep.packet.header.sequence_number, 5);
    let ep = buf.read_extended().await.unwrap();
    assert_eq!(ep.packet.header.sequence_number, 6);

    buf.close().await;
}

#[tokio::test]
async fn test_read_eof_after_close() {
    let buf = new_buffer();
    buf.bind(vp8_params(&[], &[]), Options::default()).await;
    buf.write(&vp8_packet(1, 100, false)).await.unwrap();
    buf.close().await;

    // queued packet still drains, then EOF
    assert!(buf.read_extended().await.is_ok());
    assert_eq!(buf.read_extended().await.unwrap_err(), Error::ErrIoEof);
    assert_eq!(
        buf.write(&vp8_packet(2, 200, false)).await.unwrap_err(),
        Error::ErrIoEof
    );
}

#[tokio::test]
async fn test_gap_pushes_nacks_and_escalates_to_pli() {
    let buf = new_buffer();
    buf.bind(vp8_params(&[("nack", "")], &[]), Options::default())
        .await;

    buf.write(&vp8_packet(100, 1000, true)).await.unwrap();
    // 101..=102 lost
    buf.write(&vp8_packet(103, 4000, false)).await.unwrap();
    buf.write(&vp8_packet(110, 11000, false)).await.unwrap();

    let base = { buf.internal.lock().await.last_report };

    for round in 0..3 {
        let (pkts, _) = {
            let mut b = buf.internal.lock().await;
            b.build_feedback(base + round, SSRC)
        };
        assert_eq!(pkts.len(), 1, "round {round}");
        let nack = pkts[0]
            .as_any()
            .downcast_ref::<TransportLayerNack>()
            .unwrap();
        assert_eq!(nack.media_ssrc, SSRC);
        assert_eq!(nack.nacks.len(), 1);
        assert_eq!(nack.nacks[0].packet_id, 101);
        let missing: Vec<u16> = nack.nacks[0].packet_list();
        assert_eq!(missing, vec![101, 102, 104, 105, 106, 107]);
    }

    // fourth sweep: retries exhausted, exactly one PLI
    let (pkts, _) = {
        let mut b = buf.internal.lock().await;
        b.build_feedback(base + 3, SSRC)
    };
    assert_eq!(pkts.len(), 1);
    let pli = pkts[0]
        .as_any()
        .downcast_ref::<PictureLossIndication>()
        .unwrap();
    assert_eq!(pli.media_ssrc, SSRC);

    let (pkts, _) = {
        let mut b = buf.internal.lock().await;
        b.build_feedback(base + 4, SSRC)
    };
    assert!(pkts.is_empty());

    buf.close().await;
}

#[tokio::test]
async fn test_late_arrival_clears_nack() {
    let buf = new_buffer();
    buf.bind(vp8_params(&[("nack", "")], &[]), Options::default())
        .await;

    buf.write(&vp8_packet(100, 1000, false)).await.unwrap();
    buf.write(&vp8_packet(102, 3000, false)).await.unwrap();
    // the hole arrives late
    buf.write(&vp8_packet(101, 2000, false)).await.unwrap();

    let (pkts, _) = {
        let base = { buf.internal.lock().await.last_report };
        let mut b = buf.internal.lock().await;
        b.build_feedback(base, SSRC)
    };
    assert!(pkts.is_empty());

    buf.close().await;
}

#[tokio::test]
async fn test_reception_report_fraction_lost() {
    let buf = new_buffer();
    buf.bind(vp8_params(&[], &[]), Options::default()).await;

    // 100..=119 with 5 packets missing
    for sn in 100u16..120 {
        if (105..110).contains(&sn) {
            continue;
        }
        buf.write(&vp8_packet(sn, sn as u32 * 100, false))
            .await
            .unwrap();
    }

    let base = { buf.internal.lock().await.last_report };
    let (pkts, bitrate) = {
        let mut b = buf.internal.lock().await;
        b.build_feedback(base + REPORT_DELTA, SSRC)
    };
    assert!(bitrate.unwrap() > 0);
    let rr = pkts
        .iter()
        .find_map(|p| p.as_any().downcast_ref::<ReceiverReport>())
        .unwrap();
    let report = &rr.reports[0];
    assert_eq!(report.ssrc, SSRC);
    assert_eq!(report.total_lost, 5);
    // 5 lost of 20 expected
    assert_eq!(report.fraction_lost, (5u32 * 256 / 20) as u8);
    assert_eq!(report.last_sequence_number, 119);

    buf.close().await;
}

#[tokio::test]
async fn test_remb_generated_without_twcc() {
    let buf = new_buffer();
    buf.bind(
        vp8_params(&[("goog-remb", "")], &[]),
        Options {
            max_bit_rate: 1_000_000,
        },
    )
    .await;

    for sn in 0u16..20 {
        buf.write(&vp8_packet(sn, sn as u32 * 100, false))
            .await
            .unwrap();
    }
    let base = { buf.internal.lock().await.last_report };
    let (pkts, _) = {
        let mut b = buf.internal.lock().await;
        b.build_feedback(base + REPORT_DELTA, SSRC)
    };
    let remb = pkts
        .iter()
        .find_map(|p| p.as_any().downcast_ref::<ReceiverEstimatedMaximumBitrate>())
        .unwrap();
    assert_eq!(remb.ssrcs, vec![SSRC]);
    assert!(remb.bitrate >= 100_000.0);
    assert!(remb.bitrate <= 1_000_000.0);

    buf.close().await;
}

#[tokio::test]
async fn test_twcc_and_audio_level_hooks() {
    let buf = new_buffer();
    let (twcc_tx, mut twcc_rx) = mpsc::channel::<(u16, bool)>(8);
    buf.on_transport_wide_cc(Box::new(move |sn, _t, marker| {
        let tx = twcc_tx.clone();
        Box::pin(async move {
            let _ = tx.send((sn, marker)).await;
        })
    }))
    .await;

    buf.bind(
        vp8_params(&[("transport-cc", "")], &[(TRANSPORT_CC_URI, 5)]),
        Options::default(),
    )
    .await;

    let mut pkt = rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 96,
            sequence_number: 50,
            timestamp: 5000,
            ssrc: SSRC,
            marker: true,
            ..Default::default()
        },
        payload: Bytes::from(vec![0x10, 0x00, 0xaa]),
    };
    let tcc = TransportCcExtension {
        transport_sequence: 777,
    };
    pkt.header
        .set_extension(5, tcc.marshal().unwrap())
        .unwrap();

    buf.write(&pkt.marshal().unwrap()).await.unwrap();
    let (sn, marker) = twcc_rx.recv().await.unwrap();
    assert_eq!(sn, 777);
    assert!(marker);

    buf.close().await;
}

#[tokio::test]
async fn test_audio_level_hook() {
    let audio_pool = Arc::new(BytePool::new(25 * crate::bucket::MAX_PKT_SIZE));
    let video_pool = Arc::new(BytePool::new(100 * crate::bucket::MAX_PKT_SIZE));
    let buf = Arc::new(Buffer::new(SSRC, video_pool, audio_pool));

    let (level_tx, mut level_rx) = mpsc::channel::<u8>(8);
    buf.on_audio_level(Box::new(move |level| {
        let tx = level_tx.clone();
        Box::pin(async move {
            let _ = tx.send(level).await;
        })
    }))
    .await;

    let params = RtpParameters {
        header_extensions: vec![RtpHeaderExtensionParameter {
            uri: SDES_AUDIO_LEVEL_URI.to_string(),
            id: 1,
        }],
        codecs: vec![RtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        }],
    };
    buf.bind(params, Options::default()).await;

    let mut pkt = rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 111,
            sequence_number: 1,
            timestamp: 960,
            ssrc: SSRC,
            ..Default::default()
        },
        payload: Bytes::from(vec![0u8; 50]),
    };
    let ext = AudioLevelExtension {
        level: 30,
        voice: true,
    };
    pkt.header.set_extension(1, ext.marshal().unwrap()).unwrap();

    buf.write(&pkt.marshal().unwrap()).await.unwrap();
    assert_eq!(level_rx.recv().await.unwrap(), 30);

    buf.close().await;
}

#[tokio::test]
async fn test_retransmit_lookup_via_bucket() {
    let buf = new_buffer();
    buf.bind(vp8_params(&[("nack", "")], &[]), Options::default())
        .await;

    let original = vp8_packet(42, 4200, false);
    buf.write(&original).await.unwrap();

    let mut out = vec![0u8; crate::bucket::MAX_PKT_SIZE];
    let n = buf.get_packet(&mut out, 42).await.unwrap();
    assert_eq!(&out[..n], &original[..]);

    assert_eq!(
        buf.get_packet(&mut out, 43).await.unwrap_err(),
        Error::ErrPacketNotFound
    );

    buf.close().await;
}
