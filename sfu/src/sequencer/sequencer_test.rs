use super::*;

#[test]
fn test_push_and_lookup() {
    let mut s = Sequencer::new();
    for i in 0u16..10 {
        let sn = 100 + i;
        let off = 10 + i;
        s.push(sn, off, 1000 + i as u32, 1, true);
    }

    let metas = s.get_seq_no_pairs(&[12, 15]);
    assert_eq!(metas.len(), 2);
    assert_eq!(metas[0].source_seq_no, 102);
    assert_eq!(metas[0].target_seq_no, 12);
    assert_eq!(metas[0].timestamp, 1002);
    assert_eq!(metas[0].layer, 1);
    assert_eq!(metas[1].source_seq_no, 105);
}

#[test]
fn test_unknown_seq_ignored() {
    let mut s = Sequencer::new();
    s.push(100, 10, 1000, 0, true);
    // 11 was never sent; 12 advanced the head but skipped 11's slot
    s.push(102, 12, 1200, 0, true);
    let metas = s.get_seq_no_pairs(&[11]);
    assert!(metas.is_empty());
}

#[test]
fn test_out_of_order_push() {
    let mut s = Sequencer::new();
    s.push(100, 10, 1000, 0, true);
    s.push(103, 13, 1300, 0, true);
    // late retransmits fill their original slots
    s.push(101, 11, 1100, 0, false);
    s.push(102, 12, 1200, 0, false);

    let metas = s.get_seq_no_pairs(&[11, 12, 13]);
    assert_eq!(metas.len(), 3);
    assert_eq!(metas[0].source_seq_no, 101);
    assert_eq!(metas[2].source_seq_no, 103);
}

#[test]
fn test_renack_capped() {
    let mut s = Sequencer::new();
    s.push(100, 10, 1000, 0, true);
    for _ in 0..3 {
        assert_eq!(s.get_seq_no_pairs(&[10]).len(), 1);
    }
    assert!(s.get_seq_no_pairs(&[10]).is_empty());
}

#[test]
fn test_vp8_meta_round_trip() {
    let mut s = Sequencer::new();
    let meta = s.push(100, 10, 1000, 2, true).unwrap();
    meta.set_vp8_payload_meta(7, 0x1fff);
    let metas = s.get_seq_no_pairs(&[10]);
    assert_eq!(metas[0].vp8_payload_meta(), (7, 0x1fff));
}

#[test]
fn test_wrap_around_target_sn() {
    let mut s = Sequencer::new();
    for i in 0u16..6 {
        let off = 65533u16.wrapping_add(i);
        s.push(500 + i, off, 2000 + i as u32, 0, true);
    }
    let metas = s.get_seq_no_pairs(&[65534, 0, 2]);
    assert_eq!(metas.len(), 3);
    assert_eq!(metas[0].source_seq_no, 501);
    assert_eq!(metas[1].source_seq_no, 503);
    assert_eq!(metas[2].source_seq_no, 505);
}
