use super::*;

#[test]
fn test_push_is_idempotent_and_sorted() {
    let mut q = NackQueue::new();
    q.push(105);
    q.push(101);
    q.push(103);
    q.push(101);
    let (pairs, ask_kf) = q.pairs(120);
    assert!(!ask_kf);
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].packet_id, 101);
    // 103 = base+2 -> bit 1, 105 = base+4 -> bit 3
    assert_eq!(pairs[0].lost_packets, 0b1010);
}

#[test]
fn test_remove_on_arrival() {
    let mut q = NackQueue::new();
    q.push(101);
    q.push(102);
    q.remove(101);
    let (pairs, _) = q.pairs(120);
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].packet_id, 102);
    assert_eq!(pairs[0].lost_packets, 0);
}

#[test]
fn test_fresh_entries_held_back() {
    let mut q = NackQueue::new();
    q.push(118);
    q.push(119);
    q.push(100);
    let (pairs, _) = q.pairs(120);
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].packet_id, 100);
}

#[test]
fn test_pair_split_on_large_gap() {
    let mut q = NackQueue::new();
    q.push(100);
    q.push(117); // > base+16, needs its own pair
    let (pairs, _) = q.pairs(200);
    assert_eq!(pairs.len(), 2);
    assert_eq!(pairs[0].packet_id, 100);
    assert_eq!(pairs[1].packet_id, 117);
}

#[test]
fn test_keyframe_escalation_once_per_seq() {
    let mut q = NackQueue::new();
    q.push(100);
    for _ in 0..MAX_NACK_TIMES {
        let (pairs, ask_kf) = q.pairs(200);
        assert_eq!(pairs.len(), 1);
        assert!(!ask_kf);
    }
    // retries exhausted: exactly one keyframe request, entry dropped
    let (pairs, ask_kf) = q.pairs(200);
    assert!(pairs.is_empty());
    assert!(ask_kf);
    let (pairs, ask_kf) = q.pairs(200);
    assert!(pairs.is_empty());
    assert!(!ask_kf);
}

#[test]
fn test_cache_bounded() {
    let mut q = NackQueue::new();
    for sn in 0..300u32 {
        q.push(sn);
    }
    let (pairs, _) = q.pairs(400);
    let total: usize = pairs
        .iter()
        .map(|p| 1 + p.lost_packets.count_ones() as usize)
        .sum();
    assert!(total <= MAX_NACK_CACHE);
    // oldest entries were evicted first
    assert_eq!(pairs[0].packet_id, 200);
}
