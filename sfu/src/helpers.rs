use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the unix epoch (1970).
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

pub(crate) fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Converts a wall clock instant to the 64 bit NTP format used in sender
/// reports: seconds since 1900 in the high half, binary fraction in the low.
pub fn to_ntp_time(t: SystemTime) -> u64 {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = d.as_secs() + NTP_EPOCH_OFFSET;
    let frac = (u64::from(d.subsec_nanos()) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

/// NTP timestamp to milliseconds since the NTP epoch.
pub fn ntp_to_millis(ntp: u64) -> u64 {
    let secs = ntp >> 32;
    let frac = ntp & 0xffff_ffff;
    secs * 1000 + ((frac * 1000) >> 32)
}

#[cfg(test)]
mod helpers_test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ntp_round_trip() {
        let t = UNIX_EPOCH + Duration::new(1_000_000, 500_000_000);
        let ntp = to_ntp_time(t);
        assert_eq!(ntp >> 32, 1_000_000 + NTP_EPOCH_OFFSET);
        let ms = ntp_to_millis(ntp);
        assert_eq!(ms, (1_000_000 + NTP_EPOCH_OFFSET) * 1000 + 499);
    }
}
