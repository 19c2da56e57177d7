//! WIM timestamps: 100-nanosecond ticks since 1601-01-01 00:00:00 UTC.

use filetime::FileTime;

const TICKS_PER_SECOND: u64 = 10_000_000;

/// Seconds between 1601-01-01 and the Unix epoch.
const EPOCH_DIFF_SECONDS: u64 = 11_644_473_600;

const EPOCH_DIFF_TICKS: u64 = EPOCH_DIFF_SECONDS * TICKS_PER_SECOND;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct WimTimestamp(u64);

impl WimTimestamp {
    pub const fn from_ticks(ticks: u64) -> Self {
        WimTimestamp(ticks)
    }

    pub const fn ticks(self) -> u64 {
        self.0
    }

    pub fn from_unix(seconds: i64, nanoseconds: u32) -> Self {
        let ticks = EPOCH_DIFF_TICKS as i64
            + seconds * TICKS_PER_SECOND as i64
            + (nanoseconds / 100) as i64;
        WimTimestamp(ticks.max(0) as u64)
    }

    /// Convert to a [`FileTime`] for application to the filesystem.
    /// Timestamps before the Unix epoch map to negative seconds.
    pub fn to_filetime(self) -> FileTime {
        let rel = self.0 as i64 - EPOCH_DIFF_TICKS as i64;
        let seconds = rel.div_euclid(TICKS_PER_SECOND as i64);
        let nanos = (rel.rem_euclid(TICKS_PER_SECOND as i64) * 100) as u32;
        FileTime::from_unix_time(seconds, nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_epoch_round_trips() {
        let ts = WimTimestamp::from_unix(0, 0);
        assert_eq!(ts.ticks(), EPOCH_DIFF_TICKS);
        let ft = ts.to_filetime();
        assert_eq!(ft.unix_seconds(), 0);
        assert_eq!(ft.nanoseconds(), 0);
    }

    #[test]
    fn sub_second_precision_survives() {
        let ts = WimTimestamp::from_unix(1_600_000_000, 123_456_700);
        let ft = ts.to_filetime();
        assert_eq!(ft.unix_seconds(), 1_600_000_000);
        assert_eq!(ft.nanoseconds(), 123_456_700);
    }

    #[test]
    fn pre_unix_timestamps_go_negative() {
        // 1601-01-01 itself.
        let ft = WimTimestamp::from_ticks(0).to_filetime();
        assert_eq!(ft.unix_seconds(), -(EPOCH_DIFF_SECONDS as i64));
    }
}
