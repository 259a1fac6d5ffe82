//! FAT timestamps and their POSIX-time conversion.

/// A point in time, split FAT-style.
///
/// `year` counts from 1980 and `ms` holds centiseconds, because that is
/// how directory entries store them; everything else is the obvious
/// calendar field.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Timestamp {
    pub ms: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hour: u8,
    pub day: u8,
    pub month: u8,
    /// Years since 1980.
    pub year: u8,
}

const SECONDS_PER_DAY: u32 = 86_400;
const MONTH_DAYS: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

impl Timestamp {
    /// Convert a POSIX timestamp (seconds since 1970-01-01 UTC).
    ///
    /// Leap years are `year % 4 == 0`, which holds for the whole range a
    /// `u32` can express (2000 was a leap year).
    pub fn from_unix(time: u32) -> Self {
        let seconds = (time % 60) as u8;
        let minutes = ((time / 60) % 60) as u8;
        let hour = ((time / 3600) % 24) as u8;

        let mut days = time / SECONDS_PER_DAY;
        let mut year: u32 = 1970;
        loop {
            let year_days = if year % 4 == 0 { 366 } else { 365 };
            if days < year_days {
                break;
            }
            days -= year_days;
            year += 1;
        }

        let mut month = 0usize;
        loop {
            let mut month_days = MONTH_DAYS[month];
            if month == 1 && year % 4 == 0 {
                month_days += 1;
            }
            if days < month_days {
                break;
            }
            days -= month_days;
            month += 1;
        }

        Timestamp {
            ms: 0,
            seconds,
            minutes,
            hour,
            day: days as u8 + 1,
            month: month as u8 + 1,
            year: year.saturating_sub(1980) as u8,
        }
    }

    /// The five on-disk bytes: centiseconds, then the 16-bit time and
    /// 16-bit date fields, little endian.
    ///
    /// Seconds are stored in 2-second units; the odd second moves into
    /// the centiseconds byte.
    pub fn pack(&self) -> [u8; 5] {
        [
            self.ms + 100 * (self.seconds & 1),
            ((self.minutes & 0x07) << 5) | (self.seconds >> 1),
            (self.hour << 3) | (self.minutes >> 3),
            ((self.month & 0x07) << 5) | self.day,
            (self.year << 1) | (self.month >> 3),
        ]
    }

    /// Inverse of [`Self::pack`].
    pub fn unpack(raw: &[u8; 5]) -> Self {
        Timestamp {
            ms: raw[0] % 100,
            seconds: ((raw[1] & 0x1F) << 1) + raw[0] / 100,
            minutes: (raw[1] >> 5) | ((raw[2] & 0x07) << 3),
            hour: raw[2] >> 3,
            day: raw[3] & 0x1F,
            month: (raw[3] >> 5) | ((raw[4] & 0x01) << 3),
            year: raw[4] >> 1,
        }
    }

    /// The 16-bit time and date fields only, as written into the
    /// last-modified slot of a directory entry.
    pub fn serialize_time_date(&self) -> [u8; 4] {
        let packed = self.pack();
        [packed[1], packed[2], packed[3], packed[4]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_a_known_posix_time() {
        // 2001-09-09 01:46:40 UTC
        let ts = Timestamp::from_unix(1_000_000_000);
        assert_eq!(ts.year, 21);
        assert_eq!(ts.month, 9);
        assert_eq!(ts.day, 9);
        assert_eq!(ts.hour, 1);
        assert_eq!(ts.minutes, 46);
        assert_eq!(ts.seconds, 40);
    }

    #[test]
    fn handles_leap_day() {
        // 2020-02-29 00:00:00 UTC
        let ts = Timestamp::from_unix(1_582_934_400);
        assert_eq!(ts.year, 40);
        assert_eq!(ts.month, 2);
        assert_eq!(ts.day, 29);
    }

    #[test]
    fn pack_matches_the_fat_field_layout() {
        let ts = Timestamp {
            ms: 0,
            seconds: 56,
            minutes: 34,
            hour: 12,
            day: 17,
            month: 5,
            year: 41,
        };
        // time = 12 << 11 | 34 << 5 | 28, date = 41 << 9 | 5 << 5 | 17
        assert_eq!(ts.pack(), [0x00, 0x5C, 0x64, 0xB1, 0x52]);
    }

    #[test]
    fn odd_seconds_survive_through_the_centiseconds_byte() {
        let ts = Timestamp {
            ms: 40,
            seconds: 33,
            minutes: 5,
            hour: 7,
            day: 1,
            month: 12,
            year: 46,
        };
        assert_eq!(Timestamp::unpack(&ts.pack()), ts);
    }

    #[test]
    fn agrees_with_chrono() {
        use chrono::{Datelike, TimeZone, Timelike, Utc};
        for &time in &[951_827_696u32, 1_700_000_000, 4_000_000_000] {
            let expected = Utc.timestamp_opt(i64::from(time), 0).unwrap();
            let ts = Timestamp::from_unix(time);
            assert_eq!(u32::from(ts.year) + 1980, expected.year() as u32, "{time}");
            assert_eq!(u32::from(ts.month), expected.month(), "{time}");
            assert_eq!(u32::from(ts.day), expected.day(), "{time}");
            assert_eq!(u32::from(ts.hour), expected.hour(), "{time}");
            assert_eq!(u32::from(ts.minutes), expected.minute(), "{time}");
            assert_eq!(u32::from(ts.seconds), expected.second(), "{time}");
        }
    }
}
