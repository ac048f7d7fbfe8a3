//! MS-DOS date/time fields

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};

/// Packed DOS time and date as stored in ZIP headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosDateTime {
    pub time: u16,
    pub date: u16,
}

impl DosDateTime {
    /// Timestamp given to entries when timestamps are not kept
    ///
    /// 1981-01-01 01:01:02, so neither field is zero.
    pub fn fixed() -> Self {
        DosDateTime {
            time: (1 << 11) | (1 << 5) | 1,
            date: (1 << 9) | (1 << 5) | 1,
        }
    }

    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    /// Pack a calendar time; years are clamped to the DOS range 1980-2107
    pub fn from_datetime(dt: NaiveDateTime) -> Self {
        let year = dt.year().clamp(1980, 2107);
        let date = (((year - 1980) as u16) << 9) | ((dt.month() as u16) << 5) | dt.day() as u16;
        let time =
            ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | (dt.second() as u16 / 2);

        DosDateTime { time, date }
    }

    /// Unpack into a calendar time, `None` for impossible dates
    pub fn to_datetime(self) -> Option<NaiveDateTime> {
        let year = 1980 + (self.date >> 9) as i32;
        let month = ((self.date >> 5) & 0x0f) as u32;
        let day = (self.date & 0x1f) as u32;
        let hour = (self.time >> 11) as u32;
        let minute = ((self.time >> 5) & 0x3f) as u32;
        let second = ((self.time & 0x1f) * 2) as u32;

        NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
    }
}
