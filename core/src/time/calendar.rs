//! Calendar date/time conversions using O(1) algorithms
//!
//! Implements Howard Hinnant's civil_from_days and days_from_civil algorithms.
//! Reference: http://howardhinnant.github.io/date_algorithms.html
//!
//! System time counts days since 1970-01-01 plus milliseconds since
//! midnight. These helpers convert that representation to and from RTC
//! broken-down time and seconds since the epoch.

use hal_abstractions::RtcDateTime;

use super::clock::SysTime;
use crate::config::{TICKS_PER_DAY, TICKS_PER_SEC};

/// Seconds per day
pub const SECONDS_PER_DAY: u32 = 86_400;

/// Check if year is a leap year (Gregorian calendar)
///
/// - Divisible by 4: leap year
/// - EXCEPT divisible by 100: not a leap year
/// - EXCEPT divisible by 400: leap year
pub fn is_leap_year(year: u16) -> bool {
    (year.is_multiple_of(4) && !year.is_multiple_of(100)) || year.is_multiple_of(400)
}

/// Days in `month` (1-12) of `year`
pub fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

/// Whether every field of `dt` names a real calendar instant
pub fn is_valid_date_time(dt: &RtcDateTime) -> bool {
    (1..=12).contains(&dt.month)
        && dt.day >= 1
        && dt.day <= days_in_month(dt.year, dt.month)
        && dt.hour < 24
        && dt.minute < 60
        && dt.second < 60
        && dt.millis < 1000
}

/// Convert RTC broken-down time to system time
///
/// Dates before the epoch clamp to day 0. A date/time that fails
/// [`is_valid_date_time`] maps to [`SysTime::INVALID`].
pub fn date_time_to_sys(dt: &RtcDateTime) -> SysTime {
    if !is_valid_date_time(dt) {
        return SysTime::INVALID;
    }
    let days = days_from_civil(dt.year, dt.month, dt.day).max(0) as u32;
    let time = (dt.hour as u32) * 3_600_000
        + (dt.minute as u32) * 60_000
        + (dt.second as u32) * TICKS_PER_SEC
        + dt.millis as u32;
    SysTime::new(days, time)
}

/// Convert system time to RTC broken-down time
pub fn sys_to_date_time(sys: &SysTime) -> RtcDateTime {
    let (year, month, day) = civil_from_days(sys.date as i32);
    let ms = sys.time % TICKS_PER_DAY;
    RtcDateTime {
        year,
        month,
        day,
        hour: (ms / 3_600_000) as u8,
        minute: ((ms % 3_600_000) / 60_000) as u8,
        second: ((ms % 60_000) / TICKS_PER_SEC) as u8,
        millis: (ms % TICKS_PER_SEC) as u16,
    }
}

/// Convert seconds since epoch to RTC broken-down time
pub fn seconds_to_date_time(secs: u32) -> RtcDateTime {
    sys_to_date_time(&SysTime::from_seconds(secs, 0))
}

/// Convert RTC broken-down time to seconds since epoch (milliseconds dropped)
pub fn date_time_to_seconds(dt: &RtcDateTime) -> u32 {
    date_time_to_sys(dt).to_seconds()
}

/// Convert days since Unix epoch to civil date (year, month, day)
///
/// Howard Hinnant's civil_from_days algorithm.
pub(crate) fn civil_from_days(days_since_epoch: i32) -> (u16, u8, u8) {
    // Shift epoch from 1970-01-01 to 0000-03-01 (March 1, year 0)
    // This makes the year start on March 1, placing leap day at end of year
    let z = days_since_epoch + 719468;

    // Calculate era (400-year cycles)
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u32; // day of era [0, 146096]

    // Calculate year of era [0, 399]
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = (yoe as i32) + era * 400;

    // Day of year [0, 365], month [0, 11] where 0 = March
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;

    let d = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u8;

    // Adjust year for January and February
    let year = if m <= 2 { y + 1 } else { y };

    (year as u16, m, d)
}

/// Convert civil date (year, month, day) to days since Unix epoch
///
/// Howard Hinnant's days_from_civil algorithm.
pub(crate) fn days_from_civil(year: u16, month: u8, day: u8) -> i32 {
    let y = year as i32;
    let m = month as i32;
    let d = day as i32;

    // Adjust year and month to make March = month 0, February = month 11
    let (y, m) = if m <= 2 { (y - 1, m + 9) } else { (y, m - 3) };

    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u32; // year of era [0, 399]
    let doy = (153 * (m as u32) + 2) / 5 + (d as u32) - 1; // day of year [0, 365]
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy; // day of era [0, 146096]

    era * 146097 + (doe as i32) - 719468
}
