//! Internal RTC (LSE) as the time subsystem's real-time clock
//!
//! Calendar in the RTC peripheral, sub-second counter from the SSR
//! register for drift measurement.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::Mutex;
use defmt::info;
use embassy_stm32::pac;
use embassy_stm32::rtc::{DateTime, DayOfWeek, Rtc};
use hal_abstractions::{RtcClock, RtcDateTime, RtcError};
use timesys_core::time::calendar::{date_time_to_seconds, date_time_to_sys, is_valid_date_time};

pub struct BoardRtc {
    rtc: Mutex<RefCell<Rtc>>,
    /// Calendar has been set since the backup domain last lost power
    valid: AtomicBool,
}

impl BoardRtc {
    pub fn new(rtc: Rtc) -> Self {
        let valid = pac::RTC.isr().read().inits();
        info!("Internal RTC up, calendar {}", if valid { "set" } else { "lost" });
        Self {
            rtc: Mutex::new(RefCell::new(rtc)),
            valid: AtomicBool::new(valid),
        }
    }

    fn now(&self) -> Result<RtcDateTime, RtcError> {
        let dt = critical_section::with(|cs| self.rtc.borrow_ref_mut(cs).now())
            .map_err(|_| RtcError::HardwareError)?;
        Ok(RtcDateTime {
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
            millis: 0,
        })
    }
}

/// 1970-01-01 was a Thursday
fn day_of_week(dt: &RtcDateTime) -> DayOfWeek {
    match (date_time_to_sys(dt).date + 3) % 7 {
        0 => DayOfWeek::Monday,
        1 => DayOfWeek::Tuesday,
        2 => DayOfWeek::Wednesday,
        3 => DayOfWeek::Thursday,
        4 => DayOfWeek::Friday,
        5 => DayOfWeek::Saturday,
        _ => DayOfWeek::Sunday,
    }
}

impl RtcClock for BoardRtc {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn date_time(&self) -> Result<RtcDateTime, RtcError> {
        if !self.is_valid() {
            return Err(RtcError::NotInitialized);
        }
        self.now()
    }

    fn set_date_time(&self, dt: RtcDateTime) -> Result<(), RtcError> {
        if !is_valid_date_time(&dt) {
            return Err(RtcError::InvalidDateTime);
        }
        let datetime = DateTime::from(
            dt.year,
            dt.month,
            dt.day,
            day_of_week(&dt),
            dt.hour,
            dt.minute,
            dt.second,
            0,
        )
        .map_err(|_| RtcError::InvalidDateTime)?;
        critical_section::with(|cs| self.rtc.borrow_ref_mut(cs).set_datetime(datetime))
            .map_err(|_| RtcError::HardwareError)?;
        self.valid.store(true, Ordering::Release);
        Ok(())
    }

    fn micros(&self) -> Result<u64, RtcError> {
        let prediv = pac::RTC.prer().read().prediv_s() as u64;
        loop {
            // SSR before the calendar: reading it freezes the TR/DR shadows
            // until DR is read, so both describe the same second
            let ss = pac::RTC.ssr().read().ss() as u64;
            let now = self.now()?;
            // SSR counts down from PREDIV_S; a reload in between means the
            // second rolled over and the pair is stale
            if pac::RTC.ssr().read().ss() as u64 > ss {
                continue;
            }
            let secs = date_time_to_seconds(&now) as u64;
            let ss = ss.min(prediv);
            return Ok(secs * 1_000_000 + (prediv - ss) * 1_000_000 / (prediv + 1));
        }
    }
}
