//! Software clock state
//!
//! System time and power-up time advance together from the RTOS tick
//! interrupt. All access goes through `critical_section::with` so the tick
//! ISR, the GPS capture ISR and task-level readers always observe a
//! consistent snapshot.

use hal_abstractions::TickCounter;

use super::TimeSys;
use crate::config::{TICKS_PER_DAY, TICKS_PER_SEC};
use crate::freq::ClockInfo;
use hal_abstractions::FileStore;

use embassy_sync::blocking_mutex::raw::RawMutex;

/// Milliseconds between recorded phase reference stamps
pub(crate) const FIVE_SEC_TICKS: u32 = 5 * TICKS_PER_SEC;

/// Date and time as kept by the software clock
///
/// `date` counts days since 1970-01-01 and `time` counts milliseconds since
/// midnight. `(0, 0)` is the invalid sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SysTime {
    pub date: u32,
    pub time: u32,
    /// RTOS ticks into the current logical unit
    pub tictoc: u16,
    /// Counter cycles into the current RTOS tick when sampled
    pub elapsed_cycles: u32,
}

impl SysTime {
    /// "No valid time"
    pub const INVALID: Self = Self::new(0, 0);

    pub const fn new(date: u32, time: u32) -> Self {
        Self {
            date,
            time,
            tictoc: 0,
            elapsed_cycles: 0,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.date == Self::INVALID.date && self.time == Self::INVALID.time
    }

    /// Milliseconds since the epoch
    pub fn combined(&self) -> u64 {
        self.date as u64 * TICKS_PER_DAY as u64 + self.time as u64
    }

    pub fn from_combined(ms: u64) -> Self {
        Self::new(
            (ms / TICKS_PER_DAY as u64) as u32,
            (ms % TICKS_PER_DAY as u64) as u32,
        )
    }

    /// Whole seconds since the epoch
    pub fn to_seconds(&self) -> u32 {
        self.date
            .wrapping_mul(crate::time::calendar::SECONDS_PER_DAY)
            .wrapping_add(self.time / TICKS_PER_SEC)
    }

    pub fn from_seconds(secs: u32, millis: u32) -> Self {
        let day = crate::time::calendar::SECONDS_PER_DAY;
        Self::new(secs / day, (secs % day) * TICKS_PER_SEC + millis % TICKS_PER_SEC)
    }

    /// Same instant shifted by `offset_ms`, saturating at the epoch
    pub fn offset_by(&self, offset_ms: i64) -> Self {
        let ms = (self.combined() as i64).saturating_add(offset_ms).max(0);
        Self::from_combined(ms as u64)
    }

    fn advance(&mut self, unit_ms: u32) {
        self.time += unit_ms;
        if self.time >= TICKS_PER_DAY {
            self.time -= TICKS_PER_DAY;
            self.date = self.date.wrapping_add(1);
        }
    }
}

/// Validity of system time (persisted as its numeric value)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TimeState {
    #[default]
    Invalid = 0,
    ValidSync = 2,
}

impl TimeState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => Self::ValidSync,
            _ => Self::Invalid,
        }
    }

    pub fn is_valid(self) -> bool {
        self == Self::ValidSync
    }
}

/// Everything written from interrupt context
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClockState {
    pub(crate) sys: SysTime,
    pub(crate) pup: SysTime,
    tictoc: u16,
    pub(crate) state: TimeState,
    pub(crate) local_offset_ms: i32,
    pub(crate) info: ClockInfo,
    /// A time set has already been accepted while GPS was present
    pub(crate) gps_time_seeded: bool,
}

impl ClockState {
    pub(crate) const fn new(info: ClockInfo) -> Self {
        Self {
            sys: SysTime::INVALID,
            pup: SysTime::new(0, 0),
            tictoc: 0,
            state: TimeState::Invalid,
            local_offset_ms: 0,
            info,
            gps_time_seeded: false,
        }
    }

    /// One RTOS tick. `cycle_stamp` is the cycle counter at interrupt entry.
    pub(crate) fn tick(&mut self, cycle_stamp: u32, ticks_per_unit: u32, unit_ms: u32) {
        self.tictoc = ((self.tictoc as u32 + 1) % ticks_per_unit) as u16;
        self.sys.tictoc = self.tictoc;
        self.pup.tictoc = self.tictoc;
        if self.tictoc == 0 {
            self.sys.advance(unit_ms);
            self.pup.advance(unit_ms);
            if self.sys.time % FIVE_SEC_TICKS == 0 {
                self.info.five_sec_tick_time = cycle_stamp;
            }
        }
    }

    /// Replace system time and re-base the sub-tick counters
    pub(crate) fn set_sys_time(&mut self, t: SysTime) {
        self.sys = SysTime::new(t.date, t.time);
        self.tictoc = 0;
    }

    pub(crate) fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            sys: self.sys,
            pup: self.pup,
            valid: self.state.is_valid(),
            local_offset_ms: self.local_offset_ms,
        }
    }
}

/// Clock values an alarm evaluation pass works from
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClockSnapshot {
    pub(crate) sys: SysTime,
    pub(crate) pup: SysTime,
    pub(crate) valid: bool,
    pub(crate) local_offset_ms: i32,
}

impl ClockSnapshot {
    /// System time converted to local time
    pub(crate) fn local(&self) -> SysTime {
        self.sys.offset_by(self.local_offset_ms as i64)
    }
}

/// Cycles elapsed in the current RTOS tick
///
/// A pending wrap means a whole tick went by since the interrupt last ran.
pub(crate) fn elapsed_cycles(counter: &dyn TickCounter) -> u32 {
    let mut span = counter.reload().wrapping_add(1);
    if counter.wrap_pending() {
        span = span.wrapping_mul(2);
    }
    span.wrapping_sub(counter.current())
}

impl<'a, F: FileStore, M: RawMutex> TimeSys<'a, F, M> {
    /// RTOS tick interrupt entry
    ///
    /// Never blocks. `cycle_stamp` is the free-running cycle counter sampled
    /// on interrupt entry; it is recorded on 5-second boundaries as the phase
    /// reference for the GPS estimator.
    pub fn tick(&self, cycle_stamp: u32) {
        let per_unit = self.config.ticks_per_unit();
        let unit_ms = self.config.unit_ms;
        critical_section::with(|cs| {
            self.clock
                .borrow_ref_mut(cs)
                .tick(cycle_stamp, per_unit, unit_ms)
        });
    }

    /// Current system time with sub-tick resolution
    pub fn get_sys_time(&self) -> SysTime {
        critical_section::with(|cs| {
            let mut t = self.clock.borrow_ref(cs).sys;
            t.elapsed_cycles = self.counter.map(elapsed_cycles).unwrap_or(0);
            t
        })
    }

    /// Time since power-up; always valid
    pub fn get_power_up_time(&self) -> SysTime {
        critical_section::with(|cs| {
            let mut t = self.clock.borrow_ref(cs).pup;
            t.elapsed_cycles = self.counter.map(elapsed_cycles).unwrap_or(0);
            t
        })
    }

    /// System time in whole seconds since the epoch
    pub fn get_sys_time_seconds(&self) -> u32 {
        critical_section::with(|cs| self.clock.borrow_ref(cs).sys.to_seconds())
    }

    pub fn time_state(&self) -> TimeState {
        critical_section::with(|cs| self.clock.borrow_ref(cs).state)
    }

    pub fn is_time_valid(&self) -> bool {
        self.time_state().is_valid()
    }

    /// Offset from UTC to local time, applied by alarms that use local time
    pub fn set_local_offset(&self, offset_ms: i32) {
        critical_section::with(|cs| self.clock.borrow_ref_mut(cs).local_offset_ms = offset_ms);
    }

    pub fn local_offset(&self) -> i32 {
        critical_section::with(|cs| self.clock.borrow_ref(cs).local_offset_ms)
    }

    pub(crate) fn snapshot(&self) -> ClockSnapshot {
        critical_section::with(|cs| self.clock.borrow_ref(cs).snapshot())
    }
}
