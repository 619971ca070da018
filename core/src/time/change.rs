//! Time acceptance and change propagation
//!
//! Every way time gets set (RTC seed at boot, network sync, operator
//! command) funnels through [`TimeSys::set_sys_date_time`]. It decides the
//! direction of the change, commits the new time inside a short critical
//! section and then stamps every armed alarm with the change.

use embassy_sync::blocking_mutex::raw::RawMutex;
use hal_abstractions::FileStore;

use super::calendar::{date_time_to_sys, is_valid_date_time};
use super::clock::{ClockState, SysTime, TimeState, FIVE_SEC_TICKS};
use super::TimeSys;
use crate::config::TICKS_PER_DAY;
use crate::error::TimeSysError;

/// Outcome of a time set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimeChange {
    pub changed: bool,
    pub forward: bool,
    pub backward: bool,
    /// New minus previous time in milliseconds
    pub delta: i64,
}

/// Round `t` to the nearest multiple of `unit_ms`
pub(crate) fn round_to_unit(t: SysTime, unit_ms: u32) -> SysTime {
    let half = unit_ms / 2;
    let up = t.time + half;
    let mut rounded = SysTime::new(t.date, up - up % unit_ms);
    if rounded.time >= TICKS_PER_DAY {
        rounded.time -= TICKS_PER_DAY;
        rounded.date = rounded.date.wrapping_add(1);
    }
    rounded
}

impl ClockState {
    /// Decide the direction of a time set and commit it
    ///
    /// While GPS drives the tick phase, only the 5-second slot is taken
    /// from the candidate and the current phase within the slot is kept.
    pub(crate) fn accept(&mut self, candidate: SysTime, unit_ms: u32) -> TimeChange {
        let current = self.sys;
        let mut target = round_to_unit(candidate, unit_ms);
        let mut change = TimeChange::default();
        let mut gps_aligned = false;

        if target.is_invalid() {
            self.state = TimeState::Invalid;
            change.changed = true;
        } else {
            self.state = TimeState::ValidSync;
            if self.info.watchdog != 0 {
                if self.gps_time_seeded {
                    target.time =
                        target.time / FIVE_SEC_TICKS * FIVE_SEC_TICKS + current.time % FIVE_SEC_TICKS;
                    self.info.got_gps_time = true;
                    gps_aligned = true;
                }
                self.gps_time_seeded = true;
            }

            if current.is_invalid() {
                change.changed = true;
                change.forward = true;
                change.backward = true;
            } else if target.combined() > current.combined() {
                change.changed = true;
                change.forward = true;
            } else if target.combined() != current.combined() {
                change.changed = true;
                change.backward = true;
            }
        }
        change.delta = target.combined() as i64 - current.combined() as i64;

        let same_slot = target.date == current.date
            && target.time / FIVE_SEC_TICKS == current.time / FIVE_SEC_TICKS;
        if !(gps_aligned && same_slot) {
            self.set_sys_time(target);
        }
        change
    }
}

impl<'a, F: FileStore, M: RawMutex> TimeSys<'a, F, M> {
    /// Accept a new system time
    ///
    /// The invalid sentinel (1970-01-01 00:00:00) marks time invalid.
    ///
    /// Both task-level locks are taken before anything is committed, so a
    /// set either happens completely or fails with
    /// [`TimeSysError::Busy`]. Only the clock commit runs inside a critical
    /// section. Alarm stamping and the file store write run with interrupts
    /// enabled, and the alarm table stays locked until the change flags are
    /// stamped so no dispatch pass sees the new time without them.
    pub fn set_sys_date_time(&self, candidate: SysTime) -> Result<TimeChange, TimeSysError> {
        let unit_ms = self.config.unit_ms;
        let mut alarms = self.lock_alarms()?;
        let mut vars = self.lock_vars()?;

        let (change, was_valid, snap) = critical_section::with(|cs| {
            let mut clock = self.clock.borrow_ref_mut(cs);
            let was_valid = clock.state.is_valid();
            let change = clock.accept(candidate, unit_ms);
            (change, was_valid, clock.snapshot())
        });

        alarms.on_time_change(&change, &snap);
        drop(alarms);

        vars.on_time_set(&change, snap.valid, candidate.to_seconds());
        self.publish_vars(vars.vars());
        drop(vars);

        if was_valid != snap.valid {
            info!("Time state {} -> {}", was_valid, snap.valid);
        }
        if change.changed {
            info!(
                "Time set: day {} {} ms (fwd {}, bwd {}, delta {} ms)",
                snap.sys.date,
                snap.sys.time,
                change.forward,
                change.backward,
                change.delta
            );
        } else {
            trace!("Time set: unchanged");
        }
        Ok(change)
    }

    /// Seed system time from the RTC
    ///
    /// An RTC that lost its time, or reports a date that does not exist,
    /// seeds the invalid sentinel, which leaves system time invalid.
    pub fn set_time_from_rtc(&self) -> Result<TimeChange, TimeSysError> {
        let candidate = if self.rtc.is_valid() {
            match self.rtc.date_time() {
                Ok(dt) if is_valid_date_time(&dt) => date_time_to_sys(&dt),
                Ok(dt) => {
                    warn!(
                        "RTC date/time out of range: {}-{}-{} {}:{}:{}",
                        dt.year, dt.month, dt.day, dt.hour, dt.minute, dt.second
                    );
                    SysTime::INVALID
                }
                Err(e) => {
                    warn!("RTC read failed: {:?}", e);
                    SysTime::INVALID
                }
            }
        } else {
            warn!("RTC not valid, system time stays invalid");
            SysTime::INVALID
        };
        self.set_sys_date_time(candidate)
    }
}
