//! System time subsystem
//!
//! ## Architecture
//! - [`TimeSys`] owns every piece of time state; the board creates one at
//!   startup and shares `&TimeSys` with its interrupt handlers and tasks
//! - Software clock, power-up clock and frequency information live in a
//!   `critical_section::Mutex` and are touched from the tick ISR, the GPS
//!   capture ISR and tasks
//! - The alarm table and persisted variables sit behind a task-level
//!   `embassy_sync::mutex::Mutex`; its raw mutex only guards the lock flag,
//!   so interrupts stay enabled while a pass sends to sinks or the file
//!   store is written
//! - Alarm and variable operations belong to one execution priority. A call
//!   that finds the lock taken fails with [`TimeSysError::Busy`] instead of
//!   blocking
//! - Collaborators (RTC, file store, tick counter, alarm sinks) are injected
//!
//! ## Lock order
//! alarm table, then persisted variables, then the clock critical section.
//! Alarm sinks are called with the alarm table held and must not call back
//! into the alarm API.

pub mod alarm;
pub mod calendar;
pub mod change;
pub mod clock;
pub mod vars;

use core::cell::{Cell, RefCell};

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::mutex::{Mutex, MutexGuard};
use hal_abstractions::{FileStore, RtcClock, TickCounter};

use crate::config::TimeSysConfig;
use crate::error::TimeSysError;
use crate::freq::ClockInfo;
use alarm::AlarmTable;
use clock::ClockState;
use vars::VarStore;

pub use alarm::{AlarmCause, AlarmId, AlarmMsg, AlarmSink, CalAlarm, PeriodicAlarm};
pub use change::TimeChange;
pub use clock::{SysTime, TimeState};
pub use vars::{ParamId, ParamValue, TimeVars};

/// The time subsystem
pub struct TimeSys<'a, F: FileStore, M: RawMutex = CriticalSectionRawMutex> {
    pub(crate) config: TimeSysConfig,
    pub(crate) clock: critical_section::Mutex<RefCell<ClockState>>,
    pub(crate) alarms: Mutex<M, AlarmTable<'a>>,
    pub(crate) vars: Mutex<M, VarStore<F>>,
    /// Last committed variables, readable without the task lock
    pub(crate) vars_view: critical_section::Mutex<Cell<TimeVars>>,
    pub(crate) rtc: &'a dyn RtcClock,
    pub(crate) counter: Option<&'a dyn TickCounter>,
}

impl<'a, F: FileStore, M: RawMutex> TimeSys<'a, F, M> {
    /// Build the subsystem
    ///
    /// Loads the persisted variables from `store` (writing defaults when the
    /// record is missing or unreadable). Time starts out invalid; seed it
    /// with [`TimeSys::set_time_from_rtc`] or a time sync. `counter` gives
    /// sub-tick resolution to [`TimeSys::get_sys_time`] and receives reload
    /// corrections from the dispatch task.
    pub fn new(
        config: TimeSysConfig,
        store: F,
        rtc: &'a dyn RtcClock,
        counter: Option<&'a dyn TickCounter>,
    ) -> Self {
        let info = ClockInfo::new(config.gps.core_clock_hz, config.gps.nominal_window());
        let vars = VarStore::load(store);
        let view = vars.vars();
        info!(
            "Time subsystem up: tick {} ms, unit {} ms, nominal clock {} Hz",
            config.tick_ms,
            config.unit_ms,
            config.gps.core_clock_hz
        );
        Self {
            config,
            clock: critical_section::Mutex::new(RefCell::new(ClockState::new(info))),
            alarms: Mutex::new(AlarmTable::new()),
            vars: Mutex::new(vars),
            vars_view: critical_section::Mutex::new(Cell::new(view)),
            rtc,
            counter,
        }
    }

    pub fn config(&self) -> &TimeSysConfig {
        &self.config
    }

    pub fn tick_counter(&self) -> Option<&'a dyn TickCounter> {
        self.counter
    }

    pub(crate) fn lock_alarms(&self) -> Result<MutexGuard<'_, M, AlarmTable<'a>>, TimeSysError> {
        self.alarms.try_lock().map_err(|_| TimeSysError::Busy)
    }

    pub(crate) fn lock_vars(&self) -> Result<MutexGuard<'_, M, VarStore<F>>, TimeSysError> {
        self.vars.try_lock().map_err(|_| TimeSysError::Busy)
    }
}
