//! Alarm registry and dispatch
//!
//! A fixed table of [`MAX_ALARMS`] slots. The slot index is the alarm id
//! handed back to callers. Calendar alarms fire at an absolute date and
//! time (one-shot) or at a time of day (daily, `date == 0`); periodic
//! alarms fire whenever the clock lands on their offset within the period.
//!
//! [`TimeSys::process_sys_tick`] evaluates every slot once per logical time
//! unit against a single clock snapshot. Sending never blocks: a busy
//! periodic destination is retried on the next pass, a busy calendar
//! destination is simply re-evaluated.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use hal_abstractions::FileStore;

use super::change::TimeChange;
use super::clock::{ClockSnapshot, SysTime};
use super::TimeSys;
use crate::config::{MAX_ALARMS, TICKS_PER_DAY};
use crate::error::{SinkBusy, TimeSysError};

/// Alarm handle (slot index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlarmId(pub u8);

impl AlarmId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Why an alarm message was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AlarmCause {
    /// The alarm's time was reached
    #[default]
    Scheduled,
    /// System time was changed
    TimeChange,
}

/// Message delivered to an alarm's destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlarmMsg {
    pub alarm_id: AlarmId,
    /// Date of the reported time base
    pub date: u32,
    /// Time of day of the reported time base
    pub time: u32,
    /// Accumulated time change in milliseconds since the last delivery
    pub time_change_delta: i64,
    /// `date`/`time` are system time rather than power-up time
    pub using_system_time: bool,
    pub time_changed_forward: bool,
    pub time_changed_backward: bool,
    pub system_time_valid: bool,
    pub cause: AlarmCause,
}

/// Destination of alarm messages
///
/// Called from the dispatch pass with the alarm table locked; must not
/// block or call back into the alarm API.
pub trait AlarmSink: Sync {
    fn send(&self, msg: AlarmMsg) -> Result<(), SinkBusy>;
}

impl<M: RawMutex + Sync, const N: usize> AlarmSink for Channel<M, AlarmMsg, N> {
    fn send(&self, msg: AlarmMsg) -> Result<(), SinkBusy> {
        self.try_send(msg).map_err(|_| SinkBusy)
    }
}

/// Calendar alarm configuration
#[derive(Clone, Copy)]
pub struct CalAlarm<'a> {
    /// Day index to fire on; 0 fires every day
    pub date: u32,
    /// Time of day in milliseconds
    pub time: u32,
    /// Do not send a message when system time changes
    pub skip_on_time_change: bool,
    /// Compare against local time instead of UTC
    pub use_local_time: bool,
    /// Without a destination the schedule still advances
    pub sink: Option<&'a dyn AlarmSink>,
}

/// Periodic alarm configuration
#[derive(Clone, Copy)]
pub struct PeriodicAlarm<'a> {
    /// Period in milliseconds
    pub period: u32,
    /// Offset within the period, less than `period`
    pub offset: u32,
    pub skip_on_time_change: bool,
    pub use_local_time: bool,
    /// Fire on system time while it is valid
    pub on_valid_time: bool,
    /// Fire on power-up time while system time is invalid
    pub on_invalid_time: bool,
    pub sink: Option<&'a dyn AlarmSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AlarmKind {
    Free,
    Calendar {
        /// Next trigger date
        date: u32,
        time: u32,
        daily: bool,
        expired: bool,
    },
    Periodic {
        period: u32,
        offset: u32,
        on_valid: bool,
        on_invalid: bool,
    },
}

#[derive(Clone, Copy)]
struct AlarmSlot<'a> {
    kind: AlarmKind,
    skip_on_time_change: bool,
    use_local_time: bool,
    sink: Option<&'a dyn AlarmSink>,
    cause: AlarmCause,
    time_changed: bool,
    forward: bool,
    backward: bool,
    retry_pending: bool,
    delta: i64,
}

impl<'a> AlarmSlot<'a> {
    const EMPTY: Self = Self {
        kind: AlarmKind::Free,
        skip_on_time_change: false,
        use_local_time: false,
        sink: None,
        cause: AlarmCause::Scheduled,
        time_changed: false,
        forward: false,
        backward: false,
        retry_pending: false,
        delta: 0,
    };

    fn in_use(&self) -> bool {
        self.kind != AlarmKind::Free
    }

    /// Time the alarm compares against
    fn now(&self, snap: &ClockSnapshot) -> SysTime {
        if self.use_local_time {
            snap.local()
        } else {
            snap.sys
        }
    }

    /// Recompute the trigger date of a daily calendar alarm
    ///
    /// After a time change or on registration an alarm due right now stays
    /// on today; a routine re-arm of a just-fired alarm moves to tomorrow.
    fn rearm_daily(&mut self, snap: &ClockSnapshot, changed_or_new: bool) {
        if !snap.valid {
            return;
        }
        let now = self.now(snap);
        if let AlarmKind::Calendar { date, time, .. } = &mut self.kind {
            let passed = if changed_or_new {
                now.time > *time
            } else {
                now.time >= *time
            };
            *date = if passed { now.date + 1 } else { now.date };
        }
    }

    /// Report power-up time instead of system time
    fn uses_power_up_time(&self, valid: bool) -> bool {
        match self.kind {
            AlarmKind::Periodic {
                on_valid,
                on_invalid,
                ..
            } => (!valid && !(on_valid && !on_invalid)) || (!on_valid && on_invalid),
            _ => !valid,
        }
    }

    fn periodic_due(&self, snap: &ClockSnapshot) -> bool {
        let AlarmKind::Periodic {
            period,
            offset,
            on_valid,
            on_invalid,
        } = self.kind
        else {
            return false;
        };
        if on_valid && snap.valid {
            let mut shift = TICKS_PER_DAY as i64;
            if self.use_local_time {
                shift += snap.local_offset_ms as i64;
            }
            (snap.sys.time as i64 + shift).rem_euclid(period as i64) == offset as i64
        } else if on_invalid {
            snap.pup.time % period == 0
        } else {
            false
        }
    }

    /// Send the alarm message for the current cause
    fn execute(&mut self, id: AlarmId, snap: &ClockSnapshot) -> Result<(), SinkBusy> {
        if let Some(sink) = self.sink {
            let power_up = self.uses_power_up_time(snap.valid);
            let base = if power_up { snap.pup } else { snap.sys };
            let msg = AlarmMsg {
                alarm_id: id,
                date: base.date,
                time: base.time,
                time_change_delta: self.delta,
                using_system_time: !power_up,
                time_changed_forward: self.forward,
                time_changed_backward: self.backward,
                system_time_valid: snap.valid,
                cause: self.cause,
            };
            if let Err(e) = sink.send(msg) {
                self.retry_pending = true;
                debug!("Alarm {} destination busy", id.0);
                return Err(e);
            }
        }
        self.forward = false;
        self.backward = false;
        self.delta = 0;
        self.retry_pending = false;
        Ok(())
    }
}

/// Fixed-capacity alarm slot table
pub(crate) struct AlarmTable<'a> {
    slots: [AlarmSlot<'a>; MAX_ALARMS],
}

impl<'a> AlarmTable<'a> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [AlarmSlot::EMPTY; MAX_ALARMS],
        }
    }

    fn allocate(&mut self) -> Result<(AlarmId, &mut AlarmSlot<'a>), TimeSysError> {
        self.slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| !slot.in_use())
            .map(|(i, slot)| (AlarmId(i as u8), slot))
            .ok_or(TimeSysError::NoFreeSlot)
    }

    fn slot(&self, id: AlarmId) -> Result<&AlarmSlot<'a>, TimeSysError> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.in_use())
            .ok_or(TimeSysError::InvalidAlarmId)
    }

    pub(crate) fn add_cal(
        &mut self,
        alarm: &CalAlarm<'a>,
        snap: &ClockSnapshot,
    ) -> Result<AlarmId, TimeSysError> {
        if alarm.time >= TICKS_PER_DAY {
            return Err(TimeSysError::InvalidTimeOfDay);
        }
        let (id, slot) = self.allocate()?;
        *slot = AlarmSlot {
            kind: AlarmKind::Calendar {
                date: alarm.date,
                time: alarm.time,
                daily: alarm.date == 0,
                expired: false,
            },
            skip_on_time_change: alarm.skip_on_time_change,
            use_local_time: alarm.use_local_time,
            sink: alarm.sink,
            ..AlarmSlot::EMPTY
        };
        if alarm.date == 0 {
            slot.rearm_daily(snap, true);
        }
        Ok(id)
    }

    pub(crate) fn add_periodic(&mut self, alarm: &PeriodicAlarm<'a>) -> Result<AlarmId, TimeSysError> {
        if alarm.period == 0 {
            return Err(TimeSysError::ZeroPeriod);
        }
        if alarm.offset >= alarm.period {
            return Err(TimeSysError::OffsetOutOfRange);
        }
        if alarm.on_invalid_time && !alarm.on_valid_time && !alarm.skip_on_time_change {
            return Err(TimeSysError::MeaninglessFlags);
        }
        if alarm.sink.is_none() {
            return Err(TimeSysError::MissingDestination);
        }
        let (id, slot) = self.allocate()?;
        *slot = AlarmSlot {
            kind: AlarmKind::Periodic {
                period: alarm.period,
                offset: alarm.offset % alarm.period,
                on_valid: alarm.on_valid_time,
                on_invalid: alarm.on_invalid_time,
            },
            skip_on_time_change: alarm.skip_on_time_change,
            use_local_time: alarm.use_local_time,
            sink: alarm.sink,
            ..AlarmSlot::EMPTY
        };
        Ok(id)
    }

    pub(crate) fn get_cal(&self, id: AlarmId) -> Result<CalAlarm<'a>, TimeSysError> {
        let slot = self.slot(id)?;
        match slot.kind {
            AlarmKind::Calendar {
                date, time, daily, ..
            } => Ok(CalAlarm {
                date: if daily { 0 } else { date },
                time,
                skip_on_time_change: slot.skip_on_time_change,
                use_local_time: slot.use_local_time,
                sink: slot.sink,
            }),
            _ => Err(TimeSysError::NotCalendarAlarm),
        }
    }

    pub(crate) fn get_periodic(&self, id: AlarmId) -> Result<PeriodicAlarm<'a>, TimeSysError> {
        let slot = self.slot(id)?;
        match slot.kind {
            AlarmKind::Periodic {
                period,
                offset,
                on_valid,
                on_invalid,
            } => Ok(PeriodicAlarm {
                period,
                offset,
                skip_on_time_change: slot.skip_on_time_change,
                use_local_time: slot.use_local_time,
                on_valid_time: on_valid,
                on_invalid_time: on_invalid,
                sink: slot.sink,
            }),
            _ => Err(TimeSysError::NotPeriodicAlarm),
        }
    }

    /// Free a slot; freeing a free slot is not an error
    pub(crate) fn delete(&mut self, id: AlarmId) -> Result<(), TimeSysError> {
        let slot = self
            .slots
            .get_mut(id.index())
            .ok_or(TimeSysError::InvalidAlarmId)?;
        *slot = AlarmSlot::EMPTY;
        Ok(())
    }

    /// Stamp every armed slot with a time change
    pub(crate) fn on_time_change(&mut self, change: &TimeChange, snap: &ClockSnapshot) {
        for slot in self.slots.iter_mut().filter(|s| s.in_use()) {
            slot.delta = change.delta;
            if change.changed {
                if matches!(slot.kind, AlarmKind::Calendar { daily: true, .. }) {
                    slot.rearm_daily(snap, true);
                }
                if !slot.skip_on_time_change {
                    slot.time_changed = true;
                }
            }
            // Sticky until delivered
            slot.forward |= change.forward;
            slot.backward |= change.backward;
        }
    }

    /// One dispatch pass over every slot
    pub(crate) fn process(&mut self, snap: &ClockSnapshot) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let id = AlarmId(i as u8);
            match slot.kind {
                AlarmKind::Free => {}
                AlarmKind::Periodic { .. } => {
                    if slot.retry_pending {
                        let _ = slot.execute(id, snap);
                    } else if slot.periodic_due(snap) {
                        slot.cause = AlarmCause::Scheduled;
                        let _ = slot.execute(id, snap);
                    } else if slot.time_changed {
                        slot.cause = AlarmCause::TimeChange;
                        let _ = slot.execute(id, snap);
                    }
                    slot.time_changed = false;
                }
                AlarmKind::Calendar {
                    date,
                    time,
                    daily,
                    expired,
                } => {
                    if !snap.valid || expired {
                        continue;
                    }
                    let now = slot.now(snap);
                    let reached = (now.date == date && now.time >= time) || now.date > date;
                    if reached {
                        slot.cause = AlarmCause::Scheduled;
                        if slot.execute(id, snap).is_ok() {
                            slot.time_changed = false;
                            if daily {
                                slot.rearm_daily(snap, false);
                            } else if let AlarmKind::Calendar { expired, .. } = &mut slot.kind {
                                *expired = true;
                            }
                        }
                    } else if slot.time_changed {
                        slot.cause = AlarmCause::TimeChange;
                        if slot.execute(id, snap).is_ok() {
                            slot.time_changed = false;
                        }
                    }
                }
            }
        }
    }
}

impl<'a, F: FileStore, M: RawMutex> TimeSys<'a, F, M> {
    /// Register a one-shot (`date != 0`) or daily (`date == 0`) calendar alarm
    pub fn add_cal_alarm(&self, alarm: CalAlarm<'a>) -> Result<AlarmId, TimeSysError> {
        let result = self.lock_alarms().and_then(|mut alarms| {
            let snap = self.snapshot();
            alarms.add_cal(&alarm, &snap)
        });
        match &result {
            Ok(id) => debug!("Calendar alarm {} at day {} {} ms", id.0, alarm.date, alarm.time),
            Err(e) => warn!("Calendar alarm rejected: {}", e),
        }
        result
    }

    /// Register a periodic alarm
    pub fn add_periodic_alarm(&self, alarm: PeriodicAlarm<'a>) -> Result<AlarmId, TimeSysError> {
        let result = self
            .lock_alarms()
            .and_then(|mut alarms| alarms.add_periodic(&alarm));
        match &result {
            Ok(id) => debug!(
                "Periodic alarm {} every {} ms at {}",
                id.0,
                alarm.period,
                alarm.offset
            ),
            Err(e) => warn!("Periodic alarm rejected: {}", e),
        }
        result
    }

    /// Configuration of a calendar alarm; daily alarms report date 0
    pub fn get_cal_alarm(&self, id: AlarmId) -> Result<CalAlarm<'a>, TimeSysError> {
        self.lock_alarms()?.get_cal(id)
    }

    pub fn get_periodic_alarm(&self, id: AlarmId) -> Result<PeriodicAlarm<'a>, TimeSysError> {
        self.lock_alarms()?.get_periodic(id)
    }

    pub fn delete_alarm(&self, id: AlarmId) -> Result<(), TimeSysError> {
        self.lock_alarms()?.delete(id)
    }

    /// Evaluate every alarm once; called once per logical time unit
    ///
    /// Sinks run with the alarm table locked but interrupts enabled. A pass
    /// that finds the table locked is skipped; due alarms fire on the next.
    pub fn process_sys_tick(&self) {
        match self.lock_alarms() {
            Ok(mut alarms) => {
                let snap = self.snapshot();
                alarms.process(&snap);
            }
            Err(_) => debug!("Alarm table busy, pass skipped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{interrupts_enabled, MemStore, TestHw};
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    type Queue<const N: usize> = Channel<CriticalSectionRawMutex, AlarmMsg, N>;

    const HOUR: u32 = 3_600_000;

    /// Advance one 10 ms unit and run the dispatch pass
    fn unit(sys: &TimeSys<'_, MemStore>) {
        sys.tick(0);
        sys.tick(0);
        sys.process_sys_tick();
    }

    fn drain<const N: usize>(q: &Queue<N>) -> heapless::Vec<AlarmMsg, 16> {
        let mut out = heapless::Vec::new();
        while let Ok(msg) = q.try_receive() {
            let _ = out.push(msg);
        }
        out
    }

    fn cal_state(sys: &TimeSys<'_, MemStore>, id: AlarmId) -> AlarmKind {
        sys.lock_alarms().unwrap().slots[id.index()].kind
    }

    fn snapshot(sys: SysTime, pup: SysTime, valid: bool, local_offset_ms: i32) -> ClockSnapshot {
        ClockSnapshot {
            sys,
            pup,
            valid,
            local_offset_ms,
        }
    }

    fn periodic<'a>(period: u32, offset: u32, sink: &'a dyn AlarmSink) -> PeriodicAlarm<'a> {
        PeriodicAlarm {
            period,
            offset,
            skip_on_time_change: false,
            use_local_time: false,
            on_valid_time: true,
            on_invalid_time: false,
            sink: Some(sink),
        }
    }

    /// Occupies a destination so the next send finds it full
    fn filler() -> AlarmMsg {
        AlarmMsg {
            alarm_id: AlarmId(99),
            date: 0,
            time: 0,
            time_change_delta: 0,
            using_system_time: false,
            time_changed_forward: false,
            time_changed_backward: false,
            system_time_valid: false,
            cause: AlarmCause::TimeChange,
        }
    }

    /// Counts sends and any made with interrupts masked
    #[derive(Default)]
    struct IrqCheckSink {
        sent: AtomicU32,
        masked: AtomicU32,
    }

    impl AlarmSink for IrqCheckSink {
        fn send(&self, _msg: AlarmMsg) -> Result<(), SinkBusy> {
            self.sent.fetch_add(1, Ordering::Relaxed);
            if !interrupts_enabled() {
                self.masked.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        }
    }

    fn daily<'a>(time: u32, sink: &'a dyn AlarmSink) -> CalAlarm<'a> {
        CalAlarm {
            date: 0,
            time,
            skip_on_time_change: false,
            use_local_time: false,
            sink: Some(sink),
        }
    }

    #[test]
    fn test_invalid_time_periodic_fires_on_power_up_time() {
        let q: Queue<4> = Channel::new();
        let hw = TestHw::new();
        let sys = hw.time_sys();
        let id = sys
            .add_periodic_alarm(PeriodicAlarm {
                on_valid_time: false,
                on_invalid_time: true,
                skip_on_time_change: true,
                ..periodic(1000, 0, &q)
            })
            .unwrap();

        for _ in 0..100 {
            unit(&sys);
        }
        let msgs = drain(&q);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].alarm_id, id);
        assert_eq!(msgs[0].cause, AlarmCause::Scheduled);
        assert!(!msgs[0].using_system_time);
        assert!(!msgs[0].system_time_valid);
        assert_eq!(msgs[0].time, 1000);
    }

    #[test]
    fn test_daily_alarm_across_midnight() {
        let q: Queue<4> = Channel::new();
        let hw = TestHw::new();
        let sys = hw.time_sys();
        sys.set_sys_date_time(SysTime::new(5, TICKS_PER_DAY - 10)).unwrap();
        let id = sys.add_cal_alarm(daily(0, &q)).unwrap();
        assert!(matches!(cal_state(&sys, id), AlarmKind::Calendar { date: 6, .. }));

        unit(&sys);
        let msgs = drain(&q);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].cause, AlarmCause::Scheduled);
        assert_eq!(msgs[0].date, 6);
        assert_eq!(msgs[0].time, 0);
        assert!(msgs[0].using_system_time);
        assert!(matches!(cal_state(&sys, id), AlarmKind::Calendar { date: 7, .. }));

        unit(&sys);
        assert!(drain(&q).is_empty());
        assert_eq!(sys.get_cal_alarm(id).unwrap().date, 0);
    }

    #[test]
    fn test_backward_change_stamps_every_slot() {
        let q: Queue<4> = Channel::new();
        let hw = TestHw::new();
        let sys = hw.time_sys();
        sys.set_sys_date_time(SysTime::new(100, 10 * HOUR)).unwrap();
        let a = sys.add_periodic_alarm(periodic(HOUR, 0, &q)).unwrap();
        let b = sys.add_cal_alarm(daily(12 * HOUR, &q)).unwrap();
        let c = sys
            .add_cal_alarm(CalAlarm {
                date: 200,
                ..daily(0, &q)
            })
            .unwrap();

        let change = sys.set_sys_date_time(SysTime::new(100, 8 * HOUR)).unwrap();
        assert!(change.changed && change.backward && !change.forward);
        let table = sys.lock_alarms().unwrap();
        for id in [a, b, c] {
            let slot = &table.slots[id.index()];
            assert_eq!(slot.delta, -(2 * HOUR as i64));
            assert!(slot.backward && !slot.forward);
        }
    }

    #[test]
    fn test_periodic_registration_rejections() {
        let q: Queue<1> = Channel::new();
        let hw = TestHw::new();
        let sys = hw.time_sys();
        assert_eq!(
            sys.add_periodic_alarm(periodic(0, 0, &q)).err(),
            Some(TimeSysError::ZeroPeriod)
        );
        assert_eq!(
            sys.add_periodic_alarm(periodic(1000, 1000, &q)).err(),
            Some(TimeSysError::OffsetOutOfRange)
        );
        let never = PeriodicAlarm {
            on_valid_time: false,
            on_invalid_time: true,
            ..periodic(1000, 0, &q)
        };
        assert_eq!(
            sys.add_periodic_alarm(never).err(),
            Some(TimeSysError::MeaninglessFlags)
        );
        let nowhere = PeriodicAlarm {
            sink: None,
            ..periodic(1000, 0, &q)
        };
        assert_eq!(
            sys.add_periodic_alarm(nowhere).err(),
            Some(TimeSysError::MissingDestination)
        );
        // Nothing was allocated
        assert_eq!(sys.add_periodic_alarm(periodic(1000, 999, &q)), Ok(AlarmId(0)));
        assert_eq!(sys.get_periodic_alarm(AlarmId(0)).unwrap().offset, 999);
    }

    #[test]
    fn test_calendar_time_of_day_checked() {
        let hw = TestHw::new();
        let sys = hw.time_sys();
        let alarm = CalAlarm {
            date: 3,
            time: TICKS_PER_DAY,
            skip_on_time_change: false,
            use_local_time: false,
            sink: None,
        };
        assert_eq!(sys.add_cal_alarm(alarm).err(), Some(TimeSysError::InvalidTimeOfDay));
    }

    #[test]
    fn test_table_full_and_slot_reuse() {
        let q: Queue<1> = Channel::new();
        let hw = TestHw::new();
        let sys = hw.time_sys();
        for i in 0..MAX_ALARMS {
            assert_eq!(sys.add_periodic_alarm(periodic(1000, 0, &q)), Ok(AlarmId(i as u8)));
        }
        assert_eq!(
            sys.add_periodic_alarm(periodic(1000, 0, &q)).err(),
            Some(TimeSysError::NoFreeSlot)
        );
        sys.delete_alarm(AlarmId(7)).unwrap();
        sys.delete_alarm(AlarmId(7)).unwrap();
        assert_eq!(
            sys.delete_alarm(AlarmId(MAX_ALARMS as u8)).err(),
            Some(TimeSysError::InvalidAlarmId)
        );
        assert_eq!(sys.add_cal_alarm(daily(0, &q)), Ok(AlarmId(7)));
    }

    #[test]
    fn test_get_by_kind() {
        let q: Queue<1> = Channel::new();
        let hw = TestHw::new();
        let sys = hw.time_sys();
        let p = sys.add_periodic_alarm(periodic(500, 100, &q)).unwrap();
        let c = sys
            .add_cal_alarm(CalAlarm {
                date: 9,
                use_local_time: true,
                ..daily(HOUR, &q)
            })
            .unwrap();

        assert_eq!(sys.get_cal_alarm(p).err(), Some(TimeSysError::NotCalendarAlarm));
        assert_eq!(sys.get_periodic_alarm(c).err(), Some(TimeSysError::NotPeriodicAlarm));
        assert_eq!(sys.get_cal_alarm(AlarmId(5)).err(), Some(TimeSysError::InvalidAlarmId));

        let cal = sys.get_cal_alarm(c).unwrap();
        assert_eq!((cal.date, cal.time), (9, HOUR));
        assert!(cal.use_local_time);
        let per = sys.get_periodic_alarm(p).unwrap();
        assert_eq!((per.period, per.offset), (500, 100));
        assert!(per.on_valid_time && !per.on_invalid_time);
    }

    #[test]
    fn test_daily_rearm_after_forward_change() {
        let q: Queue<4> = Channel::new();
        let hw = TestHw::new();
        let sys = hw.time_sys();
        sys.set_sys_date_time(SysTime::new(10, 8 * HOUR)).unwrap();
        let id = sys.add_cal_alarm(daily(9 * HOUR, &q)).unwrap();
        assert!(matches!(cal_state(&sys, id), AlarmKind::Calendar { date: 10, .. }));

        sys.set_sys_date_time(SysTime::new(10, 10 * HOUR)).unwrap();
        assert!(matches!(cal_state(&sys, id), AlarmKind::Calendar { date: 11, .. }));

        unit(&sys);
        let msgs = drain(&q);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].cause, AlarmCause::TimeChange);
        assert!(msgs[0].time_changed_forward);
        assert_eq!(msgs[0].time_change_delta, 2 * HOUR as i64);
        assert!(matches!(cal_state(&sys, id), AlarmKind::Calendar { date: 11, .. }));

        unit(&sys);
        assert!(drain(&q).is_empty());
    }

    #[test]
    fn test_unchanged_set_clears_delta() {
        let q: Queue<4> = Channel::new();
        let hw = TestHw::new();
        let sys = hw.time_sys();
        sys.set_sys_date_time(SysTime::new(10, HOUR)).unwrap();
        let id = sys.add_periodic_alarm(periodic(HOUR, 0, &q)).unwrap();
        sys.set_sys_date_time(SysTime::new(10, 2 * HOUR)).unwrap();
        let change = sys.set_sys_date_time(SysTime::new(10, 2 * HOUR)).unwrap();
        assert!(!change.changed);
        assert_eq!(sys.lock_alarms().unwrap().slots[id.index()].delta, 0);
    }

    #[test]
    fn test_periodic_retries_when_busy() {
        let q: Queue<1> = Channel::new();
        let hw = TestHw::new();
        let sys = hw.time_sys();
        let id = sys
            .add_periodic_alarm(PeriodicAlarm {
                on_valid_time: false,
                on_invalid_time: true,
                skip_on_time_change: true,
                ..periodic(20, 0, &q)
            })
            .unwrap();
        q.try_send(filler()).unwrap();

        unit(&sys);
        unit(&sys);
        assert!(sys.lock_alarms().unwrap().slots[id.index()].retry_pending);
        assert_eq!(q.try_receive().unwrap().alarm_id, AlarmId(99));

        unit(&sys);
        let msg = q.try_receive().unwrap();
        assert_eq!(msg.alarm_id, id);
        assert_eq!(msg.cause, AlarmCause::Scheduled);
        assert_eq!(msg.time, 30);
        assert!(!sys.lock_alarms().unwrap().slots[id.index()].retry_pending);
    }

    #[test]
    fn test_calendar_retries_when_busy() {
        let q: Queue<1> = Channel::new();
        let hw = TestHw::new();
        let sys = hw.time_sys();
        sys.set_sys_date_time(SysTime::new(3, 1_000)).unwrap();
        let id = sys
            .add_cal_alarm(CalAlarm {
                date: 3,
                skip_on_time_change: true,
                ..daily(1_050, &q)
            })
            .unwrap();
        q.try_send(filler()).unwrap();

        for _ in 0..10 {
            unit(&sys);
        }
        assert!(matches!(
            cal_state(&sys, id),
            AlarmKind::Calendar { expired: false, .. }
        ));
        assert_eq!(q.try_receive().unwrap().alarm_id, AlarmId(99));

        unit(&sys);
        let msg = q.try_receive().unwrap();
        assert_eq!(msg.alarm_id, id);
        assert_eq!(msg.cause, AlarmCause::Scheduled);
        assert!(matches!(
            cal_state(&sys, id),
            AlarmKind::Calendar { expired: true, .. }
        ));

        for _ in 0..5 {
            unit(&sys);
        }
        assert!(q.try_receive().is_err());
    }

    #[test]
    fn test_sinks_run_with_interrupts_enabled() {
        let sink = IrqCheckSink::default();
        let hw = TestHw::new();
        let sys = hw.time_sys();
        sys.set_sys_date_time(SysTime::new(3, 0)).unwrap();
        sys.add_periodic_alarm(periodic(20, 0, &sink)).unwrap();
        sys.add_cal_alarm(CalAlarm {
            date: 3,
            skip_on_time_change: true,
            ..daily(30, &sink)
        })
        .unwrap();

        for _ in 0..4 {
            unit(&sys);
        }
        assert_eq!(sink.sent.load(Ordering::Relaxed), 3);
        assert_eq!(sink.masked.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_locked_table_reports_busy() {
        let q: Queue<4> = Channel::new();
        let hw = TestHw::new();
        let sys = hw.time_sys();
        sys.set_sys_date_time(SysTime::new(3, 0)).unwrap();
        let id = sys.add_periodic_alarm(periodic(20, 0, &q)).unwrap();

        let held = sys.lock_alarms().unwrap();
        assert_eq!(
            sys.add_periodic_alarm(periodic(20, 0, &q)).err(),
            Some(TimeSysError::Busy)
        );
        assert_eq!(sys.delete_alarm(id), Err(TimeSysError::Busy));
        assert_eq!(
            sys.set_sys_date_time(SysTime::new(4, 0)).err(),
            Some(TimeSysError::Busy)
        );
        // Due at 20 ms, but the pass is skipped
        unit(&sys);
        unit(&sys);
        drop(held);
        assert!(drain(&q).is_empty());

        unit(&sys);
        unit(&sys);
        let msgs = drain(&q);
        assert_eq!(msgs.len(), 1);
        assert_eq!((msgs[0].date, msgs[0].time), (3, 40));
        sys.delete_alarm(id).unwrap();
    }

    #[test]
    fn test_one_shot_expires() {
        let q: Queue<4> = Channel::new();
        let hw = TestHw::new();
        let sys = hw.time_sys();
        sys.set_sys_date_time(SysTime::new(3, 1_000)).unwrap();
        let id = sys
            .add_cal_alarm(CalAlarm {
                date: 3,
                skip_on_time_change: true,
                ..daily(1_050, &q)
            })
            .unwrap();
        for _ in 0..10 {
            unit(&sys);
        }
        let msgs = drain(&q);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].time, 1_050);
        assert!(matches!(
            cal_state(&sys, id),
            AlarmKind::Calendar { expired: true, .. }
        ));
        assert_eq!(sys.get_cal_alarm(id).unwrap().date, 3);
    }

    #[test]
    fn test_calendar_waits_for_valid_time() {
        let q: Queue<4> = Channel::new();
        let hw = TestHw::new();
        let sys = hw.time_sys();
        sys.add_cal_alarm(CalAlarm {
            date: 1,
            ..daily(0, &q)
        })
        .unwrap();
        for _ in 0..5 {
            unit(&sys);
        }
        assert!(drain(&q).is_empty());

        sys.set_sys_date_time(SysTime::new(2, 0)).unwrap();
        unit(&sys);
        let msgs = drain(&q);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].cause, AlarmCause::Scheduled);
        assert!(msgs[0].time_changed_forward && msgs[0].time_changed_backward);
    }

    #[test]
    fn test_calendar_without_destination_still_expires() {
        let hw = TestHw::new();
        let sys = hw.time_sys();
        sys.set_sys_date_time(SysTime::new(3, 0)).unwrap();
        let id = sys
            .add_cal_alarm(CalAlarm {
                date: 3,
                time: 0,
                skip_on_time_change: true,
                use_local_time: false,
                sink: None,
            })
            .unwrap();
        unit(&sys);
        assert!(matches!(
            cal_state(&sys, id),
            AlarmKind::Calendar { expired: true, .. }
        ));
    }

    #[test]
    fn test_periodic_local_time() {
        let mut slot = AlarmSlot::EMPTY;
        slot.kind = AlarmKind::Periodic {
            period: HOUR,
            offset: 0,
            on_valid: true,
            on_invalid: false,
        };
        let half = (HOUR / 2) as i32;
        let at = |t| snapshot(SysTime::new(1, t), SysTime::new(0, 0), true, half);

        assert!(slot.periodic_due(&at(HOUR)));
        assert!(!slot.periodic_due(&at(HOUR / 2)));
        slot.use_local_time = true;
        assert!(slot.periodic_due(&at(HOUR / 2)));
        assert!(!slot.periodic_due(&at(HOUR)));

        // Negative offsets stay within the period
        let west = snapshot(SysTime::new(1, HOUR / 2), SysTime::new(0, 0), true, -half);
        assert!(slot.periodic_due(&west));
    }

    #[test]
    fn test_time_base_selection() {
        let mut slot = AlarmSlot::EMPTY;
        let mut kind = |on_valid, on_invalid| {
            slot.kind = AlarmKind::Periodic {
                period: 1000,
                offset: 0,
                on_valid,
                on_invalid,
            };
            slot
        };
        // Valid-time only: system time either way
        assert!(!kind(true, false).uses_power_up_time(true));
        assert!(!kind(true, false).uses_power_up_time(false));
        // Invalid-time only: power-up time either way
        assert!(kind(false, true).uses_power_up_time(true));
        assert!(kind(false, true).uses_power_up_time(false));
        // Both: follows validity
        assert!(!kind(true, true).uses_power_up_time(true));
        assert!(kind(true, true).uses_power_up_time(false));

        let mut cal = AlarmSlot::EMPTY;
        cal.kind = AlarmKind::Calendar {
            date: 1,
            time: 0,
            daily: false,
            expired: false,
        };
        assert!(!cal.uses_power_up_time(true));
    }

    #[test]
    fn test_periodic_branch_follows_validity() {
        let mut slot = AlarmSlot::EMPTY;
        slot.kind = AlarmKind::Periodic {
            period: 1000,
            offset: 0,
            on_valid: true,
            on_invalid: true,
        };
        let invalid = snapshot(SysTime::INVALID, SysTime::new(0, 3000), false, 0);
        assert!(slot.periodic_due(&invalid));
        let valid = snapshot(SysTime::new(1, 3500), SysTime::new(0, 3000), true, 0);
        assert!(!slot.periodic_due(&valid));
    }
}
