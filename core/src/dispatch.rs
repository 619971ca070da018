//! Alarm dispatch task
//!
//! The tick interrupt posts [`TickSemaphore`] once per RTOS tick. The task
//! side runs the tick discipline (GPS reload control or RTC trim) on every
//! post and the alarm pass once per logical time unit.

use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::signal::Signal;
use hal_abstractions::{FileStore, TickCounter};

use crate::freq::{ReloadController, RtcTrim};
use crate::time::TimeSys;

/// Counting semaphore posted from interrupt context
pub struct TickSemaphore {
    count: AtomicU32,
    signal: Signal<CriticalSectionRawMutex, ()>,
}

impl TickSemaphore {
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            signal: Signal::new(),
        }
    }

    /// Never blocks
    pub fn post(&self) {
        self.count.fetch_add(1, Ordering::Release);
        self.signal.signal(());
    }

    /// Take one post if available
    pub fn try_pend(&self) -> bool {
        self.count
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Wait for and take one post
    pub async fn pend(&self) {
        loop {
            if self.try_pend() {
                return;
            }
            self.signal.wait().await;
        }
    }

    /// Posts not yet taken
    pub fn pending(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for TickSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// What keeps the tick period honest
pub enum Discipline {
    /// Nominal reload, never adjusted
    None,
    /// Reload derived from the GPS-measured CPU frequency
    Gps(ReloadController),
    /// Reload trimmed against the RTC crystal
    Rtc(RtcTrim),
}

pub struct DispatchTask<'s, 'a, F: FileStore, M: RawMutex = CriticalSectionRawMutex> {
    time_sys: &'s TimeSys<'a, F, M>,
    sem: &'s TickSemaphore,
    discipline: Discipline,
    ticks: u32,
}

impl<'s, 'a, F: FileStore, M: RawMutex> DispatchTask<'s, 'a, F, M> {
    pub fn new(time_sys: &'s TimeSys<'a, F, M>, sem: &'s TickSemaphore, discipline: Discipline) -> Self {
        Self {
            time_sys,
            sem,
            discipline,
            ticks: 0,
        }
    }

    /// Handle one RTOS tick
    pub fn on_tick(&mut self) {
        let counter = self.time_sys.tick_counter();
        let reload = match &mut self.discipline {
            Discipline::None => None,
            Discipline::Gps(ctl) => self.time_sys.with_clock_info(|info| ctl.on_tick(info)),
            Discipline::Rtc(trim) => {
                let current = counter
                    .map(|c| c.reload())
                    .unwrap_or_else(|| trim.config().nominal_reload());
                trim.on_tick(self.time_sys.is_time_valid(), self.time_sys.rtc, current)
            }
        };
        if let (Some(value), Some(counter)) = (reload, counter) {
            if counter.reload() != value {
                trace!("Tick reload {}", value);
                counter.set_reload(value);
            }
        }

        self.ticks += 1;
        if self.ticks >= self.time_sys.config().ticks_per_unit() {
            self.ticks = 0;
            self.time_sys.process_sys_tick();
        }
    }

    /// Wait for one tick post and handle it
    pub async fn step(&mut self) {
        self.sem.pend().await;
        self.on_tick();
    }

    pub async fn run(&mut self) -> ! {
        info!("Alarm dispatch task running");
        loop {
            self.step().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GpsConfig, RtcTrimConfig};
    use crate::freq::ClockSource;
    use crate::testutil::{FakeCounter, TestHw};
    use crate::time::{AlarmCause, AlarmMsg, PeriodicAlarm, SysTime};
    use embassy_futures::block_on;
    use embassy_sync::channel::Channel;

    #[test]
    fn test_semaphore_counts() {
        let sem = TickSemaphore::new();
        assert!(!sem.try_pend());
        sem.post();
        sem.post();
        sem.post();
        assert_eq!(sem.pending(), 3);
        assert!(sem.try_pend());
        block_on(sem.pend());
        block_on(sem.pend());
        assert!(!sem.try_pend());
        assert_eq!(sem.pending(), 0);
    }

    #[test]
    fn test_alarm_pass_once_per_unit() {
        let q: Channel<CriticalSectionRawMutex, AlarmMsg, 4> = Channel::new();
        let hw = TestHw::new();
        let sys = hw.time_sys();
        let sem = TickSemaphore::new();
        sys.add_periodic_alarm(PeriodicAlarm {
            period: 1000,
            offset: 0,
            skip_on_time_change: true,
            use_local_time: false,
            on_valid_time: false,
            on_invalid_time: true,
            sink: Some(&q),
        })
        .unwrap();

        let mut task = DispatchTask::new(&sys, &sem, Discipline::None);
        for _ in 0..200 {
            sys.tick(0);
            sem.post();
            block_on(task.step());
        }
        let msg = q.try_receive().unwrap();
        assert_eq!(msg.cause, AlarmCause::Scheduled);
        assert!(!msg.using_system_time);
        assert_eq!(msg.time, 1000);
        assert!(q.try_receive().is_err());
    }

    #[test]
    fn test_gps_discipline_writes_reload() {
        let hw = TestHw::new();
        let counter = FakeCounter::new(599_999, 0);
        let sys = hw.with_counter(&counter);
        let sem = TickSemaphore::new();
        sys.set_real_cpu_freq(120_000_500, ClockSource::Gps, false);
        sys.with_clock_info(|info| {
            info.valid_freq = true;
            info.watchdog = 10;
        });

        let mut task = DispatchTask::new(
            &sys,
            &sem,
            Discipline::Gps(ReloadController::new(GpsConfig::default())),
        );
        sem.post();
        block_on(task.step());
        assert_eq!(counter.reload(), 600_001);
        assert_eq!(sys.clock_info().watchdog, 9);
    }

    #[test]
    fn test_no_reload_without_gps() {
        let hw = TestHw::new();
        let counter = FakeCounter::new(599_999, 0);
        let sys = hw.with_counter(&counter);
        let sem = TickSemaphore::new();
        let mut task = DispatchTask::new(
            &sys,
            &sem,
            Discipline::Gps(ReloadController::new(GpsConfig::default())),
        );
        for _ in 0..10 {
            task.on_tick();
        }
        assert_eq!(counter.reload(), 599_999);
    }

    #[test]
    fn test_rtc_discipline_trims_reload() {
        let hw = TestHw::new();
        let counter = FakeCounter::new(600_000, 0);
        let sys = hw.with_counter(&counter);
        let sem = TickSemaphore::new();
        sys.set_sys_date_time(SysTime::new(10, 0)).unwrap();

        let trim = RtcTrim::new(RtcTrimConfig::default(), &hw.rtc);
        let mut task = DispatchTask::new(&sys, &sem, Discipline::Rtc(trim));
        for _ in 0..1999 {
            task.on_tick();
        }
        hw.rtc.advance_micros(10_000_500);
        task.on_tick();
        assert_eq!(counter.reload(), 599_970);
    }
}
