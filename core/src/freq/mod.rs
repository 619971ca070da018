//! CPU clock frequency tracking
//!
//! [`ClockInfo`] holds the best estimate of the real CPU frequency and, on
//! GPS-equipped hardware, the phase relationship between the RTOS tick and
//! the 1PPS reference. It shares the clock critical section with the
//! software clock.

pub mod gps;
pub mod reload;
pub mod rtc_trim;

use embassy_sync::blocking_mutex::raw::RawMutex;
use hal_abstractions::FileStore;

use crate::config::FREQ_FRESH_SECS;
use crate::time::TimeSys;

pub use gps::{GpsEstimator, PpsCapture, PpsOutcome};
pub use reload::ReloadController;
pub use rtc_trim::RtcTrim;

/// Where a frequency estimate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockSource {
    #[default]
    None,
    Tcxo,
    Cpu,
    Gps,
    Afc,
}

impl ClockSource {
    /// Four-character label used in status reports
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Tcxo => "TCXO",
            Self::Cpu => "CPU ",
            Self::Gps => "GPS ",
            Self::Afc => "AFC ",
        }
    }
}

/// Frequency estimate and GPS phase-lock state
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClockInfo {
    /// Estimated CPU frequency in Hz
    pub freq: u32,
    /// Seconds since epoch of the last update; 0 marks the estimate stale
    pub freq_last_update: u32,
    pub source: ClockSource,
    /// A GPS-derived frequency is available for tick correction
    pub valid_freq: bool,
    /// RTOS ticks left before GPS is declared absent
    pub watchdog: u32,
    /// Filtered tick-to-1PPS phase error in core cycles
    pub tick_to_gps_error: f32,
    /// Unfiltered phase error of the last window
    pub raw_error: i32,
    /// Capture-timer ticks over the last trusted 10 s window
    pub ftm_count: u32,
    pub phase_locked: bool,
    /// UTC was received while tracking GPS
    pub got_gps_time: bool,
    /// A phase correction is pending for the reload controller
    pub send_command: bool,
    /// Cycle counter at the last 5-second tick boundary
    pub five_sec_tick_time: u32,
}

impl ClockInfo {
    pub const fn new(nominal_freq: u32, nominal_window: u32) -> Self {
        Self {
            freq: nominal_freq,
            freq_last_update: 0,
            source: ClockSource::None,
            valid_freq: false,
            watchdog: 0,
            tick_to_gps_error: 0.0,
            raw_error: 0,
            ftm_count: nominal_window,
            phase_locked: false,
            got_gps_time: false,
            send_command: false,
            five_sec_tick_time: 0,
        }
    }

    /// Forget GPS-derived state; the published frequency is kept
    pub fn reset_gps_stats(&mut self, nominal_window: u32) {
        self.ftm_count = nominal_window;
        self.got_gps_time = false;
        self.phase_locked = false;
        self.valid_freq = false;
    }

    /// Publish a frequency; a reset marks it stale immediately
    pub fn set_freq(&mut self, freq: u32, source: ClockSource, now_secs: u32, reset: bool) {
        self.freq = freq;
        self.source = source;
        self.freq_last_update = if reset { 0 } else { now_secs };
    }

    pub fn is_fresh(&self, now_secs: u32) -> bool {
        now_secs.wrapping_sub(self.freq_last_update) < FREQ_FRESH_SECS
    }

    /// Phase error scaled to `units_per_sec` (1e6 for microseconds)
    fn phase_error(&self, units_per_sec: f64) -> i32 {
        if self.freq == 0 {
            return 0;
        }
        (self.tick_to_gps_error as f64 * units_per_sec / 5.0 / self.freq as f64) as i32
    }
}

/// Reading returned by [`TimeSys::get_real_cpu_freq`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CpuFreq {
    pub freq: u32,
    pub source: ClockSource,
    /// Updated within the last minute
    pub fresh: bool,
}

impl<'a, F: FileStore, M: RawMutex> TimeSys<'a, F, M> {
    /// Copy of the frequency information
    pub fn clock_info(&self) -> ClockInfo {
        critical_section::with(|cs| self.clock.borrow_ref(cs).info)
    }

    pub fn get_real_cpu_freq(&self) -> CpuFreq {
        critical_section::with(|cs| {
            let clock = self.clock.borrow_ref(cs);
            let now = clock.sys.to_seconds();
            CpuFreq {
                freq: clock.info.freq,
                source: clock.info.source,
                fresh: clock.info.is_fresh(now),
            }
        })
    }

    /// Publish a frequency estimate; `reset` marks it stale
    pub fn set_real_cpu_freq(&self, freq: u32, source: ClockSource, reset: bool) {
        critical_section::with(|cs| {
            let mut clock = self.clock.borrow_ref_mut(cs);
            let now = clock.sys.to_seconds();
            clock.info.set_freq(freq, source, now, reset);
        });
        debug!("CPU frequency {} Hz from {}", freq, source.name());
    }

    /// 1PPS edges arrived recently
    pub fn is_gps_present(&self) -> bool {
        self.clock_info().watchdog != 0
    }

    pub fn is_gps_phase_locked(&self) -> bool {
        self.clock_info().phase_locked
    }

    /// UTC was received after GPS tracking started
    pub fn is_gps_time_valid(&self) -> bool {
        self.clock_info().got_gps_time
    }

    /// Filtered phase error in microseconds per second
    pub fn phase_error_usec(&self) -> i32 {
        self.clock_info().phase_error(1_000_000.0)
    }

    /// Filtered phase error in nanoseconds per second
    pub fn phase_error_nsec(&self) -> i32 {
        self.clock_info().phase_error(1_000_000_000.0)
    }

    /// Run `f` on the frequency information inside the clock critical section
    pub(crate) fn with_clock_info<R>(&self, f: impl FnOnce(&mut ClockInfo) -> R) -> R {
        critical_section::with(|cs| f(&mut self.clock.borrow_ref_mut(cs).info))
    }

    pub fn reset_gps_stats(&self) {
        let window = self.config.gps.nominal_window();
        critical_section::with(|cs| self.clock.borrow_ref_mut(cs).info.reset_gps_stats(window));
    }

    /// 1PPS capture interrupt entry
    ///
    /// Runs the estimator inside the clock critical section. Never blocks.
    pub fn gps_capture(&self, estimator: &mut GpsEstimator, capture: PpsCapture) -> PpsOutcome {
        let outcome = critical_section::with(|cs| {
            let mut clock = self.clock.borrow_ref_mut(cs);
            let now = clock.sys.to_seconds();
            estimator.on_capture(capture, &mut clock.info, now)
        });
        match outcome {
            PpsOutcome::Published { freq, locked } => {
                trace!("GPS window: {} Hz, locked {}", freq, locked)
            }
            PpsOutcome::Rejected(reason) => debug!("GPS window rejected: {:?}", reason),
            PpsOutcome::Measured { .. } => {}
        }
        outcome
    }
}
