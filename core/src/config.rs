//! Time subsystem configuration structures
//!
//! The GPS constants are empirical calibration values for the capture
//! hardware. They are kept as named defaults rather than derived.

/// Number of alarm slots
pub const MAX_ALARMS: usize = 20;

/// Milliseconds per second (time of day is kept in milliseconds)
pub const TICKS_PER_SEC: u32 = 1000;

/// Milliseconds per day
pub const TICKS_PER_DAY: u32 = 86_400 * TICKS_PER_SEC;

/// Seconds after an update during which a published CPU frequency is fresh
pub const FREQ_FRESH_SECS: u32 = 60;

/// Lower bound for the time request timeout parameter (seconds)
pub const MIN_TIME_REQUEST_TIMEOUT: u16 = 30;

/// Upper bound for the time acceptance delay parameter (seconds)
pub const MAX_TIME_ACCEPTANCE_DELAY: u16 = 3600;

/// Allowed range of the time signature offset parameter (milliseconds)
pub const TIME_SIG_OFFSET_RANGE: core::ops::RangeInclusive<u16> = 1..=60_000;

/// Software clock configuration
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimeSysConfig {
    /// RTOS tick period in milliseconds
    pub tick_ms: u32,
    /// Logical time unit in milliseconds; system time advances in these steps
    pub unit_ms: u32,
    /// Clock tree and 1PPS estimator constants
    pub gps: GpsConfig,
}

impl TimeSysConfig {
    /// RTOS ticks per logical time unit (at least 1)
    pub fn ticks_per_unit(&self) -> u32 {
        (self.unit_ms / self.tick_ms.max(1)).max(1)
    }
}

impl Default for TimeSysConfig {
    fn default() -> Self {
        Self {
            tick_ms: 5,
            unit_ms: 10,
            gps: GpsConfig::default(),
        }
    }
}

/// GPS 1PPS frequency/phase estimator configuration
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GpsConfig {
    /// Nominal core (cycle counter) clock
    pub core_clock_hz: u32,
    /// Nominal bus clock driving the capture timer
    pub bus_clock_hz: u32,
    /// RTOS tick rate
    pub tick_rate_hz: u32,
    /// Allowed deviation of a window's frequency from nominal, in ppm
    pub sanity_ppm: u32,
    /// Maximum disagreement between window counts, in capture-timer ticks
    pub convergence_ticks: u32,
    /// Maximum spread of the frequency filter before publishing, in Hz
    pub filter_tolerance_hz: u32,
    /// Phase error (cycles) below which the loop is considered locked
    pub lock_threshold: i32,
    /// Unlock when the error exceeds `lock_threshold * unlock_factor`
    pub unlock_factor: i32,
    /// Exponential filter weight of a new phase error while locked
    pub error_alpha: f32,
    /// Fraction of a window the expected edge is placed before the boundary
    pub clock_bias: f32,
    /// Seconds without a 1PPS edge before GPS is considered absent
    pub watchdog_secs: u32,
    /// Proportional gain applied to the tick-to-GPS error
    pub command_gain: f32,
}

impl GpsConfig {
    /// Core cycles per capture-timer tick
    pub fn clock_ratio(&self) -> u32 {
        (self.core_clock_hz / self.bus_clock_hz.max(1)).max(1)
    }

    /// Watchdog reload value in RTOS ticks
    pub fn watchdog_reset(&self) -> u32 {
        self.watchdog_secs * self.tick_rate_hz
    }

    /// Capture-timer ticks in a 10 second window at nominal clock; also marks
    /// an estimator waiting to bootstrap
    pub fn nominal_window(&self) -> u32 {
        self.bus_clock_hz.wrapping_mul(10)
    }
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            core_clock_hz: 120_000_000,
            bus_clock_hz: 60_000_000,
            tick_rate_hz: 200,
            sanity_ppm: 150,
            convergence_ticks: 100,
            filter_tolerance_hz: 10,
            lock_threshold: 10,
            unlock_factor: 5,
            error_alpha: 0.1,
            clock_bias: 0.0001,
            watchdog_secs: 60,
            command_gain: 0.4,
        }
    }
}

/// RTC-referenced tick trim configuration
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RtcTrimConfig {
    /// Nominal core clock
    pub core_clock_hz: u32,
    /// RTOS tick rate
    pub tick_rate_hz: u32,
    /// RTOS tick period in milliseconds
    pub tick_ms: u32,
    /// Measurement window in microseconds
    pub window_us: u32,
    /// Accepted deviation of a measured window, in percent
    pub window_tolerance_pct: u32,
    /// Drift (microseconds per window) below which no trim is applied
    pub min_drift_us: i64,
    /// Consecutive drift samples must agree within this many microseconds
    pub stable_us: i64,
    /// Trim limit around the nominal reload, in percent
    pub max_trim_pct: u32,
}

impl RtcTrimConfig {
    /// Nominal reload register value
    pub fn nominal_reload(&self) -> u32 {
        self.core_clock_hz / self.tick_rate_hz.max(1)
    }

    /// RTOS tick period in microseconds
    pub fn tick_us(&self) -> i64 {
        self.tick_ms as i64 * 1000
    }

    /// RTOS ticks per measurement window
    pub fn window_ticks(&self) -> u32 {
        (self.window_us / (self.tick_ms * 1000).max(1)).max(1)
    }
}

impl Default for RtcTrimConfig {
    fn default() -> Self {
        Self {
            core_clock_hz: 120_000_000,
            tick_rate_hz: 200,
            tick_ms: 5,
            window_us: 10_000_000,
            window_tolerance_pct: 2,
            min_drift_us: 100,
            stable_us: 10_000,
            max_trim_pct: 1,
        }
    }
}
