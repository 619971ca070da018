//! GPS 1PPS frequency and phase estimator
//!
//! The capture timer latches its counter on a GPS-derived edge every
//! 5 seconds. Each interrupt closes a 10 second window spanning the last
//! three edges, from which the real CPU frequency is estimated and the
//! phase of the software tick's 5-second boundary is compared against the
//! edge.
//!
//! ## Pipeline per edge
//! 1. Latency-compensate the cycle counter sample
//! 2. Count capture-timer ticks over the window (bootstrap from the cycle
//!    counter until a trusted count exists, then rollover-corrected)
//! 3. Sanity band around the nominal clock
//! 4. Convergence gate (unlocked) or glitch gate (locked)
//! 5. Phase error on the circular 5-second timeline, lock hysteresis
//! 6. Frequency filter; publish when the last windows agree
//!
//! Any rejection discards the window and waits for the next edge.

use heapless::HistoryBuffer;

use super::{ClockInfo, ClockSource};
use crate::config::GpsConfig;

/// Windows the frequency filter spans
pub const FREQ_FILTER_LEN: usize = 5;

/// Capture-timer period
const TIMER_SPAN: u32 = 1 << 16;

/// Register values sampled in the capture interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PpsCapture {
    /// Free-running cycle counter at interrupt entry
    pub cycle_count: u32,
    /// Capture timer counter at interrupt entry
    pub timer_now: u16,
    /// Capture timer value latched on the edge
    pub captured: u16,
}

/// Why a window was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RejectReason {
    /// Implied frequency outside the sanity band; statistics were reset
    OutOfBand,
    /// Count jumped while phase locked
    Glitch,
    /// Two consecutive counts disagree while unlocked
    NotConverged,
}

/// Result of one capture
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PpsOutcome {
    Rejected(RejectReason),
    /// Window accepted; the frequency filter is not settled yet
    Measured { error: i32, locked: bool },
    /// Window accepted and a frequency was published
    Published { freq: u32, locked: bool },
}

/// Per-interrupt history of the estimator
///
/// Owned by the capture interrupt handler; shared results go to
/// [`ClockInfo`].
pub struct GpsEstimator {
    config: GpsConfig,
    cycles: u32,
    cycles_5s: u32,
    cycles_10s: u32,
    current: u16,
    five_sec_ago: u16,
    ten_sec_ago: u16,
    prev_count: u32,
    filter: HistoryBuffer<u32, FREQ_FILTER_LEN>,
}

impl GpsEstimator {
    pub const fn new(config: GpsConfig) -> Self {
        Self {
            config,
            cycles: 0,
            cycles_5s: 0,
            cycles_10s: 0,
            current: 0,
            five_sec_ago: 0,
            ten_sec_ago: 0,
            prev_count: 0,
            filter: HistoryBuffer::new(),
        }
    }

    pub fn config(&self) -> &GpsConfig {
        &self.config
    }

    /// Process one 1PPS capture
    pub fn on_capture(
        &mut self,
        capture: PpsCapture,
        info: &mut ClockInfo,
        now_secs: u32,
    ) -> PpsOutcome {
        let ratio = self.config.clock_ratio();
        let window = self.config.nominal_window();

        self.cycles_10s = self.cycles_5s;
        self.cycles_5s = self.cycles;
        self.ten_sec_ago = self.five_sec_ago;
        self.five_sec_ago = self.current;
        self.current = capture.captured;

        // Back-date the cycle sample to the edge, in core cycles
        let latency = capture.timer_now.wrapping_sub(capture.captured) as i16 as i32;
        self.cycles = capture
            .cycle_count
            .wrapping_sub(ratio.wrapping_mul(latency as u32));

        if info.watchdog == 0 {
            info.reset_gps_stats(window);
        }

        let count = if info.ftm_count == window {
            self.cycles.wrapping_sub(self.cycles_10s) / ratio
        } else {
            let since_ten = TIMER_SPAN - self.ten_sec_ago as u32;
            let remainder = info
                .ftm_count
                .wrapping_sub(since_ten)
                .wrapping_sub(self.current as u32);
            let rollover = remainder.wrapping_add(TIMER_SPAN / 2) / TIMER_SPAN;
            TIMER_SPAN
                .wrapping_mul(rollover)
                .wrapping_add(since_ten)
                .wrapping_add(self.current as u32)
        };

        if !self.in_band(count) {
            info.reset_gps_stats(window);
            return PpsOutcome::Rejected(RejectReason::OutOfBand);
        }

        let gate = self.config.convergence_ticks;
        if info.phase_locked {
            if info.ftm_count.abs_diff(count) > gate {
                return PpsOutcome::Rejected(RejectReason::Glitch);
            }
        } else if self.prev_count.abs_diff(count) > gate {
            self.prev_count = count;
            return PpsOutcome::Rejected(RejectReason::NotConverged);
        }
        self.prev_count = count;

        let error = self.phase_error(count, info.five_sec_tick_time);
        info.raw_error = error;

        let magnitude = error.unsigned_abs();
        let threshold = self.config.lock_threshold.unsigned_abs();
        let unlock = threshold * self.config.unlock_factor.unsigned_abs();
        if !info.phase_locked && magnitude < threshold {
            info.phase_locked = true;
            info!("GPS phase locked (error {} cycles)", error);
        } else if info.phase_locked && magnitude > unlock {
            info.phase_locked = false;
            warn!("GPS phase lock lost (error {} cycles)", error);
        }

        if info.phase_locked {
            let alpha = self.config.error_alpha;
            info.tick_to_gps_error = error as f32 * alpha + info.tick_to_gps_error * (1.0 - alpha);
        } else {
            info.tick_to_gps_error = error as f32;
        }

        let freq = (count as u64 * ratio as u64 / 10) as u32;
        self.filter.write(freq);

        let outcome = match self.filter_spread() {
            Some(spread) if spread < self.config.filter_tolerance_hz => {
                info.ftm_count = count;
                info.set_freq(freq, ClockSource::Gps, now_secs, false);
                info.valid_freq = true;
                info.send_command = true;
                PpsOutcome::Published {
                    freq,
                    locked: info.phase_locked,
                }
            }
            _ => PpsOutcome::Measured {
                error,
                locked: info.phase_locked,
            },
        };

        info.watchdog = self.config.watchdog_reset();
        outcome
    }

    /// Window frequency within the sanity band around nominal
    fn in_band(&self, count: u32) -> bool {
        let estimate = (count / 10) as u64 * self.config.clock_ratio() as u64;
        let nominal = self.config.core_clock_hz as u64;
        let tolerance = nominal * self.config.sanity_ppm as u64 / 1_000_000;
        estimate <= nominal + tolerance && estimate >= nominal.saturating_sub(tolerance)
    }

    /// Signed cycles from the biased expected edge to the tick boundary,
    /// whichever way round the 5-second circle is shorter
    fn phase_error(&self, count: u32, five_sec_tick_time: u32) -> i32 {
        let ratio = self.config.clock_ratio();
        let bias = (count as f32 * self.config.clock_bias / 10.0 * ratio as f32 + 0.5) as u32;
        let left = self
            .cycles
            .wrapping_sub(bias)
            .wrapping_sub(five_sec_tick_time) as i32;
        // 5 s in core cycles
        let circle = (count as u64 * ratio as u64 / 2) as i32;
        let right = if left >= 0 {
            left.wrapping_sub(circle)
        } else {
            circle.wrapping_add(left)
        };
        if left.unsigned_abs() < right.unsigned_abs() {
            left
        } else {
            right
        }
    }

    /// Max minus min of the filter, once it holds a full set of windows
    fn filter_spread(&self) -> Option<u32> {
        let values = self.filter.as_slice();
        if values.len() < FREQ_FILTER_LEN {
            return None;
        }
        let max = values.iter().copied().max()?;
        let min = values.iter().copied().min()?;
        Some(max - min)
    }
}
