//! Tick reload trim against the RTC crystal
//!
//! Boards without a GPS reference compare the RTOS tick against the RTC's
//! microsecond counter over 10 second windows. Once two consecutive windows
//! agree on a drift larger than the noise floor, the reload register is
//! scaled to cancel it.

use hal_abstractions::RtcClock;

use crate::config::RtcTrimConfig;

pub struct RtcTrim {
    config: RtcTrimConfig,
    ticks: u32,
    last_micros: Option<u64>,
    /// RTC time minus tick time over the current window
    acc: i64,
    last_acc: i64,
}

impl RtcTrim {
    /// Start trimming, taking the first RTC sample now
    pub fn new(config: RtcTrimConfig, rtc: &dyn RtcClock) -> Self {
        Self {
            config,
            ticks: 0,
            last_micros: rtc.micros().ok(),
            acc: 0,
            last_acc: 0,
        }
    }

    pub fn config(&self) -> &RtcTrimConfig {
        &self.config
    }

    /// One RTOS tick; returns a new reload value when a trim is due
    ///
    /// `reload` is the value currently in the reload register.
    pub fn on_tick(&mut self, time_valid: bool, rtc: &dyn RtcClock, reload: u32) -> Option<u32> {
        self.acc -= self.config.tick_us();
        if !time_valid {
            return None;
        }
        self.ticks += 1;
        if self.ticks < self.config.window_ticks() {
            return None;
        }
        self.ticks = 0;

        let now = match rtc.micros() {
            Ok(micros) => Some(micros),
            Err(e) => {
                warn!("RTC sample failed: {}", e);
                None
            }
        };
        let elapsed = match (now, self.last_micros) {
            (Some(now), Some(last)) => Some(now as i64 - last as i64),
            _ => None,
        };
        self.last_micros = now;

        let mut trim = None;
        match elapsed {
            Some(elapsed) if self.window_plausible(elapsed) => {
                self.acc += elapsed;
                let steady = (self.acc - self.last_acc) / self.config.stable_us == 0;
                if steady && self.acc.abs() > self.config.min_drift_us {
                    let value = self.trimmed(reload);
                    debug!("RTC drift {} us per window, reload {}", self.acc, value);
                    trim = Some(value);
                }
            }
            _ => self.acc = 0,
        }
        self.last_acc = self.acc;
        self.acc = 0;
        trim
    }

    fn window_plausible(&self, elapsed: i64) -> bool {
        let window = self.config.window_us as i64;
        let slack = window * self.config.window_tolerance_pct as i64 / 100;
        (window - slack..=window + slack).contains(&elapsed)
    }

    /// Scale `reload` to cancel the drift, within the trim limit
    fn trimmed(&self, reload: u32) -> u32 {
        let window = self.config.window_us as i64;
        let scaled = reload as i64 * (window - self.acc) / window;
        let nominal = self.config.nominal_reload() as i64;
        let limit = nominal * self.config.max_trim_pct as i64 / 100;
        scaled.clamp(nominal - limit, nominal + limit) as u32
    }
}
