//! Tick reload control from a GPS-disciplined frequency
//!
//! Runs once per RTOS tick. The reload value is the published frequency
//! divided down to the tick rate; the fractional remainder is accumulated
//! and paid back one cycle at a time so the average period is exact. A
//! pending phase correction adds a proportional command on top.

use super::ClockInfo;
use crate::config::GpsConfig;

/// Largest command, as a fraction of the reload value, that slows the tick
const MAX_SLOW_DOWN: f32 = 1.1;
/// Largest command, as a fraction of the reload value, that speeds it up
const MAX_SPEED_UP: f32 = 0.1;

/// Reload register controller
pub struct ReloadController {
    config: GpsConfig,
    /// Accumulated fractional cycles
    dither: u32,
}

impl ReloadController {
    pub const fn new(config: GpsConfig) -> Self {
        Self { config, dither: 0 }
    }

    /// One RTOS tick
    ///
    /// Counts the GPS watchdog down and returns the reload value to write,
    /// or `None` while no GPS frequency is valid.
    pub fn on_tick(&mut self, info: &mut ClockInfo) -> Option<u32> {
        info.watchdog = info.watchdog.saturating_sub(1);
        if !info.valid_freq {
            return None;
        }

        // Five ticks worth of cycles keeps the fraction small
        let rate = self.config.tick_rate_hz as u64 * 5;
        let cycles = info.freq as u64 * 5;
        let mut reload = (cycles / rate) as u32 - 1;
        self.dither += (cycles % rate) as u32;
        if self.dither as u64 >= rate {
            self.dither -= rate as u32;
            reload += 1;
        }

        let mut command = 0i32;
        if info.send_command {
            command = (info.tick_to_gps_error * self.config.command_gain) as i32;
            let upper = (reload as f32 * MAX_SLOW_DOWN) as i32;
            let lower = (reload as f32 * -MAX_SPEED_UP) as i32;
            if command > upper {
                command = upper;
                info.tick_to_gps_error -= command as f32;
            } else if command < lower {
                command = lower;
                info.tick_to_gps_error -= command as f32;
            } else {
                info.send_command = false;
            }
        }

        Some((reload as i64 + command as i64) as u32)
    }
}
