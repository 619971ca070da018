//! Radio sync to zero-cross correlation
//!
//! The radio ISR records the cycle counter at each detected sync word
//! together with the last mains zero-cross capture. The MAC layer later
//! looks the record up by its sync timestamp to report the phase angle
//! of the sync relative to the mains cycle.

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::HistoryBuffer;

/// Records retained
pub const SYNC_ENTRY_COUNT: usize = 4;

/// Full circle in hundredths of a degree
pub const MAX_ANGLE: u32 = 36_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SyncRecord {
    /// Radio timestamp of the sync, Q32.32 seconds
    pub sync_time: u64,
    /// Cycle counter when the sync was detected
    pub sync_cycles: u32,
    /// Cycle counter at the last zero cross
    pub zcd_count: u32,
    /// Cycles per mains period
    pub zcd_period: u32,
}

impl SyncRecord {
    /// Angle from the sync to the next zero cross, in hundredths of a degree
    ///
    /// A zero cross captured just after the sync is moved back one period.
    /// `None` without a measured mains period.
    pub fn phase_angle(&self) -> Option<u16> {
        if self.zcd_period == 0 {
            return None;
        }
        let mut zcd = self.zcd_count;
        if (zcd.wrapping_sub(self.sync_cycles) as i32) > 0 {
            zcd = zcd.wrapping_sub(self.zcd_period);
        }
        let delta = self.sync_cycles.wrapping_sub(zcd) as u64;
        let angle = MAX_ANGLE as i64 - (delta * MAX_ANGLE as u64 / self.zcd_period as u64) as i64;
        Some(angle.rem_euclid(MAX_ANGLE as i64) as u16)
    }
}

/// Ring of the most recent sync records, shared between ISR and task
pub struct SyncRing {
    records: Mutex<RefCell<HistoryBuffer<SyncRecord, SYNC_ENTRY_COUNT>>>,
}

impl SyncRing {
    pub const fn new() -> Self {
        Self {
            records: Mutex::new(RefCell::new(HistoryBuffer::new())),
        }
    }

    /// Record a sync, dropping the oldest when full
    pub fn add(&self, record: SyncRecord) {
        critical_section::with(|cs| self.records.borrow_ref_mut(cs).write(record));
    }

    pub fn get(&self, sync_time: u64) -> Option<SyncRecord> {
        critical_section::with(|cs| {
            self.records
                .borrow_ref(cs)
                .as_slice()
                .iter()
                .find(|r| r.sync_time == sync_time)
                .copied()
        })
    }
}

impl Default for SyncRing {
    fn default() -> Self {
        Self::new()
    }
}
