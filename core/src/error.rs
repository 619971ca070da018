//! Time subsystem error types

use hal_abstractions::{RtcError, StorageError};

/// Time subsystem operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimeSysError {
    /// Periodic alarm registered with a zero period
    ZeroPeriod,
    /// Periodic alarm offset is not smaller than its period
    OffsetOutOfRange,
    /// Fires on invalid time only, yet wants no time-change notification
    MeaninglessFlags,
    /// Periodic alarm registered without a destination
    MissingDestination,
    /// Calendar time of day is not within one day
    InvalidTimeOfDay,
    /// All alarm slots are in use
    NoFreeSlot,
    /// Alarm id out of range or slot not in use
    InvalidAlarmId,
    /// Slot holds a periodic alarm
    NotCalendarAlarm,
    /// Slot holds a calendar alarm
    NotPeriodicAlarm,
    /// Parameter value outside its allowed range or of the wrong kind
    ValueOutOfRange,
    /// Parameter cannot be written
    ReadOnly,
    /// Alarm table or persisted variables held by another context
    Busy,
    /// File store failure
    Storage(StorageError),
    /// RTC failure
    Rtc(RtcError),
}

impl core::fmt::Display for TimeSysError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ZeroPeriod => write!(f, "Alarm period is zero"),
            Self::OffsetOutOfRange => write!(f, "Alarm offset not less than period"),
            Self::MeaninglessFlags => write!(f, "Alarm would never fire"),
            Self::MissingDestination => write!(f, "Alarm has no destination"),
            Self::InvalidTimeOfDay => write!(f, "Time of day out of range"),
            Self::NoFreeSlot => write!(f, "No free alarm slot"),
            Self::InvalidAlarmId => write!(f, "Invalid alarm id"),
            Self::NotCalendarAlarm => write!(f, "Not a calendar alarm"),
            Self::NotPeriodicAlarm => write!(f, "Not a periodic alarm"),
            Self::ValueOutOfRange => write!(f, "Value out of range"),
            Self::ReadOnly => write!(f, "Parameter is read-only"),
            Self::Busy => write!(f, "Time subsystem busy"),
            Self::Storage(e) => write!(f, "Storage error: {}", e),
            Self::Rtc(e) => write!(f, "RTC error: {}", e),
        }
    }
}

// Implement core::error::Error for no_std compatibility
impl core::error::Error for TimeSysError {}

impl From<StorageError> for TimeSysError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<RtcError> for TimeSysError {
    fn from(e: RtcError) -> Self {
        Self::Rtc(e)
    }
}

/// Destination could not accept the message right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SinkBusy;

impl core::fmt::Display for SinkBusy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Alarm destination busy")
    }
}

impl core::error::Error for SinkBusy {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_storage_error() {
        let e: TimeSysError = StorageError::Io.into();
        assert_eq!(e, TimeSysError::Storage(StorageError::Io));
    }

    #[test]
    fn test_display_nests_source() {
        let e = TimeSysError::Rtc(RtcError::HardwareError);
        assert_eq!(e.to_string(), "RTC error: RTC hardware error");
    }
}
