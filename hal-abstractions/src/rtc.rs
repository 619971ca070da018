//! Real-time clock collaborator

/// Broken-down calendar date and time as held by an RTC peripheral (UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RtcDateTime {
    pub year: u16,
    /// 1-12
    pub month: u8,
    /// 1-31
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub millis: u16,
}

impl RtcDateTime {
    /// 1970-01-01 00:00:00.000
    pub const EPOCH: Self = Self {
        year: 1970,
        month: 1,
        day: 1,
        hour: 0,
        minute: 0,
        second: 0,
        millis: 0,
    };
}

/// RTC operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RtcError {
    /// RTC not initialized
    NotInitialized,
    /// RTC hardware error
    HardwareError,
    /// Date/time fields out of range for the peripheral
    InvalidDateTime,
}

impl core::fmt::Display for RtcError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "RTC not initialized"),
            Self::HardwareError => write!(f, "RTC hardware error"),
            Self::InvalidDateTime => write!(f, "RTC date/time out of range"),
        }
    }
}

impl core::error::Error for RtcError {}

/// Battery-backed real-time clock
///
/// Methods take `&self`: implementations serialize access to the peripheral
/// internally (typically with a critical section) so the clock can be shared
/// between the boot path, the parameter handler and the dispatch task.
pub trait RtcClock: Sync {
    /// Whether the RTC has been set since it last lost power
    fn is_valid(&self) -> bool;

    /// Read the current date and time
    fn date_time(&self) -> Result<RtcDateTime, RtcError>;

    /// Set the date and time
    fn set_date_time(&self, dt: RtcDateTime) -> Result<(), RtcError>;

    /// Free-running microsecond reading used to measure tick drift
    fn micros(&self) -> Result<u64, RtcError>;
}
