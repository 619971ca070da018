//! Persisted time variables and the get/set parameter handler
//!
//! The record is rewritten on every change. A missing or short record is
//! replaced by defaults at boot.

use embassy_sync::blocking_mutex::raw::RawMutex;
use hal_abstractions::{FileId, FileStore};

use super::calendar::{date_time_to_seconds, seconds_to_date_time};
use super::change::TimeChange;
use super::clock::TimeState;
use super::TimeSys;
use crate::config::{MAX_TIME_ACCEPTANCE_DELAY, MIN_TIME_REQUEST_TIMEOUT, TIME_SIG_OFFSET_RANGE};
use crate::error::TimeSysError;

/// Default time signature offset (milliseconds)
pub const DEFAULT_TIME_SIG_OFFSET: u16 = 12_000;

/// Default time acceptance delay (seconds)
pub const DEFAULT_TIME_ACCEPTANCE_DELAY: u16 = 60;

/// Default maximum time request timeout (seconds)
pub const DEFAULT_TIME_REQUEST_MAX_TIMEOUT: u16 = 900;

/// Persisted time variables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimeVars {
    pub time_sig_offset: u16,
    pub time_acceptance_delay: u16,
    /// Seconds since epoch of the last time change
    pub time_last_updated: u32,
    /// Seconds since epoch of the first valid time ever received
    pub install_date_time: u32,
    pub time_request_max_timeout: u16,
    pub date_time_lost_count: u16,
    pub time_state: TimeState,
}

impl Default for TimeVars {
    fn default() -> Self {
        Self {
            time_sig_offset: DEFAULT_TIME_SIG_OFFSET,
            time_acceptance_delay: DEFAULT_TIME_ACCEPTANCE_DELAY,
            time_last_updated: 0,
            install_date_time: 0,
            time_request_max_timeout: DEFAULT_TIME_REQUEST_MAX_TIMEOUT,
            date_time_lost_count: 0,
            time_state: TimeState::Invalid,
        }
    }
}

impl TimeVars {
    /// Encoded record length
    pub const ENCODED_LEN: usize = 17;

    /// Little-endian fixed layout
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..2].copy_from_slice(&self.time_sig_offset.to_le_bytes());
        buf[2..4].copy_from_slice(&self.time_acceptance_delay.to_le_bytes());
        buf[4..8].copy_from_slice(&self.time_last_updated.to_le_bytes());
        buf[8..12].copy_from_slice(&self.install_date_time.to_le_bytes());
        buf[12..14].copy_from_slice(&self.time_request_max_timeout.to_le_bytes());
        buf[14..16].copy_from_slice(&self.date_time_lost_count.to_le_bytes());
        buf[16] = self.time_state as u8;
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        let u16_at = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Some(Self {
            time_sig_offset: u16_at(0),
            time_acceptance_delay: u16_at(2),
            time_last_updated: u32_at(4),
            install_date_time: u32_at(8),
            time_request_max_timeout: u16_at(12),
            date_time_lost_count: u16_at(14),
            time_state: TimeState::from_u8(buf[16]),
        })
    }
}

/// Variables plus their backing store
pub(crate) struct VarStore<F: FileStore> {
    store: F,
    vars: TimeVars,
    ship_mode: bool,
}

impl<F: FileStore> VarStore<F> {
    pub(crate) fn load(mut store: F) -> Self {
        let mut buf = [0u8; TimeVars::ENCODED_LEN];
        let loaded = match store.read(FileId::TIME_SYS, &mut buf) {
            Ok(n) => TimeVars::decode(&buf[..n]),
            Err(e) => {
                debug!("Time variables not readable: {:?}", e);
                None
            }
        };
        let mut vars = match loaded {
            Some(vars) => vars,
            None => {
                info!("Time variables missing, writing defaults");
                let vars = TimeVars::default();
                if let Err(e) = store.write(FileId::TIME_SYS, &vars.encode()) {
                    error!("Failed to write time variables: {:?}", e);
                }
                vars
            }
        };
        // Time is invalid until something sets it
        vars.time_state = TimeState::Invalid;
        Self {
            store,
            vars,
            ship_mode: false,
        }
    }

    pub(crate) fn vars(&self) -> TimeVars {
        self.vars
    }

    /// Apply `f` to a copy, persist it and keep it only if the write succeeds
    pub(crate) fn update(
        &mut self,
        f: impl FnOnce(&mut TimeVars),
    ) -> Result<(), TimeSysError> {
        let mut next = self.vars;
        f(&mut next);
        self.store.write(FileId::TIME_SYS, &next.encode())?;
        self.vars = next;
        Ok(())
    }

    pub(crate) fn on_time_set(&mut self, change: &TimeChange, valid: bool, candidate_secs: u32) {
        let ship_mode = self.ship_mode;
        self.vars.time_state = if valid {
            TimeState::ValidSync
        } else {
            TimeState::Invalid
        };
        if valid && self.vars.install_date_time == 0 && !ship_mode {
            info!("Installation time stamped: {}", candidate_secs);
            self.vars.install_date_time = candidate_secs;
        }
        if change.changed {
            self.vars.time_last_updated = candidate_secs;
        }
        if let Err(e) = self.store.write(FileId::TIME_SYS, &self.vars.encode()) {
            error!("Failed to persist time variables: {:?}", e);
        }
    }
}

/// Parameters exposed to the remote get/set handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParamId {
    TimeState,
    TimeRequestMaxTimeout,
    DateTimeLostCount,
    TimeLastUpdated,
    InstallationDateTime,
    TimeAcceptanceDelay,
    TimeSigOffset,
    RtcDateTime,
}

/// Typed parameter value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParamValue {
    U8(u8),
    U16(u16),
    U32(u32),
    /// Seconds since epoch
    DateTime(u32),
}

impl ParamValue {
    fn as_u16(self) -> Result<u16, TimeSysError> {
        match self {
            Self::U16(v) => Ok(v),
            _ => Err(TimeSysError::ValueOutOfRange),
        }
    }

    fn as_seconds(self) -> Result<u32, TimeSysError> {
        match self {
            Self::U32(v) | Self::DateTime(v) => Ok(v),
            _ => Err(TimeSysError::ValueOutOfRange),
        }
    }
}

impl<'a, F: FileStore, M: RawMutex> TimeSys<'a, F, M> {
    /// Snapshot of the persisted variables
    pub fn time_vars(&self) -> TimeVars {
        critical_section::with(|cs| self.vars_view.borrow(cs).get())
    }

    pub(crate) fn publish_vars(&self, vars: TimeVars) {
        critical_section::with(|cs| self.vars_view.borrow(cs).set(vars));
    }

    /// Write through the file store with the task lock held, then publish
    fn update_vars(&self, f: impl FnOnce(&mut TimeVars)) -> Result<(), TimeSysError> {
        let mut store = self.lock_vars()?;
        store.update(f)?;
        self.publish_vars(store.vars());
        Ok(())
    }

    pub fn time_sig_offset(&self) -> u16 {
        self.time_vars().time_sig_offset
    }

    pub fn set_time_sig_offset(&self, value: u16) -> Result<(), TimeSysError> {
        if !TIME_SIG_OFFSET_RANGE.contains(&value) {
            return Err(TimeSysError::ValueOutOfRange);
        }
        self.update_vars(|v| v.time_sig_offset = value)
    }

    pub fn time_acceptance_delay(&self) -> u16 {
        self.time_vars().time_acceptance_delay
    }

    pub fn set_time_acceptance_delay(&self, value: u16) -> Result<(), TimeSysError> {
        if value > MAX_TIME_ACCEPTANCE_DELAY {
            return Err(TimeSysError::ValueOutOfRange);
        }
        self.update_vars(|v| v.time_acceptance_delay = value)
    }

    pub fn time_request_max_timeout(&self) -> u16 {
        self.time_vars().time_request_max_timeout
    }

    pub fn set_time_request_max_timeout(&self, value: u16) -> Result<(), TimeSysError> {
        if value < MIN_TIME_REQUEST_TIMEOUT {
            return Err(TimeSysError::ValueOutOfRange);
        }
        self.update_vars(|v| v.time_request_max_timeout = value)
    }

    pub fn date_time_lost_count(&self) -> u16 {
        self.time_vars().date_time_lost_count
    }

    pub fn set_date_time_lost_count(&self, value: u16) -> Result<(), TimeSysError> {
        self.update_vars(|v| v.date_time_lost_count = value)
    }

    /// Count one loss of date/time (e.g. RTC found invalid after power loss)
    pub fn increment_date_time_lost_count(&self) -> Result<(), TimeSysError> {
        self.update_vars(|v| v.date_time_lost_count = v.date_time_lost_count.saturating_add(1))
    }

    pub fn time_last_updated(&self) -> u32 {
        self.time_vars().time_last_updated
    }

    pub fn installation_date_time(&self) -> u32 {
        self.time_vars().install_date_time
    }

    pub fn set_installation_date_time(&self, secs: u32) -> Result<(), TimeSysError> {
        self.update_vars(|v| v.install_date_time = secs)
    }

    /// In ship mode the first valid time does not stamp the installation time
    pub fn set_ship_mode(&self, ship_mode: bool) -> Result<(), TimeSysError> {
        self.lock_vars()?.ship_mode = ship_mode;
        Ok(())
    }

    /// RTC time in seconds since epoch
    pub fn rtc_date_time(&self) -> Result<u32, TimeSysError> {
        let dt = self.rtc.date_time()?;
        Ok(date_time_to_seconds(&dt))
    }

    pub fn set_rtc_date_time(&self, secs: u32) -> Result<(), TimeSysError> {
        self.rtc.set_date_time(seconds_to_date_time(secs))?;
        Ok(())
    }

    /// Parameter handler: read
    pub fn get_param(&self, id: ParamId) -> Result<ParamValue, TimeSysError> {
        let vars = self.time_vars();
        let value = match id {
            ParamId::TimeState => ParamValue::U8(self.time_state() as u8),
            ParamId::TimeRequestMaxTimeout => ParamValue::U16(vars.time_request_max_timeout),
            ParamId::DateTimeLostCount => ParamValue::U16(vars.date_time_lost_count),
            ParamId::TimeLastUpdated => ParamValue::DateTime(vars.time_last_updated),
            ParamId::InstallationDateTime => ParamValue::DateTime(vars.install_date_time),
            ParamId::TimeAcceptanceDelay => ParamValue::U16(vars.time_acceptance_delay),
            ParamId::TimeSigOffset => ParamValue::U16(vars.time_sig_offset),
            ParamId::RtcDateTime => ParamValue::DateTime(self.rtc_date_time()?),
        };
        Ok(value)
    }

    /// Parameter handler: write with bounds validation
    pub fn set_param(&self, id: ParamId, value: ParamValue) -> Result<(), TimeSysError> {
        let result = match id {
            ParamId::TimeState | ParamId::TimeLastUpdated => Err(TimeSysError::ReadOnly),
            ParamId::TimeRequestMaxTimeout => {
                self.set_time_request_max_timeout(value.as_u16()?)
            }
            ParamId::DateTimeLostCount => self.set_date_time_lost_count(value.as_u16()?),
            ParamId::InstallationDateTime => self.set_installation_date_time(value.as_seconds()?),
            ParamId::TimeAcceptanceDelay => self.set_time_acceptance_delay(value.as_u16()?),
            ParamId::TimeSigOffset => self.set_time_sig_offset(value.as_u16()?),
            ParamId::RtcDateTime => self.set_rtc_date_time(value.as_seconds()?),
        };
        if let Err(e) = result {
            warn!("Parameter {:?} rejected: {:?}", id, e);
        }
        result
    }
}
