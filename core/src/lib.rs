//! Platform-agnostic system time subsystem for metering firmware
//!
//! Software clock driven by the RTOS tick, alarm registry and dispatch,
//! time change propagation, GPS 1PPS frequency discipline and the persisted
//! time variables. Hardware is reached only through the traits in
//! `hal-abstractions`.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

#[macro_use]
mod fmt;

pub mod config;
pub mod dispatch;
pub mod error;
pub mod freq;
pub mod sync_record;
pub mod time;

#[cfg(test)]
mod testutil;

pub use config::{GpsConfig, RtcTrimConfig, TimeSysConfig};
pub use dispatch::{DispatchTask, Discipline, TickSemaphore};
pub use error::{SinkBusy, TimeSysError};
pub use freq::{ClockInfo, ClockSource, CpuFreq, GpsEstimator, PpsCapture, PpsOutcome};
pub use sync_record::{SyncRecord, SyncRing};
pub use time::{
    AlarmCause, AlarmId, AlarmMsg, AlarmSink, CalAlarm, PeriodicAlarm, SysTime, TimeChange,
    TimeState, TimeSys,
};
