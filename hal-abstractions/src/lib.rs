//! Hardware abstraction traits for the time subsystem
//!
//! This crate defines the collaborators the time subsystem needs from a
//! board: the RTC, a small file store for persisted variables, and the
//! tick-reload counter behind the RTOS tick. BSPs implement these traits;
//! host tests implement them with fakes.

#![no_std]
#![deny(unsafe_code)]

pub mod rtc;
pub mod storage;
pub mod systick;

pub use rtc::{RtcClock, RtcDateTime, RtcError};
pub use storage::{FileId, FileStore, StorageError};
pub use systick::TickCounter;
