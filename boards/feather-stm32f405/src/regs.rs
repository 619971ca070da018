//! Core peripheral register access
//!
//! The **only** module in the firmware allowed to use `unsafe`. Everything
//! else reads the SysTick and DWT registers through the safe static
//! accessors in `cortex-m`.

#![allow(unsafe_code)]

use cortex_m::peripheral::{DWT, SCB, SYST};
use hal_abstractions::TickCounter;

/// SysTick as the RTOS tick counter
///
/// The SYST peripheral itself is consumed by `init`; this handle only
/// touches the reload and current value registers so it can be shared with
/// the tick interrupt and the dispatch task.
pub struct SysTickCounter;

impl TickCounter for SysTickCounter {
    fn reload(&self) -> u32 {
        SYST::get_reload()
    }

    fn current(&self) -> u32 {
        SYST::get_current()
    }

    fn wrap_pending(&self) -> bool {
        SCB::is_pendst_pending()
    }

    fn set_reload(&self, value: u32) {
        // SAFETY: single 32-bit write to RVR; the counter picks it up on the
        // next wrap and no other code writes RVR after init.
        unsafe { (*SYST::PTR).rvr.write(value & 0x00FF_FFFF) }
    }
}

/// Free-running core cycle counter
pub fn cycle_count() -> u32 {
    DWT::cycle_count()
}
