//! RTOS tick counter collaborator
//!
//! Models a SysTick-style peripheral: a 24/32-bit down-counter that reloads
//! from a reload register and raises the RTOS tick interrupt on wrap.

/// Hardware tick counter and its reload register
pub trait TickCounter: Sync {
    /// Reload register value (one tick spans `reload + 1` cycles)
    fn reload(&self) -> u32;

    /// Current down-counter value
    fn current(&self) -> u32;

    /// The counter wrapped but the tick interrupt has not been serviced yet
    fn wrap_pending(&self) -> bool;

    /// Program a new reload value, taking effect on the next wrap
    fn set_reload(&self, value: u32);
}
