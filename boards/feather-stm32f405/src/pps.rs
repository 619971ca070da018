//! GPS 1PPS input capture on TIM3 channel 1 (PA6, AF2)
//!
//! TIM3 free-runs at the APB1 timer clock over the full 16-bit range and
//! latches the counter on each rising edge.

use embassy_stm32::pac;
use embassy_stm32::pac::timer::vals::CcmrInputCcs;

const PA6: usize = 6;
const AF_TIM3: u8 = 2;

pub fn init_capture() {
    pac::RCC.ahb1enr().modify(|w| w.set_gpioaen(true));
    pac::RCC.apb1enr().modify(|w| w.set_tim3en(true));

    pac::GPIOA
        .moder()
        .modify(|w| w.set_moder(PA6, pac::gpio::vals::Moder::ALTERNATE));
    pac::GPIOA.afr(PA6 / 8).modify(|w| w.set_afr(PA6 % 8, AF_TIM3));

    let tim = pac::TIM3;
    tim.psc().write_value(0);
    tim.arr().write(|w| w.set_arr(0xFFFF));
    // CC1 as input, mapped on TI1, rising edge
    tim.ccmr_input(0)
        .modify(|w| w.set_ccs(0, CcmrInputCcs::from_bits(0b01)));
    tim.ccer().modify(|w| {
        w.set_ccp(0, false);
        w.set_cce(0, true);
    });
    tim.dier().modify(|w| w.set_ccie(0, true));
    tim.cr1().modify(|w| w.set_cen(true));
}

/// Latched edge and the live counter, if an edge is pending
pub fn take_capture() -> Option<(u16, u16)> {
    let tim = pac::TIM3;
    if !tim.sr().read().ccif(0) {
        return None;
    }
    let captured = tim.ccr(0).read().ccr();
    let now = tim.cnt().read().cnt();
    tim.sr().modify(|w| w.set_ccif(0, false));
    Some((now, captured))
}
