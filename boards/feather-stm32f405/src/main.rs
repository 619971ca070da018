#![deny(unsafe_code)]
#![no_main]
#![no_std]

use defmt_rtt as _; // global logger
use panic_probe as _;
use rtic::app;
use rtic_monotonics::stm32::prelude::*;

mod backup;
mod pps;
mod regs;
mod rtc;

stm32_tim2_monotonic!(Mono, 1_000_000);

#[app(device = embassy_stm32, peripherals = true, dispatchers = [USART1, USART2])]
mod app {
    use super::*;
    use cortex_m::peripheral::syst::SystClkSource;
    use defmt::{debug, info, warn};
    use embassy_stm32::gpio::{Level, Output, Speed};
    use embassy_stm32::rcc::{Hse, HseMode, LsConfig, LseConfig, LseMode};
    use embassy_stm32::rtc::{Rtc, RtcConfig};
    use embassy_stm32::time::Hertz;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use embassy_sync::channel::Channel;
    use hal_abstractions::RtcClock;
    use static_cell::StaticCell;
    use timesys_core::freq::{ReloadController, RtcTrim};
    use timesys_core::{
        AlarmMsg, DispatchTask, Discipline, GpsConfig, GpsEstimator, PeriodicAlarm, PpsCapture,
        RtcTrimConfig, TickSemaphore, TimeSys, TimeSysConfig,
    };

    use crate::backup::BackupStore;
    use crate::regs::{self, SysTickCounter};
    use crate::rtc::BoardRtc;

    /// SYSCLK from the PLL below
    const CORE_CLOCK_HZ: u32 = 84_000_000;
    /// APB1 timer clock (TIM2, TIM3)
    const TIMER_CLOCK_HZ: u32 = 84_000_000;
    const TICK_RATE_HZ: u32 = 200;
    /// A GPS receiver drives PA6 with its 1PPS output; without one the tick
    /// is trimmed against the RTC crystal instead
    const GPS_PPS: bool = true;
    const HEARTBEAT_PERIOD_MS: u32 = 5_000;

    type BoardTimeSys = TimeSys<'static, BackupStore>;

    static TICK_COUNTER: SysTickCounter = SysTickCounter;
    static TICK_SEM: TickSemaphore = TickSemaphore::new();
    static HEARTBEAT: Channel<CriticalSectionRawMutex, AlarmMsg, 2> = Channel::new();

    #[shared]
    struct Shared {}

    #[local]
    struct Local {
        led: Output<'static>,
        tick_time: &'static BoardTimeSys,
        dispatch_time: &'static BoardTimeSys,
        rtc: &'static BoardRtc,
        pps_time: &'static BoardTimeSys,
        estimator: GpsEstimator,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local) {
        info!("Time subsystem demo starting...");

        // Adafruit Feather STM32F405: 12 MHz HSE, 32.768 kHz LSE (PC14/PC15)
        let mut config = embassy_stm32::Config::default();
        config.rcc.hse = Some(Hse {
            freq: Hertz(12_000_000),
            mode: HseMode::Oscillator,
        });

        // HSE (12 MHz) / PREDIV(6) = 2 MHz (PLL input)
        // 2 MHz * MUL(168) = 336 MHz (VCO)
        // VCO / DIVP(4) = 84 MHz (SYSCLK)
        config.rcc.pll_src = embassy_stm32::rcc::PllSource::HSE;
        config.rcc.pll = Some(embassy_stm32::rcc::Pll {
            prediv: embassy_stm32::rcc::PllPreDiv::DIV6,
            mul: embassy_stm32::rcc::PllMul::MUL168,
            divp: Some(embassy_stm32::rcc::PllPDiv::DIV4),
            divq: Some(embassy_stm32::rcc::PllQDiv::DIV7),
            divr: None,
        });
        config.rcc.sys = embassy_stm32::rcc::Sysclk::PLL1_P;
        config.rcc.ahb_pre = embassy_stm32::rcc::AHBPrescaler::DIV1; // 84 MHz
        config.rcc.apb1_pre = embassy_stm32::rcc::APBPrescaler::DIV2; // 42 MHz
        config.rcc.apb2_pre = embassy_stm32::rcc::APBPrescaler::DIV1; // 84 MHz

        config.rcc.ls = LsConfig {
            rtc: embassy_stm32::rcc::RtcClockSource::LSE,
            lsi: false,
            lse: Some(LseConfig {
                frequency: Hertz(32_768),
                mode: LseMode::Oscillator(embassy_stm32::rcc::LseDrive::MediumHigh),
            }),
        };

        let p = embassy_stm32::init(config);

        // TIM2 on APB1: timer clock = 2*APB1 when prescaler != 1
        Mono::start(TIMER_CLOCK_HZ);

        let mut core = cx.core;
        core.DCB.enable_trace();
        core.DWT.enable_cycle_counter();

        static RTC: StaticCell<BoardRtc> = StaticCell::new();
        let rtc: &'static BoardRtc = RTC.init(BoardRtc::new(Rtc::new(p.RTC, RtcConfig::default())));

        let gps_config = GpsConfig {
            core_clock_hz: CORE_CLOCK_HZ,
            bus_clock_hz: TIMER_CLOCK_HZ,
            tick_rate_hz: TICK_RATE_HZ,
            ..GpsConfig::default()
        };
        let ts_config = TimeSysConfig {
            tick_ms: 1000 / TICK_RATE_HZ,
            gps: gps_config,
            ..TimeSysConfig::default()
        };
        static TIME_SYS: StaticCell<BoardTimeSys> = StaticCell::new();
        let time_sys: &'static BoardTimeSys =
            TIME_SYS.init(TimeSys::new(ts_config, BackupStore, rtc, Some(&TICK_COUNTER)));

        if !rtc.is_valid() {
            warn!("RTC lost its calendar, system time starts invalid");
            if let Err(e) = time_sys.increment_date_time_lost_count() {
                warn!("Could not count lost date/time: {:?}", e);
            }
        }
        if let Err(e) = time_sys.set_time_from_rtc() {
            warn!("System time not seeded from RTC: {:?}", e);
        }

        if let Err(e) = time_sys.add_periodic_alarm(PeriodicAlarm {
            period: HEARTBEAT_PERIOD_MS,
            offset: 0,
            skip_on_time_change: true,
            use_local_time: false,
            on_valid_time: true,
            on_invalid_time: true,
            sink: Some(&HEARTBEAT),
        }) {
            warn!("Heartbeat alarm not registered: {:?}", e);
        }

        // RTOS tick from SysTick at the core clock
        let mut syst = core.SYST;
        syst.set_clock_source(SystClkSource::Core);
        syst.set_reload(CORE_CLOCK_HZ / TICK_RATE_HZ - 1);
        syst.clear_current();
        syst.enable_interrupt();
        syst.enable_counter();
        info!("SysTick running at {} Hz", TICK_RATE_HZ);

        if GPS_PPS {
            pps::init_capture();
            info!("1PPS capture armed on TIM3 CH1");
        }

        let led = Output::new(p.PC1, Level::High, Speed::Low);

        heartbeat::spawn().ok();
        dispatch::spawn().ok();

        (
            Shared {},
            Local {
                led,
                tick_time: time_sys,
                dispatch_time: time_sys,
                rtc,
                pps_time: time_sys,
                estimator: GpsEstimator::new(gps_config),
            },
        )
    }

    /// RTOS tick: advance the software clock and wake the dispatcher
    #[task(binds = SysTick, priority = 3, local = [tick_time])]
    fn sys_tick(cx: sys_tick::Context) {
        cx.local.tick_time.tick(regs::cycle_count());
        TICK_SEM.post();
    }

    /// 1PPS edge: feed the frequency/phase estimator
    #[task(binds = TIM3, priority = 4, local = [pps_time, estimator])]
    fn pps_capture(cx: pps_capture::Context) {
        let cycle_count = regs::cycle_count();
        if let Some((timer_now, captured)) = pps::take_capture() {
            let capture = PpsCapture {
                cycle_count,
                timer_now,
                captured,
            };
            let outcome = cx.local.pps_time.gps_capture(cx.local.estimator, capture);
            debug!("1PPS window: {:?}", outcome);
        }
    }

    /// Alarm dispatch and tick discipline
    #[task(priority = 2, local = [dispatch_time, rtc])]
    async fn dispatch(cx: dispatch::Context) {
        let time_sys: &'static BoardTimeSys = *cx.local.dispatch_time;
        let discipline = if GPS_PPS {
            Discipline::Gps(ReloadController::new(time_sys.config().gps))
        } else {
            let trim_config = RtcTrimConfig {
                core_clock_hz: CORE_CLOCK_HZ,
                tick_rate_hz: TICK_RATE_HZ,
                tick_ms: 1000 / TICK_RATE_HZ,
                ..RtcTrimConfig::default()
            };
            Discipline::Rtc(RtcTrim::new(trim_config, *cx.local.rtc))
        };
        let mut task = DispatchTask::new(time_sys, &TICK_SEM, discipline);
        task.run().await;
    }

    /// Blink on every heartbeat alarm
    #[task(priority = 1, local = [led])]
    async fn heartbeat(cx: heartbeat::Context) {
        info!("Heartbeat task started");
        loop {
            let msg = HEARTBEAT.receive().await;
            info!(
                "Heartbeat at {}:{} ({})",
                msg.date,
                msg.time,
                if msg.using_system_time { "system" } else { "power-up" }
            );
            cx.local.led.set_high();
            Mono::delay(100.millis()).await;
            cx.local.led.set_low();
        }
    }

    /// RTIC idle task - WFI sleep mode when no tasks active
    #[idle]
    fn idle(_cx: idle::Context) -> ! {
        info!("Idle task started - entering WFI loop");
        loop {
            cortex_m::asm::wfi();
        }
    }
}
