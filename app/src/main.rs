#![no_main]
#![no_std]

use core::sync::atomic::{AtomicU32, Ordering};
use cortex_m;
use cortex_m_rt::{entry, exception};
use log::{info, LevelFilter};
use panic_halt as _;

use stm32f0xx_hal as hal;

use touch::{AdaptiveFilter, Clock, FilterConfig, TouchSensor, DEFAULT_FILTER_CONFIG};

use crate::hal::pac;
use crate::hal::pac::interrupt;
use crate::hal::prelude::*;
use crate::hal::tsc::Tsc;
use crate::hal::rcc::Rcc;

mod serial;

/// One electrode: the TSC group it belongs to, that group's sampling cap
/// input, and the electrode input.
#[derive(Clone, Copy, Debug)]
struct TscSample {
    group: u8,
    sample: u8,
    channel: u8,
}

struct TscWrapper {
    tsc: Tsc,
    max_count: u16,
}

impl TscWrapper {
    pub fn new(tsc: pac::TSC, rcc: &mut Rcc) -> Self {
        let config = hal::tsc::Config {
            clock_prescale: None,
            max_count: Some(hal::tsc::MaxCount::U8191),
            charge_transfer_high: None,
            charge_transfer_low: None,
        };
        Self {
            tsc: Tsc::tsc(tsc, rcc, Some(config)),
            max_count: 8191,
        }
    }

    /// Acquire a single electrode
    ///
    /// Returns max count + 1 if the acquisition did not finish, which the filter
    /// treats as "not touched".
    fn acquire(&mut self, s: TscSample) -> u16 {
        // The HAL does not expose the channel/sample IO registers, so steal them.
        let regs = unsafe { pac::Peripherals::steal().TSC };

        regs.iogcsr.write(|w| unsafe { w.bits(1 << (s.group - 1)) });
        regs.ioscr.write(|w| unsafe { w.bits(1 << ((s.group - 1) * 4 + s.sample - 1)) });
        regs.ioccr.write(|w| unsafe { w.bits(1 << ((s.group - 1) * 4 + s.channel - 1)) });

        self.tsc.acquire().ok();

        // Status bits indicate if the group completed successfully
        let group_status = regs.iogcsr.read().bits() >> 16;
        if group_status & (1 << (s.group - 1)) != 0 {
            self.tsc.read_unchecked(s.group)
        } else {
            self.max_count + 1
        }
    }
}

impl TouchSensor for TscWrapper {
    type Channel = TscSample;

    fn read(&mut self, channel: TscSample) -> u16 {
        self.acquire(channel)
    }
}

/// Millisecond clock driven by the SysTick exception
struct SysTickClock;

impl Clock for SysTickClock {
    fn now_ms(&self) -> u32 {
        TIME.load(Ordering::Relaxed)
    }

    fn delay_ms(&mut self, ms: u32) {
        let start = self.now_ms();
        while self.now_ms().wrapping_sub(start) < ms {}
    }
}

const NUM_CHANNELS: usize = 3;

static ELECTRODES: [TscSample; NUM_CHANNELS] = [
    TscSample { group: 1, sample: 2, channel: 1 }, // PA0
    TscSample { group: 2, sample: 3, channel: 1 }, // PA4
    TscSample { group: 3, sample: 4, channel: 2 }, // PB0
];

static FILTER_CONFIG: FilterConfig = FilterConfig {
    sample_period_ms: 10,
    init_duration_ms: 5000,
    filter_period_ms: 10000,
    ..DEFAULT_FILTER_CONFIG
};

static TIME: AtomicU32 = AtomicU32::new(0);

#[entry]
fn main() -> ! {
    let dp = pac::Peripherals::take().unwrap();
    let cp = cortex_m::Peripherals::take().unwrap();

    let mut flash = dp.FLASH;
    let mut rcc = dp.RCC.configure().sysclk(48.mhz()).freeze(&mut flash);
    let gpioa = dp.GPIOA.split(&mut rcc);
    let gpiob = dp.GPIOB.split(&mut rcc);
    let gpioc = dp.GPIOC.split(&mut rcc);

    // A library requiring a critical section to set a gpio AF register is bad and I just won't.
    let fake_cs = unsafe { cortex_m::interrupt::CriticalSection::new() };

    // Touch electrodes
    let _pad1 = gpioa.pa0.into_alternate_af3(&fake_cs);
    let _pad2 = gpioa.pa4.into_alternate_af3(&fake_cs);
    let _pad3 = gpiob.pb0.into_alternate_af3(&fake_cs);
    // Sampling caps
    let _g1_cap = gpioa.pa1.into_alternate_af3(&fake_cs);
    let _g2_cap = gpioa.pa6.into_alternate_af3(&fake_cs);
    let _g3_cap = gpiob.pb2.into_alternate_af3(&fake_cs);

    let mut led = gpioc.pc8.into_push_pull_output(&fake_cs);

    let mut syst = hal::timers::Timer::syst(cp.SYST, 1000.hz(), &mut rcc);
    syst.listen(&hal::timers::Event::TimeOut);

    let tx_pin = gpiob.pb6.into_alternate_af0(&fake_cs);
    let rx_pin = gpiob.pb7.into_alternate_af0(&fake_cs);
    let uart = hal::serial::Serial::usart1(dp.USART1, (tx_pin, rx_pin), 115200.bps(), &mut rcc);
    serial::uart1::init(uart, 4);
    serial::init_logger(LevelFilter::Info);

    let sensor = TscWrapper::new(dp.TSC, &mut rcc);
    let mut filter = AdaptiveFilter::new(sensor, SysTickClock, ELECTRODES, Some(FILTER_CONFIG));

    info!("calibrating, hands off");
    filter.initialize();

    let mut touched = [false; NUM_CHANNELS];
    let mut next_time = TIME.load(Ordering::Relaxed);

    loop {
        let time = TIME.load(Ordering::Relaxed);
        if time.wrapping_sub(next_time) as i32 >= 0 {
            next_time = next_time.wrapping_add(FILTER_CONFIG.sample_period_ms);

            filter.update();

            for i in 0..NUM_CHANNELS {
                let now_touched = filter.is_touched(i);
                if now_touched && !touched[i] {
                    info!("channel {} touched (raw {}, threshold {})", i, filter.touch_value(i), filter.threshold(i));
                }
                touched[i] = now_touched;
            }

            if touched.iter().any(|t| *t) {
                led.set_high().ok();
            } else {
                led.set_low().ok();
            }
        }
    }
}

#[exception]
fn SysTick() {
    let time = TIME.load(Ordering::Relaxed);
    TIME.store(time.wrapping_add(1), Ordering::Relaxed);
}
