#![no_main]
#![no_std]

use panic_probe as _;
use defmt_rtt as _;
use stm32f0xx_hal as hal;
use f0hal as lib;

#[rtic::app(device = crate::hal::pac, dispatchers = [CEC_CAN])]
mod app {
    use cortex_m::interrupt::free as ifree;
    use systick_monotonic::ExtU64;
    use super::hal;
    use hal::prelude::*;

    use super::lib;
    use lib::config;
    use lib::hal_ext::{bootstrap, checksum::{self, ChecksumGen}, crc};
    use lib::hal_ext::dma::{DmaChannel, DmaSplit};
    use lib::hal_ext::uart::{self, Buffer, DmaPath, IrqPath, Usart, ROUTER};

    /// Interrupt driven reception, DMA transmission
    type Serial = uart::Uart<Usart<hal::pac::USART1>, IrqPath, DmaPath<DmaChannel<2>>>;

    #[shared]
    struct Shared {}

    #[local]
    struct Local {
        serial: &'static Serial,
    }

    #[monotonic(binds = SysTick, default = true)]
    type Mono = systick_monotonic::Systick<MONO_HZ>;
    pub const MONO_HZ: u32 = 1000;

    #[init(local = [
        serial: Option<Serial> = None,
        echo_buf: [u8; config::ECHO_LEN] = [0; config::ECHO_LEN],
    ])]
    fn init(cx: init::Context) -> (Shared, Local, init::Monotonics) {
        let mut core = cx.core;
        let mut dev = cx.device;

        // Automatically enter sleep mode when leaving an ISR
        if cfg!(feature = "idle-sleep") {
            core.SCB.set_sleeponexit();
        }

        let sysclk: hal::time::Hertz = config::SYSCLK_HZ.hz().into();
        let pclk: hal::time::Hertz = config::PCLK_HZ.hz().into();
        let mut rcc = dev.RCC
            .configure()
            .hsi48()
            .sysclk(sysclk)
            .pclk(pclk)
            .freeze(&mut dev.FLASH);

        let gpioa = dev.GPIOA.split(&mut rcc);
        let dma = dev.DMA1.split(&mut rcc);

        defmt::info!("Liftoff! {=str} {=str}", lib::build_info::PKG_VERSION, lib::build_info::GIT_VERSION.unwrap_or("-"));
        match bootstrap::boot_pid() {
            Some(pid) => defmt::info!("Started as program {=u8}", pid),
            None => defmt::info!("Started after power-on reset"),
        }

        // Hardware CRC, used for the same model as the bootstrap image checks
        let mut crc_hw = crc::Crc::new(dev.CRC, &mut rcc, &checksum::CRC_32)
            .ok()
            .expect("CRC-32 must be supported by the CRC unit");
        let mut engine = crc::CrcEngine::new(checksum::CRC_32, crc::Method::Best, crc::Resources {
            hardware: Some(&mut crc_hw),
            ..Default::default()
        });
        let check = engine.decode(b"123456789");
        defmt::debug!("CRC method={} check=0x{=u32:08x}", engine.method(), check);
        if check != engine.model().check {
            defmt::error!("CRC check failed, expected 0x{=u32:08x}", engine.model().check);
        }

        // UART
        let tx = ifree(|cs| gpioa.pa9.into_alternate_af1(cs));
        let rx = ifree(|cs| gpioa.pa10.into_alternate_af1(cs));
        let port = Usart::new(dev.USART1, (tx, rx), &rcc);
        let serial: &'static Serial = cx.local.serial.insert(uart::Uart::new(
            port,
            config::SERIAL,
            IrqPath,
            DmaPath::new(dma.ch2),
        ));
        serial.init().expect("Invalid serial configuration");

        if let Err((e, _)) = serial.read(Buffer::from(cx.local.echo_buf), config::ECHO_LEN as u16, on_read, 0) {
            defmt::panic!("Could not start reading: {}", e);
        }

        heartbeat::spawn().ok();

        let mono = systick_monotonic::Systick::new(core.SYST, sysclk.0);

        (Shared {}, Local { serial }, init::Monotonics(mono))
    }

    /// Echo received data back
    fn on_read(serial: &Serial, buf: Buffer, count: u16, param: usize) {
        if let Err((e, buf)) = serial.write(buf, count, on_write, param) {
            defmt::warn!("Echo failed: {}", e);
            rearm(serial, buf);
        }
    }

    fn on_write(serial: &Serial, buf: Buffer, _count: u16, _param: usize) {
        rearm(serial, buf);
    }

    fn rearm(serial: &Serial, buf: Buffer) {
        if let Err((e, _)) = serial.read(buf, config::ECHO_LEN as u16, on_read, 0) {
            defmt::error!("Could not restart reading: {}", e);
        }
    }

    #[task(binds = USART1, priority = 2)]
    fn usart1(_cx: usart1::Context) {
        ROUTER.on_vector(hal::pac::Interrupt::USART1);
    }

    #[task(binds = DMA1_CH2_3, priority = 2)]
    fn dma1_ch2_3(_cx: dma1_ch2_3::Context) {
        ROUTER.on_dma_interrupt();
    }

    #[task(priority = 1, local = [serial, ticks: u32 = 0])]
    fn heartbeat(cx: heartbeat::Context) {
        let serial = *cx.local.serial;
        *cx.local.ticks += 1;

        defmt::debug!("Heartbeat {=u32}: rx={} tx={}",
            *cx.local.ticks,
            serial.read_progress(),
            serial.write_progress(),
        );

        if heartbeat::spawn_after(config::HEARTBEAT_MS.millis()).is_err() {
            defmt::warn!("Spawn failed: heartbeat");
        }
    }
}
