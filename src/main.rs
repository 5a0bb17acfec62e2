//! Synchronized emitter, multiplexer and ADC acquisition for an fNIRS headset.
#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![doc(html_playground_url = "https://play.rust-lang.org/")]
#![warn(missing_docs)]

#[cfg(target_os = "none")]
mod firmware {
    use core::cell::RefCell;

    use cortex_m::{peripheral::syst::SystClkSource, singleton};
    use cortex_m_rt::exception;
    use defmt::{debug, info, warn, Display2Format};
    #[allow(unused_imports)]
    use defmt_rtt as _;
    use embedded_hal::digital::PinState;
    use embedded_hal_bus::i2c::RefCellDevice;
    #[allow(unused_imports)]
    use panic_probe as _;
    use rp2040_hal::{
        adc::AdcPin,
        clocks::init_clocks_and_plls,
        dma::{double_buffer, DMAExt, SingleChannel},
        entry,
        fugit::RateExtU32,
        gpio::{FunctionI2C, Pin, Pins, PullUp},
        pac::{self, interrupt},
        usb::UsbBus,
        Adc, Clock, Sio, Timer, Watchdog, I2C,
    };
    use usb_device::{class_prelude::UsbBusAllocator, prelude::*};
    use usbd_serial::SerialPort;

    use fnirs_acquisition::{
        board::{install_logger, ADC_TRANSFER},
        buffer::create_adc_buffers,
        components::{ExpanderPair, IoExpander, Pca9685},
        config::{CALIBRATION, EXPANDER_ADDRESSES, PWM_DRIVER_ADDRESS, TICK_HZ},
        emitter::EmitterController,
        interrupt::{adc_frame_complete, system_tick, ACTIVE_CHANNEL, FRAMES, TICKS},
        mux::MuxSequencer,
        system::FnirsSystem,
        telemetry::TelemetryLink,
    };

    /// Second-stage bootloader, from [rp2040-boot2](https://docs.rs/rp2040-boot2)
    #[link_section = ".boot2"]
    #[no_mangle]
    #[used]
    pub static BOOT2_FIRMWARE: [u8; 256] = rp2040_boot2::BOOT_LOADER_W25Q080;
    /// External high-speed crystal on the pico board is 12Mhz
    pub const XOSC_FREQ_HZ: u32 = 12_000_000;
    /// ADC clock runs from the 48 MHz USB PLL; a divider of 749 gives 64 ksamples/s
    const ADC_CLOCK_DIVIDER: u16 = 749;

    /// Main operation loop
    #[entry]
    fn main() -> ! {
        install_logger();
        info!("Acquisition controller startup");
        let mut pac = pac::Peripherals::take().unwrap();
        let core = pac::CorePeripherals::take().unwrap();
        let mut watchdog = Watchdog::new(pac.WATCHDOG);
        let sio = Sio::new(pac.SIO);

        let clocks = init_clocks_and_plls(
            XOSC_FREQ_HZ,
            pac.XOSC,
            pac.CLOCKS,
            pac.PLL_SYS,
            pac.PLL_USB,
            &mut pac.RESETS,
            &mut watchdog,
        )
        .ok()
        .unwrap();
        let timer = Timer::new(pac.TIMER, &mut pac.RESETS, &clocks);
        let pins = Pins::new(
            pac.IO_BANK0,
            pac.PADS_BANK0,
            sio.gpio_bank0,
            &mut pac.RESETS,
        );

        // Shared I2C bus: PWM driver and both expanders
        let sda: Pin<_, FunctionI2C, PullUp> = pins.gpio16.reconfigure();
        let scl: Pin<_, FunctionI2C, PullUp> = pins.gpio17.reconfigure();
        let i2c = I2C::i2c0(
            pac.I2C0,
            sda,
            scl,
            400.kHz(),
            &mut pac.RESETS,
            &clocks.system_clock,
        );
        let i2c_bus = RefCell::new(i2c);

        // /OE starts released so nothing lights before the emitter machine runs
        let output_enable = pins.gpio15.into_push_pull_output_in_state(PinState::High);
        let mut pwm = Pca9685::new(
            RefCellDevice::new(&i2c_bus),
            PWM_DRIVER_ADDRESS,
            output_enable,
            timer,
        );
        if let Err(err) = pwm.configure() {
            warn!("PWM driver not configured: {}", defmt::Debug2Format(&err));
        }
        let mut expanders = ExpanderPair::new(
            IoExpander::new(RefCellDevice::new(&i2c_bus), EXPANDER_ADDRESSES[0]),
            IoExpander::new(RefCellDevice::new(&i2c_bus), EXPANDER_ADDRESSES[1]),
        );
        if let Err((chip, err)) = expanders.configure() {
            warn!(
                "Expander {} not configured: {}",
                defmt::Debug2Format(&chip),
                defmt::Debug2Format(&err)
            );
        }

        let mut system = FnirsSystem::new(
            EmitterController::new(pwm),
            MuxSequencer::new(expanders, &ACTIVE_CHANNEL),
            CALIBRATION,
        );
        if let Err(err) = system.init() {
            warn!("Peripheral init incomplete: {}", Display2Format(&err));
        }
        #[cfg(feature = "autostart")]
        if let Err(err) = system.start_sequencing() {
            warn!("Sequencing not started: {}", Display2Format(&err));
        }

        // USB CDC-ACM link to the host
        let usb_bus = singleton!(: UsbBusAllocator<UsbBus> = UsbBusAllocator::new(UsbBus::new(
            pac.USBCTRL_REGS,
            pac.USBCTRL_DPRAM,
            clocks.usb_clock,
            true,
            &mut pac.RESETS,
        )))
        .unwrap();
        let mut serial = SerialPort::new(usb_bus);
        let mut usb_dev = UsbDeviceBuilder::new(usb_bus, UsbVidPid(0x16c0, 0x27dd))
            .strings(&[StringDescriptors::default()
                .manufacturer("fNIRS")
                .product("Acquisition controller")
                .serial_number("0001")])
            .unwrap()
            .device_class(2)
            .build();

        // Setup ADC pins, DMA, buffers
        let mut adc = Adc::new(pac.ADC, &mut pac.RESETS);
        let mut module0 = AdcPin::new(pins.gpio26.into_floating_input()).unwrap();
        let mut module1 = AdcPin::new(pins.gpio27.into_floating_input()).unwrap();
        let mut module2 = AdcPin::new(pins.gpio28.into_floating_input()).unwrap();
        let mut module3 = AdcPin::new(pins.gpio29.into_floating_input()).unwrap();
        let mut dma = pac.DMA.split(&mut pac.RESETS);

        let (first, second) = create_adc_buffers().unwrap();
        let mut readings_fifo = adc
            .build_fifo()
            .clock_divider(ADC_CLOCK_DIVIDER, 0)
            .set_channel(&mut module0)
            .round_robin((&mut module0, &mut module1, &mut module2, &mut module3))
            .enable_dma()
            .start_paused();
        dma.ch0.enable_irq0();
        dma.ch1.enable_irq0();
        let adc_transfer =
            double_buffer::Config::new((dma.ch0, dma.ch1), readings_fifo.dma_read_target(), first)
                .start()
                .write_next(second);
        debug!("critical_section: transfer ADC DMA to mutex");
        critical_section::with(|cs| ADC_TRANSFER.replace(cs, Some(adc_transfer)));

        // 1 kHz tick
        let mut syst = core.SYST;
        syst.set_clock_source(SystClkSource::Core);
        syst.set_reload(clocks.system_clock.freq().to_Hz() / TICK_HZ - 1);
        syst.clear_current();
        syst.enable_counter();
        syst.enable_interrupt();

        readings_fifo.resume();
        unsafe { pac::NVIC::unmask(pac::Interrupt::DMA_IRQ_0) }
        info!("System initialization complete");

        let mut inbound = [0u8; 64];
        let mut link = TelemetryLink::default();
        loop {
            if usb_dev.poll(&mut [&mut serial]) {
                if let Ok(count) = serial.read(&mut inbound) {
                    system.receive_stream(&inbound[..count]);
                }
            }

            match system.poll(TICKS.now(), &TICKS, &FRAMES) {
                Some(packet) => link.send(&mut serial, packet),
                None => {
                    link.flush(&mut serial);
                }
            }
        }
    }

    #[exception]
    fn SysTick() {
        system_tick();
    }

    #[interrupt]
    fn DMA_IRQ_0() {
        critical_section::with(|cs| {
            if let Some(transfer) = ADC_TRANSFER.take(cs) {
                let (buffer, next) = transfer.wait();
                adc_frame_complete(&buffer[..]);
                ADC_TRANSFER.replace(cs, Some(next.write_next(buffer)));
            }
        });
        // Acknowledge both ping-pong channels
        unsafe { (*pac::DMA::ptr()).ints0().write(|w| w.bits(0b11)) };
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    println!("fnirs_acquisition firmware only runs on the RP2040 (thumbv6m-none-eabi)");
}
