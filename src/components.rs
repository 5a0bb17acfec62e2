// SPDX-License-Identifier: Apache-2.0

//! I2C drivers for the emitter PWM controller and the mux GPIO expanders
use embedded_hal::{delay::DelayNs, digital::OutputPin, i2c::I2c};
#[allow(unused_imports)]
use log::trace;

use crate::{
    config::PWM_CHANNELS,
    emitter::PwmOutput,
    mux::{ExpanderChip, ExpanderPort, PortWriter},
};

/// Driver errors
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error<B, P> {
    /// Underlying bus error
    Bus(B),
    /// Output-enable pin error
    Pin(P),
    /// Channel does not exist on the chip
    Channel(usize),
}

/// PCA9685 register addresses
#[derive(Debug, Copy, Clone)]
#[repr(u8)]
enum Register {
    /// Oscillator, auto-increment and restart control
    Mode1 = 0x00,
    /// Output driver configuration
    Mode2 = 0x01,
    /// First of four ON/OFF count registers for channel 0
    Led0OnL = 0x06,
    /// Oscillator prescaler, writable only while asleep
    PreScale = 0xFE,
}

/// MODE1 bits
mod mode1 {
    /// Restart PWM channels after sleep
    pub const RESTART: u8 = 1 << 7;
    /// Register auto-increment
    pub const AI: u8 = 1 << 5;
    /// Low-power mode, oscillator off
    pub const SLEEP: u8 = 1 << 4;
}

/// MODE2 totem-pole outputs
const MODE2_OUTDRV: u8 = 1 << 2;
/// Full-on (in ON_H) or full-off (in OFF_H) bit
const FULL: u8 = 1 << 4;
/// PWM counter steps per period
const COUNTS: u32 = 4096;
/// Internal oscillator frequency
const OSCILLATOR_HZ: f32 = 25_000_000.0;
/// Oscillator start-up time after leaving sleep
const WAKE_DELAY_US: u32 = 500;

/// Prescaler value for a PWM frequency, clamped to the chip's range.
pub fn prescale(hz: f32) -> u8 {
    let rounded = (OSCILLATOR_HZ / (COUNTS as f32 * hz) + 0.5) as u32;
    rounded.saturating_sub(1).clamp(3, 255) as u8
}

/// ON_L, ON_H, OFF_L, OFF_H for a duty cycle and phase offset, both fractions of the period.
pub fn channel_registers(duty: f32, phase: f32) -> [u8; 4] {
    if duty <= 0.0 {
        return [0, 0, 0, FULL];
    }
    if duty >= 1.0 {
        return [0, FULL, 0, 0];
    }
    let on = (phase * COUNTS as f32 + 0.5) as u32 % COUNTS;
    // A fractional duty must not round onto the full-off or full-on encoding
    let width = ((duty * COUNTS as f32 + 0.5) as u32).clamp(1, COUNTS - 1);
    let off = (on + width) % COUNTS;
    let [on_l, on_h] = (on as u16).to_le_bytes();
    let [off_l, off_h] = (off as u16).to_le_bytes();
    [on_l, on_h, off_l, off_h]
}

/// 16-channel PCA9685 PWM controller with an active-low output-enable line.
pub struct Pca9685<I2C, OE, D> {
    /// Bus handle
    i2c: I2C,
    /// 7-bit address
    address: u8,
    /// Output-enable (/OE) pin
    output_enable: OE,
    /// Delay used while the oscillator restarts
    delay: D,
}

impl<I2C, OE, D> Pca9685<I2C, OE, D>
where
    I2C: I2c,
    OE: OutputPin,
    D: DelayNs,
{
    /// Create a driver. Nothing is written until [`Pca9685::configure`].
    pub fn new(i2c: I2C, address: u8, output_enable: OE, delay: D) -> Self {
        Self {
            i2c,
            address,
            output_enable,
            delay,
        }
    }

    /// Enable register auto-increment and totem-pole outputs.
    pub fn configure(&mut self) -> Result<(), Error<I2C::Error, OE::Error>> {
        self.write(Register::Mode1, mode1::AI)?;
        self.write(Register::Mode2, MODE2_OUTDRV)
    }

    /// Write an 8 bit register
    fn write(&mut self, register: Register, value: u8) -> Result<(), Error<I2C::Error, OE::Error>> {
        #[cfg(feature = "trace_writes")]
        trace!("PCA9685 {:?} <- {:#04x}", register, value);
        self.i2c
            .write(self.address, &[register as u8, value])
            .map_err(Error::Bus)
    }

    /// Release the bus, pin and delay
    pub fn release(self) -> (I2C, OE, D) {
        (self.i2c, self.output_enable, self.delay)
    }
}

impl<I2C, OE, D> PwmOutput for Pca9685<I2C, OE, D>
where
    I2C: I2c,
    OE: OutputPin,
    D: DelayNs,
{
    type Error = Error<I2C::Error, OE::Error>;

    fn set_frequency(&mut self, hz: f32) -> Result<(), Self::Error> {
        // Prescaler only latches while the oscillator is stopped
        self.write(Register::Mode1, mode1::AI | mode1::SLEEP)?;
        self.write(Register::PreScale, prescale(hz))?;
        self.write(Register::Mode1, mode1::AI)?;
        self.delay.delay_us(WAKE_DELAY_US);
        self.write(Register::Mode1, mode1::AI | mode1::RESTART)
    }

    fn set_channel_pattern(
        &mut self,
        channel: usize,
        duty: f32,
        phase: f32,
    ) -> Result<(), Self::Error> {
        if channel >= PWM_CHANNELS {
            return Err(Error::Channel(channel));
        }
        let [on_l, on_h, off_l, off_h] = channel_registers(duty, phase);
        let first = Register::Led0OnL as u8 + 4 * channel as u8;
        #[cfg(feature = "trace_writes")]
        trace!(
            "PCA9685 LED{} <- {:#04x} {:#04x} {:#04x} {:#04x}",
            channel,
            on_l,
            on_h,
            off_l,
            off_h
        );
        self.i2c
            .write(self.address, &[first, on_l, on_h, off_l, off_h])
            .map_err(Error::Bus)
    }

    fn assert_enable_line(&mut self) -> Result<(), Self::Error> {
        self.output_enable.set_low().map_err(Error::Pin)
    }

    fn deassert_enable_line(&mut self) -> Result<(), Self::Error> {
        self.output_enable.set_high().map_err(Error::Pin)
    }
}

/// Register offsets of a PCA9539/TCA9535-class expander
mod expander {
    /// Output port 0, port 1 follows
    pub const OUTPUT: u8 = 0x02;
    /// Polarity inversion port 0, port 1 follows
    pub const POLARITY: u8 = 0x04;
    /// Pin direction port 0, port 1 follows. Clear bits are outputs.
    pub const CONFIGURATION: u8 = 0x06;
}

/// 16-pin I2C GPIO expander with two 8-bit ports.
#[derive(Clone, Copy, Debug)]
pub struct IoExpander<I2C> {
    /// Bus handle
    i2c: I2C,
    /// 7-bit address
    address: u8,
}

impl<I2C: I2c> IoExpander<I2C> {
    /// Creates an expander with specific address.
    pub fn new(i2c: I2C, address: u8) -> Self {
        Self { i2c, address }
    }

    /// Make every pin a non-inverted output.
    pub fn configure(&mut self) -> Result<(), I2C::Error> {
        for port in [ExpanderPort::Zero, ExpanderPort::One] {
            self.write(expander::POLARITY + port as u8, 0x00)?;
            self.write(expander::CONFIGURATION + port as u8, 0x00)?;
        }
        Ok(())
    }

    /// Drive the pins of `port`.
    pub fn set_port(&mut self, port: ExpanderPort, bits: u8) -> Result<(), I2C::Error> {
        self.write(expander::OUTPUT + port as u8, bits)
    }

    /// Write an 8 bit register
    pub fn write(&mut self, register: u8, data: u8) -> Result<(), I2C::Error> {
        #[cfg(feature = "trace_writes")]
        trace!(
            "Expander {:#04x} reg {:#04x} <- {:#010b}",
            self.address,
            register,
            data
        );
        self.i2c.write(self.address, &[register, data])
    }
}

/// Both mux expanders, addressed by [`ExpanderChip`]
pub struct ExpanderPair<I2C> {
    /// Chip driving muxes 0 to 3
    one: IoExpander<I2C>,
    /// Chip driving muxes 4 to 7
    two: IoExpander<I2C>,
}

impl<I2C: I2c> ExpanderPair<I2C> {
    /// Pair two expanders
    pub fn new(one: IoExpander<I2C>, two: IoExpander<I2C>) -> Self {
        Self { one, two }
    }

    /// Configure both chips as outputs, trying the second even if the first fails.
    pub fn configure(&mut self) -> Result<(), (ExpanderChip, I2C::Error)> {
        let one = self.one.configure().map_err(|err| (ExpanderChip::One, err));
        let two = self.two.configure().map_err(|err| (ExpanderChip::Two, err));
        one.and(two)
    }

    /// Expander for `chip`
    pub fn chip(&mut self, chip: ExpanderChip) -> &mut IoExpander<I2C> {
        match chip {
            ExpanderChip::One => &mut self.one,
            ExpanderChip::Two => &mut self.two,
        }
    }
}

impl<I2C: I2c> PortWriter for ExpanderPair<I2C> {
    type Error = I2C::Error;

    fn write_port(
        &mut self,
        chip: ExpanderChip,
        port: ExpanderPort,
        bits: u8,
    ) -> Result<(), Self::Error> {
        self.chip(chip).set_port(port, bits)
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;

    use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};
    use embedded_hal_bus::i2c::RefCellDevice;

    use super::*;
    use crate::{
        config::{EXPANDER_ADDRESSES, PWM_DRIVER_ADDRESS},
        testing::{NoDelay, RecordingI2c, RecordingPin},
    };

    fn pca() -> Pca9685<RecordingI2c, RecordingPin, NoDelay> {
        Pca9685::new(
            RecordingI2c::default(),
            PWM_DRIVER_ADDRESS,
            RecordingPin::default(),
            NoDelay,
        )
    }

    #[test]
    fn prescale_matches_datasheet() {
        assert_eq!(prescale(200.0), 30);
        assert_eq!(prescale(1_000.0), 5);
        assert_eq!(prescale(24.0), 253);
        assert_eq!(prescale(10.0), 255);
        assert_eq!(prescale(5_000.0), 3);
    }

    #[test]
    fn channel_counts() {
        assert_eq!(channel_registers(0.0, 0.3), [0, 0, 0, FULL]);
        assert_eq!(channel_registers(1.0, 0.3), [0, FULL, 0, 0]);
        // ON 0, OFF 2048
        assert_eq!(channel_registers(0.5, 0.0), [0, 0, 0x00, 0x08]);
        // ON 3072, OFF (3072 + 2048) % 4096 = 1024
        assert_eq!(channel_registers(0.5, 0.75), [0x00, 0x0C, 0x00, 0x04]);
        // Phase 1 wraps to 0
        assert_eq!(channel_registers(0.25, 1.0), [0, 0, 0x00, 0x04]);
    }

    #[test]
    fn near_limit_duty_keeps_an_edge() {
        // 4095.8 counts would wrap OFF onto ON
        assert_eq!(channel_registers(0.999_95, 0.0), [0, 0, 0xFF, 0x0F]);
        // 0.4 counts would round OFF onto ON
        assert_eq!(channel_registers(0.000_1, 0.0), [0, 0, 0x01, 0x00]);
        // ON 3072, OFF (3072 + 4095) % 4096 = 3071
        assert_eq!(channel_registers(0.999_95, 0.75), [0x00, 0x0C, 0xFF, 0x0B]);
    }

    #[test]
    fn frequency_change_sleeps_then_restarts() {
        let mut driver = pca();
        driver.set_frequency(1_000.0).unwrap();
        let (i2c, _, _) = driver.release();
        assert_eq!(
            i2c.writes_to(PWM_DRIVER_ADDRESS),
            [
                &[0x00, 0x30][..],
                &[0xFE, 5][..],
                &[0x00, 0x20][..],
                &[0x00, 0xA0][..],
            ]
        );
    }

    #[test]
    fn channel_pattern_writes_auto_incremented_block() {
        let mut driver = pca();
        driver.set_channel_pattern(3, 0.5, 0.0).unwrap();
        assert_eq!(
            driver.set_channel_pattern(PWM_CHANNELS, 0.5, 0.0),
            Err(Error::Channel(PWM_CHANNELS))
        );
        let (i2c, _, _) = driver.release();
        assert_eq!(
            i2c.writes,
            [(PWM_DRIVER_ADDRESS, vec![0x12, 0, 0, 0, 0x08])]
        );
    }

    #[test]
    fn output_enable_is_active_low() {
        let mut driver = pca();
        driver.assert_enable_line().unwrap();
        driver.deassert_enable_line().unwrap();
        let (_, pin, _) = driver.release();
        assert_eq!(pin.levels, [false, true]);
    }

    #[test]
    fn configure_sets_auto_increment_and_totem_pole() {
        let mut driver = pca();
        driver.configure().unwrap();
        let (i2c, _, _) = driver.release();
        assert_eq!(
            i2c.writes_to(PWM_DRIVER_ADDRESS),
            [&[0x00, 0x20][..], &[0x01, 0x04][..]]
        );
    }

    #[test]
    fn bus_error_is_reported() {
        let mut driver = Pca9685::new(
            RecordingI2c {
                fail_address: Some(PWM_DRIVER_ADDRESS),
                ..Default::default()
            },
            PWM_DRIVER_ADDRESS,
            RecordingPin::default(),
            NoDelay,
        );
        assert_eq!(
            driver.set_channel_pattern(0, 0.5, 0.0),
            Err(Error::Bus(ErrorKind::NoAcknowledge(
                NoAcknowledgeSource::Address
            )))
        );
    }

    #[test]
    fn pair_shares_one_bus() {
        let bus = RefCell::new(RecordingI2c::default());
        let [first, second] = EXPANDER_ADDRESSES;
        let mut pair = ExpanderPair::new(
            IoExpander::new(RefCellDevice::new(&bus), first),
            IoExpander::new(RefCellDevice::new(&bus), second),
        );
        pair.configure().unwrap();
        pair.write_port(ExpanderChip::Two, ExpanderPort::One, 0b0000_1011)
            .unwrap();

        let i2c = bus.borrow();
        assert_eq!(
            i2c.writes_to(first),
            [&[0x04, 0][..], &[0x06, 0][..], &[0x05, 0][..], &[0x07, 0][..]]
        );
        assert_eq!(
            i2c.writes_to(second),
            [
                &[0x04, 0][..],
                &[0x06, 0][..],
                &[0x05, 0][..],
                &[0x07, 0][..],
                &[0x03, 0b0000_1011][..],
            ]
        );
    }

    #[test]
    fn pair_configures_second_chip_after_first_fails() {
        let bus = RefCell::new(RecordingI2c {
            fail_address: Some(EXPANDER_ADDRESSES[0]),
            ..Default::default()
        });
        let mut pair = ExpanderPair::new(
            IoExpander::new(RefCellDevice::new(&bus), EXPANDER_ADDRESSES[0]),
            IoExpander::new(RefCellDevice::new(&bus), EXPANDER_ADDRESSES[1]),
        );
        let (chip, _) = pair.configure().unwrap_err();
        assert_eq!(chip, ExpanderChip::One);
        assert_eq!(bus.borrow().writes_to(EXPANDER_ADDRESSES[1]).len(), 4);
    }
}
