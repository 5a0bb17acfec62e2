// SPDX-License-Identifier: Apache-2.0

//! Compile-time configuration for the acquisition controller.
//!
//! Everything here is fixed for a build; there is no run-time reconfiguration beyond the
//! emitter/mux overrides carried by [`ControlRecord`](crate::control::ControlRecord).

use crate::acquisition::Calibration;

/// Rate of the hardware tick interrupt (SysTick).
pub const TICK_HZ: u32 = 1_000;

/// Emitter state machine runs once every 50 ticks (50 ms).
pub const EMITTER_GATE_TICKS: u32 = 50;

/// Mux sequencer runs once every 6 ticks, giving each detector channel a 6 ms dwell.
pub const MUX_GATE_TICKS: u32 = 6;

/// Time allowed for the mux outputs and photodiode front end to settle after a channel switch.
///
/// Measured from the tick in which the last expander write returned, plus one tick. Frames that
/// overlap this window at either end are discarded instead of being attributed to either the old
/// or the new channel.
pub const MUX_SETTLING_TICKS: u32 = 2;

/// Length of the long interval raised by the tick source (5 s).
///
/// Sequenced emitters swap wavelength groups and pipeline statistics are logged on each boundary.
pub const LONG_INTERVAL_TICKS: u32 = 5_000;

/// Calibrated matrix is sent to the host every 10 ticks.
pub const TELEMETRY_GATE_TICKS: u32 = 10;

/// Number of sensor modules, one per RP2040 ADC input (GPIO26 to GPIO29).
pub const SENSOR_MODULES: usize = 4;

/// Conversions taken per module for every DMA frame. These are averaged into a single code.
pub const OVERSAMPLE: usize = 16;

/// Length of a single DMA buffer, in conversions.
pub const ADC_BUFFER_LEN: usize = SENSOR_MODULES * OVERSAMPLE;

/// Aggregate conversion rate across all round-robin inputs.
pub const ADC_SAMPLE_RATE_HZ: u32 = 64_000;

/// Largest code produced by the 12-bit ADC.
pub const ADC_MAX_CODE: u16 = 0x0FFF;

/// Number of PWM outputs on the emitter driver.
pub const PWM_CHANNELS: usize = 16;

/// PWM frequency programmed at init and requested until changed.
pub const DEFAULT_PWM_FREQUENCY_HZ: f32 = 1_000.0;

/// Duty cycle used for any emitter switched on by a state policy or the serial bitmap.
pub const DEFAULT_DUTY: f32 = 0.5;

/// Emitter channels carrying the 940 nm LEDs.
pub const WAVELENGTH_940NM_CHANNELS: u16 = 0x5555;

/// Emitter channels carrying the 660 nm LEDs.
pub const WAVELENGTH_660NM_CHANNELS: u16 = 0xAAAA;

/// 7-bit I2C address of the PWM driver.
pub const PWM_DRIVER_ADDRESS: u8 = 0b100_1011;

/// 7-bit I2C addresses of the two GPIO expanders driving the mux select lines.
pub const EXPANDER_ADDRESSES: [u8; 2] = [0x20, 0x21];

/// Per-module calibration applied to every frame.
pub const CALIBRATION: [Calibration; SENSOR_MODULES] = [Calibration::IDENTITY; SENSOR_MODULES];

/// Duration of one DMA frame in microseconds.
pub const FRAME_PERIOD_US: u32 = (ADC_BUFFER_LEN as u32 * 1_000_000) / ADC_SAMPLE_RATE_HZ;

/// Tick period in microseconds.
const TICK_US: u32 = 1_000_000 / TICK_HZ;

// The settling deadline lands one tick past the window to absorb tick quantization
const _: () = assert!(
    MUX_SETTLING_TICKS + 1 < MUX_GATE_TICKS,
    "mux must settle before the next channel switch"
);
const _: () = assert!(
    FRAME_PERIOD_US <= MUX_SETTLING_TICKS * TICK_US,
    "the settling window must cover at least one frame"
);
const _: () = assert!(
    2 * FRAME_PERIOD_US <= (MUX_GATE_TICKS - MUX_SETTLING_TICKS - 1) * TICK_US,
    "every dwell must hold one whole frame after settling"
);
const _: () = assert!(SENSOR_MODULES <= 8, "telemetry packets carry at most 8 modules");
