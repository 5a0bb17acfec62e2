//! This [RP2040](https://www.raspberrypi.com/documentation/microcontrollers/rp2040.html) project
//! drives a multi-channel fNIRS headset: a bank of light emitters, a set of detector multiplexers
//! and the ADC that samples them, all kept in lockstep so every captured sample can be attributed
//! to a known (emitter state, mux channel) pair.
//!
//! The crate is split into a hardware-independent core, which runs and is tested on the host, and
//! a thin RP2040 layer compiled only for `target_os = "none"`:
//!
//! - [`tick`]: 1 kHz tick counter and the software gates derived from it.
//! - [`emitter`]: the 5-state emitter machine, pushing only changed PWM values to the driver.
//! - [`mux`]: the detector mux round robin and the channel cell shared with the ADC interrupt.
//! - [`buffer`] and [`acquisition`]: DMA frame hand-off and the calibrated sample matrix.
//! - [`components`]: PCA9685 PWM driver and GPIO expander drivers over `embedded-hal` I2C.
//! - [`control`] and [`telemetry`]: the USB serial record formats.
//! - [`system`]: the main-loop orchestrator tying the above together.
//!
//! ## Crate features
//!
//! - `autostart`: Enables the mux round robin and sequenced emitters at boot, without waiting for
//!   a control record from the host. Enabled by default.
//! - `trace_frames`: Logs every ADC frame folded into the sample matrix. Very noisy!
//! - `trace_writes`: Logs every PWM driver and GPIO expander register write.
//!
//! ## Timing
//!
//! All periods are in [`config`]. The emitter machine steps every
//! [`EMITTER_GATE_TICKS`](config::EMITTER_GATE_TICKS), the mux every
//! [`MUX_GATE_TICKS`](config::MUX_GATE_TICKS). After each mux switch the shared channel cell is
//! marked as settling for [`MUX_SETTLING_TICKS`](config::MUX_SETTLING_TICKS), counted from the
//! last expander write. An ADC frame is kept only if the channel was settled and unchanged at
//! both its start and its completion.
//!
//! ```
//! use fnirs_acquisition::{
//!     acquisition::Calibration,
//!     buffer::FrameExchange,
//!     emitter::{EmitterController, PwmOutput},
//!     mux::{ActiveChannel, ExpanderChip, ExpanderPort, MuxChannel, MuxSequencer, PortWriter},
//!     system::FnirsSystem,
//!     tick::TickCounter,
//! };
//!
//! struct NullPwm;
//! impl PwmOutput for NullPwm {
//!     type Error = ();
//!     fn set_frequency(&mut self, _: f32) -> Result<(), ()> { Ok(()) }
//!     fn set_channel_pattern(&mut self, _: usize, _: f32, _: f32) -> Result<(), ()> { Ok(()) }
//!     fn assert_enable_line(&mut self) -> Result<(), ()> { Ok(()) }
//!     fn deassert_enable_line(&mut self) -> Result<(), ()> { Ok(()) }
//! }
//!
//! struct NullPorts;
//! impl PortWriter for NullPorts {
//!     type Error = ();
//!     fn write_port(&mut self, _: ExpanderChip, _: ExpanderPort, _: u8) -> Result<(), ()> {
//!         Ok(())
//!     }
//! }
//!
//! let ticks = TickCounter::new(5_000);
//! let frames = FrameExchange::<2>::new();
//! let active = ActiveChannel::new();
//! let mut system = FnirsSystem::new(
//!     EmitterController::new(NullPwm),
//!     MuxSequencer::new(NullPorts, &active),
//!     [Calibration::IDENTITY; 2],
//! );
//! system.init().unwrap();
//! system.start_sequencing().unwrap();
//!
//! for _ in 0..20 {
//!     ticks.on_tick();
//!     frames.complete([512, 1024], active.snapshot()).ok();
//!     system.poll(ticks.now(), &ticks, &frames);
//! }
//! assert_eq!(system.mux().current(), MuxChannel::Two);
//! assert_eq!(system.pipeline().raw_value(1, MuxChannel::Four), Some(1024));
//! ```

// Copyright 2026 The fnirs_acquisition Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), feature(doc_auto_cfg), feature(doc_cfg_hide))]

pub mod acquisition;
#[cfg(target_os = "none")]
pub mod board;
pub mod buffer;
pub mod components;
pub mod config;
pub mod control;
pub mod emitter;
pub mod error;
pub mod interrupt;
pub mod mux;
pub mod system;
pub mod telemetry;
pub mod tick;

#[cfg(test)]
pub(crate) mod testing;
