// SPDX-License-Identifier: Apache-2.0

//! Error conditions surfaced by the acquisition controller.
//!
//! None of these stop the control loop. Hardware write failures and frame overruns are logged
//! where they happen and reported to the caller of the step that hit them; invalid requests are
//! rejected at the setter that received them.

use crate::{emitter::EmitterState, mux::ExpanderChip};

/// Hardware device addressed by a failed write
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Device {
    /// Emitter PWM driver
    PwmDriver,
    /// One of the mux GPIO expanders
    Expander(ExpanderChip),
}

/// Requested value that can be out of range
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Parameter {
    /// PWM frequency in Hz
    Frequency,
    /// Emitter duty cycle, fraction of the period
    DutyCycle,
    /// Emitter phase offset, fraction of the period
    Phase,
}

/// Errors raised by the controller
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A register write to the device did not complete
    #[error("hardware write to {0:?} failed")]
    HardwareWriteFailed(Device),
    /// A DMA frame completed before the previous one was consumed
    #[error("ADC frame overrun, {dropped} frames dropped this session")]
    FrameOverrun {
        /// Frames overwritten before the pipeline read them, since reset
        dropped: u32,
    },
    /// Requested value is outside its valid range
    #[error("requested {0:?} is out of range")]
    OutOfRange(Parameter),
    /// PWM channel index does not exist on the driver
    #[error("emitter channel {0} does not exist")]
    InvalidChannel(usize),
    /// State cannot be requested directly
    #[error("emitter state {0:?} cannot be requested")]
    InvalidRequest(EmitterState),
    /// Inbound control record has the wrong length or an unknown field value
    #[error("malformed control record")]
    MalformedRecord,
}
