// SPDX-License-Identifier: Apache-2.0

//! Recording doubles for the hardware capabilities, used by the unit tests.

use embedded_hal::{
    delay::DelayNs,
    digital::{self, OutputPin},
    i2c::{self, ErrorKind, I2c, NoAcknowledgeSource, Operation},
};

use crate::{
    emitter::PwmOutput,
    mux::{ExpanderChip, ExpanderPort, PortWriter},
};

/// Write refused by a recording double
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WriteRejected;

/// Call received by [`RecordingPwm`]
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum PwmCall {
    /// `set_frequency`
    Frequency(f32),
    /// `set_channel_pattern`
    Pattern {
        /// Channel index
        channel: usize,
        /// Duty cycle
        duty: f32,
        /// Phase offset
        phase: f32,
    },
    /// `assert_enable_line`
    Enable,
    /// `deassert_enable_line`
    Disable,
}

/// PWM driver that records every successful call
#[derive(Debug, Default)]
pub struct RecordingPwm {
    /// Successful calls, in order
    pub calls: Vec<PwmCall>,
    /// Pattern writes to this channel fail
    pub fail_channel: Option<usize>,
}

impl PwmOutput for RecordingPwm {
    type Error = WriteRejected;

    fn set_frequency(&mut self, hz: f32) -> Result<(), Self::Error> {
        self.calls.push(PwmCall::Frequency(hz));
        Ok(())
    }

    fn set_channel_pattern(
        &mut self,
        channel: usize,
        duty: f32,
        phase: f32,
    ) -> Result<(), Self::Error> {
        if self.fail_channel == Some(channel) {
            return Err(WriteRejected);
        }
        self.calls.push(PwmCall::Pattern {
            channel,
            duty,
            phase,
        });
        Ok(())
    }

    fn assert_enable_line(&mut self) -> Result<(), Self::Error> {
        self.calls.push(PwmCall::Enable);
        Ok(())
    }

    fn deassert_enable_line(&mut self) -> Result<(), Self::Error> {
        self.calls.push(PwmCall::Disable);
        Ok(())
    }
}

/// Expander pair that records every successful port write
#[derive(Debug, Default)]
pub struct RecordingPorts {
    /// Successful writes, in order
    pub writes: Vec<(ExpanderChip, ExpanderPort, u8)>,
    /// Writes to this chip fail
    pub fail_chip: Option<ExpanderChip>,
}

impl PortWriter for RecordingPorts {
    type Error = WriteRejected;

    fn write_port(
        &mut self,
        chip: ExpanderChip,
        port: ExpanderPort,
        bits: u8,
    ) -> Result<(), Self::Error> {
        if self.fail_chip == Some(chip) {
            return Err(WriteRejected);
        }
        self.writes.push((chip, port, bits));
        Ok(())
    }
}

/// I2C bus recording every write transfer. Reads return zeroes.
#[derive(Debug, Default)]
pub struct RecordingI2c {
    /// (address, bytes) of every write, in order
    pub writes: Vec<(u8, Vec<u8>)>,
    /// Transactions to this address are not acknowledged
    pub fail_address: Option<u8>,
}

impl RecordingI2c {
    /// Byte strings written to `address`
    pub fn writes_to(&self, address: u8) -> Vec<&[u8]> {
        self.writes
            .iter()
            .filter(|(to, _)| *to == address)
            .map(|(_, bytes)| bytes.as_slice())
            .collect()
    }
}

impl i2c::ErrorType for RecordingI2c {
    type Error = ErrorKind;
}

impl I2c for RecordingI2c {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        if self.fail_address == Some(address) {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }
        for operation in operations {
            match operation {
                Operation::Write(bytes) => self.writes.push((address, bytes.to_vec())),
                Operation::Read(buffer) => buffer.fill(0),
            }
        }
        Ok(())
    }
}

/// Output pin remembering every level it was driven to
#[derive(Debug, Default)]
pub struct RecordingPin {
    /// Levels driven, `true` for high
    pub levels: Vec<bool>,
}

impl digital::ErrorType for RecordingPin {
    type Error = core::convert::Infallible;
}

impl OutputPin for RecordingPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.levels.push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.levels.push(true);
        Ok(())
    }
}

/// Delay that returns immediately
#[derive(Debug, Default)]
pub struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}
