// SPDX-License-Identifier: Apache-2.0

//! Emitter control state machine.
//!
//! Requests are staged by the setters and only reach the PWM driver on the next gated
//! [`EmitterController::step`]. Each step pushes the difference between the staged
//! [`EmitterTarget`] and the values last programmed into the driver, then commits the state
//! transition.

#[allow(unused_imports)]
use log::trace;
use log::{debug, info, warn};

use crate::{
    config::{DEFAULT_PWM_FREQUENCY_HZ, EMITTER_GATE_TICKS, PWM_CHANNELS},
    error::{Device, Error, Parameter},
    tick::{Step, TickGate, Ticks},
};

/// Operating states of the emitter bank
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum EmitterState {
    /// Waiting for a mode request
    #[default]
    Idle = 0,
    /// Emitters follow the host's PWM bitmap
    UserControl,
    /// Emitters follow the on-board wavelength sequence
    SequencerControl,
    /// Every emitter is on
    FullyEnabled,
    /// Master enable is off
    FullyDisabled,
}

impl EmitterState {
    /// Every state, in wire order
    pub const ALL: [EmitterState; 5] = [
        Self::Idle,
        Self::UserControl,
        Self::SequencerControl,
        Self::FullyEnabled,
        Self::FullyDisabled,
    ];
}

impl TryFrom<u8> for EmitterState {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(Error::MalformedRecord)
    }
}

/// Write capability of the emitter PWM driver.
pub trait PwmOutput {
    /// Bus or pin error reported by the driver
    type Error: core::fmt::Debug;

    /// Program the PWM frequency shared by every channel.
    fn set_frequency(&mut self, hz: f32) -> Result<(), Self::Error>;
    /// Program one channel's duty cycle and phase offset, both fractions of the period.
    fn set_channel_pattern(
        &mut self,
        channel: usize,
        duty: f32,
        phase: f32,
    ) -> Result<(), Self::Error>;
    /// Drive the output-enable line so the emitters can light.
    fn assert_enable_line(&mut self) -> Result<(), Self::Error>;
    /// Release the output-enable line, blanking every emitter.
    fn deassert_enable_line(&mut self) -> Result<(), Self::Error>;
}

/// Duty cycle and phase of one emitter channel
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ChannelPattern {
    /// Fraction of the period the emitter is on
    pub duty: f32,
    /// Start of the on time, as a fraction of the period
    pub phase: f32,
}

impl ChannelPattern {
    /// Emitter off
    pub const OFF: Self = Self {
        duty: 0.0,
        phase: 0.0,
    };
    /// Placeholder for a channel whose hardware value is not known. Never equal to any pattern.
    const UNKNOWN: Self = Self {
        duty: f32::NAN,
        phase: f32::NAN,
    };

    /// Validated pattern. Both values must lie in \[0, 1\].
    pub fn new(duty: f32, phase: f32) -> Result<Self, Error> {
        if !(0.0..=1.0).contains(&duty) {
            return Err(Error::OutOfRange(Parameter::DutyCycle));
        }
        if !(0.0..=1.0).contains(&phase) {
            return Err(Error::OutOfRange(Parameter::Phase));
        }
        Ok(Self { duty, phase })
    }
}

/// Requested (or programmed) PWM configuration for the whole emitter bank
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct EmitterTarget {
    /// PWM frequency, Hz
    pub frequency_hz: f32,
    /// Per-channel pattern
    pub channels: [ChannelPattern; PWM_CHANNELS],
}

impl EmitterTarget {
    /// Target with every channel off
    pub const fn off(frequency_hz: f32) -> Self {
        Self {
            frequency_hz,
            channels: [ChannelPattern::OFF; PWM_CHANNELS],
        }
    }

    /// Bitmap of channels with a non-zero duty cycle
    pub fn on_mask(&self) -> u16 {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, pattern)| pattern.duty > 0.0)
            .fold(0, |mask, (channel, _)| mask | 1 << channel)
    }

    /// Shadow of a driver whose registers have not been written yet
    const fn unknown() -> Self {
        Self {
            frequency_hz: f32::NAN,
            channels: [ChannelPattern::UNKNOWN; PWM_CHANNELS],
        }
    }
}

impl Default for EmitterTarget {
    fn default() -> Self {
        Self::off(DEFAULT_PWM_FREQUENCY_HZ)
    }
}

/// Next emitter state for one gated step.
///
/// A cleared master enable wins over everything else. `FullyDisabled` only leaves through `Idle`,
/// and `Idle` only leaves for a requested mode.
pub fn transition(current: EmitterState, enabled: bool, requested: EmitterState) -> EmitterState {
    if !enabled {
        return EmitterState::FullyDisabled;
    }
    match current {
        EmitterState::FullyDisabled => EmitterState::Idle,
        EmitterState::Idle if requested != EmitterState::Idle => requested,
        held => held,
    }
}

/// Tick-gated emitter state machine driving a [`PwmOutput`]
pub struct EmitterController<P> {
    /// PWM driver
    pwm: P,
    /// Master enable
    enabled: bool,
    /// Committed state
    state: EmitterState,
    /// Mode requested by the host or a policy
    requested: EmitterState,
    /// Staged PWM configuration
    target: EmitterTarget,
    /// Values the driver is known to hold
    programmed: EmitterTarget,
    /// Step gate
    gate: TickGate,
}

impl<P: PwmOutput> EmitterController<P> {
    /// Create a controller gated every [`EMITTER_GATE_TICKS`].
    pub fn new(pwm: P) -> Self {
        Self::with_gate(pwm, EMITTER_GATE_TICKS)
    }

    /// Create a controller gated every `gate_ticks`.
    pub fn with_gate(pwm: P, gate_ticks: u32) -> Self {
        Self {
            pwm,
            enabled: false,
            state: EmitterState::Idle,
            requested: EmitterState::Idle,
            target: EmitterTarget::default(),
            programmed: EmitterTarget::unknown(),
            gate: TickGate::new(gate_ticks),
        }
    }

    /// Blank the emitters and program the default target into the driver.
    pub fn init(&mut self) -> Result<(), Error> {
        let blank = self
            .pwm
            .deassert_enable_line()
            .map_err(|err| write_failed("deassert enable line", err));
        let push = self.push_target();
        debug!("Emitter driver initialized with {} writes", push.writes);
        blank?;
        push.failure.map_or(Ok(()), Err)
    }

    /// Set the master enable and drive the output-enable line.
    pub fn enable(&mut self) -> Result<(), Error> {
        self.enabled = true;
        info!("Emitter master enable set");
        self.pwm
            .assert_enable_line()
            .map_err(|err| write_failed("assert enable line", err))
    }

    /// Clear the master enable and release the output-enable line.
    pub fn disable(&mut self) -> Result<(), Error> {
        let result = self
            .pwm
            .deassert_enable_line()
            .map_err(|err| write_failed("deassert enable line", err));
        self.enabled = false;
        info!("Emitter master enable cleared");
        result
    }

    /// Stage a mode request. `FullyDisabled` is only reachable through [`Self::disable`].
    pub fn request_state(&mut self, state: EmitterState) -> Result<(), Error> {
        if state == EmitterState::FullyDisabled {
            return Err(Error::InvalidRequest(state));
        }
        if state != self.requested {
            debug!("Emitter state {:?} requested", state);
        }
        self.requested = state;
        Ok(())
    }

    /// Stage a new PWM frequency.
    pub fn request_frequency(&mut self, hz: f32) -> Result<(), Error> {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(Error::OutOfRange(Parameter::Frequency));
        }
        self.target.frequency_hz = hz;
        Ok(())
    }

    /// Stage a duty cycle and phase for one channel. Out-of-range values leave the target as-is.
    pub fn request_duty_and_phase(
        &mut self,
        channel: usize,
        duty: f32,
        phase: f32,
    ) -> Result<(), Error> {
        let slot = self
            .target
            .channels
            .get_mut(channel)
            .ok_or(Error::InvalidChannel(channel))?;
        *slot = ChannelPattern::new(duty, phase)?;
        Ok(())
    }

    /// Stage every channel from a bitmap: set bits get `duty` with zero phase, clear bits go off.
    pub fn request_channel_mask(&mut self, mask: u16, duty: f32) -> Result<(), Error> {
        let on = ChannelPattern::new(duty, 0.0)?;
        for (channel, slot) in self.target.channels.iter_mut().enumerate() {
            *slot = if mask & (1 << channel) != 0 {
                on
            } else {
                ChannelPattern::OFF
            };
        }
        Ok(())
    }

    /// Run one step if the gate is open at `now`.
    pub fn poll(&mut self, now: Ticks) -> Option<Step<EmitterState>> {
        self.gate.poll(now).then(|| self.step())
    }

    /// Compute the next state, push staged changes to the driver, then commit the transition.
    pub fn step(&mut self) -> Step<EmitterState> {
        let next = transition(self.state, self.enabled, self.requested);
        let mut step = self.push_target();
        if next != self.state {
            info!("Emitter state {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        step.state = next;
        step
    }

    /// Write every staged value that differs from the driver shadow.
    ///
    /// A failed write leaves its shadow entry unknown so the next step issues it again.
    fn push_target(&mut self) -> Step<EmitterState> {
        let mut step = Step::quiet(self.state);

        if self.target.frequency_hz != self.programmed.frequency_hz {
            #[cfg(feature = "trace_writes")]
            trace!("PWM frequency -> {} Hz", self.target.frequency_hz);
            match self.pwm.set_frequency(self.target.frequency_hz) {
                Ok(()) => {
                    self.programmed.frequency_hz = self.target.frequency_hz;
                    step.writes += 1;
                }
                Err(err) => {
                    self.programmed.frequency_hz = f32::NAN;
                    step.failure = Some(write_failed("set frequency", err));
                }
            }
        }

        for (channel, (wanted, shadow)) in self
            .target
            .channels
            .iter()
            .zip(self.programmed.channels.iter_mut())
            .enumerate()
        {
            if *wanted == *shadow {
                continue;
            }
            #[cfg(feature = "trace_writes")]
            trace!(
                "PWM channel {} -> duty {} phase {}",
                channel,
                wanted.duty,
                wanted.phase
            );
            match self
                .pwm
                .set_channel_pattern(channel, wanted.duty, wanted.phase)
            {
                Ok(()) => {
                    *shadow = *wanted;
                    step.writes += 1;
                }
                Err(err) => {
                    *shadow = ChannelPattern::UNKNOWN;
                    step.failure = Some(write_failed("set channel pattern", err));
                }
            }
        }
        step
    }

    /// Committed state
    pub fn state(&self) -> EmitterState {
        self.state
    }

    /// Master enable
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Staged PWM configuration
    pub fn target(&self) -> &EmitterTarget {
        &self.target
    }

    /// Values last written to the driver. Entries whose write failed are NaN.
    pub fn programmed(&self) -> &EmitterTarget {
        &self.programmed
    }

    /// PWM driver
    pub fn pwm(&self) -> &P {
        &self.pwm
    }

    /// Mutable PWM driver
    pub fn pwm_mut(&mut self) -> &mut P {
        &mut self.pwm
    }
}

/// Log a failed driver write and map it to [`Error::HardwareWriteFailed`].
fn write_failed<E: core::fmt::Debug>(operation: &str, err: E) -> Error {
    warn!("PWM driver failed to {}: {:?}", operation, err);
    Error::HardwareWriteFailed(Device::PwmDriver)
}
