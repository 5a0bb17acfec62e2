// SPDX-License-Identifier: Apache-2.0

//! Detector multiplexer sequencer.
//!
//! Both GPIO expanders drive duplicate mux groups, so every transition writes the same channel
//! pattern to both chips. The channel currently routed to the ADC is published through
//! [`ActiveChannel`], which the DMA interrupt snapshots at both ends of every frame.
//!
//! The settling deadline is taken from the tick counter after the last expander write returns,
//! not from the tick at which the step was scheduled, so I2C time spent elsewhere in the same
//! main-loop pass never shortens it. One extra tick covers the unknown phase inside the tick in
//! which the writes finished.

use core::sync::atomic::{AtomicU8, Ordering};

#[allow(unused_imports)]
use log::trace;
use log::{debug, warn};

use crate::{
    config::{MUX_GATE_TICKS, MUX_SETTLING_TICKS},
    error::{Device, Error},
    tick::{Step, TickCounter, TickGate, Ticks},
};

/// Detector input routed through the multiplexers
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxChannel {
    /// No input selected
    #[default]
    Disabled = 0,
    /// Input channel 1
    One,
    /// Input channel 2
    Two,
    /// Input channel 3
    Three,
    /// Input channel 4
    Four,
}

impl MuxChannel {
    /// Number of channel states, including [`MuxChannel::Disabled`]
    pub const COUNT: usize = 5;
    /// Every channel state, in wire order
    pub const ALL: [MuxChannel; Self::COUNT] = [
        Self::Disabled,
        Self::One,
        Self::Two,
        Self::Three,
        Self::Four,
    ];

    /// Row of the sample matrix and the pattern table
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Next channel of the round robin.
    ///
    /// Four is only entered from Disabled and never revisited; there is no wired input behind it
    /// on the current board.
    pub const fn next(self) -> Self {
        match self {
            Self::Disabled => Self::Four,
            Self::One => Self::Two,
            Self::Two => Self::Three,
            Self::Three => Self::One,
            Self::Four => Self::One,
        }
    }

    /// Channel encoded in the low bits of a raw value
    const fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            1 => Self::One,
            2 => Self::Two,
            3 => Self::Three,
            4 => Self::Four,
            _ => Self::Disabled,
        }
    }
}

impl TryFrom<u8> for MuxChannel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(Error::MalformedRecord)
    }
}

/// GPIO expander driving one of the two mux groups
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpanderChip {
    /// Muxes 0 to 3
    One,
    /// Muxes 4 to 7
    Two,
}

impl ExpanderChip {
    /// Both chips
    pub const ALL: [ExpanderChip; 2] = [Self::One, Self::Two];
}

/// 8-bit output port of a GPIO expander
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpanderPort {
    /// Pins P0_0 to P0_7
    Zero,
    /// Pins P1_0 to P1_7
    One,
}

/// Output levels for both ports of an expander
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PortPattern {
    /// Port 0 levels
    pub port0: u8,
    /// Port 1 levels
    pub port1: u8,
}

/// Select/enable levels per channel, indexed by [`MuxChannel::index`].
///
/// Port 0 carries the selects for muxes 1 to 3 (mux 1 also uses P1_0 as its enable), port 1 the
/// select and enable for mux 0. Chip two is wired in mirror image with identical port levels.
pub const MUX_PATTERNS: [PortPattern; MuxChannel::COUNT] = [
    // Disabled: same levels as channel one, enables are not cleared
    PortPattern {
        port0: 0b0010_0100,
        port1: 0b0000_1001,
    },
    PortPattern {
        port0: 0b0010_0100,
        port1: 0b0000_1001,
    },
    PortPattern {
        port0: 0b0110_1101,
        port1: 0b0000_1011,
    },
    PortPattern {
        port0: 0b1011_0110,
        port1: 0b0000_1101,
    },
    PortPattern {
        port0: 0b1111_1111,
        port1: 0b0000_1111,
    },
];

/// Port write capability of the expander pair.
pub trait PortWriter {
    /// Bus error reported by the expanders
    type Error: core::fmt::Debug;

    /// Drive every pin of `port` on `chip` to the levels in `bits`.
    fn write_port(
        &mut self,
        chip: ExpanderChip,
        port: ExpanderPort,
        bits: u8,
    ) -> Result<(), Self::Error>;
}

/// Channel state observed by the acquisition side
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelSnapshot {
    /// Channel is routed and its inputs have settled
    Settled(MuxChannel),
    /// Switch to this channel is in progress; samples are not attributable
    Settling(MuxChannel),
}

impl ChannelSnapshot {
    /// Settled channel, if any
    pub fn settled(self) -> Option<MuxChannel> {
        match self {
            Self::Settled(channel) => Some(channel),
            Self::Settling(_) => None,
        }
    }

    /// Channel routed or being routed
    pub fn channel(self) -> MuxChannel {
        match self {
            Self::Settled(channel) | Self::Settling(channel) => channel,
        }
    }

    /// Attribution of a frame that started at `self` and completed at `end`.
    ///
    /// Only a frame bracketed by the same settled channel at both ends is settled.
    pub fn spanning(self, end: Self) -> Self {
        match (self, end) {
            (Self::Settled(start), Self::Settled(channel)) if start == channel => end,
            _ => Self::Settling(end.channel()),
        }
    }
}

/// Channel currently routed to the ADC, shared with the DMA interrupt.
///
/// A single byte, written only by the sequencer and read with one atomic load, so a snapshot is
/// never torn. Bit 7 marks a switch that has not settled yet.
pub struct ActiveChannel(AtomicU8);

impl ActiveChannel {
    /// Settling flag
    const SETTLING: u8 = 0x80;

    /// Disabled and settled
    pub const fn new() -> Self {
        Self(AtomicU8::new(MuxChannel::Disabled as u8))
    }

    /// Read the channel as seen at this instant.
    pub fn snapshot(&self) -> ChannelSnapshot {
        let raw = self.0.load(Ordering::Acquire);
        let channel = MuxChannel::from_bits(raw);
        if raw & Self::SETTLING != 0 {
            ChannelSnapshot::Settling(channel)
        } else {
            ChannelSnapshot::Settled(channel)
        }
    }

    /// Mark a switch to `channel` as started. Called before any select line changes.
    fn begin_switch(&self, channel: MuxChannel) {
        self.0.store(channel as u8 | Self::SETTLING, Ordering::Release);
    }

    /// Publish `channel` as settled.
    fn settle(&self, channel: MuxChannel) {
        self.0.store(channel as u8, Ordering::Release);
    }
}

impl Default for ActiveChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Tick-gated round robin over the detector inputs
pub struct MuxSequencer<'a, G> {
    /// Expander pair
    ports: G,
    /// Channel published to the acquisition side
    active: &'a ActiveChannel,
    /// Channel the select lines are driven to
    current: MuxChannel,
    /// Round robin runs while set; cleared, the sequencer returns to Disabled
    enabled: bool,
    /// Channel to park on instead of cycling
    hold: Option<MuxChannel>,
    /// Tick at which the current switch is considered settled
    settle_at: Option<Ticks>,
    /// Ticks allowed for settling after each switch
    settling_ticks: u32,
    /// Step gate
    gate: TickGate,
}

impl<'a, G: PortWriter> MuxSequencer<'a, G> {
    /// Create a sequencer gated every [`MUX_GATE_TICKS`] with [`MUX_SETTLING_TICKS`] of settling.
    pub fn new(ports: G, active: &'a ActiveChannel) -> Self {
        Self::with_timing(ports, active, MUX_GATE_TICKS, MUX_SETTLING_TICKS)
    }

    /// Create a sequencer with explicit gate and settling periods.
    pub fn with_timing(
        ports: G,
        active: &'a ActiveChannel,
        gate_ticks: u32,
        settling_ticks: u32,
    ) -> Self {
        Self {
            ports,
            active,
            current: MuxChannel::Disabled,
            enabled: false,
            hold: None,
            settle_at: None,
            settling_ticks,
            gate: TickGate::new(gate_ticks),
        }
    }

    /// Drive both expanders to the disabled pattern.
    pub fn init(&mut self) -> Result<(), Error> {
        self.active.begin_switch(MuxChannel::Disabled);
        let (writes, failure) = self.write_pattern(MuxChannel::Disabled);
        self.current = MuxChannel::Disabled;
        self.settle_at = None;
        self.active.settle(MuxChannel::Disabled);
        debug!("Mux expanders initialized with {} writes", writes);
        failure.map_or(Ok(()), Err)
    }

    /// Start the round robin on the next step.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Return to Disabled on the next step.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Park on `channel` instead of cycling, or run the round robin with `None`.
    ///
    /// Both forms enable the sequencer, so `hold(None)` also starts a round robin that was never
    /// enabled. Holding [`MuxChannel::Disabled`] disables the sequencer.
    pub fn hold(&mut self, channel: Option<MuxChannel>) {
        match channel {
            Some(MuxChannel::Disabled) => {
                self.hold = None;
                self.enabled = false;
            }
            other => {
                self.hold = other;
                self.enabled = true;
            }
        }
    }

    /// Complete any pending settle, then run one step if the gate is open.
    pub fn poll(&mut self, clock: &TickCounter) -> Option<Step<MuxChannel>> {
        let now = clock.now();
        self.settle(now);
        self.gate.poll(now).then(|| self.step(clock))
    }

    /// Advance to the next channel, rewriting the expanders only on an actual transition.
    pub fn step(&mut self, clock: &TickCounter) -> Step<MuxChannel> {
        let next = if !self.enabled {
            MuxChannel::Disabled
        } else {
            self.hold.unwrap_or_else(|| self.current.next())
        };
        if next == self.current {
            return Step::quiet(next);
        }

        // Acquisition stops attributing frames before the first select line moves
        self.active.begin_switch(next);
        let (writes, failure) = self.write_pattern(next);
        let written = clock.now();
        #[cfg(feature = "trace_writes")]
        trace!("Mux {:?} -> {:?} at tick {}", self.current, next, written);
        self.current = next;
        if self.settling_ticks == 0 {
            self.active.settle(next);
            self.settle_at = None;
        } else {
            self.settle_at = Some(written + self.settling_ticks as Ticks + 1);
        }

        Step {
            state: next,
            writes,
            failure,
        }
    }

    /// Publish the current channel once its settling time has passed.
    pub fn settle(&mut self, now: Ticks) {
        if let Some(at) = self.settle_at {
            if now >= at {
                self.active.settle(self.current);
                self.settle_at = None;
            }
        }
    }

    /// Write `channel`'s pattern to both ports of both chips, continuing past failures.
    fn write_pattern(&mut self, channel: MuxChannel) -> (u8, Option<Error>) {
        let pattern = MUX_PATTERNS[channel.index()];
        let mut writes = 0;
        let mut failure = None;
        for chip in ExpanderChip::ALL {
            for (port, bits) in [
                (ExpanderPort::Zero, pattern.port0),
                (ExpanderPort::One, pattern.port1),
            ] {
                match self.ports.write_port(chip, port, bits) {
                    Ok(()) => writes += 1,
                    Err(err) => {
                        warn!(
                            "Expander {:?} port {:?} write failed: {:?}",
                            chip,
                            port,
                            err
                        );
                        failure = Some(Error::HardwareWriteFailed(Device::Expander(chip)));
                    }
                }
            }
        }
        (writes, failure)
    }

    /// Channel the select lines are driven to
    pub fn current(&self) -> MuxChannel {
        self.current
    }

    /// Whether the round robin is running
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Port writer
    pub fn ports(&self) -> &G {
        &self.ports
    }

    /// Mutable port writer
    pub fn ports_mut(&mut self) -> &mut G {
        &mut self.ports
    }
}
