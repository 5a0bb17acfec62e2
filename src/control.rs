// SPDX-License-Identifier: Apache-2.0

//! Host control record received over USB serial.
//!
//! Layout, one byte per field except the bitmap:
//!
//! | byte | field                                 |
//! |------|---------------------------------------|
//! | 0    | emitter override, non-zero is enabled |
//! | 1    | requested [`EmitterState`]            |
//! | 2..4 | PWM channel bitmap, big endian        |
//! | 4    | mux override, non-zero is enabled     |
//! | 5    | requested [`MuxChannel`]              |
//!
//! USB reads split the stream at arbitrary points, so bytes are reassembled by a
//! [`RecordReader`] before decoding.

use heapless::Vec;
use log::debug;

use crate::{emitter::EmitterState, error::Error, mux::MuxChannel};

/// Decoded control record
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    /// Host drives the emitter state
    emitter_override: bool,
    /// Requested emitter state
    emitter_state: EmitterState,
    /// Bit n turns emitter channel n on under user control
    pwm_bitmap: u16,
    /// Host drives the mux channel
    mux_override: bool,
    /// Requested mux channel
    mux_channel: MuxChannel,
}

impl ControlRecord {
    /// Encoded length
    pub const LEN: usize = 6;

    /// Decode a record from the start of `bytes`. Trailing bytes are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let Some(&[emitter_override, state, hi, lo, mux_override, channel]) =
            bytes.first_chunk::<{ Self::LEN }>()
        else {
            return Err(Error::MalformedRecord);
        };
        Ok(Self {
            emitter_override: emitter_override != 0,
            emitter_state: EmitterState::try_from(state)?,
            pwm_bitmap: u16::from_be_bytes([hi, lo]),
            mux_override: mux_override != 0,
            mux_channel: MuxChannel::try_from(channel)?,
        })
    }

    /// Whether the host drives the emitter state
    pub fn emitter_override(&self) -> bool {
        self.emitter_override
    }

    /// Requested emitter state
    pub fn emitter_state(&self) -> EmitterState {
        self.emitter_state
    }

    /// Requested PWM channel bitmap
    pub fn pwm_bitmap(&self) -> u16 {
        self.pwm_bitmap
    }

    /// Whether the host drives the mux channel
    pub fn mux_override(&self) -> bool {
        self.mux_override
    }

    /// Requested mux channel
    pub fn mux_channel(&self) -> MuxChannel {
        self.mux_channel
    }
}

/// Reassembles fixed-length records from a byte stream.
#[derive(Debug, Default)]
pub struct RecordReader {
    /// Bytes of the record being assembled
    partial: Vec<u8, { ControlRecord::LEN }>,
}

impl RecordReader {
    /// Append one byte, returning the record it completes.
    pub fn push(&mut self, byte: u8) -> Option<[u8; ControlRecord::LEN]> {
        // Never full on entry, a complete record is drained below
        self.partial.push(byte).ok()?;
        if !self.partial.is_full() {
            return None;
        }
        let record = <[u8; ControlRecord::LEN]>::try_from(self.partial.as_slice()).ok();
        self.partial.clear();
        record
    }

    /// Bytes held towards the next record
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

/// Last valid record received from the host.
#[derive(Debug, Default)]
pub struct ControlStore {
    /// Latest record
    record: ControlRecord,
    /// Records accepted since reset
    accepted: u32,
    /// Records rejected since reset
    rejected: u32,
}

impl ControlStore {
    /// Decode `bytes` and keep the record if it is valid. An invalid record leaves the store as-is.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<ControlRecord, Error> {
        match ControlRecord::parse(bytes) {
            Ok(record) => {
                self.record = record;
                self.accepted = self.accepted.wrapping_add(1);
                debug!("Control record accepted: {:?}", record);
                Ok(record)
            }
            Err(err) => {
                self.rejected = self.rejected.wrapping_add(1);
                debug!("Control record rejected ({} bytes)", bytes.len());
                Err(err)
            }
        }
    }

    /// Latest valid record, all-zero before the first one arrives
    pub fn record(&self) -> &ControlRecord {
        &self.record
    }

    /// Records accepted and rejected since reset
    pub fn counts(&self) -> (u32, u32) {
        (self.accepted, self.rejected)
    }
}
