// SPDX-License-Identifier: Apache-2.0

//! Outbound telemetry packet.
//!
//! One 8-byte record per sensor module: module id, the calibrated values of channels one to three
//! as big-endian `u16`, and the emitter status. The host tools read 64 bytes at a time, so a
//! packet carries at most [`MAX_MODULES`] modules.
//!
//! The host frames records purely by position, so packets go out through a [`TelemetryLink`]
//! that never leaves a partial packet behind.

use heapless::Vec;

use crate::{
    acquisition::AcquisitionPipeline,
    config::{WAVELENGTH_660NM_CHANNELS, WAVELENGTH_940NM_CHANNELS},
    emitter::EmitterTarget,
    mux::MuxChannel,
};

/// Bytes per module record
pub const RECORD_LEN: usize = 8;
/// Modules carried by one packet
pub const MAX_MODULES: usize = 8;
/// Largest packet
pub const PACKET_LEN: usize = RECORD_LEN * MAX_MODULES;

/// Encoded telemetry packet
pub type Packet = Vec<u8, PACKET_LEN>;

/// Emitter pattern reported with each record
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum EmitterStatus {
    /// No emitter lit
    #[default]
    Off = 0,
    /// 940 nm group lit
    Wavelength940nm = 1,
    /// 660 nm group lit
    Wavelength660nm = 2,
    /// Any other combination
    Other = 3,
}

impl EmitterStatus {
    /// Status of an emitter bank with the given master enable and programmed target
    pub fn classify(enabled: bool, target: &EmitterTarget) -> Self {
        if !enabled {
            return Self::Off;
        }
        match target.on_mask() {
            0 => Self::Off,
            WAVELENGTH_940NM_CHANNELS => Self::Wavelength940nm,
            WAVELENGTH_660NM_CHANNELS => Self::Wavelength660nm,
            _ => Self::Other,
        }
    }
}

/// Round a calibrated value into the wire range. Float casts saturate and map NaN to zero.
fn to_wire(value: f32) -> u16 {
    (value + 0.5) as u16
}

/// Encode the calibrated matrix into a packet.
pub fn encode<const M: usize>(
    pipeline: &AcquisitionPipeline<M>,
    status: EmitterStatus,
) -> Packet {
    let mut packet = Packet::new();
    for (module, cells) in pipeline.matrix().iter().enumerate().take(MAX_MODULES) {
        let [one, two, three] = [MuxChannel::One, MuxChannel::Two, MuxChannel::Three]
            .map(|channel| to_wire(cells[channel.index()].calibrated).to_be_bytes());
        let record = [
            module as u8,
            one[0],
            one[1],
            two[0],
            two[1],
            three[0],
            three[1],
            status as u8,
        ];
        if packet.extend_from_slice(&record).is_err() {
            break;
        }
    }
    packet
}

/// Byte sink for outbound packets, such as the USB serial port.
pub trait PacketSink {
    /// Write a prefix of `bytes` and return its length. Zero when the sink is busy.
    fn write_some(&mut self, bytes: &[u8]) -> usize;
}

/// Sends whole packets over a sink that may accept part of a write.
///
/// The unsent tail of a packet goes out before any later packet, and packets produced while a
/// tail is pending are dropped whole.
#[derive(Debug, Default)]
pub struct TelemetryLink {
    /// Packet being sent
    pending: Packet,
    /// Bytes of `pending` already accepted by the sink
    sent: usize,
    /// Packets dropped while a tail was pending
    dropped: u32,
}

impl TelemetryLink {
    /// Push out any pending tail. Returns `true` once nothing is left.
    pub fn flush<S: PacketSink>(&mut self, sink: &mut S) -> bool {
        while self.sent < self.pending.len() {
            match sink.write_some(&self.pending[self.sent..]) {
                0 => return false,
                count => self.sent = (self.sent + count).min(self.pending.len()),
            }
        }
        true
    }

    /// Send `packet`, or drop it if an earlier packet is still going out.
    pub fn send<S: PacketSink>(&mut self, sink: &mut S, packet: Packet) {
        if !self.flush(sink) {
            self.dropped = self.dropped.saturating_add(1);
            return;
        }
        self.pending = packet;
        self.sent = 0;
        self.flush(sink);
    }

    /// Packets dropped since reset
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}
