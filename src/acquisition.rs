// SPDX-License-Identifier: Apache-2.0

//! Calibrated sample matrix fed by tagged ADC frames.

#[allow(unused_imports)]
use log::trace;

use crate::{buffer::TaggedFrame, mux::MuxChannel};

/// Affine calibration of one sensor module
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Calibration {
    /// Gain applied to the raw code
    pub scale: f32,
    /// Offset added after scaling
    pub offset: f32,
}

impl Calibration {
    /// Calibrated value equals the raw code
    pub const IDENTITY: Self = Self::new(1.0, 0.0);

    /// Calibration computing `scale * raw + offset`
    pub const fn new(scale: f32, offset: f32) -> Self {
        Self { scale, offset }
    }

    /// Calibrated value of a raw code. No clamping.
    pub fn apply(&self, raw: u16) -> f32 {
        self.scale * raw as f32 + self.offset
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Last reading of one (module, channel) cell
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct SensorSample {
    /// Raw 12-bit code
    pub raw: u16,
    /// Calibrated value
    pub calibrated: f32,
}

/// Frame counters kept by the pipeline
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames written into the matrix
    pub processed: u32,
    /// Frames captured while the mux was settling
    pub discarded: u32,
    /// Sequence number of the last frame seen
    pub last_sequence: u32,
}

/// Per-module, per-channel matrix of the latest calibrated samples.
pub struct AcquisitionPipeline<const M: usize> {
    /// Per-module calibration
    calibration: [Calibration; M],
    /// Latest sample per module and channel
    samples: [[SensorSample; MuxChannel::COUNT]; M],
    /// Frame counters
    stats: PipelineStats,
}

impl<const M: usize> AcquisitionPipeline<M> {
    /// Zeroed matrix using `calibration` for each module
    pub fn new(calibration: [Calibration; M]) -> Self {
        Self {
            calibration,
            samples: [[SensorSample::default(); MuxChannel::COUNT]; M],
            stats: PipelineStats::default(),
        }
    }

    /// Write a frame into the cells of the channel it was captured on.
    ///
    /// Frames captured during a channel switch are counted and dropped. Returns the channel
    /// written.
    pub fn process_frame(&mut self, frame: &TaggedFrame<M>) -> Option<MuxChannel> {
        self.stats.last_sequence = frame.sequence;
        let Some(channel) = frame.channel.settled() else {
            self.stats.discarded = self.stats.discarded.saturating_add(1);
            #[cfg(feature = "trace_frames")]
            trace!("Frame {} discarded while mux settles", frame.sequence);
            return None;
        };

        for ((cells, calibration), raw) in self
            .samples
            .iter_mut()
            .zip(&self.calibration)
            .zip(frame.codes)
        {
            cells[channel.index()] = SensorSample {
                raw,
                calibrated: calibration.apply(raw),
            };
        }
        self.stats.processed = self.stats.processed.saturating_add(1);
        #[cfg(feature = "trace_frames")]
        trace!(
            "Frame {} on {:?}: {:?}",
            frame.sequence,
            channel,
            frame.codes
        );
        Some(channel)
    }

    /// Cell at (`module`, `channel`), or `None` for a module that does not exist
    pub fn sample(&self, module: usize, channel: MuxChannel) -> Option<SensorSample> {
        self.samples.get(module).map(|cells| cells[channel.index()])
    }

    /// Calibrated value at (`module`, `channel`)
    pub fn calibrated_value(&self, module: usize, channel: MuxChannel) -> Option<f32> {
        self.sample(module, channel).map(|s| s.calibrated)
    }

    /// Raw code at (`module`, `channel`)
    pub fn raw_value(&self, module: usize, channel: MuxChannel) -> Option<u16> {
        self.sample(module, channel).map(|s| s.raw)
    }

    /// Whole matrix, indexed by module then [`MuxChannel::index`]
    pub fn matrix(&self) -> &[[SensorSample; MuxChannel::COUNT]; M] {
        &self.samples
    }

    /// Frame counters
    pub fn stats(&self) -> PipelineStats {
        self.stats
    }
}
