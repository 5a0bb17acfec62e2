// SPDX-License-Identifier: Apache-2.0

//! DMA frame hand-off between the ADC interrupt and the main loop.
//!
//! The ADC FIFO is drained by two chained DMA channels into a pair of buffers, so the interrupt
//! only ever reads the buffer that just completed while the other one fills. The interrupt
//! reduces that buffer to one code per sensor module, tags it with the mux channel seen across
//! the buffer and publishes it to a [`FrameExchange`]. The main loop takes it from there.
//!
//! Each completion also starts the next buffer, so the snapshot taken in one interrupt is the
//! start-of-frame snapshot for the next. [`FrameWindow`] keeps it between interrupts.

use core::cell::{Cell, RefCell};

use critical_section::Mutex;
use log::warn;

use crate::{
    config::ADC_MAX_CODE,
    error::Error,
    mux::{ChannelSnapshot, MuxChannel},
};

/// One reduced ADC frame, attributed to the mux channel observed while it filled
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TaggedFrame<const M: usize> {
    /// Mean raw code per sensor module
    pub codes: [u16; M],
    /// Mux channel across the DMA transfer, settled only if unchanged from start to completion
    pub channel: ChannelSnapshot,
    /// Completion count since reset, wrapping
    pub sequence: u32,
}

impl<const M: usize> TaggedFrame<M> {
    /// Zeroed frame on a disabled mux
    pub const fn empty() -> Self {
        Self {
            codes: [0; M],
            channel: ChannelSnapshot::Settled(MuxChannel::Disabled),
            sequence: 0,
        }
    }
}

/// Average a round-robin DMA buffer down to one code per module.
///
/// Conversion `i` belongs to module `i % M`. Codes are masked to 12 bits and the mean is rounded
/// to nearest.
pub fn reduce_interleaved<const M: usize>(buffer: &[u16]) -> [u16; M] {
    let mut sums = [0u32; M];
    let mut counts = [0u32; M];
    for (module, code) in (0..M).cycle().zip(buffer) {
        sums[module] += (code & ADC_MAX_CODE) as u32;
        counts[module] += 1;
    }
    core::array::from_fn(|module| match counts[module] {
        0 => 0,
        n => ((sums[module] + n / 2) / n) as u16,
    })
}

/// Mailbox state
#[derive(Debug)]
struct Exchange<const M: usize> {
    /// Latest completed frame
    frame: TaggedFrame<M>,
    /// Completion flag: set by the interrupt, cleared by the consumer
    ready: bool,
    /// Frames completed since reset
    completed: u32,
    /// Frames overwritten before they were consumed
    overruns: u32,
}

/// Single-slot frame mailbox guarded by a critical section.
pub struct FrameExchange<const M: usize> {
    /// Mailbox state
    state: Mutex<RefCell<Exchange<M>>>,
}

impl<const M: usize> FrameExchange<M> {
    /// Empty mailbox
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(Exchange {
                frame: TaggedFrame::empty(),
                ready: false,
                completed: 0,
                overruns: 0,
            })),
        }
    }

    /// Publish a completed frame. Called from the DMA interrupt.
    ///
    /// If the previous frame was never taken it is replaced by this one and
    /// [`Error::FrameOverrun`] is returned.
    pub fn complete(&self, codes: [u16; M], channel: ChannelSnapshot) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut exchange = self.state.borrow_ref_mut(cs);
            let overrun = exchange.ready;
            if overrun {
                exchange.overruns = exchange.overruns.saturating_add(1);
            }
            exchange.completed = exchange.completed.wrapping_add(1);
            exchange.frame = TaggedFrame {
                codes,
                channel,
                sequence: exchange.completed,
            };
            exchange.ready = true;

            if overrun {
                Err(Error::FrameOverrun {
                    dropped: exchange.overruns,
                })
            } else {
                Ok(())
            }
        })
    }

    /// Take the pending frame, clearing the completion flag.
    pub fn take(&self) -> Option<TaggedFrame<M>> {
        critical_section::with(|cs| {
            let mut exchange = self.state.borrow_ref_mut(cs);
            if exchange.ready {
                exchange.ready = false;
                Some(exchange.frame)
            } else {
                None
            }
        })
    }

    /// Whether a frame is waiting
    pub fn is_ready(&self) -> bool {
        critical_section::with(|cs| self.state.borrow_ref(cs).ready)
    }

    /// Frames overwritten before being consumed, since reset
    pub fn overruns(&self) -> u32 {
        critical_section::with(|cs| self.state.borrow_ref(cs).overruns)
    }
}

impl<const M: usize> Default for FrameExchange<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Mux snapshot at the start of the buffer currently filling.
pub struct FrameWindow {
    /// Snapshot taken at the previous completion
    start: Mutex<Cell<ChannelSnapshot>>,
}

impl FrameWindow {
    /// No completion seen yet, so the first frame is never attributed.
    pub const fn new() -> Self {
        Self {
            start: Mutex::new(Cell::new(ChannelSnapshot::Settling(MuxChannel::Disabled))),
        }
    }

    /// Close the frame that completed at `end` and open the next one there.
    ///
    /// Returns the attribution for the closed frame, see [`ChannelSnapshot::spanning`].
    pub fn close(&self, end: ChannelSnapshot) -> ChannelSnapshot {
        critical_section::with(|cs| self.start.borrow(cs).replace(end).spanning(end))
    }
}

impl Default for FrameWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Reduce a completed DMA buffer and publish it, logging any overrun.
pub fn publish_buffer<const M: usize>(
    exchange: &FrameExchange<M>,
    buffer: &[u16],
    channel: ChannelSnapshot,
) {
    if let Err(err) = exchange.complete(reduce_interleaved(buffer), channel) {
        warn!("{}", err);
    }
}

/// Creates the two buffers used by the ADC DMA ping-pong
#[cfg(target_os = "none")]
pub fn create_adc_buffers() -> Option<(
    &'static mut [u16; crate::config::ADC_BUFFER_LEN],
    &'static mut [u16; crate::config::ADC_BUFFER_LEN],
)> {
    use crate::config::ADC_BUFFER_LEN;
    use cortex_m::singleton;

    let first = singleton!(: [u16; ADC_BUFFER_LEN] = [0u16; ADC_BUFFER_LEN])?;
    let second = singleton!(: [u16; ADC_BUFFER_LEN] = [0u16; ADC_BUFFER_LEN])?;
    Some((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_averages_per_module() {
        // Two modules, three rounds
        let buffer = [10, 100, 20, 200, 30, 301];
        assert_eq!(reduce_interleaved::<2>(&buffer), [20, 200]);
    }

    #[test]
    fn reduce_masks_error_flag() {
        let buffer = [0x8000 | 0x0FFF, 0x0001];
        assert_eq!(reduce_interleaved::<2>(&buffer), [0x0FFF, 1]);
    }

    #[test]
    fn reduce_handles_short_buffer() {
        assert_eq!(reduce_interleaved::<4>(&[7, 9]), [7, 9, 0, 0]);
    }

    #[test]
    fn take_clears_completion_flag() {
        let exchange = FrameExchange::<2>::new();
        assert_eq!(exchange.take(), None);

        let channel = ChannelSnapshot::Settled(MuxChannel::Two);
        exchange.complete([1, 2], channel).unwrap();
        assert!(exchange.is_ready());
        let frame = exchange.take().unwrap();
        assert_eq!(frame.codes, [1, 2]);
        assert_eq!(frame.channel, channel);
        assert_eq!(frame.sequence, 1);
        assert!(!exchange.is_ready());
        assert_eq!(exchange.take(), None);
    }

    #[test]
    fn unconsumed_frame_is_an_overrun() {
        let exchange = FrameExchange::<1>::new();
        let channel = ChannelSnapshot::Settled(MuxChannel::One);
        exchange.complete([1], channel).unwrap();
        assert_eq!(
            exchange.complete([2], channel),
            Err(Error::FrameOverrun { dropped: 1 })
        );
        assert_eq!(
            exchange.complete([3], channel),
            Err(Error::FrameOverrun { dropped: 2 })
        );
        assert_eq!(exchange.overruns(), 2);

        let frame = exchange.take().unwrap();
        assert_eq!(frame.codes, [3]);
        assert_eq!(frame.sequence, 3);
        exchange.complete([4], channel).unwrap();
    }

    #[test]
    fn publish_buffer_tags_reduced_frame() {
        let exchange = FrameExchange::<2>::new();
        let channel = ChannelSnapshot::Settling(MuxChannel::Three);
        publish_buffer(&exchange, &[4, 8, 6, 10], channel);
        let frame = exchange.take().unwrap();
        assert_eq!(frame.codes, [5, 9]);
        assert_eq!(frame.channel, channel);
    }

    #[test]
    fn window_attributes_only_settled_unchanged_frames() {
        use ChannelSnapshot::{Settled, Settling};
        let window = FrameWindow::new();
        // Start of the first buffer was never observed
        assert_eq!(
            window.close(Settled(MuxChannel::One)),
            Settling(MuxChannel::One)
        );
        assert_eq!(
            window.close(Settled(MuxChannel::One)),
            Settled(MuxChannel::One)
        );
        // Switch began mid-frame
        assert_eq!(
            window.close(Settling(MuxChannel::Two)),
            Settling(MuxChannel::Two)
        );
        // Settled at completion, but the frame started while settling
        assert_eq!(
            window.close(Settled(MuxChannel::Two)),
            Settling(MuxChannel::Two)
        );
        assert_eq!(
            window.close(Settled(MuxChannel::Two)),
            Settled(MuxChannel::Two)
        );
    }
}
