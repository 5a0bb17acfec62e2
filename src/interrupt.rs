// SPDX-License-Identifier: Apache-2.0

//! Interrupt-side entry points, plus the statics they share with the main loop.
//!
//! The firmware's `SysTick` and `DMA_IRQ_0` handlers are thin wrappers around
//! [`system_tick`] and [`adc_frame_complete`].

use crate::{
    buffer::{publish_buffer, FrameExchange, FrameWindow},
    config::{LONG_INTERVAL_TICKS, SENSOR_MODULES},
    mux::ActiveChannel,
    tick::TickCounter,
};

/// Ticks since reset
pub static TICKS: TickCounter = TickCounter::new(LONG_INTERVAL_TICKS);

/// Mux channel routed to the ADC, written by the sequencer and read by the DMA interrupt
pub static ACTIVE_CHANNEL: ActiveChannel = ActiveChannel::new();

/// Latest reduced ADC frame
pub static FRAMES: FrameExchange<SENSOR_MODULES> = FrameExchange::new();

/// Mux snapshot at the start of the ADC buffer currently filling
pub static FRAME_WINDOW: FrameWindow = FrameWindow::new();

/// Tick interrupt body
pub fn system_tick() {
    TICKS.on_tick();
}

/// DMA completion body. `buffer` is the ping-pong half that just filled.
pub fn adc_frame_complete(buffer: &[u16]) {
    let channel = FRAME_WINDOW.close(ACTIVE_CHANNEL.snapshot());
    publish_buffer(&FRAMES, buffer, channel);
}
