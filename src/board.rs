// SPDX-License-Identifier: Apache-2.0

//! RP2040 board glue: the DMA transfer shared with `DMA_IRQ_0`, the USB telemetry sink and the
//! defmt log bridge.

use core::cell::RefCell;

use critical_section::Mutex;
use rp2040_hal::{
    adc::DmaReadTarget,
    dma::{
        double_buffer::{Transfer, WriteNext},
        Channel, CH0, CH1,
    },
    usb::UsbBus,
};
use usb_device::UsbError;
use usbd_serial::SerialPort;

use crate::{config::ADC_BUFFER_LEN, telemetry::PacketSink};

/// One half of the ADC ping-pong
pub type AdcBuffer = &'static mut [u16; ADC_BUFFER_LEN];

/// Running ADC transfer, with the idle buffer queued behind the active one
pub type AdcTransfer =
    Transfer<Channel<CH0>, Channel<CH1>, DmaReadTarget<u16>, AdcBuffer, WriteNext<AdcBuffer>>;

/// ADC DMA transfer for access in interrupts
pub static ADC_TRANSFER: Mutex<RefCell<Option<AdcTransfer>>> = Mutex::new(RefCell::new(None));

impl PacketSink for SerialPort<'_, UsbBus> {
    fn write_some(&mut self, bytes: &[u8]) -> usize {
        match self.write(bytes) {
            Ok(count) => count,
            Err(UsbError::WouldBlock) => 0,
            Err(err) => {
                defmt::warn!("USB write failed: {}", defmt::Debug2Format(&err));
                0
            }
        }
    }
}

/// Forwards `log` records from the portable core to defmt
struct DefmtLogger;

impl log::Log for DefmtLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let message = defmt::Display2Format(record.args());
        match record.level() {
            log::Level::Error => defmt::error!("{}", message),
            log::Level::Warn => defmt::warn!("{}", message),
            log::Level::Info => defmt::info!("{}", message),
            log::Level::Debug => defmt::debug!("{}", message),
            log::Level::Trace => defmt::trace!("{}", message),
        }
    }

    fn flush(&self) {}
}

/// Bridge instance
static LOGGER: DefmtLogger = DefmtLogger;

/// Route core log records to defmt. Call once, before interrupts are unmasked.
pub fn install_logger() {
    // Cortex-M0+ has no compare-and-swap, so only the racy setters exist. Nothing else runs yet.
    unsafe {
        if log::set_logger_racy(&LOGGER).is_err() {
            defmt::warn!("Logger already installed");
        }
        log::set_max_level_racy(if cfg!(any(feature = "trace_frames", feature = "trace_writes")) {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Debug
        });
    }
}
