// SPDX-License-Identifier: Apache-2.0

//! Main-loop orchestration of the emitter, mux and acquisition state machines.
//!
//! [`FnirsSystem::poll`] is called continuously from the firmware's main loop. On each call it
//! consumes the long-interval flag, stages the emitter target for the current state, runs any
//! gated emitter and mux steps, folds the latest ADC frame into the sample matrix, and hands back
//! a telemetry packet when the telemetry gate opens.

use log::{info, warn};

use crate::{
    acquisition::{AcquisitionPipeline, Calibration},
    buffer::FrameExchange,
    config::{
        DEFAULT_DUTY, TELEMETRY_GATE_TICKS, WAVELENGTH_660NM_CHANNELS, WAVELENGTH_940NM_CHANNELS,
    },
    control::{ControlRecord, ControlStore, RecordReader},
    emitter::{EmitterController, EmitterState, PwmOutput},
    error::Error,
    mux::{MuxSequencer, PortWriter},
    telemetry::{self, EmitterStatus, Packet},
    tick::{TickCounter, TickGate, Ticks},
};

/// Emitter group lit under sequencer control
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum WavelengthGroup {
    /// 940 nm emitters
    #[default]
    Nm940,
    /// 660 nm emitters
    Nm660,
}

impl WavelengthGroup {
    /// PWM channels of this group
    pub fn channels(self) -> u16 {
        match self {
            Self::Nm940 => WAVELENGTH_940NM_CHANNELS,
            Self::Nm660 => WAVELENGTH_660NM_CHANNELS,
        }
    }

    /// The other group
    pub fn toggled(self) -> Self {
        match self {
            Self::Nm940 => Self::Nm660,
            Self::Nm660 => Self::Nm940,
        }
    }
}

/// Counters logged at every long interval
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    /// Frames written into the matrix
    pub frames_processed: u32,
    /// Frames dropped while the mux settled
    pub frames_discarded: u32,
    /// Frames overwritten before the main loop took them
    pub frame_overruns: u32,
    /// Emitter steps with a failed driver write
    pub emitter_failures: u32,
    /// Mux steps with a failed expander write
    pub mux_failures: u32,
}

/// The synchronized acquisition controller
pub struct FnirsSystem<'a, P, G, const M: usize> {
    /// Emitter state machine
    emitter: EmitterController<P>,
    /// Mux sequencer
    mux: MuxSequencer<'a, G>,
    /// Sample matrix
    pipeline: AcquisitionPipeline<M>,
    /// Last host record
    control: ControlStore,
    /// Partial record from the host stream
    reader: RecordReader,
    /// Group lit under sequencer control
    wavelength: WavelengthGroup,
    /// Telemetry gate
    telemetry: TickGate,
    /// Emitter steps with a failed write
    emitter_failures: u32,
    /// Mux steps with a failed write
    mux_failures: u32,
}

impl<'a, P: PwmOutput, G: PortWriter, const M: usize> FnirsSystem<'a, P, G, M> {
    /// Assemble the controller from its state machines
    pub fn new(
        emitter: EmitterController<P>,
        mux: MuxSequencer<'a, G>,
        calibration: [Calibration; M],
    ) -> Self {
        Self {
            emitter,
            mux,
            pipeline: AcquisitionPipeline::new(calibration),
            control: ControlStore::default(),
            reader: RecordReader::default(),
            wavelength: WavelengthGroup::default(),
            telemetry: TickGate::new(TELEMETRY_GATE_TICKS),
            emitter_failures: 0,
            mux_failures: 0,
        }
    }

    /// Program both peripherals to their idle configuration.
    ///
    /// Both are attempted; the first failure is returned.
    pub fn init(&mut self) -> Result<(), Error> {
        let emitter = self.emitter.init();
        let mux = self.mux.init();
        emitter.and(mux)
    }

    /// Enable the emitters under sequencer control and start the mux round robin.
    pub fn start_sequencing(&mut self) -> Result<(), Error> {
        self.emitter.request_state(EmitterState::SequencerControl)?;
        self.mux.enable();
        self.emitter.enable()
    }

    /// Decode and apply a record received from the host.
    pub fn receive_control(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let record = self.control.receive(bytes)?;
        self.apply_control(&record)
    }

    /// Feed bytes read from the host link, applying every record they complete.
    ///
    /// Returns the number of records completed, valid or not. Failures are logged.
    pub fn receive_stream(&mut self, bytes: &[u8]) -> usize {
        let mut completed = 0;
        for &byte in bytes {
            if let Some(record) = self.reader.push(byte) {
                completed += 1;
                if let Err(err) = self.receive_control(&record) {
                    warn!("Control record not applied: {}", err);
                }
            }
        }
        completed
    }

    /// Apply host overrides. The mux override is applied even if the emitter override fails.
    ///
    /// With the mux override clear the round robin runs, so any record without it starts the
    /// sequencer, including one sent only to change the emitters.
    pub fn apply_control(&mut self, record: &ControlRecord) -> Result<(), Error> {
        if record.mux_override() {
            self.mux.hold(Some(record.mux_channel()));
        } else {
            self.mux.hold(None);
        }

        if !record.emitter_override() {
            return Ok(());
        }
        match record.emitter_state() {
            EmitterState::FullyDisabled => self.emitter.disable(),
            state => {
                self.emitter.request_state(state)?;
                self.emitter.enable()
            }
        }
    }

    /// Run everything that is due at `now`.
    ///
    /// The mux reads `ticks` itself, after any emitter bus traffic in the same pass.
    pub fn poll(
        &mut self,
        now: Ticks,
        ticks: &TickCounter,
        frames: &FrameExchange<M>,
    ) -> Option<Packet> {
        if ticks.take_long_interval() {
            self.wavelength = self.wavelength.toggled();
            self.log_diagnostics(frames);
        }

        if let Err(err) = self.stage_emitter_target() {
            warn!("Emitter target not staged: {}", err);
        }
        if let Some(step) = self.emitter.poll(now) {
            if step.failure.is_some() {
                self.emitter_failures = self.emitter_failures.saturating_add(1);
            }
        }
        if let Some(step) = self.mux.poll(ticks) {
            if step.failure.is_some() {
                self.mux_failures = self.mux_failures.saturating_add(1);
            }
        }

        if let Some(frame) = frames.take() {
            self.pipeline.process_frame(&frame);
        }

        self.telemetry
            .poll(now)
            .then(|| telemetry::encode(&self.pipeline, self.emitter_status()))
    }

    /// Stage the channel pattern dictated by the committed emitter state.
    fn stage_emitter_target(&mut self) -> Result<(), Error> {
        let mask = match self.emitter.state() {
            EmitterState::Idle | EmitterState::FullyDisabled => 0,
            EmitterState::FullyEnabled => u16::MAX,
            EmitterState::UserControl => self.control.record().pwm_bitmap(),
            EmitterState::SequencerControl => self.wavelength.channels(),
        };
        self.emitter.request_channel_mask(mask, DEFAULT_DUTY)
    }

    /// Emitter pattern as last written to the driver
    pub fn emitter_status(&self) -> EmitterStatus {
        EmitterStatus::classify(self.emitter.is_enabled(), self.emitter.programmed())
    }

    /// Current counters
    pub fn diagnostics(&self, frames: &FrameExchange<M>) -> Diagnostics {
        let stats = self.pipeline.stats();
        Diagnostics {
            frames_processed: stats.processed,
            frames_discarded: stats.discarded,
            frame_overruns: frames.overruns(),
            emitter_failures: self.emitter_failures,
            mux_failures: self.mux_failures,
        }
    }

    /// Log counters and the state of both machines
    fn log_diagnostics(&self, frames: &FrameExchange<M>) {
        let diagnostics = self.diagnostics(frames);
        info!(
            "Emitter {:?} ({:?}), mux {:?}",
            self.emitter.state(),
            self.emitter_status(),
            self.mux.current()
        );
        info!(
            "Frames processed {}, discarded {}, overrun {}; write failures emitter {}, mux {}",
            diagnostics.frames_processed,
            diagnostics.frames_discarded,
            diagnostics.frame_overruns,
            diagnostics.emitter_failures,
            diagnostics.mux_failures
        );
    }

    /// Emitter state machine
    pub fn emitter(&self) -> &EmitterController<P> {
        &self.emitter
    }

    /// Mux sequencer
    pub fn mux(&self) -> &MuxSequencer<'a, G> {
        &self.mux
    }

    /// Sample matrix
    pub fn pipeline(&self) -> &AcquisitionPipeline<M> {
        &self.pipeline
    }

    /// Last host record
    pub fn control(&self) -> &ControlStore {
        &self.control
    }

    /// Group lit under sequencer control
    pub fn wavelength(&self) -> WavelengthGroup {
        self.wavelength
    }
}

#[cfg(test)]
mod tests {
    use core::convert::Infallible;

    use super::*;
    use crate::{
        buffer::FrameWindow,
        config::MUX_SETTLING_TICKS,
        mux::{ActiveChannel, ExpanderChip, ExpanderPort, MuxChannel},
        testing::{RecordingPorts, RecordingPwm},
    };

    const MODULES: usize = 2;

    /// Stand-ins for the interrupt-owned statics
    struct Bench {
        ticks: TickCounter,
        frames: FrameExchange<MODULES>,
        window: FrameWindow,
        active: ActiveChannel,
    }

    impl Bench {
        fn new(long_interval: u32) -> Self {
            Self {
                ticks: TickCounter::new(long_interval),
                frames: FrameExchange::new(),
                window: FrameWindow::new(),
                active: ActiveChannel::new(),
            }
        }

        /// Complete one ADC frame, as the DMA interrupt does
        fn capture(&self, codes: [u16; MODULES]) {
            self.frames.take();
            let channel = self.window.close(self.active.snapshot());
            let _ = self.frames.complete(codes, channel);
        }

        fn system(&self) -> FnirsSystem<'_, RecordingPwm, RecordingPorts, MODULES> {
            let mut system = FnirsSystem::new(
                EmitterController::new(RecordingPwm::default()),
                MuxSequencer::new(RecordingPorts::default(), &self.active),
                [Calibration::IDENTITY; MODULES],
            );
            system.init().unwrap();
            system
        }

        /// Tick once, capture a frame on the active channel, then poll
        fn run(
            &self,
            system: &mut FnirsSystem<'_, RecordingPwm, RecordingPorts, MODULES>,
            until: Ticks,
            codes: [u16; MODULES],
        ) -> Option<Packet> {
            let mut last = None;
            while self.ticks.now() < until {
                self.ticks.on_tick();
                self.capture(codes);
                if let Some(packet) = system.poll(self.ticks.now(), &self.ticks, &self.frames) {
                    last = Some(packet);
                }
            }
            last
        }
    }

    #[test]
    fn sequencing_alternates_wavelength_groups() {
        let bench = Bench::new(1_000);
        let mut system = bench.system();
        system.start_sequencing().unwrap();

        bench.run(&mut system, 50, [0; MODULES]);
        assert_eq!(system.emitter().state(), EmitterState::SequencerControl);
        bench.run(&mut system, 100, [0; MODULES]);
        assert_eq!(
            system.emitter().programmed().on_mask(),
            WAVELENGTH_940NM_CHANNELS
        );
        assert_eq!(system.emitter_status(), EmitterStatus::Wavelength940nm);

        bench.run(&mut system, 1_000, [0; MODULES]);
        assert_eq!(system.wavelength(), WavelengthGroup::Nm660);
        assert_eq!(
            system.emitter().programmed().on_mask(),
            WAVELENGTH_660NM_CHANNELS
        );
    }

    #[test]
    fn frames_land_on_settled_channel_only() {
        let bench = Bench::new(10_000);
        let mut system = bench.system();
        system.start_sequencing().unwrap();

        // Four at tick 6, settled at 9; the frame ending at 10 started while settling
        bench.run(&mut system, 10, [40, 41]);
        assert_eq!(system.pipeline().raw_value(0, MuxChannel::Four), Some(0));
        bench.run(&mut system, 11, [40, 41]);
        assert_eq!(system.pipeline().raw_value(0, MuxChannel::Four), Some(40));

        // Tick 12 still captures on Four, tick 13 is settling on One
        bench.run(&mut system, 13, [10, 11]);
        assert_eq!(system.pipeline().raw_value(0, MuxChannel::Four), Some(10));
        assert_eq!(system.pipeline().raw_value(0, MuxChannel::One), Some(0));

        // One settles at 15, so the first whole frame on it ends at 17
        bench.run(&mut system, 16, [10, 11]);
        assert_eq!(system.pipeline().raw_value(0, MuxChannel::One), Some(0));
        bench.run(&mut system, 17, [10, 11]);
        assert_eq!(system.pipeline().raw_value(0, MuxChannel::One), Some(10));
        assert_eq!(system.pipeline().raw_value(1, MuxChannel::One), Some(11));

        // Ticks 1, 7 to 10 and 13 to 16
        let diagnostics = system.diagnostics(&bench.frames);
        assert_eq!(diagnostics.frames_discarded, 9);
        assert_eq!(diagnostics.frame_overruns, 0);
    }

    #[test]
    fn telemetry_packet_every_gate() {
        let bench = Bench::new(10_000);
        let mut system = bench.system();
        assert!(bench.run(&mut system, 9, [0; MODULES]).is_none());
        let packet = bench.run(&mut system, 10, [0; MODULES]).unwrap();
        assert_eq!(packet.len(), MODULES * telemetry::RECORD_LEN);
        assert_eq!(packet[7], EmitterStatus::Off as u8);
    }

    #[test]
    fn user_control_follows_bitmap() {
        let bench = Bench::new(10_000);
        let mut system = bench.system();
        system.receive_control(&[1, 1, 0x00, 0x0F, 0, 0]).unwrap();
        assert!(system.emitter().is_enabled());
        // No mux override, so the round robin runs
        assert!(system.mux().is_enabled());

        bench.run(&mut system, 100, [0; MODULES]);
        assert_eq!(system.emitter().state(), EmitterState::UserControl);
        assert_eq!(system.emitter().programmed().on_mask(), 0x000F);
        assert_eq!(system.emitter_status(), EmitterStatus::Other);
        assert_ne!(system.mux().current(), MuxChannel::Disabled);
    }

    #[test]
    fn disabling_record_blanks_emitters() {
        let bench = Bench::new(10_000);
        let mut system = bench.system();
        system.receive_control(&[1, 3, 0, 0, 0, 0]).unwrap();
        bench.run(&mut system, 100, [0; MODULES]);
        assert_eq!(system.emitter().programmed().on_mask(), u16::MAX);

        system.receive_control(&[1, 4, 0, 0, 0, 0]).unwrap();
        assert!(!system.emitter().is_enabled());
        bench.run(&mut system, 200, [0; MODULES]);
        assert_eq!(system.emitter().state(), EmitterState::FullyDisabled);
        assert_eq!(system.emitter().programmed().on_mask(), 0);
        assert_eq!(system.emitter_status(), EmitterStatus::Off);
    }

    #[test]
    fn mux_override_holds_channel() {
        let bench = Bench::new(10_000);
        let mut system = bench.system();
        system.receive_control(&[0, 0, 0, 0, 1, 2]).unwrap();
        bench.run(&mut system, 30, [0; MODULES]);
        assert_eq!(system.mux().current(), MuxChannel::Two);

        system.receive_control(&[0, 0, 0, 0, 1, 0]).unwrap();
        bench.run(&mut system, 36, [0; MODULES]);
        assert_eq!(system.mux().current(), MuxChannel::Disabled);
        assert!(!system.mux().is_enabled());
    }

    #[test]
    fn malformed_record_changes_nothing() {
        let bench = Bench::new(10_000);
        let mut system = bench.system();
        assert_eq!(
            system.receive_control(&[1, 7, 0, 0, 0, 0]),
            Err(Error::MalformedRecord)
        );
        assert!(!system.emitter().is_enabled());
        assert!(!system.mux().is_enabled());
        assert_eq!(system.control().counts(), (0, 1));
    }

    #[test]
    fn stream_records_apply_across_reads() {
        let bench = Bench::new(10_000);
        let mut system = bench.system();
        assert_eq!(system.receive_stream(&[1, 3, 0]), 0);
        assert!(!system.emitter().is_enabled());
        // Tail of the first record, a malformed one, then a mux hold
        let completed = system.receive_stream(&[0, 0, 0, 1, 9, 0, 0, 0, 0, 0, 0, 0, 0, 1, 3]);
        assert_eq!(completed, 3);
        assert!(system.emitter().is_enabled());
        assert_eq!(system.control().counts(), (2, 1));
        assert_eq!(system.control().record().mux_channel(), MuxChannel::Three);
    }

    /// PWM driver whose channel writes hold the bus for one tick each
    struct SlowPwm<'a> {
        clock: &'a TickCounter,
        channel_writes: u32,
    }

    impl PwmOutput for SlowPwm<'_> {
        type Error = Infallible;

        fn set_frequency(&mut self, _hz: f32) -> Result<(), Infallible> {
            Ok(())
        }

        fn set_channel_pattern(
            &mut self,
            _channel: usize,
            _duty: f32,
            _phase: f32,
        ) -> Result<(), Infallible> {
            self.channel_writes += 1;
            self.clock.on_tick();
            Ok(())
        }

        fn assert_enable_line(&mut self) -> Result<(), Infallible> {
            Ok(())
        }

        fn deassert_enable_line(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    /// Expanders remembering the tick of their latest write
    struct TimedPorts<'a> {
        clock: &'a TickCounter,
        last_write: Ticks,
    }

    impl PortWriter for TimedPorts<'_> {
        type Error = Infallible;

        fn write_port(
            &mut self,
            _chip: ExpanderChip,
            _port: ExpanderPort,
            _bits: u8,
        ) -> Result<(), Infallible> {
            self.last_write = self.clock.now();
            Ok(())
        }
    }

    #[test]
    fn settling_outlasts_emitter_bus_traffic() {
        // Wavelength swaps every 60 ticks rewrite all 16 emitter channels
        let bench = Bench::new(60);
        let ticks = &bench.ticks;
        let mut system = FnirsSystem::new(
            EmitterController::new(SlowPwm {
                clock: ticks,
                channel_writes: 0,
            }),
            MuxSequencer::new(
                TimedPorts {
                    clock: ticks,
                    last_write: 0,
                },
                &bench.active,
            ),
            [Calibration::IDENTITY; MODULES],
        );
        system.init().unwrap();
        system.start_sequencing().unwrap();

        let mut settles = 0;
        let mut contended_switches = 0;
        while ticks.now() < 2_000 {
            ticks.on_tick();
            bench.capture([0; MODULES]);
            let polled_at = ticks.now();
            let before = bench.active.snapshot();
            system.poll(polled_at, ticks, &bench.frames);
            let after = bench.active.snapshot();

            if ticks.now() > polled_at && after.channel() != before.channel() {
                contended_switches += 1;
            }
            if before.settled().is_none() && after.settled().is_some() {
                let gap = ticks.now() - system.mux().ports().last_write;
                assert!(
                    gap > MUX_SETTLING_TICKS as Ticks,
                    "settled {gap} ticks after the last expander write"
                );
                settles += 1;
            }
        }
        assert!(system.emitter().pwm().channel_writes > 100);
        assert!(contended_switches > 0);
        assert!(settles > 50);
    }
}
