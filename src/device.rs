//! The control engine for one attached oscilloscope: drains pending command
//! updates to the transport, drives the capture state machine, and decodes
//! finished frames into the shared sample buffer.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use bitflags::bitflags;
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::{CHANNELS, Error, Result, SPECIAL_CHANNELS};
use crate::capture::{self, SampleBuffer};
use crate::commands::{
    AcquireHardData, BulkCode, BulkCommand, CaptureState, CaptureStateResponse, ControlCode,
    ControlCommand, ControlIndex, ControlValue, EnableTrigger, ForceTrigger, GetCaptureState,
    GetData, SetBuffer2250, SetBuffer5200, SetChannels2250, SetDiv, SetGain, SetOffset,
    SetRecordLength2250, SetRelays, SetSamplerate2250, SetSamplerate5200, SetTrigger2250,
    SetTrigger5200, SetTriggerAndSamplerate, StartSampling, hex_parse,
    BUSED_CH2, DTRIGGERPOSITION_ON, USED_CH1, USED_CH1CH2, USED_CH2,
};
use crate::samplerate::best_samplerate;
use crate::settings::{Coupling, RateMode, Settings, Slope, TriggerMode};
use crate::spec::{Model, ModelSpec, SamplerateLimits, ROLL_RECORD_LENGTH};
use crate::transport::{Transport, TransportError};

/// Signals emitted by the engine towards the user interface.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SamplingStarted,
    SamplingStopped,
    /// A frame has been decoded into the shared sample buffer.
    SamplesAvailable,
    SamplerateChanged(f64),
    SamplerateLimitsChanged { min: f64, max: f64 },
    RecordLengthChanged(u32),
    RecordTimeChanged(f64),
    AvailableRecordLengthsChanged(Vec<u32>),
    /// 6022BE only: the discrete samplerate steps in MS/s.
    SamplerateSet { mode: u32, steps: Vec<f64> },
    StatusMessage(&'static str),
    /// The device vanished; the acquisition loop has terminated.
    CommunicationError,
}

bitflags! {
    /// Pending bulk commands, one bit per wire opcode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct BulkPending: u16 {
        const SET_TRIGGER_AND_SAMPLERATE = 1 << 0x01;
        const FORCE_TRIGGER = 1 << 0x02;
        const START_SAMPLING = 1 << 0x03;
        const ENABLE_TRIGGER = 1 << 0x04;
        const GET_DATA = 1 << 0x05;
        const GET_CAPTURE_STATE = 1 << 0x06;
        const SET_GAIN = 1 << 0x07;
        const B_SET_CHANNELS = 1 << 0x0b;
        const C_SET_TRIGGER_OR_SAMPLERATE = 1 << 0x0c;
        const D_SET_BUFFER = 1 << 0x0d;
        const E_SET_TRIGGER_OR_SAMPLERATE = 1 << 0x0e;
        const F_SET_BUFFER = 1 << 0x0f;
    }
}

impl BulkPending {
    fn bit(code: BulkCode) -> BulkPending {
        BulkPending::from_bits_retain(1 << code as u8)
    }
}

bitflags! {
    /// Pending control commands, one bit per slot index.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct ControlPending: u8 {
        const SET_OFFSET = 1 << 0;
        const SET_RELAYS = 1 << 1;
        const VOLT_DIV_CH1 = 1 << 2;
        const VOLT_DIV_CH2 = 1 << 3;
        const TIME_DIV = 1 << 4;
        const ACQUIRE_HARD_DATA = 1 << 5;
    }
}

impl ControlPending {
    fn bit(index: ControlIndex) -> ControlPending {
        ControlPending::from_bits_retain(1 << index as usize)
    }
}

/// Roll mode advances one of these steps per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RollState {
    StartSampling,
    EnableTrigger,
    ForceTrigger,
    GetData,
}

impl RollState {
    fn next(self) -> RollState {
        match self {
            RollState::StartSampling => RollState::EnableTrigger,
            RollState::EnableTrigger => RollState::ForceTrigger,
            RollState::ForceTrigger => RollState::GetData,
            RollState::GetData => RollState::StartSampling,
        }
    }
}

// Update the named command slot and mark it pending. The slot variant is
// fixed at init time, so a mismatch simply never runs the body.
macro_rules! write_bulk {
    ($self:ident, $code:ident, $variant:ident, |$cmd:ident| $body:block) => {{
        if let Some(BulkCommand::$variant($cmd)) =
                $self.commands[BulkCode::$code as usize].as_mut() $body
        $self.bulk_pending.insert(BulkPending::bit(BulkCode::$code));
    }};
}

macro_rules! write_control {
    ($self:ident, $index:ident, $variant:ident, |$cmd:ident| $body:block) => {{
        if let Some(ControlCommand::$variant($cmd)) =
                $self.controls[ControlIndex::$index as usize].as_mut() $body
        $self.control_pending.insert(ControlPending::bit(ControlIndex::$index));
    }};
}

pub struct Device<T: Transport> {
    transport: T,
    model: Model,
    spec: ModelSpec,
    settings: Settings,
    commands: [Option<BulkCommand>; BulkCode::SLOTS],
    bulk_pending: BulkPending,
    controls: [Option<ControlCommand>; ControlIndex::COUNT],
    control_pending: ControlPending,
    result: Arc<RwLock<SampleBuffer>>,
    events: Sender<Event>,
    sampling: bool,
    capture_state: CaptureState,
    roll_state: RollState,
    sampling_started: bool,
    last_trigger_mode: Option<TriggerMode>,
    cycle_counter: u32,
    start_cycle: u32,
    /// Tick period in ms, ~25% of the expected buffer fill time.
    cycle_time: u32,
    previous_sample_count: u32,
}

impl<T: Transport> Device<T> {
    pub fn new(mut transport: T) -> Result<(Device<T>, Receiver<Event>)> {
        let (events, receiver) = unbounded();

        let id = transport.model_id();
        let model = match Model::from_id(id) {
            Some(model) => model,
            None => {
                let _ = events.send(Event::StatusMessage("Unknown model"));
                transport.disconnect();
                return Err(Error::UnknownModel(id));
            }
        };
        if model.is_experimental() {
            log::warn!("the {:?} isn't supported officially and may not work as expected; \
                        reports about your experiences are very welcome", model);
        }

        let mut device = Device {
            transport,
            model,
            spec: ModelSpec::new(model),
            settings: Settings::default(),
            commands: std::array::from_fn(|_| None),
            bulk_pending: BulkPending::empty(),
            controls: std::array::from_fn(|_| None),
            control_pending: ControlPending::empty(),
            result: Arc::new(RwLock::new(SampleBuffer::default())),
            events,
            sampling: false,
            capture_state: CaptureState::Waiting,
            roll_state: RollState::StartSampling,
            sampling_started: false,
            last_trigger_mode: None,
            cycle_counter: 0,
            start_cycle: 0,
            cycle_time: 10,
            previous_sample_count: 0,
        };

        device.init_commands();
        device.read_offset_limits()?;
        device.emit_initial_state();
        device.update_interval();
        Ok((device, receiver))
    }

    /// Allocate the command slots this model understands and mark its
    /// configuration commands pending so the first tick programs the device.
    fn init_commands(&mut self) {
        // Commands understood by every model.
        self.commands[BulkCode::ForceTrigger as usize] =
            Some(BulkCommand::ForceTrigger(ForceTrigger::new()));
        self.commands[BulkCode::StartSampling as usize] =
            Some(BulkCommand::StartSampling(StartSampling::new()));
        self.commands[BulkCode::EnableTrigger as usize] =
            Some(BulkCommand::EnableTrigger(EnableTrigger::new()));
        self.commands[BulkCode::GetData as usize] =
            Some(BulkCommand::GetData(GetData::new()));
        self.commands[BulkCode::GetCaptureState as usize] =
            Some(BulkCommand::GetCaptureState(GetCaptureState::new()));
        self.commands[BulkCode::SetGain as usize] =
            Some(BulkCommand::SetGain(SetGain::new()));

        self.controls[ControlIndex::SetOffset as usize] =
            Some(ControlCommand::SetOffset(SetOffset::new()));
        self.controls[ControlIndex::SetRelays as usize] =
            Some(ControlCommand::SetRelays(SetRelays::new()));

        match self.model {
            Model::Dso2090 | Model::Dso2150 => {
                self.commands[BulkCode::SetTriggerAndSamplerate as usize] =
                    Some(BulkCommand::SetTriggerAndSamplerate(SetTriggerAndSamplerate::new()));
                self.bulk_pending.insert(BulkPending::SET_TRIGGER_AND_SAMPLERATE);
            }

            Model::Dso2250 => {
                self.commands[BulkCode::BSetChannels as usize] =
                    Some(BulkCommand::SetChannels2250(SetChannels2250::new()));
                self.commands[BulkCode::CSetTriggerOrSamplerate as usize] =
                    Some(BulkCommand::SetTrigger2250(SetTrigger2250::new()));
                self.commands[BulkCode::DSetBuffer as usize] =
                    Some(BulkCommand::SetRecordLength2250(SetRecordLength2250::new()));
                self.commands[BulkCode::ESetTriggerOrSamplerate as usize] =
                    Some(BulkCommand::SetSamplerate2250(SetSamplerate2250::new()));
                self.commands[BulkCode::FSetBuffer as usize] =
                    Some(BulkCommand::SetBuffer2250(SetBuffer2250::new()));
                self.bulk_pending.insert(BulkPending::B_SET_CHANNELS
                    | BulkPending::C_SET_TRIGGER_OR_SAMPLERATE
                    | BulkPending::D_SET_BUFFER
                    | BulkPending::E_SET_TRIGGER_OR_SAMPLERATE
                    | BulkPending::F_SET_BUFFER);
            }

            Model::Dso5200 | Model::Dso5200a => {
                self.commands[BulkCode::CSetTriggerOrSamplerate as usize] =
                    Some(BulkCommand::SetSamplerate5200(SetSamplerate5200::new()));
                self.commands[BulkCode::DSetBuffer as usize] =
                    Some(BulkCommand::SetBuffer5200(SetBuffer5200::new()));
                self.commands[BulkCode::ESetTriggerOrSamplerate as usize] =
                    Some(BulkCommand::SetTrigger5200(SetTrigger5200::new()));
                self.bulk_pending.insert(BulkPending::C_SET_TRIGGER_OR_SAMPLERATE
                    | BulkPending::D_SET_BUFFER
                    | BulkPending::E_SET_TRIGGER_OR_SAMPLERATE);
            }

            // The 6022BE doesn't support any bulk commands.
            Model::Dso6022be => {
                self.controls[ControlIndex::VoltDivCh1 as usize] =
                    Some(ControlCommand::VoltDivCh1(SetDiv::new()));
                self.controls[ControlIndex::VoltDivCh2 as usize] =
                    Some(ControlCommand::VoltDivCh2(SetDiv::new()));
                self.controls[ControlIndex::TimeDiv as usize] =
                    Some(ControlCommand::TimeDiv(SetDiv::new()));
                self.controls[ControlIndex::AcquireHardData as usize] =
                    Some(ControlCommand::AcquireHardData(AcquireHardData::new()));
            }
        }

        self.control_pending.insert(ControlPending::SET_OFFSET | ControlPending::SET_RELAYS);
        if self.model == Model::Dso6022be {
            self.control_pending = ControlPending::VOLT_DIV_CH1
                | ControlPending::VOLT_DIV_CH2
                | ControlPending::TIME_DIV
                | ControlPending::ACQUIRE_HARD_DATA;
        }
    }

    /// Read the factory offset calibration table from the device.
    fn read_offset_limits(&mut self) -> Result<()> {
        let mut raw = [0u8; CHANNELS * 9 * 4];
        if let Err(error) =
                self.transport.control_read(ControlCode::Value, &mut raw, ControlValue::OffsetLimits) {
            self.transport.disconnect();
            let _ = self.events.send(
                Event::StatusMessage("Couldn't get channel level data from oscilloscope"));
            return Err(error.into());
        }

        let mut position = 0;
        for channel in 0..CHANNELS {
            for gain in 0..9 {
                let start = u16::from_be_bytes([raw[position], raw[position + 1]]);
                let end = u16::from_be_bytes([raw[position + 2], raw[position + 3]]);
                self.spec.offset_limit[channel][gain] = [start, end];
                position += 4;
            }
        }
        Ok(())
    }

    fn emit_initial_state(&mut self) {
        let _ = self.events.send(Event::AvailableRecordLengthsChanged(
            self.active_limits().record_lengths.clone()));
        self.update_samplerate_limits();
        let _ = self.events.send(Event::RecordLengthChanged(self.active_record_length()));
        if self.active_record_length() != ROLL_RECORD_LENGTH {
            let _ = self.events.send(Event::RecordTimeChanged(
                self.active_record_length() as f64 / self.settings.samplerate.current));
        }
        let _ = self.events.send(Event::SamplerateChanged(self.settings.samplerate.current));

        if self.model == Model::Dso6022be {
            let _ = self.events.send(Event::SamplerateSet {
                mode: 1,
                steps: vec![1.0, 2.0, 5.0, 10.0, 20.0, 40.0, 80.0, 160.0, 240.0, 480.0],
            });
        } else {
            // Snap the default target to something the hardware can do.
            self.restore_targets();
        }
    }

    pub fn model(&self) -> Model {
        self.model
    }

    pub fn channel_count(&self) -> usize {
        CHANNELS
    }

    pub fn special_trigger_sources(&self) -> &'static [&'static str] {
        &["EXT", "EXT/10"]
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Handle to the decoded samples, shared with consumers.
    pub fn samples(&self) -> Arc<RwLock<SampleBuffer>> {
        Arc::clone(&self.result)
    }

    pub fn is_sampling(&self) -> bool {
        self.sampling
    }

    pub fn available_record_lengths(&self) -> &[u32] {
        &self.active_limits().record_lengths
    }

    /// Minimum samplerate for this oscilloscope in S/s.
    pub fn min_samplerate(&self) -> f64 {
        self.spec.samplerate.single.base / self.spec.samplerate.single.max_downsampler as f64
    }

    /// Maximum samplerate for the current channel configuration in S/s.
    pub fn max_samplerate(&self) -> f64 {
        if self.settings.used_channels <= 1 {
            self.spec.samplerate.multi.max
        } else {
            self.spec.samplerate.single.max
        }
    }

    pub fn start_sampling(&mut self) {
        self.sampling = true;
        let _ = self.events.send(Event::SamplingStarted);
    }

    pub fn stop_sampling(&mut self) {
        self.sampling = false;
        let _ = self.events.send(Event::SamplingStopped);
    }

    fn active_limits(&self) -> &SamplerateLimits {
        self.spec.limits(self.settings.samplerate.mode == RateMode::Multi)
    }

    fn active_record_length(&self) -> u32 {
        self.active_limits().record_lengths[self.settings.record_length_id]
    }

    fn roll_mode(&self) -> bool {
        self.active_record_length() == ROLL_RECORD_LENGTH
    }

    fn divider(&self) -> f64 {
        self.spec.buffer_dividers[self.settings.record_length_id] as f64
    }

    /// Check the state every time 25% of the buffer should have refilled.
    fn update_interval(&mut self) {
        let cycle_time = if self.roll_mode() {
            let per_rate = if self.settings.samplerate.mode == RateMode::Multi {
                1.0
            } else {
                CHANNELS as f64
            };
            self.transport.packet_size() as f64 / per_rate
                / self.settings.samplerate.current * 250.0
        } else {
            self.active_record_length() as f64 / self.settings.samplerate.current * 250.0
        };
        // Not more often than every 10 ms, but at least once every second.
        self.cycle_time = (cycle_time as u32).clamp(10, 1000);
    }

    /// Decode the trigger point from the capture state response. Each set
    /// bit inverts all lower bits, which makes the decode an involution.
    fn calculate_trigger_point(value: u32) -> u32 {
        let mut result = value;
        let mut bit: u32 = 1;
        while bit != 0 {
            if result & bit != 0 {
                result ^= bit - 1;
            }
            bit <<= 1;
        }
        result
    }

    /// Poll the capture state and update the trigger point. `None` stands
    /// for a state byte the protocol doesn't know.
    fn get_capture_state(&mut self)
            -> core::result::Result<Option<CaptureState>, TransportError> {
        if self.model == Model::Dso6022be {
            return Ok(Some(CaptureState::Ready));
        }

        if let Some(command) = &self.commands[BulkCode::GetCaptureState as usize] {
            self.transport.bulk_command(command.data(), 1)?;
        }

        let mut response = CaptureStateResponse::new();
        self.transport.bulk_read(&mut response.0)?;

        self.settings.trigger.point =
            Self::calculate_trigger_point(response.trigger_point() as u32);

        match CaptureState::from_raw(response.capture_state()) {
            Some(state) => Ok(Some(state)),
            None => {
                log::warn!("unknown capture state {}", response.capture_state());
                Ok(None)
            }
        }
    }

    /// Expected total sample count of the next frame and whether fast rate
    /// mode is active.
    fn sample_count(&self) -> (u32, bool) {
        let fast_rate = self.settings.samplerate.mode == RateMode::Multi;
        let mut total = self.active_record_length();
        if total == ROLL_RECORD_LENGTH {
            total = self.transport.packet_size() as u32;
        } else if !fast_rate {
            total *= CHANNELS as u32;
        }
        (total, fast_rate)
    }

    /// Fetch one frame from the scope; decode it when `process` is set.
    /// Returns the received byte count.
    fn get_samples(&mut self, process: bool)
            -> core::result::Result<usize, TransportError> {
        if self.model != Model::Dso6022be {
            if let Some(command) = &self.commands[BulkCode::GetData as usize] {
                self.transport.bulk_command(command.data(), 1)?;
            }
        }

        let (mut total_sample_count, fast_rate) = self.sample_count();

        // If a previous sampling left more data in the scope buffer, read
        // the larger amount this cycle and stash the smaller for the next.
        if total_sample_count < self.previous_sample_count {
            std::mem::swap(&mut total_sample_count, &mut self.previous_sample_count);
        } else {
            self.previous_sample_count = total_sample_count;
        }

        let mut data_length = total_sample_count as usize;
        if self.spec.sample_size > 8 {
            // The high-order bits trail the low-byte block.
            data_length *= 2;
        }

        let mut raw = vec![0u8; data_length];
        let received = self.transport.bulk_read_multi(&mut raw)?;

        if !process {
            return Ok(received);
        }

        // The received byte count is authoritative.
        let total_sample_count = if self.spec.sample_size > 8 {
            received / 2
        } else {
            received
        };

        {
            let mut result = self.result.write().unwrap();
            capture::convert(&self.spec, self.model, &self.settings, fast_rate,
                             &raw[..received], total_sample_count, &mut result);
        }

        let _ = self.events.send(Event::SamplesAvailable);
        Ok(received)
    }

    /// Write the record length field without updating dependencies.
    fn update_record_length(&mut self, index: usize) -> Result<u32> {
        if index >= self.active_limits().record_lengths.len() {
            return Err(Error::Parameter);
        }

        match self.spec.command.bulk.set_record_length {
            Some(BulkCode::SetTriggerAndSamplerate) => {
                write_bulk!(self, SetTriggerAndSamplerate, SetTriggerAndSamplerate, |cmd| {
                    cmd.set_record_length(index as u8);
                });
            }

            Some(BulkCode::DSetBuffer) => {
                if self.spec.command.bulk.set_pretrigger == Some(BulkCode::FSetBuffer) {
                    write_bulk!(self, DSetBuffer, SetRecordLength2250, |cmd| {
                        cmd.set_record_length(index as u8);
                    });
                } else {
                    write_bulk!(self, DSetBuffer, SetBuffer5200, |cmd| {
                        cmd.set_used_pre(DTRIGGERPOSITION_ON);
                        cmd.set_used_post(DTRIGGERPOSITION_ON);
                        cmd.set_record_length(index as u8);
                    });
                }
            }

            _ => return Err(Error::Unsupported),
        }

        let divider_changed = self.spec.buffer_dividers[index]
            != self.spec.buffer_dividers[self.settings.record_length_id];
        self.settings.record_length_id = index;

        if divider_changed {
            self.update_samplerate_limits();
            // The effective rate moved, recalculate it from the target.
            self.restore_targets();
        }

        Ok(self.active_record_length())
    }

    /// Set the size of the oscilloscope's sample buffer.
    pub fn set_record_length(&mut self, index: usize) -> Result<u32> {
        if !self.transport.is_connected() {
            return Err(Error::Connection);
        }

        self.update_record_length(index)?;
        self.restore_targets();
        let _ = self.set_pretrigger_position(self.settings.trigger.position);

        let _ = self.events.send(Event::RecordLengthChanged(self.active_record_length()));
        Ok(self.active_record_length())
    }

    /// Set the samplerate that should be met in S/s; 0.0 restores the
    /// stored target after a divider change.
    pub fn set_samplerate(&mut self, samplerate: f64) -> Result<f64> {
        if !self.transport.is_connected() {
            return Err(Error::Connection);
        }

        let samplerate = if samplerate == 0.0 {
            self.settings.samplerate.target.samplerate
        } else {
            self.settings.samplerate.target.samplerate = samplerate;
            self.settings.samplerate.target.samplerate_set = true;
            samplerate
        };

        if self.model != Model::Dso6022be {
            // Enable fast rate when it is required to reach the request.
            let fast_rate = self.settings.used_channels <= 1
                && samplerate > self.spec.samplerate.single.max / self.divider();

            // The nearest samplerate that is at least as high.
            let (best, downsampler) = best_samplerate(
                &self.spec, self.settings.record_length_id, samplerate, fast_rate, false);
            self.update_samplerate(downsampler, fast_rate)?;
            Ok(best)
        } else {
            let steps = &self.spec.sample_steps;
            let mut sample_id = 0;
            while sample_id < steps.len() - 1 {
                if steps[sample_id] == samplerate {
                    break;
                }
                sample_id += 1;
            }
            let div = self.spec.sample_div[sample_id];
            write_control!(self, TimeDiv, TimeDiv, |cmd| {
                cmd.set_div(div);
            });
            self.settings.samplerate.current = samplerate;

            // Leave margin for the software trigger.
            let sample_margin = 2000;
            if self.active_record_length() != ROLL_RECORD_LENGTH {
                let _ = self.events.send(Event::RecordTimeChanged(
                    (self.active_record_length() - sample_margin) as f64
                        / self.settings.samplerate.current));
            }
            let _ = self.events.send(
                Event::SamplerateChanged(self.settings.samplerate.current));
            Ok(samplerate)
        }
    }

    /// Set the record time duration in seconds by adapting the samplerate;
    /// 0.0 restores the stored target after a divider change.
    pub fn set_record_time(&mut self, duration: f64) -> Result<f64> {
        if !self.transport.is_connected() {
            return Err(Error::Connection);
        }

        let duration = if duration == 0.0 {
            self.settings.samplerate.target.duration
        } else {
            self.settings.samplerate.target.duration = duration;
            self.settings.samplerate.target.samplerate_set = false;
            duration
        };

        if self.model != Model::Dso6022be {
            // The highest samplerate that still provides the duration.
            let max_samplerate = self.spec.samplerate.single
                .record_lengths[self.settings.record_length_id] as f64 / duration;

            // Fast rate improves the resolution when the record time can't
            // be reached otherwise.
            let fast_rate = self.settings.used_channels <= 1
                && max_samplerate >= self.spec.samplerate.multi.base / self.divider();

            // The nearest samplerate that is at most as high.
            let (best, downsampler) = best_samplerate(
                &self.spec, self.settings.record_length_id, max_samplerate, fast_rate, true);
            self.update_samplerate(downsampler, fast_rate)?;
            Ok(self.active_record_length() as f64 / best)
        } else {
            // Only the 10240 sample capture works reliably, pick the highest
            // samplerate that fits the duration into it with trigger margin.
            let sample_margin = 2000.0;
            let sample_count = 10240.0;
            let mut best_id = 0;
            for (sample_id, &step) in self.spec.sample_steps.iter().enumerate() {
                if step * duration < sample_count - sample_margin {
                    best_id = sample_id;
                }
            }
            let div = self.spec.sample_div[best_id];
            write_control!(self, TimeDiv, TimeDiv, |cmd| {
                cmd.set_div(div);
            });
            self.settings.samplerate.current = self.spec.sample_steps[best_id];

            let _ = self.events.send(
                Event::SamplerateChanged(self.settings.samplerate.current));
            Ok(self.settings.samplerate.current)
        }
    }

    /// Program the samplerate fields from the solver output.
    fn update_samplerate(&mut self, mut downsampler: u32, fast_rate: bool) -> Result<u32> {
        match self.spec.command.bulk.set_samplerate {
            Some(BulkCode::SetTriggerAndSamplerate) => {
                let limits = self.spec.limits(fast_rate);
                let (base, max) = (limits.base, limits.max);

                let mut downsampler_value: u16 = 0;
                let mut samplerate_id: u8 = 0;
                let mut downsampling = false;

                if downsampler <= 5 {
                    // Factors up to 5 use the special samplerate ids.
                    if downsampler == 0 && base >= max {
                        samplerate_id = 1;
                    } else if downsampler <= 2 {
                        samplerate_id = downsampler as u8;
                    } else {
                        // Factors 3 and 4 are not supported.
                        samplerate_id = 3;
                        downsampler = 5;
                        downsampler_value = 0xffff;
                    }
                } else {
                    // Above 5 the factor is set directly, even values only.
                    downsampler &= !0x0001;
                    downsampler_value = (0x10001 - (downsampler >> 1)) as u16;
                    downsampling = true;
                }

                write_bulk!(self, SetTriggerAndSamplerate, SetTriggerAndSamplerate, |cmd| {
                    cmd.set_downsampling_mode(downsampling);
                    cmd.set_samplerate_id(samplerate_id);
                    cmd.set_downsampler(downsampler_value);
                    // The hardware fast rate bit stays off.
                    cmd.set_fast_rate(false);
                });
            }

            Some(BulkCode::CSetTriggerOrSamplerate) => {
                // Split the factor into the values understood by the device;
                // the fast value is kept at 4 (or 3) for slow rates.
                let value_slow = downsampler.saturating_sub(3) / 2;
                let value_fast = downsampler - value_slow * 2;

                write_bulk!(self, CSetTriggerOrSamplerate, SetSamplerate5200, |cmd| {
                    cmd.set_samplerate_fast(4 - value_fast as u8);
                    // Two's complement for the slow value.
                    cmd.set_samplerate_slow(
                        if value_slow == 0 { 0 } else { 0xffff - value_slow as u16 });
                });
                write_bulk!(self, ESetTriggerOrSamplerate, SetTrigger5200, |cmd| {
                    cmd.set_fast_rate(fast_rate);
                });
            }

            Some(BulkCode::ESetTriggerOrSamplerate) => {
                write_bulk!(self, ESetTriggerOrSamplerate, SetSamplerate2250, |cmd| {
                    cmd.set_downsampling(downsampler >= 1);
                    cmd.set_samplerate(
                        if downsampler > 1 { (0x10001 - downsampler) as u16 } else { 0 });
                    cmd.set_fast_rate(fast_rate);
                });
            }

            _ => return Err(Error::Unsupported),
        }

        let fast_rate_changed =
            fast_rate != (self.settings.samplerate.mode == RateMode::Multi);
        if fast_rate_changed {
            self.settings.samplerate.mode =
                if fast_rate { RateMode::Multi } else { RateMode::Single };
        }

        self.settings.samplerate.downsampler = downsampler;
        let limits = self.spec.limits(fast_rate);
        self.settings.samplerate.current = if downsampler != 0 {
            limits.base / self.divider() / downsampler as f64
        } else {
            limits.max / self.divider()
        };

        // The divider may have changed the sample conversion of the
        // pretrigger position.
        let _ = self.set_pretrigger_position(self.settings.trigger.position);

        if fast_rate_changed {
            let _ = self.events.send(Event::AvailableRecordLengthsChanged(
                self.active_limits().record_lengths.clone()));
            let _ = self.events.send(
                Event::RecordLengthChanged(self.active_record_length()));
        }
        if self.active_record_length() != ROLL_RECORD_LENGTH {
            let _ = self.events.send(Event::RecordTimeChanged(
                self.active_record_length() as f64 / self.settings.samplerate.current));
        }
        let _ = self.events.send(
            Event::SamplerateChanged(self.settings.samplerate.current));

        Ok(downsampler)
    }

    /// Re-solve the stored user intent after a divider change.
    fn restore_targets(&mut self) {
        if self.settings.samplerate.target.samplerate_set {
            let _ = self.set_samplerate(0.0);
        } else {
            let _ = self.set_record_time(0.0);
        }
    }

    /// Announce the supported samplerate range for the current channel
    /// configuration.
    fn update_samplerate_limits(&mut self) {
        // The minimum samplerate for normal mode is lower than for fast
        // rate mode on all models.
        let limits = if self.settings.used_channels <= 1 {
            &self.spec.samplerate.multi
        } else {
            &self.spec.samplerate.single
        };
        let divider = self.divider();
        let _ = self.events.send(Event::SamplerateLimitsChanged {
            min: self.spec.samplerate.single.base
                / self.spec.samplerate.single.max_downsampler as f64 / divider,
            max: limits.max / divider,
        });
    }

    /// Enable or disable sampling of the given channel.
    pub fn set_channel_used(&mut self, channel: usize, used: bool) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(Error::Connection);
        }
        if channel >= CHANNELS {
            return Err(Error::Parameter);
        }

        self.settings.voltage[channel].used = used;
        let channel_count =
            self.settings.voltage.iter().filter(|voltage| voltage.used).count() as u32;

        let mut used_value = USED_CH1;
        if self.settings.voltage[1].used {
            used_value = if self.settings.voltage[0].used {
                USED_CH1CH2
            } else if self.spec.command.bulk.set_channels == Some(BulkCode::BSetChannels) {
                BUSED_CH2
            } else {
                USED_CH2
            };
        }

        match self.spec.command.bulk.set_channels {
            Some(BulkCode::SetTriggerAndSamplerate) => {
                write_bulk!(self, SetTriggerAndSamplerate, SetTriggerAndSamplerate, |cmd| {
                    cmd.set_used_channels(used_value);
                });
            }
            Some(BulkCode::BSetChannels) => {
                write_bulk!(self, BSetChannels, SetChannels2250, |cmd| {
                    cmd.set_used_channels(used_value);
                });
            }
            Some(BulkCode::ESetTriggerOrSamplerate) => {
                write_bulk!(self, ESetTriggerOrSamplerate, SetTrigger5200, |cmd| {
                    cmd.set_used_channels(used_value);
                });
            }
            _ => {}
        }

        // Fast rate availability may have changed.
        let fast_rate_changed =
            (self.settings.used_channels <= 1) != (channel_count <= 1);
        self.settings.used_channels = channel_count;

        if fast_rate_changed {
            self.update_samplerate_limits();
        }

        Ok(())
    }

    pub fn set_coupling(&mut self, channel: usize, coupling: Coupling) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(Error::Connection);
        }
        if channel >= CHANNELS {
            return Err(Error::Parameter);
        }

        // The 6022BE has no coupling relays.
        if self.model != Model::Dso6022be {
            write_control!(self, SetRelays, SetRelays, |cmd| {
                cmd.set_coupling(channel, coupling != Coupling::AC);
            });
        }

        Ok(())
    }

    /// Set the gain in V/div; snaps up to the next supported step and
    /// returns the step that has been set.
    pub fn set_gain(&mut self, channel: usize, gain: f64) -> Result<f64> {
        if !self.transport.is_connected() {
            return Err(Error::Connection);
        }
        if channel >= CHANNELS {
            return Err(Error::Parameter);
        }

        // Lowest gain step that is at least as high as the request.
        let mut gain_id = 0;
        while gain_id < self.spec.gain_steps.len() - 1 {
            if self.spec.gain_steps[gain_id] >= gain {
                break;
            }
            gain_id += 1;
        }

        if self.model == Model::Dso6022be {
            let div = self.spec.gain_div[gain_id];
            if channel == 0 {
                write_control!(self, VoltDivCh1, VoltDivCh1, |cmd| {
                    cmd.set_div(div);
                });
            } else {
                write_control!(self, VoltDivCh2, VoltDivCh2, |cmd| {
                    cmd.set_div(div);
                });
            }
        } else {
            let index = self.spec.gain_index[gain_id];
            write_bulk!(self, SetGain, SetGain, |cmd| {
                cmd.set_gain(channel, index);
            });
            write_control!(self, SetRelays, SetRelays, |cmd| {
                cmd.set_below_1v(channel, gain_id < 3);
                cmd.set_below_100mv(channel, gain_id < 6);
            });
        }

        self.settings.voltage[channel].gain = gain_id;

        // Rescale the offset to the new range.
        let offset = self.settings.voltage[channel].offset;
        let _ = self.set_offset(channel, offset);

        Ok(self.spec.gain_steps[gain_id])
    }

    /// Set the offset as a fraction 0..1 of the calibrated range; returns
    /// the fraction after quantisation.
    pub fn set_offset(&mut self, channel: usize, offset: f64) -> Result<f64> {
        if !self.transport.is_connected() {
            return Err(Error::Connection);
        }
        if channel >= CHANNELS {
            return Err(Error::Parameter);
        }

        // The usable range comes from the calibration data.
        let limit = self.spec.offset_limit[channel][self.settings.voltage[channel].gain];
        let (minimum, maximum) = (limit[0] as f64, limit[1] as f64);
        let offset_value = (offset * (maximum - minimum) + minimum + 0.5) as u16;
        let offset_real = (offset_value as f64 - minimum) / (maximum - minimum);

        // The 6022BE has no offset hardware.
        if self.model != Model::Dso6022be {
            write_control!(self, SetOffset, SetOffset, |cmd| {
                cmd.set_channel(channel, offset_value);
            });
        }

        self.settings.voltage[channel].offset = offset;
        self.settings.voltage[channel].offset_real = offset_real;

        // The trigger level is relative to the offset.
        let level = self.settings.trigger.level[channel];
        let _ = self.set_trigger_level(channel, level);

        Ok(offset_real)
    }

    pub fn set_trigger_mode(&mut self, mode: TriggerMode) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(Error::Connection);
        }
        self.settings.trigger.mode = mode;
        Ok(())
    }

    /// Select the trigger source; `special` selects EXT/EXT10 instead of a
    /// channel.
    pub fn set_trigger_source(&mut self, special: bool, id: usize) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(Error::Connection);
        }
        if (!special && id >= CHANNELS) || (special && id >= SPECIAL_CHANNELS) {
            return Err(Error::Parameter);
        }

        match self.spec.command.bulk.set_trigger {
            Some(BulkCode::SetTriggerAndSamplerate) => {
                let source = (if special { 3 + id } else { 1 - id }) as u8;
                write_bulk!(self, SetTriggerAndSamplerate, SetTriggerAndSamplerate, |cmd| {
                    cmd.set_trigger_source(source);
                });
            }
            Some(BulkCode::CSetTriggerOrSamplerate) => {
                let source = (if special { 0 } else { 2 + id }) as u8;
                write_bulk!(self, CSetTriggerOrSamplerate, SetTrigger2250, |cmd| {
                    cmd.set_trigger_source(source);
                });
            }
            Some(BulkCode::ESetTriggerOrSamplerate) => {
                let source = (if special { 3 + id } else { 1 - id }) as u8;
                write_bulk!(self, ESetTriggerOrSamplerate, SetTrigger5200, |cmd| {
                    cmd.set_trigger_source(source);
                });
            }
            _ => return Err(Error::Unsupported),
        }

        // External trigger relay.
        write_control!(self, SetRelays, SetRelays, |cmd| {
            cmd.set_trigger(special);
        });

        self.settings.trigger.special = special;
        self.settings.trigger.source = id;

        // Apply the trigger level of the new source.
        if special {
            write_control!(self, SetOffset, SetOffset, |cmd| {
                cmd.set_trigger(0x7f);
            });
        } else {
            let level = self.settings.trigger.level[id];
            let _ = self.set_trigger_level(id, level);
        }

        Ok(())
    }

    /// Set the trigger level in V; returns the level after quantisation.
    pub fn set_trigger_level(&mut self, channel: usize, level: f64) -> Result<f64> {
        if !self.transport.is_connected() {
            return Err(Error::Connection);
        }
        if channel >= CHANNELS {
            return Err(Error::Parameter);
        }

        let (minimum, maximum) = match self.model {
            // The 10 bit models use the same range as the offsets.
            Model::Dso5200 | Model::Dso5200a => {
                let limit =
                    self.spec.offset_limit[channel][self.settings.voltage[channel].gain];
                (limit[0] as f64, limit[1] as f64)
            }
            // 0x00 to 0xfd for the 8 bit models.
            _ => (0x00 as f64, 0xfd as f64),
        };

        let gain_step = self.spec.gain_steps[self.settings.voltage[channel].gain];
        let offset_real = self.settings.voltage[channel].offset_real;

        // Never get out of the limits.
        let level_value = (((offset_real + level / gain_step) * (maximum - minimum) + 0.5)
            + minimum).clamp(minimum, maximum) as u16;

        // Only program the level when this channel is the trigger source.
        if !self.settings.trigger.special
                && channel == self.settings.trigger.source
                && self.model != Model::Dso6022be {
            write_control!(self, SetOffset, SetOffset, |cmd| {
                cmd.set_trigger(level_value);
            });
        }

        self.settings.trigger.level[channel] = level;
        Ok(((level_value as f64 - minimum) / (maximum - minimum) - offset_real) * gain_step)
    }

    pub fn set_trigger_slope(&mut self, slope: Slope) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(Error::Connection);
        }

        let code = slope.code();
        match self.spec.command.bulk.set_trigger {
            Some(BulkCode::SetTriggerAndSamplerate) => {
                write_bulk!(self, SetTriggerAndSamplerate, SetTriggerAndSamplerate, |cmd| {
                    cmd.set_trigger_slope(code);
                });
            }
            Some(BulkCode::CSetTriggerOrSamplerate) => {
                write_bulk!(self, CSetTriggerOrSamplerate, SetTrigger2250, |cmd| {
                    cmd.set_trigger_slope(code);
                });
            }
            Some(BulkCode::ESetTriggerOrSamplerate) => {
                write_bulk!(self, ESetTriggerOrSamplerate, SetTrigger5200, |cmd| {
                    cmd.set_trigger_slope(code);
                });
            }
            _ => return Err(Error::Unsupported),
        }

        self.settings.trigger.slope = slope;
        Ok(())
    }

    pub fn force_trigger(&mut self) {
        self.bulk_pending.insert(BulkPending::FORCE_TRIGGER);
    }

    /// Set the pretrigger position in seconds of waveform before the
    /// trigger; returns the position after sample quantisation.
    pub fn set_pretrigger_position(&mut self, position: f64) -> Result<f64> {
        if !self.transport.is_connected() {
            return Err(Error::Connection);
        }

        // Trigger positions are measured in samples.
        let mut position_samples = (position * self.settings.samplerate.current) as u32;
        let record_length = self.active_record_length();
        let roll_mode = record_length == ROLL_RECORD_LENGTH;
        if self.settings.samplerate.mode == RateMode::Multi {
            // Fast rate mode devotes both buffers to one channel.
            position_samples /= CHANNELS as u32;
        }

        match self.spec.command.bulk.set_pretrigger {
            Some(BulkCode::SetTriggerAndSamplerate) => {
                // Start point in the 0x7ffff space, depending on the record
                // length.
                let value = if roll_mode {
                    0x1
                } else {
                    0x7ffff_u32.wrapping_sub(record_length).wrapping_add(position_samples)
                };
                write_bulk!(self, SetTriggerAndSamplerate, SetTriggerAndSamplerate, |cmd| {
                    cmd.set_trigger_position(value);
                });
            }

            Some(BulkCode::FSetBuffer) => {
                // Inverse positions, maximum is 0x7ffff.
                let pre =
                    0x7ffff_u32.wrapping_sub(record_length).wrapping_add(position_samples);
                let post = 0x7ffff_u32.wrapping_sub(position_samples);
                write_bulk!(self, FSetBuffer, SetBuffer2250, |cmd| {
                    cmd.set_trigger_position_pre(pre);
                    cmd.set_trigger_position_post(post);
                });
            }

            Some(BulkCode::ESetTriggerOrSamplerate) => {
                // Inverse positions, maximum is 0xffff; the field lives in
                // the 5200 buffer command.
                let pre = 0xffff_u32
                    .wrapping_sub(record_length).wrapping_add(position_samples) as u16;
                let post = 0xffff_u32.wrapping_sub(position_samples) as u16;
                write_bulk!(self, DSetBuffer, SetBuffer5200, |cmd| {
                    cmd.set_trigger_position_pre(pre);
                    cmd.set_trigger_position_post(post);
                });
            }

            _ => return Err(Error::Unsupported),
        }

        self.settings.trigger.position = position;
        Ok(position_samples as f64 / self.settings.samplerate.current)
    }

    /// Diagnostic escape hatch: `send bulk <hex…>` / `send control <hex…>`
    /// writes raw bytes into the named command buffer and marks it pending.
    pub fn string_command(&mut self, command: &str) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(Error::Connection);
        }

        let parts: Vec<&str> = command.split_whitespace().collect();
        if parts.is_empty() {
            return Err(Error::Parameter);
        }
        if parts[0] != "send" {
            return Err(Error::Unsupported);
        }
        if parts.len() < 2 {
            return Err(Error::Parameter);
        }

        match parts[1] {
            "bulk" => {
                if parts.len() < 3 {
                    return Err(Error::Parameter);
                }
                let mut code = [0u8; 1];
                if hex_parse(parts[2], &mut code) != 1 {
                    return Err(Error::Parameter);
                }
                let code = match BulkCode::from_code(code[0]) {
                    Some(code) => code,
                    None => return Err(Error::Unsupported),
                };

                // The opcode byte is part of the frame.
                let data = parts[2..].join(" ");
                match self.commands[code as usize].as_mut() {
                    Some(command) => {
                        hex_parse(&data, command.data_mut());
                    }
                    None => return Err(Error::Unsupported),
                }
                self.bulk_pending.insert(BulkPending::bit(code));
                Ok(())
            }

            "control" => {
                if parts.len() < 3 {
                    return Err(Error::Parameter);
                }
                let mut code = [0u8; 1];
                if hex_parse(parts[2], &mut code) != 1 {
                    return Err(Error::Parameter);
                }

                let index = (0..ControlIndex::COUNT).find(|&index| {
                    self.controls[index].as_ref()
                        .map_or(false, |command| command.code() as u8 == code[0])
                });
                let index = match index {
                    Some(index) => index,
                    None => return Err(Error::Unsupported),
                };

                let data = parts[3..].join(" ");
                if let Some(command) = self.controls[index].as_mut() {
                    hex_parse(&data, command.data_mut());
                }
                self.control_pending.insert(ControlPending::from_bits_retain(1 << index));
                Ok(())
            }

            _ => Err(Error::Unsupported),
        }
    }

    fn send_bulk(&mut self, code: BulkCode) -> core::result::Result<(), TransportError> {
        if let Some(command) = &self.commands[code as usize] {
            self.transport.bulk_command(command.data(), 3)?;
        }
        Ok(())
    }

    /// The WAITING step of block mode: count cycles since arming, enable
    /// the trigger once the buffer refilled, force it on auto timeout, and
    /// re-arm when the capture is considered lost. Returns false when the
    /// device is gone and the loop must terminate.
    fn capture_waiting_step(&mut self) -> bool {
        self.previous_sample_count = self.sample_count().0;

        if self.sampling_started
                && self.last_trigger_mode == Some(self.settings.trigger.mode) {
            self.cycle_counter += 1;

            if self.cycle_counter == self.start_cycle && !self.roll_mode() {
                // The buffer refilled completely since the start of
                // sampling, enable the trigger now.
                match self.send_bulk(BulkCode::EnableTrigger) {
                    Ok(()) => log::debug!("enabling trigger"),
                    Err(TransportError::NoDevice) => {
                        let _ = self.events.send(Event::CommunicationError);
                        return false;
                    }
                    Err(error) => {
                        log::warn!("enabling trigger failed: {}", error);
                        return true;
                    }
                }
            } else if self.cycle_counter >= 8 + self.start_cycle
                    && self.settings.trigger.mode == TriggerMode::Auto {
                match self.send_bulk(BulkCode::ForceTrigger) {
                    Ok(()) => log::debug!("forcing trigger"),
                    Err(TransportError::NoDevice) => {
                        let _ = self.events.send(Event::CommunicationError);
                        return false;
                    }
                    Err(error) => {
                        log::warn!("forcing trigger failed: {}", error);
                        return true;
                    }
                }
            }

            // Give the device more time before considering the capture lost.
            if self.cycle_counter < 20 || self.cycle_counter < 4000 / self.cycle_time {
                return true;
            }
        }

        // Start capturing.
        match self.send_bulk(BulkCode::StartSampling) {
            Ok(()) => log::debug!("starting to capture"),
            Err(TransportError::NoDevice) => {
                let _ = self.events.send(Event::CommunicationError);
                return false;
            }
            Err(error) => {
                log::warn!("starting sampling failed: {}", error);
                return true;
            }
        }

        self.sampling_started = true;
        self.cycle_counter = 0;
        self.start_cycle =
            (self.settings.trigger.position * 1000.0 / self.cycle_time as f64) as u32 + 1;
        self.last_trigger_mode = Some(self.settings.trigger.mode);
        true
    }

    /// One tick of the acquisition state machine. Returns the delay until
    /// the next tick, or `None` once the device is gone (after emitting
    /// `CommunicationError`).
    pub fn run(&mut self) -> Option<Duration> {
        // Send all pending bulk commands.
        for code in BulkCode::ALL {
            if !self.bulk_pending.contains(BulkPending::bit(code)) {
                continue;
            }
            let result = match &self.commands[code as usize] {
                Some(command) => {
                    log::debug!("sending bulk command {:02x}: {:02x?}",
                                code as u8, command.data());
                    self.transport.bulk_command(command.data(), 3)
                }
                None => {
                    self.bulk_pending.remove(BulkPending::bit(code));
                    continue;
                }
            };
            match result {
                Ok(_) => {
                    self.bulk_pending.remove(BulkPending::bit(code));
                }
                Err(TransportError::NoDevice) => {
                    let _ = self.events.send(Event::CommunicationError);
                    return None;
                }
                Err(error) => {
                    // Keep it pending, retried on the next tick.
                    log::warn!("sending bulk command {:02x} failed: {}", code as u8, error);
                }
            }
        }

        // Send all pending control commands.
        for index in 0..ControlIndex::COUNT {
            let bit = ControlPending::from_bits_retain(1 << index);
            if !self.control_pending.contains(bit) {
                continue;
            }
            let result = match &self.controls[index] {
                Some(command) => {
                    log::debug!("sending control command {:02x}: {:02x?}",
                                command.code() as u8, command.data());
                    self.transport.control_write(command.code(), command.data())
                }
                None => {
                    self.control_pending.remove(bit);
                    continue;
                }
            };
            match result {
                Ok(_) => {
                    self.control_pending.remove(bit);
                }
                Err(TransportError::NoDevice) => {
                    let _ = self.events.send(Event::CommunicationError);
                    return None;
                }
                Err(error) => {
                    log::warn!("sending control command failed: {}", error);
                }
            }
        }

        if self.roll_mode() {
            self.capture_state = CaptureState::Waiting;
            let mut to_next_state = true;

            match self.roll_state {
                RollState::StartSampling => {
                    // Don't iterate through the roll mode steps when stopped.
                    if !self.sampling {
                        to_next_state = false;
                    } else {
                        self.previous_sample_count = self.sample_count().0;
                        match self.send_bulk(BulkCode::StartSampling) {
                            Ok(()) => {
                                log::debug!("starting to capture");
                                self.sampling_started = true;
                            }
                            Err(TransportError::NoDevice) => {
                                let _ = self.events.send(Event::CommunicationError);
                                return None;
                            }
                            Err(error) =>
                                log::warn!("starting sampling failed: {}", error),
                        }
                    }
                }

                RollState::EnableTrigger => {
                    match self.send_bulk(BulkCode::EnableTrigger) {
                        Ok(()) => log::debug!("enabling trigger"),
                        Err(TransportError::NoDevice) => {
                            let _ = self.events.send(Event::CommunicationError);
                            return None;
                        }
                        Err(error) => log::warn!("enabling trigger failed: {}", error),
                    }
                }

                RollState::ForceTrigger => {
                    match self.send_bulk(BulkCode::ForceTrigger) {
                        Ok(()) => log::debug!("forcing trigger"),
                        Err(TransportError::NoDevice) => {
                            let _ = self.events.send(Event::CommunicationError);
                            return None;
                        }
                        Err(error) => log::warn!("forcing trigger failed: {}", error),
                    }
                }

                RollState::GetData => {
                    match self.get_samples(self.sampling_started) {
                        Ok(received) =>
                            log::debug!("received {} B of sampling data", received),
                        Err(error) =>
                            log::warn!("getting sample data failed: {}", error),
                    }

                    if self.settings.trigger.mode == TriggerMode::Single
                            && self.sampling_started {
                        self.stop_sampling();
                    }

                    // Sampling completed, restarted on the next pass.
                    self.sampling_started = false;
                }
            }

            if to_next_state {
                self.roll_state = self.roll_state.next();
            }
        } else {
            // Standard (block) mode.
            self.roll_state = RollState::StartSampling;

            let last_state = self.capture_state;
            let state = match self.get_capture_state() {
                Ok(Some(state)) => {
                    if state != last_state {
                        log::debug!("capture state changed to {:?}", state);
                    }
                    self.capture_state = state;
                    Some(state)
                }
                Ok(None) => None,
                Err(error) => {
                    log::warn!("getting capture state failed: {}", error);
                    None
                }
            };

            match state {
                Some(state) if state.is_ready() => {
                    match self.get_samples(self.sampling_started) {
                        Ok(received) =>
                            log::debug!("received {} B of sampling data", received),
                        Err(error) =>
                            log::warn!("getting sample data failed: {}", error),
                    }

                    if self.settings.trigger.mode == TriggerMode::Single
                            && self.sampling_started {
                        self.stop_sampling();
                    }

                    self.sampling_started = false;

                    // Immediately re-arm for the next capture.
                    if self.sampling && !self.capture_waiting_step() {
                        return None;
                    }
                }

                Some(CaptureState::Waiting) => {
                    if !self.capture_waiting_step() {
                        return None;
                    }
                }

                // Sampling in progress, or an unknown state byte.
                _ => {}
            }
        }

        self.update_interval();
        Some(Duration::from_millis(self.cycle_time as u64))
    }

    /// Drive `run()` until the device disappears.
    pub fn run_loop(&mut self) {
        while let Some(delay) = self.run() {
            std::thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;

    struct MockTransport {
        model_id: u32,
        packet_size: usize,
        connected: bool,
        no_device: bool,
        bulk_writes: Vec<Vec<u8>>,
        control_writes: Vec<(ControlCode, Vec<u8>)>,
        control_reads: Vec<(ControlCode, u8)>,
        offset_limits: [u8; 72],
        capture_states: VecDeque<u8>,
        trigger_point: u16,
        sample_byte: u8,
    }

    impl MockTransport {
        fn new(model_id: u32) -> MockTransport {
            // All offset limit entries span 0x0060..0x00f0.
            let mut offset_limits = [0u8; 72];
            for entry in offset_limits.chunks_mut(4) {
                entry.copy_from_slice(&[0x00, 0x60, 0x00, 0xf0]);
            }
            MockTransport {
                model_id,
                packet_size: 512,
                connected: true,
                no_device: false,
                bulk_writes: Vec::new(),
                control_writes: Vec::new(),
                control_reads: Vec::new(),
                offset_limits,
                capture_states: VecDeque::new(),
                trigger_point: 0,
                sample_byte: 0x80,
            }
        }

        fn bulk_codes(&self) -> Vec<u8> {
            self.bulk_writes.iter().map(|frame| frame[0]).collect()
        }
    }

    impl Transport for MockTransport {
        fn bulk_command(&mut self, data: &[u8], _attempts: u32) -> core::result::Result<usize, TransportError> {
            if self.no_device {
                return Err(TransportError::NoDevice);
            }
            self.bulk_writes.push(data.to_vec());
            Ok(data.len())
        }

        fn bulk_read(&mut self, data: &mut [u8]) -> core::result::Result<usize, TransportError> {
            if self.no_device {
                return Err(TransportError::NoDevice);
            }
            data.fill(0);
            let state = match self.capture_states.len() {
                0 | 1 => *self.capture_states.front().unwrap_or(&0),
                _ => self.capture_states.pop_front().unwrap(),
            };
            data[0] = state;
            data[2] = self.trigger_point as u8;
            data[3] = (self.trigger_point >> 8) as u8;
            Ok(data.len())
        }

        fn bulk_read_multi(&mut self, data: &mut [u8]) -> core::result::Result<usize, TransportError> {
            if self.no_device {
                return Err(TransportError::NoDevice);
            }
            data.fill(self.sample_byte);
            Ok(data.len())
        }

        fn control_read(&mut self, code: ControlCode, data: &mut [u8], value: ControlValue)
                -> core::result::Result<usize, TransportError> {
            self.control_reads.push((code, value as u8));
            data.copy_from_slice(&self.offset_limits[..data.len()]);
            Ok(data.len())
        }

        fn control_write(&mut self, code: ControlCode, data: &[u8]) -> core::result::Result<usize, TransportError> {
            if self.no_device {
                return Err(TransportError::NoDevice);
            }
            self.control_writes.push((code, data.to_vec()));
            Ok(data.len())
        }

        fn model_id(&self) -> u32 {
            self.model_id
        }

        fn packet_size(&self) -> usize {
            self.packet_size
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }
    }

    fn new_2090() -> (Device<MockTransport>, Receiver<Event>) {
        Device::new(MockTransport::new(0)).unwrap()
    }

    fn drain(receiver: &Receiver<Event>) -> Vec<Event> {
        receiver.try_iter().collect()
    }

    #[test]
    fn test_cold_start_2090() {
        let (device, events) = new_2090();

        // The 72 byte calibration table was read at init.
        assert_eq!(device.transport.control_reads,
                   vec![(ControlCode::Value, ControlValue::OffsetLimits as u8)]);
        assert_eq!(device.spec.offset_limit[0][0], [0x60, 0xf0]);
        assert_eq!(device.spec.offset_limit[1][8], [0x60, 0xf0]);

        // Defaults: record length preset 1, target 100 MS/s snapped to the
        // highest reachable rate.
        assert_eq!(device.settings.record_length_id, 1);
        assert_eq!(device.settings.samplerate.mode, RateMode::Single);
        assert_eq!(device.settings.samplerate.downsampler, 0);
        assert_eq!(device.settings.samplerate.current, 50e6);

        let events = drain(&events);
        assert!(events.contains(
            &Event::AvailableRecordLengthsChanged(vec![ROLL_RECORD_LENGTH, 10240, 32768])));
        assert!(events.contains(&Event::RecordLengthChanged(10240)));
        assert!(events.contains(&Event::SamplerateChanged(50e6)));
    }

    #[test]
    fn test_unknown_model_disconnects() {
        let result = Device::new(MockTransport::new(9));
        assert!(matches!(result, Err(Error::UnknownModel(9))));
    }

    #[test]
    fn test_first_tick_flushes_pending_in_order() {
        let (mut device, _events) = new_2090();
        device.transport.capture_states.push_back(0);

        assert!(device.run().is_some());

        // Megacommand first (lowest opcode), then the state poll, then the
        // re-arm; offset and relay control writes in slot order.
        let codes = device.transport.bulk_codes();
        assert_eq!(codes, vec![0x01, 0x06, 0x03]);
        let control_codes: Vec<ControlCode> =
            device.transport.control_writes.iter().map(|(code, _)| *code).collect();
        assert_eq!(control_codes, vec![ControlCode::SetOffset, ControlCode::SetRelays]);
        assert!(device.bulk_pending.is_empty());
        assert!(device.control_pending.is_empty());
    }

    #[test]
    fn test_samplerate_snap_2090() {
        let (mut device, _events) = new_2090();

        let best = device.set_samplerate(33.3e6).unwrap();
        assert_eq!(best, 50e6);
        assert_eq!(device.settings.samplerate.current, 50e6);
        assert_eq!(device.settings.samplerate.downsampler, 1);

        if let Some(BulkCommand::SetTriggerAndSamplerate(cmd)) =
                &device.commands[BulkCode::SetTriggerAndSamplerate as usize] {
            assert_eq!(cmd.samplerate_id(), 1);
            assert!(!cmd.downsampling_mode());
            assert_eq!(cmd.downsampler(), 0);
        } else {
            panic!("megacommand slot missing");
        }
    }

    #[test]
    fn test_samplerate_word_roundtrip_2090() {
        let (mut device, _events) = new_2090();

        // Every legal downsampler must be recoverable from the frame.
        for downsampler in [1u32, 2, 5, 6, 8, 1000, 131072] {
            device.update_samplerate(downsampler, false).unwrap();
            if let Some(BulkCommand::SetTriggerAndSamplerate(cmd)) =
                    &device.commands[BulkCode::SetTriggerAndSamplerate as usize] {
                let decoded = if cmd.downsampling_mode() {
                    (0x10001 - cmd.downsampler() as u32) << 1
                } else {
                    match cmd.samplerate_id() {
                        3 => 5,
                        id => id as u32,
                    }
                };
                assert_eq!(decoded, downsampler);
            } else {
                panic!("megacommand slot missing");
            }
        }
    }

    #[test]
    fn test_record_time_2090() {
        let (mut device, _events) = new_2090();

        let duration = device.set_record_time(1e-3).unwrap();
        // d* = 50e6 / 10.24e6 = 4.88, rounded up within {1, 2, 5} to 5.
        assert_eq!(device.settings.samplerate.downsampler, 5);
        assert_eq!(device.settings.samplerate.current, 10e6);
        assert_eq!(duration, 10240.0 / 10e6);
    }

    #[test]
    fn test_fast_rate_enable() {
        let (mut device, events) = new_2090();
        device.set_channel_used(0, true).unwrap();
        device.set_channel_used(1, true).unwrap();
        assert_eq!(device.settings.used_channels, 2);

        // Two channels active: the request can't leave single mode.
        device.set_samplerate(80e6).unwrap();
        assert_eq!(device.settings.samplerate.mode, RateMode::Single);
        assert_eq!(device.settings.samplerate.current, 50e6);

        drain(&events);
        device.set_channel_used(1, false).unwrap();
        assert_eq!(device.settings.used_channels, 1);
        // Fast rate became available, the limits change.
        assert!(drain(&events).iter().any(|event|
            matches!(event, Event::SamplerateLimitsChanged { max, .. } if *max == 100e6)));

        device.set_samplerate(80e6).unwrap();
        assert_eq!(device.settings.samplerate.mode, RateMode::Multi);
        assert_eq!(device.settings.samplerate.current, 100e6);
        assert!(drain(&events).contains(
            &Event::AvailableRecordLengthsChanged(vec![ROLL_RECORD_LENGTH, 20480, 65536])));
    }

    #[test]
    fn test_roll_mode_cycle() {
        let (mut device, events) = new_2090();
        device.set_channel_used(0, true).unwrap();
        device.set_record_length(0).unwrap();
        assert!(device.roll_mode());
        device.start_sampling();
        drain(&events);

        // First tick flushes the megacommand, then the roll steps advance
        // one per tick: start, enable, force, read.
        assert!(device.run().is_some());
        assert!(device.run().is_some());
        assert!(device.run().is_some());
        assert!(device.run().is_some());
        let codes = device.transport.bulk_codes();
        assert_eq!(codes, vec![0x01, 0x03, 0x04, 0x02, 0x05]);

        let events = drain(&events);
        assert!(events.contains(&Event::SamplesAvailable));
        assert!(device.result.read().unwrap().append);
        assert!(device.sampling);

        // The cycle wraps back to the start.
        assert!(device.run().is_some());
        assert_eq!(device.transport.bulk_codes().last(), Some(&0x03));
    }

    #[test]
    fn test_roll_mode_suppresses_record_time_event() {
        let (mut device, events) = new_2090();
        device.set_record_length(0).unwrap();
        drain(&events);
        device.set_samplerate(1e6).unwrap();
        assert!(drain(&events).iter().all(|event|
            !matches!(event, Event::RecordTimeChanged(_))));
    }

    #[test]
    fn test_single_shot_stops_after_ready() {
        let (mut device, events) = new_2090();
        device.set_channel_used(0, true).unwrap();
        device.set_trigger_mode(TriggerMode::Single).unwrap();
        device.start_sampling();
        drain(&events);

        // Waiting on the first tick, then Ready from there on.
        device.transport.capture_states.push_back(0);
        device.transport.capture_states.push_back(2);

        assert!(device.run().is_some());
        assert!(device.sampling_started);
        assert!(device.run().is_some());
        assert!(!device.sampling);
        assert!(drain(&events).contains(&Event::SamplingStopped));

        // The scope stays Ready; no further capture is started.
        let starts_before = device.transport.bulk_codes()
            .iter().filter(|&&code| code == 0x03).count();
        assert!(device.run().is_some());
        assert!(device.run().is_some());
        let starts_after = device.transport.bulk_codes()
            .iter().filter(|&&code| code == 0x03).count();
        assert_eq!(starts_before, 1);
        assert_eq!(starts_after, starts_before);
    }

    #[test]
    fn test_normal_mode_rearms_after_ready() {
        let (mut device, events) = new_2090();
        device.set_channel_used(0, true).unwrap();
        device.start_sampling();
        drain(&events);

        device.transport.capture_states.push_back(0);
        device.transport.capture_states.push_back(2);

        assert!(device.run().is_some());
        assert!(device.run().is_some());
        // Ready with sampling still on falls through into the re-arm.
        let starts = device.transport.bulk_codes()
            .iter().filter(|&&code| code == 0x03).count();
        assert_eq!(starts, 2);
        assert!(device.sampling);
        assert!(device.sampling_started);
    }

    #[test]
    fn test_no_device_terminates_loop() {
        let (mut device, events) = new_2090();
        drain(&events);
        device.force_trigger();
        device.transport.no_device = true;

        assert!(device.run().is_none());
        assert!(drain(&events).contains(&Event::CommunicationError));
    }

    #[test]
    fn test_trigger_point_unfold_is_involution() {
        for value in 0..=0xffffu32 {
            let unfolded = Device::<MockTransport>::calculate_trigger_point(value);
            assert_eq!(Device::<MockTransport>::calculate_trigger_point(unfolded), value);
        }
        assert_eq!(Device::<MockTransport>::calculate_trigger_point(0), 0);
        assert_eq!(Device::<MockTransport>::calculate_trigger_point(1), 1);
        // 0b10 flips the lower bit: 0b11.
        assert_eq!(Device::<MockTransport>::calculate_trigger_point(2), 3);
    }

    #[test]
    fn test_offset_quantisation_is_idempotent() {
        let (mut device, _events) = new_2090();

        let real = device.set_offset(0, 0.3).unwrap();
        assert_eq!(device.settings.voltage[0].offset_real, real);
        let real_again = device.set_offset(0, real).unwrap();
        assert_eq!(real_again, real);

        // The quantised value went into the control frame.
        if let Some(ControlCommand::SetOffset(cmd)) =
                &device.controls[ControlIndex::SetOffset as usize] {
            let expected = (real * (0xf0 - 0x60) as f64 + 0x60 as f64 + 0.5) as u16;
            assert_eq!(cmd.channel(0), expected);
        } else {
            panic!("offset slot missing");
        }
    }

    #[test]
    fn test_gain_snaps_and_sets_relays() {
        let (mut device, _events) = new_2090();

        let step = device.set_gain(0, 1.0).unwrap();
        assert_eq!(step, 1.60);
        assert_eq!(device.settings.voltage[0].gain, 4);

        if let Some(BulkCommand::SetGain(cmd)) =
                &device.commands[BulkCode::SetGain as usize] {
            assert_eq!(cmd.gain(0), 1);
        } else {
            panic!("gain slot missing");
        }
        if let Some(ControlCommand::SetRelays(cmd)) =
                &device.controls[ControlIndex::SetRelays as usize] {
            assert!(!cmd.below_1v(0));
            assert!(cmd.below_100mv(0));
        } else {
            panic!("relay slot missing");
        }
        // The offset was re-applied for the new range.
        assert!(device.control_pending.contains(ControlPending::SET_OFFSET));
    }

    #[test]
    fn test_trigger_source_codes() {
        let (mut device, _events) = new_2090();

        device.set_trigger_source(false, 0).unwrap();
        if let Some(BulkCommand::SetTriggerAndSamplerate(cmd)) =
                &device.commands[BulkCode::SetTriggerAndSamplerate as usize] {
            assert_eq!(cmd.trigger_source(), 1);
        } else {
            panic!("megacommand slot missing");
        }

        device.set_trigger_source(true, 1).unwrap();
        if let Some(BulkCommand::SetTriggerAndSamplerate(cmd)) =
                &device.commands[BulkCode::SetTriggerAndSamplerate as usize] {
            assert_eq!(cmd.trigger_source(), 0); // 3 + 1 masked to 2 bits
        } else {
            panic!("megacommand slot missing");
        }
        if let Some(ControlCommand::SetRelays(cmd)) =
                &device.controls[ControlIndex::SetRelays as usize] {
            assert!(cmd.trigger_ext());
        } else {
            panic!("relay slot missing");
        }
        // Special sources pin the level to midscale.
        if let Some(ControlCommand::SetOffset(cmd)) =
                &device.controls[ControlIndex::SetOffset as usize] {
            assert_eq!(cmd.trigger(), 0x7f);
        } else {
            panic!("offset slot missing");
        }

        assert!(matches!(device.set_trigger_source(false, 2), Err(Error::Parameter)));
        assert!(matches!(device.set_trigger_source(true, 2), Err(Error::Parameter)));
    }

    #[test]
    fn test_pretrigger_position_2090() {
        let (mut device, _events) = new_2090();

        // 2^-13 s at 50 MS/s is 6103.5 samples, truncated to 6103.
        let position = device.set_pretrigger_position(1.0 / 8192.0).unwrap();
        assert_eq!(position, 6103.0 / 50e6);
        if let Some(BulkCommand::SetTriggerAndSamplerate(cmd)) =
                &device.commands[BulkCode::SetTriggerAndSamplerate as usize] {
            assert_eq!(cmd.trigger_position(), 0x7ffff - 10240 + 6103);
        } else {
            panic!("megacommand slot missing");
        }
    }

    #[test]
    fn test_string_commands() {
        let (mut device, _events) = new_2090();

        device.string_command("send bulk 01 01 00 2a").unwrap();
        if let Some(command) = &device.commands[BulkCode::SetTriggerAndSamplerate as usize] {
            assert_eq!(&command.data()[..3], &[0x01, 0x01, 0x00]);
            assert_eq!(command.data()[3], 0x2a);
        }
        assert!(device.bulk_pending.contains(BulkPending::SET_TRIGGER_AND_SAMPLERATE));

        device.string_command("send control b5 04 08").unwrap();
        assert!(device.control_pending.contains(ControlPending::SET_RELAYS));

        assert!(matches!(device.string_command("send"), Err(Error::Parameter)));
        assert!(matches!(device.string_command("send bulk"), Err(Error::Parameter)));
        assert!(matches!(device.string_command("send bulk 10"), Err(Error::Unsupported)));
        assert!(matches!(device.string_command("send control e0"), Err(Error::Unsupported)));
        assert!(matches!(device.string_command("nonsense"), Err(Error::Unsupported)));
        assert!(matches!(device.string_command(""), Err(Error::Parameter)));
    }

    #[test]
    fn test_disconnected_setters_fail() {
        let (mut device, _events) = new_2090();
        device.transport.connected = false;
        assert!(matches!(device.set_samplerate(1e6), Err(Error::Connection)));
        assert!(matches!(device.set_gain(0, 1.0), Err(Error::Connection)));
        assert!(matches!(device.set_record_length(1), Err(Error::Connection)));
        assert!(matches!(device.string_command("send bulk 01"), Err(Error::Connection)));
    }

    #[test]
    fn test_record_length_out_of_range() {
        let (mut device, _events) = new_2090();
        assert!(matches!(device.set_record_length(3), Err(Error::Parameter)));
    }

    #[test]
    fn test_6022_uses_control_path() {
        let (mut device, events) = Device::new(MockTransport::new(5)).unwrap();
        assert!(drain(&events).iter().any(|event|
            matches!(event, Event::SamplerateSet { mode: 1, .. })));

        // Samplerate goes through the time divider request.
        device.set_samplerate(1e6).unwrap();
        if let Some(ControlCommand::TimeDiv(cmd)) =
                &device.controls[ControlIndex::TimeDiv as usize] {
            assert_eq!(cmd.div(), 1);
        } else {
            panic!("time div slot missing");
        }

        // Gain goes through the voltage divider requests.
        device.set_gain(1, 0.08).unwrap();
        if let Some(ControlCommand::VoltDivCh2(cmd)) =
                &device.controls[ControlIndex::VoltDivCh2 as usize] {
            assert_eq!(cmd.div(), 10);
        } else {
            panic!("volt div slot missing");
        }

        // No trigger bulk commands exist on this model.
        assert!(matches!(device.set_trigger_slope(Slope::Negative), Err(Error::Unsupported)));
        assert!(matches!(device.set_pretrigger_position(0.0), Err(Error::Unsupported)));
    }

    #[test]
    fn test_6022_record_time_picks_largest_fitting_step() {
        let (mut device, _events) = Device::new(MockTransport::new(5)).unwrap();
        // 1 ms: 8 MS/s gives 8000 samples < 8240, 16 MS/s would not fit.
        let rate = device.set_record_time(1e-3).unwrap();
        assert_eq!(rate, 8e6);
        if let Some(ControlCommand::TimeDiv(cmd)) =
                &device.controls[ControlIndex::TimeDiv as usize] {
            assert_eq!(cmd.div(), 8);
        } else {
            panic!("time div slot missing");
        }
    }

    #[test]
    fn test_update_interval_bounds() {
        let (mut device, _events) = new_2090();
        device.update_interval();
        assert!(device.cycle_time >= 10 && device.cycle_time <= 1000);
        device.set_record_length(0).unwrap();
        device.update_interval();
        assert!(device.cycle_time >= 10 && device.cycle_time <= 1000);
    }
}
