//! Per-model constants: which command carries which field, samplerate
//! limits, gain tables and ADC layout. One row per supported model.

use crate::CHANNELS;
use crate::commands::{BulkCode, ControlCode};

/// Record length sentinel for unbounded (roll mode) capture.
pub const ROLL_RECORD_LENGTH: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    Dso2090,
    Dso2150,
    Dso2250,
    Dso5200,
    Dso5200a,
    Dso6022be,
}

impl Model {
    pub fn from_id(id: u32) -> Option<Model> {
        match id {
            0 => Some(Model::Dso2090),
            1 => Some(Model::Dso2150),
            2 => Some(Model::Dso2250),
            3 => Some(Model::Dso5200),
            4 => Some(Model::Dso5200a),
            5 => Some(Model::Dso6022be),
            _ => None,
        }
    }

    /// Models that have seen little hardware testing.
    pub fn is_experimental(self) -> bool {
        matches!(self, Model::Dso2150 | Model::Dso5200a)
    }
}

/// Which bulk command implements each logical operation. Several models
/// overload one command for multiple operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkBinding {
    pub set_record_length: Option<BulkCode>,
    pub set_channels: Option<BulkCode>,
    pub set_gain: Option<BulkCode>,
    pub set_samplerate: Option<BulkCode>,
    pub set_trigger: Option<BulkCode>,
    pub set_pretrigger: Option<BulkCode>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ControlBinding {
    pub set_offset: Option<ControlCode>,
    pub set_relays: Option<ControlCode>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandBinding {
    pub bulk: BulkBinding,
    pub control: ControlBinding,
}

/// Limits for one rate mode (normal two-channel or fast single-channel).
#[derive(Debug, Clone)]
pub struct SamplerateLimits {
    /// Base clock divided by the downsampler, in S/s.
    pub base: f64,
    /// Maximum rate reachable with downsampler 0, in S/s.
    pub max: f64,
    pub max_downsampler: u32,
    /// Entry 0 is the roll-mode sentinel, the rest are finite presets.
    pub record_lengths: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct SamplerateSpec {
    pub single: SamplerateLimits,
    pub multi: SamplerateLimits,
}

/// Factory offset calibration: (start, end) ADC codes per channel and gain,
/// read from the device at init.
pub type OffsetLimits = [[[u16; 2]; 9]; CHANNELS];

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub command: CommandBinding,
    pub samplerate: SamplerateSpec,
    /// Shares the index space of `record_lengths`; divides base and max.
    pub buffer_dividers: Vec<u32>,
    /// Gain steps in V/div.
    pub gain_steps: Vec<f64>,
    /// ADC counts per V/div window, per channel and gain step.
    pub voltage_limit: [Vec<u16>; CHANNELS],
    /// Hardware gain index per gain step, for the bulk SetGain command.
    pub gain_index: Vec<u8>,
    /// Divider per gain step for the 6022BE voltage divider requests.
    pub gain_div: Vec<u8>,
    /// Discrete samplerate steps of the 6022BE, in S/s.
    pub sample_steps: Vec<f64>,
    /// Divider per sample step for the 6022BE time divider request.
    pub sample_div: Vec<u8>,
    /// ADC bits per sample; above 8 the high bits trail the low-byte block.
    pub sample_size: u8,
    pub offset_limit: OffsetLimits,
}

impl ModelSpec {
    pub fn new(model: Model) -> ModelSpec {
        let mut spec = match model {
            // The 2150 is a faster 2090 and shares its command layout.
            Model::Dso2090 | Model::Dso2150 => {
                let (single_max, multi_max) = match model {
                    Model::Dso2150 => (75e6, 150e6),
                    _ => (50e6, 100e6),
                };
                ModelSpec {
                    command: CommandBinding {
                        bulk: BulkBinding {
                            set_record_length: Some(BulkCode::SetTriggerAndSamplerate),
                            set_channels: Some(BulkCode::SetTriggerAndSamplerate),
                            set_gain: Some(BulkCode::SetGain),
                            set_samplerate: Some(BulkCode::SetTriggerAndSamplerate),
                            set_trigger: Some(BulkCode::SetTriggerAndSamplerate),
                            set_pretrigger: Some(BulkCode::SetTriggerAndSamplerate),
                        },
                        control: ControlBinding {
                            set_offset: Some(ControlCode::SetOffset),
                            set_relays: Some(ControlCode::SetRelays),
                        },
                    },
                    samplerate: SamplerateSpec {
                        single: SamplerateLimits {
                            base: 50e6,
                            max: single_max,
                            max_downsampler: 131072,
                            record_lengths: vec![ROLL_RECORD_LENGTH, 10240, 32768],
                        },
                        multi: SamplerateLimits {
                            base: 100e6,
                            max: multi_max,
                            max_downsampler: 131072,
                            record_lengths: vec![ROLL_RECORD_LENGTH, 20480, 65536],
                        },
                    },
                    buffer_dividers: vec![1000, 1, 1],
                    gain_steps: vec![0.08, 0.16, 0.40, 0.80, 1.60, 4.00, 8.0, 16.0, 40.0],
                    voltage_limit: [vec![255; 9], vec![255; 9]],
                    gain_index: vec![0, 1, 2, 0, 1, 2, 0, 1, 2],
                    gain_div: vec![],
                    sample_steps: vec![],
                    sample_div: vec![],
                    sample_size: 8,
                    offset_limit: Default::default(),
                }
            }

            Model::Dso2250 => ModelSpec {
                command: CommandBinding {
                    bulk: BulkBinding {
                        set_record_length: Some(BulkCode::DSetBuffer),
                        set_channels: Some(BulkCode::BSetChannels),
                        set_gain: Some(BulkCode::SetGain),
                        set_samplerate: Some(BulkCode::ESetTriggerOrSamplerate),
                        set_trigger: Some(BulkCode::CSetTriggerOrSamplerate),
                        set_pretrigger: Some(BulkCode::FSetBuffer),
                    },
                    control: ControlBinding {
                        set_offset: Some(ControlCode::SetOffset),
                        set_relays: Some(ControlCode::SetRelays),
                    },
                },
                samplerate: SamplerateSpec {
                    single: SamplerateLimits {
                        base: 100e6,
                        max: 100e6,
                        max_downsampler: 65536,
                        record_lengths: vec![ROLL_RECORD_LENGTH, 10240, 524288],
                    },
                    multi: SamplerateLimits {
                        base: 200e6,
                        max: 250e6,
                        max_downsampler: 65536,
                        record_lengths: vec![ROLL_RECORD_LENGTH, 20480, 1048576],
                    },
                },
                buffer_dividers: vec![1000, 1, 1],
                gain_steps: vec![0.08, 0.16, 0.40, 0.80, 1.60, 4.00, 8.0, 16.0, 40.0],
                voltage_limit: [vec![255; 9], vec![255; 9]],
                gain_index: vec![0, 2, 3, 0, 2, 3, 0, 2, 3],
                gain_div: vec![],
                sample_steps: vec![],
                sample_div: vec![],
                sample_size: 8,
                offset_limit: Default::default(),
            },

            // The 5200A shares the 5200 command layout.
            Model::Dso5200 | Model::Dso5200a => ModelSpec {
                command: CommandBinding {
                    bulk: BulkBinding {
                        set_record_length: Some(BulkCode::DSetBuffer),
                        set_channels: Some(BulkCode::ESetTriggerOrSamplerate),
                        set_gain: Some(BulkCode::SetGain),
                        set_samplerate: Some(BulkCode::CSetTriggerOrSamplerate),
                        set_trigger: Some(BulkCode::ESetTriggerOrSamplerate),
                        set_pretrigger: Some(BulkCode::ESetTriggerOrSamplerate),
                    },
                    control: ControlBinding {
                        set_offset: Some(ControlCode::SetOffset),
                        set_relays: Some(ControlCode::SetRelays),
                    },
                },
                samplerate: SamplerateSpec {
                    single: SamplerateLimits {
                        base: 100e6,
                        max: 125e6,
                        max_downsampler: 131072,
                        record_lengths: vec![ROLL_RECORD_LENGTH, 10240, 14336],
                    },
                    multi: SamplerateLimits {
                        base: 200e6,
                        max: 250e6,
                        max_downsampler: 131072,
                        record_lengths: vec![ROLL_RECORD_LENGTH, 20480, 28672],
                    },
                },
                buffer_dividers: vec![1000, 1, 1],
                gain_steps: vec![0.16, 0.40, 0.80, 1.60, 4.00, 8.0, 16.0, 40.0, 80.0],
                voltage_limit: [
                    vec![368, 454, 908, 368, 454, 908, 368, 454, 908],
                    vec![368, 454, 908, 368, 454, 908, 368, 454, 908],
                ],
                gain_index: vec![1, 0, 0, 1, 0, 0, 1, 0, 0],
                gain_div: vec![],
                sample_steps: vec![],
                sample_div: vec![],
                sample_size: 10,
                offset_limit: Default::default(),
            },

            // The 6022BE has no bulk commands at all; everything goes over
            // the custom-firmware control requests.
            Model::Dso6022be => ModelSpec {
                command: CommandBinding::default(),
                samplerate: SamplerateSpec {
                    single: SamplerateLimits {
                        base: 1e6,
                        max: 48e6,
                        max_downsampler: 10,
                        record_lengths: vec![ROLL_RECORD_LENGTH, 10240],
                    },
                    multi: SamplerateLimits {
                        base: 1e6,
                        max: 48e6,
                        max_downsampler: 10,
                        record_lengths: vec![ROLL_RECORD_LENGTH, 20480],
                    },
                },
                buffer_dividers: vec![1000, 1, 1],
                gain_steps: vec![0.08, 0.16, 0.40, 0.80, 1.60, 4.00, 8.0, 16.0, 40.0],
                // Measured values, they differ from the calculated ones.
                voltage_limit: [
                    vec![25, 51, 103, 206, 412, 196, 392, 784, 1000],
                    vec![25, 51, 103, 206, 412, 196, 392, 784, 1000],
                ],
                gain_index: vec![],
                gain_div: vec![10, 10, 10, 10, 10, 2, 2, 2, 1],
                sample_steps: vec![1e5, 2e5, 5e5, 1e6, 2e6, 4e6, 8e6, 16e6, 24e6, 48e6],
                sample_div: vec![10, 20, 50, 1, 2, 4, 8, 16, 24, 48],
                sample_size: 8,
                offset_limit: Default::default(),
            },
        };

        // Until the calibration read succeeds the offsets span the full
        // 16-bit range.
        for channel in &mut spec.offset_limit {
            for gain in channel.iter_mut() {
                *gain = [0x0000, 0xffff];
            }
        }
        spec
    }

    pub fn limits(&self, fast_rate: bool) -> &SamplerateLimits {
        if fast_rate {
            &self.samplerate.multi
        } else {
            &self.samplerate.single
        }
    }
}
