//! The desired state of the acquisition: what the user asked for, before
//! and after snapping to what the hardware can do.

use crate::CHANNELS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Coupling {
    #[default]
    DC,
    AC,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    Auto,
    #[default]
    Normal,
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Slope {
    #[default]
    Positive,
    Negative,
}

impl Slope {
    pub(crate) fn code(self) -> u8 {
        match self {
            Slope::Positive => 0,
            Slope::Negative => 1,
        }
    }
}

/// Which samplerate limit table is active. `Multi` is the fast-rate mode
/// where one channel uses both ADC buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateMode {
    #[default]
    Single,
    Multi,
}

/// The user's intent, re-solved whenever a divider change invalidates the
/// currently programmed rate.
#[derive(Debug, Clone, Copy)]
pub struct SamplerateTarget {
    pub samplerate: f64,
    pub duration: f64,
    /// true: hold `samplerate`; false: hold `duration`.
    pub samplerate_set: bool,
}

#[derive(Debug, Clone)]
pub struct SamplerateSettings {
    pub mode: RateMode,
    pub downsampler: u32,
    /// Effective rate in S/s.
    pub current: f64,
    pub target: SamplerateTarget,
}

#[derive(Debug, Clone)]
pub struct TriggerSettings {
    pub mode: TriggerMode,
    pub slope: Slope,
    /// true when the source is EXT or EXT/10.
    pub special: bool,
    pub source: usize,
    /// Level per channel, in V.
    pub level: [f64; CHANNELS],
    /// Pretrigger position in seconds.
    pub position: f64,
    /// Sub-buffer sample index where the last capture triggered.
    pub point: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelSettings {
    /// Index into the gain step table.
    pub gain: usize,
    /// Requested offset, 0..1 of the offset range.
    pub offset: f64,
    /// Offset as actually quantised by the calibration table.
    pub offset_real: f64,
    pub used: bool,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub samplerate: SamplerateSettings,
    pub trigger: TriggerSettings,
    pub voltage: [ChannelSettings; CHANNELS],
    /// Index into the active limits' record length table.
    pub record_length_id: usize,
    pub used_channels: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            samplerate: SamplerateSettings {
                mode: RateMode::Single,
                downsampler: 1,
                current: 1e8,
                target: SamplerateTarget {
                    samplerate: 1e8,
                    duration: 1e-3,
                    samplerate_set: true,
                },
            },
            trigger: TriggerSettings {
                mode: TriggerMode::Normal,
                slope: Slope::Positive,
                special: false,
                source: 0,
                level: [0.0; CHANNELS],
                position: 0.0,
                point: 0,
            },
            voltage: [ChannelSettings {
                gain: 0,
                offset: 0.0,
                offset_real: 0.0,
                used: false,
            }; CHANNELS],
            record_length_id: 1,
            used_channels: 0,
        }
    }
}
