//! Converts raw ADC frames into calibrated voltage samples. Three payload
//! layouts exist: interleaved 8-bit, interleaved 10-bit with the high-order
//! bits trailing the low-byte block, and single-channel fast-rate packing.

use crate::CHANNELS;
use crate::settings::{RateMode, Settings};
use crate::spec::{Model, ModelSpec, ROLL_RECORD_LENGTH};

// The 6022BE returns garbage around the capture window.
pub(crate) const DROP_DSO6022_HEAD: usize = 0x410;
pub(crate) const DROP_DSO6022_TAIL: usize = 0x3f0;

// The 6022BE has no analog offset; its ADC idles around this code.
const DSO6022_BASELINE: i32 = 0x83;

/// One decoded frame, shared with consumers under a reader/writer lock.
/// In roll mode `append` is set and consumers accumulate; otherwise each
/// frame replaces the last.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    pub data: [Vec<f64>; CHANNELS],
    pub samplerate: f64,
    pub append: bool,
}

/// Decode `raw` into `result` according to the current settings.
/// `total_sample_count` is derived from the byte count the device actually
/// returned, so a short read truncates instead of failing.
pub(crate) fn convert(
    spec: &ModelSpec,
    model: Model,
    settings: &Settings,
    fast_rate: bool,
    raw: &[u8],
    total_sample_count: usize,
    result: &mut SampleBuffer,
) {
    let limits = spec.limits(settings.samplerate.mode == RateMode::Multi);
    result.samplerate = settings.samplerate.current;
    result.append = limits.record_lengths[settings.record_length_id] == ROLL_RECORD_LENGTH;

    if fast_rate {
        // One channel is using all buffers.
        let sample_count = total_sample_count;
        let channel = (0..CHANNELS).find(|&channel| settings.voltage[channel].used);

        for cleared in 0..CHANNELS {
            if Some(cleared) != channel {
                result.data[cleared].clear();
            }
        }

        let channel = match channel {
            Some(channel) => channel,
            None => return,
        };
        result.data[channel].resize(sample_count, 0.0);

        let gain = settings.voltage[channel].gain;
        let limit = spec.voltage_limit[channel][gain] as f64;
        let gain_step = spec.gain_steps[gain];
        let offset_real = settings.voltage[channel].offset_real;

        let mut buffer_position = settings.trigger.point as usize * 2;
        if spec.sample_size > 8 {
            // The most significant bits trail the normal data.
            let extra_bits_size = (spec.sample_size - 8) as u16;
            let extra_bits_mask: u16 = (0x00ff << extra_bits_size) & 0xff00;

            for real_position in 0..sample_count {
                // TODO: the interleaved path wraps on total_sample_count;
                // find out on hardware which bound is right here.
                if buffer_position >= sample_count {
                    buffer_position %= sample_count;
                }
                let extra_bits_position = buffer_position % CHANNELS;
                let shift = 8 - (CHANNELS - 1 - extra_bits_position) as u16 * extra_bits_size;
                let value = raw[buffer_position] as u16
                    + ((raw[sample_count + buffer_position - extra_bits_position] as u16) << shift
                        & extra_bits_mask);
                result.data[channel][real_position] =
                    (value as f64 / limit - offset_real) * gain_step;
                buffer_position += 1;
            }
        } else {
            for real_position in 0..sample_count {
                if buffer_position >= sample_count {
                    buffer_position %= sample_count;
                }
                result.data[channel][real_position] =
                    (raw[buffer_position] as f64 / limit - offset_real) * gain_step;
                buffer_position += 1;
            }
        }
        return;
    }

    // Normal mode, the channels interleave into separate buffers.
    let mut sample_count = total_sample_count / CHANNELS;
    if model == Model::Dso6022be {
        sample_count = sample_count.saturating_sub(DROP_DSO6022_HEAD + DROP_DSO6022_TAIL);
    }

    for channel in 0..CHANNELS {
        if !settings.voltage[channel].used {
            result.data[channel].clear();
            continue;
        }
        if result.data[channel].len() < sample_count {
            result.data[channel].resize(sample_count, 0.0);
        }

        let gain = settings.voltage[channel].gain;
        let limit = spec.voltage_limit[channel][gain] as f64;
        let gain_step = spec.gain_steps[gain];
        let offset_real = settings.voltage[channel].offset_real;

        let mut buffer_position = settings.trigger.point as usize * 2;
        if spec.sample_size > 8 {
            let extra_bits_size = (spec.sample_size - 8) as u16;
            let extra_bits_mask: u16 = (0x00ff << extra_bits_size) & 0xff00;
            let extra_bits_index = 8 - channel as u16 * 2;

            for real_position in 0..sample_count {
                if buffer_position >= total_sample_count {
                    buffer_position %= total_sample_count;
                }
                let value = raw[buffer_position + CHANNELS - 1 - channel] as u16
                    + ((raw[total_sample_count + buffer_position] as u16) << extra_bits_index
                        & extra_bits_mask);
                result.data[channel][real_position] =
                    (value as f64 / limit - offset_real) * gain_step;
                buffer_position += CHANNELS;
            }
        } else {
            if model == Model::Dso6022be {
                buffer_position += channel + DROP_DSO6022_HEAD * 2;
            } else {
                buffer_position += CHANNELS - 1 - channel;
            }

            for real_position in 0..sample_count {
                if buffer_position >= total_sample_count {
                    buffer_position %= total_sample_count;
                }
                result.data[channel][real_position] = if model == Model::Dso6022be {
                    (raw[buffer_position] as i32 - DSO6022_BASELINE) as f64 / limit * gain_step
                } else {
                    (raw[buffer_position] as f64 / limit - offset_real) * gain_step
                };
                buffer_position += CHANNELS;
            }
        }
    }
}
