//! Snaps a requested samplerate to the nearest combination of base rate,
//! buffer divider and downsampling factor the model can realise.

use crate::commands::BulkCode;
use crate::spec::ModelSpec;

/// Find the realisable samplerate nearest `samplerate`.
///
/// With `maximum` the result may not exceed the request (used when meeting
/// a record time); without it the result may not fall below (used when
/// meeting a rate). Returns `(best rate, downsampler)`, where downsampler 0
/// means "run at the maximum rate", or `(0.0, 0)` on invalid input or a
/// model without a samplerate command.
pub(crate) fn best_samplerate(
    spec: &ModelSpec,
    record_length_id: usize,
    samplerate: f64,
    fast_rate: bool,
    maximum: bool,
) -> (f64, u32) {
    if samplerate <= 0.0 {
        return (0.0, 0);
    }

    let limits = spec.limits(fast_rate);
    let divider = spec.buffer_dividers[record_length_id] as f64;

    // Ideal continuous downsampling factor for the request.
    let mut downsampler = limits.base / divider / samplerate;

    // Base samplerate sufficient, or is the maximum better?
    if downsampler < 1.0 && (samplerate <= limits.max / divider || !maximum) {
        return (limits.max / divider, 0);
    }

    match spec.command.bulk.set_samplerate {
        // The DSO-2090 supports the factors 1, 2, 4 and 5 through special
        // samplerate ids and every even factor above through the
        // downsampler word.
        Some(BulkCode::SetTriggerAndSamplerate) => {
            if (maximum && downsampler <= 5.0) || (!maximum && downsampler < 6.0) {
                if maximum {
                    // The samplerate shall not be higher, so round up.
                    downsampler = downsampler.ceil();
                    if downsampler > 2.0 {
                        // 3 and 4 not possible with the DSO-2090.
                        downsampler = 5.0;
                    }
                } else {
                    // The samplerate shall not be lower, so round down.
                    downsampler = downsampler.floor();
                    if downsampler > 2.0 && downsampler < 5.0 {
                        downsampler = 2.0;
                    }
                }
            } else {
                // Round to the next even value in the wanted direction.
                if maximum {
                    downsampler = (downsampler / 2.0).ceil() * 2.0;
                } else {
                    downsampler = (downsampler / 2.0).floor() * 2.0;
                }
                if downsampler > 2.0 * 0x10001 as f64 {
                    downsampler = 2.0 * 0x10001 as f64;
                }
            }
        }

        // The 5200 and 2250 samplerate words take any integer factor.
        Some(BulkCode::CSetTriggerOrSamplerate) | Some(BulkCode::ESetTriggerOrSamplerate) => {
            downsampler = if maximum {
                downsampler.ceil()
            } else {
                downsampler.floor()
            };
        }

        // The 6022BE picks from its discrete step table elsewhere.
        _ => return (0.0, 0),
    }

    // Avoid overflowing the command field.
    if downsampler > limits.max_downsampler as f64 {
        downsampler = limits.max_downsampler as f64;
    }

    (limits.base / downsampler / divider, downsampler as u32)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spec::{Model, ModelSpec};

    #[test]
    fn test_invalid_input() {
        let spec = ModelSpec::new(Model::Dso2090);
        assert_eq!(best_samplerate(&spec, 1, 0.0, false, false), (0.0, 0));
        assert_eq!(best_samplerate(&spec, 1, -1.0, false, false), (0.0, 0));
    }

    #[test]
    fn test_6022_has_no_solver_path() {
        let spec = ModelSpec::new(Model::Dso6022be);
        assert_eq!(best_samplerate(&spec, 1, 1e6, false, false), (0.0, 0));
    }

    #[test]
    fn test_max_rate_sentinel() {
        let spec = ModelSpec::new(Model::Dso2090);
        // Asking above what the base clock provides selects downsampler 0.
        let (rate, downsampler) = best_samplerate(&spec, 1, 1e8, false, false);
        assert_eq!(downsampler, 0);
        assert_eq!(rate, 50e6);
    }

    #[test]
    fn test_2090_snap_down_into_fast_ids() {
        let spec = ModelSpec::new(Model::Dso2090);
        // 33.3 MHz on the 50 MHz base gives d* = 1.5; rounding down within
        // {1, 2, 4, 5} picks 1, i.e. the full 50 MHz.
        let (rate, downsampler) = best_samplerate(&spec, 1, 33.3e6, false, false);
        assert_eq!(downsampler, 1);
        assert_eq!(rate, 50e6);
    }

    #[test]
    fn test_2090_never_returns_3_or_4() {
        let spec = ModelSpec::new(Model::Dso2090);
        for maximum in [false, true] {
            let mut target = 1e3;
            while target < 1e8 {
                let (_, downsampler) = best_samplerate(&spec, 1, target, false, maximum);
                assert_ne!(downsampler, 3, "target {} maximum {}", target, maximum);
                assert_ne!(downsampler, 4, "target {} maximum {}", target, maximum);
                if downsampler >= 6 {
                    assert_eq!(downsampler % 2, 0, "target {} maximum {}", target, maximum);
                }
                target *= 1.37;
            }
        }
    }

    #[test]
    fn test_2090_gap_jumps() {
        let spec = ModelSpec::new(Model::Dso2090);
        // d* = 50e6 / 16e6 = 3.125. Downward rounding falls back to 2,
        // upward rounding jumps to 5.
        let (rate, downsampler) = best_samplerate(&spec, 1, 16e6, false, false);
        assert_eq!(downsampler, 2);
        assert_eq!(rate, 25e6);
        let (rate, downsampler) = best_samplerate(&spec, 1, 16e6, false, true);
        assert_eq!(downsampler, 5);
        assert_eq!(rate, 10e6);
    }

    #[test]
    fn test_2090_even_rounding_above_5() {
        let spec = ModelSpec::new(Model::Dso2090);
        // d* = 50e6 / 7e6 = 7.14; even rounding gives 6 down, 8 up.
        let (rate, downsampler) = best_samplerate(&spec, 1, 7e6, false, false);
        assert_eq!(downsampler, 6);
        assert_eq!(rate, 50e6 / 6.0);
        let (_, downsampler) = best_samplerate(&spec, 1, 7e6, false, true);
        assert_eq!(downsampler, 8);
    }

    #[test]
    fn test_integer_rounding_families() {
        // 2250 and 5200 take any integer factor.
        for model in [Model::Dso2250, Model::Dso5200] {
            let spec = ModelSpec::new(model);
            let base = spec.samplerate.single.base;
            let target = base / 7.3;
            let (rate, downsampler) = best_samplerate(&spec, 1, target, false, false);
            assert_eq!(downsampler, 7);
            assert_eq!(rate, base / 7.0);
            let (rate, downsampler) = best_samplerate(&spec, 1, target, false, true);
            assert_eq!(downsampler, 8);
            assert_eq!(rate, base / 8.0);
        }
    }

    #[test]
    fn test_downsampler_clamped() {
        for model in [Model::Dso2090, Model::Dso2250, Model::Dso5200] {
            let spec = ModelSpec::new(model);
            for maximum in [false, true] {
                let (_, downsampler) = best_samplerate(&spec, 1, 1e-3, false, maximum);
                assert!(downsampler <= spec.samplerate.single.max_downsampler,
                        "{:?} exceeded its downsampler limit", model);
            }
        }
    }

    #[test]
    fn test_fast_rate_uses_multi_limits() {
        let spec = ModelSpec::new(Model::Dso2090);
        let (rate, downsampler) = best_samplerate(&spec, 1, 80e6, true, false);
        assert_eq!(downsampler, 1);
        assert_eq!(rate, 100e6);
    }

    #[test]
    fn test_buffer_divider_applies() {
        let spec = ModelSpec::new(Model::Dso2090);
        // Record length id 0 is roll mode with divider 1000.
        let (rate, downsampler) = best_samplerate(&spec, 0, 1e6, false, false);
        assert_eq!(downsampler, 0);
        assert_eq!(rate, 50e6 / 1000.0);
    }

    #[test]
    fn test_solution_is_nearest_not_below() {
        let spec = ModelSpec::new(Model::Dso2250);
        let (rate, _) = best_samplerate(&spec, 1, 3e7, false, false);
        // No realisable rate closer to the request from above.
        assert!(rate >= 3e7);
        let base = spec.samplerate.single.base;
        let next_down = base / (base / rate + 1.0);
        assert!(next_down < 3e7);
    }
}
