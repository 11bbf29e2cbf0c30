use ndarray::{s, Array1, ArrayView1};

use crate::math::{argmax, gamma_density, nearest_index};
use crate::moments::MIN_WINDOW;
use crate::{Error, Result};

/// Fraction of the series, counted from the end, averaged by the default baseline
const TAIL_FRACTION: f64 = 0.95;

/// A baseline corrected pulse and the amount which was removed from it
#[derive(Clone, Debug, PartialEq)]
pub struct BaselineCorrection {
    pub flux: Array1<f64>,
    pub amount: f64,
}

/// How the baseline of each pulse is estimated
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum BaselineMethod {
    /// Subtract a known amount
    Amount(f64),
    /// Subtract the mean flux between two times
    TimeRange(f64, f64),
    /// Subtract the mean flux over the last 5% of samples
    Tail,
    /// Fit the tail against a Gamma decay, see [`baseline_gamma`]
    #[default]
    Gamma,
}

impl BaselineMethod {
    /// Estimate and remove the baseline of one pulse
    ///
    /// # Errors
    /// Propagates failures of the underlying estimate.
    pub fn apply(self, flux: ArrayView1<f64>, times: ArrayView1<f64>) -> Result<BaselineCorrection> {
        match self {
            Self::Amount(amount) => baseline_correction(flux, times, None, Some(amount)),
            Self::TimeRange(a, b) => baseline_correction(flux, times, Some((a, b)), None),
            Self::Tail => baseline_correction(flux, times, None, None),
            Self::Gamma => baseline_gamma(flux, times),
        }
    }
}

/// Subtract a constant baseline from a pulse
///
/// With an explicit `amount` the flux is shifted directly. Otherwise the amount is the mean flux
/// between the samples nearest the two times of `time_range`, or over the last 5% of samples when
/// no range is given.
///
/// # Errors
/// Fails if `flux` and `times` differ in length or the averaging window is empty.
pub fn baseline_correction(
    flux: ArrayView1<f64>,
    times: ArrayView1<f64>,
    time_range: Option<(f64, f64)>,
    amount: Option<f64>,
) -> Result<BaselineCorrection> {
    if flux.len() != times.len() {
        return Err(Error::DimensionMismatch {
            expected: times.len(),
            found: flux.len(),
        });
    }
    let amount = match amount {
        Some(amount) => amount,
        None => {
            let (start, end) = time_range.map_or_else(
                || {
                    #[allow(
                        clippy::cast_possible_truncation,
                        clippy::cast_sign_loss,
                        clippy::cast_precision_loss
                    )]
                    let start = (times.len() as f64 * TAIL_FRACTION).floor() as usize;
                    (start, times.len())
                },
                |(a, b)| {
                    let (lower, upper) = if a <= b { (a, b) } else { (b, a) };
                    (nearest_index(times, lower), nearest_index(times, upper))
                },
            );
            flux.slice(s![start..end.max(start)])
                .mean()
                .ok_or_else(|| {
                    Error::DegenerateInput(format!(
                        "baseline window [{start}, {end}) holds no samples"
                    ))
                })?
        }
    };
    Ok(BaselineCorrection {
        flux: flux.mapv(|f| f - amount),
        amount,
    })
}

fn sign(value: f64) -> f64 {
    if value > 0. {
        1.
    } else if value < 0. {
        -1.
    } else {
        0.
    }
}

/// Automatic baseline estimate for pulses with a heavy tail
///
/// The tail is modelled by a Gamma density with shape 1.5 and a scale of twice the peak time. The
/// offset between the mean of the final samples and the minimum after the peak, less the modelled
/// tail at the final time, is removed from that minimum.
///
/// # Errors
/// Fails if the pulse holds fewer samples than the tail window.
pub fn baseline_gamma(flux: ArrayView1<f64>, times: ArrayView1<f64>) -> Result<BaselineCorrection> {
    let len = flux.len();
    if len != times.len() {
        return Err(Error::DimensionMismatch {
            expected: times.len(),
            found: len,
        });
    }
    if len < MIN_WINDOW {
        return Err(Error::DegenerateInput(format!(
            "automatic baselines need at least {MIN_WINDOW} samples, found {len}"
        )));
    }

    // a peak on the first sample is noise
    let peak = match argmax(flux) {
        0 => 5,
        peak => peak,
    };
    let peak_time = times[peak];
    let flux_min = flux
        .slice(s![peak..])
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min);
    let tail_mean = flux.slice(s![len - MIN_WINDOW..]).mean().unwrap_or(f64::NAN);
    let tail_gamma = gamma_density(times[len - 1], 1.5, 2. * peak_time);

    let offset = (tail_mean - flux_min) - tail_gamma;
    let amount = flux_min - sign(flux_min) * offset.abs();

    Ok(BaselineCorrection {
        flux: flux.mapv(|f| f - amount),
        amount,
    })
}
