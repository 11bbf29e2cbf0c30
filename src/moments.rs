use ndarray::{s, Array1, ArrayView1, Zip};

use crate::calibration::{tap_mix_series, TapMixOptions};
use crate::diffusion::grahams_law;
use crate::math::{nearest_index, trapezoidal_integral};
use crate::reactor::ZoneMap;
use crate::summary::{Field, SummaryTable};
use crate::{Error, Result};

/// Fewest samples an automatically detected integration window may span
pub const MIN_WINDOW: usize = 30;

/// The zeroth, first and second moment of a pulse
///
/// The column-wise form `Moments<Array1<f64>>` holds one entry per pulse.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Moments<T = f64> {
    pub m0: T,
    pub m1: T,
    pub m2: T,
}

impl Moments {
    /// First moment normalised by the area
    pub fn normalised_mean(&self) -> f64 {
        self.m1 / self.m0
    }

    /// Divide each moment by a reference area (usually the inert M0)
    pub fn normalise_by(&self, m0: f64) -> Self {
        Self {
            m0: self.m0 / m0,
            m1: self.m1 / m0,
            m2: self.m2 / m0,
        }
    }
}

impl Moments<Array1<f64>> {
    /// Gather the moment columns of a species
    ///
    /// # Errors
    /// Fails with [`Error::MissingSummary`] if the moments have not been computed.
    pub fn from_summary(summary: &SummaryTable, species: &str) -> Result<Self> {
        Ok(Self {
            m0: summary.require(Field::M0, species)?.to_owned(),
            m1: summary.require(Field::M1, species)?.to_owned(),
            m2: summary.require(Field::M2, species)?.to_owned(),
        })
    }

    pub fn len(&self) -> usize {
        self.m0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.m0.is_empty()
    }

    /// The moments of a single pulse
    pub fn pulse(&self, pulse: usize) -> Moments {
        Moments {
            m0: self.m0[pulse],
            m1: self.m1[pulse],
            m2: self.m2[pulse],
        }
    }
}

/// How the integration window of a pulse is chosen
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IntegrationWindow {
    /// Integrate over every sample
    Full,
    /// Integrate between the samples closest to the two times, in either order
    Range(f64, f64),
    /// Detect the support of the pulse from its sign changes around the peak
    Auto,
}

/// Residence time distribution parameters, assuming a Gamma distributed residence time
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResidenceTimeParameters {
    pub mean: f64,
    pub variance: f64,
    pub gamma_shape: f64,
    pub gamma_scale: f64,
}

/// Summary statistics of a single pulse
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MinMeanMax {
    pub min: f64,
    pub mean: f64,
    pub max: f64,
}

/// Kinetic order assumed when linearising the Damkohler series
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReactionOrder {
    #[default]
    First,
    Second,
}

impl ReactionOrder {
    /// The regressor which is linear in the pulse number for this order
    fn linearise(self, damkohler: f64) -> f64 {
        match self {
            Self::First => -damkohler - damkohler.ln(),
            Self::Second => {
                let root = damkohler.sqrt();
                1. / root - root - 1.
            }
        }
    }
}

/// Active-site estimate from a train of pulses
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveSites {
    /// `conversion / (1 - conversion)` per pulse
    pub damkohler: Array1<f64>,
    /// Fitted pulse number per pulse
    pub fitted: Array1<f64>,
    pub active_sites: f64,
}

/// Locate the support of a pulse as a half-open sample range
///
/// The peak is floored at sample [`MIN_WINDOW`] so early noise spikes are ignored. The window
/// starts at the last sample before the peak below `min_value` and ends at the first such sample
/// after it, and is widened to [`MIN_WINDOW`] samples when narrower.
///
/// # Errors
/// Fails if the series is too short to hold a window.
pub fn find_integration_index(flux: ArrayView1<f64>, min_value: f64) -> Result<(usize, usize)> {
    let len = flux.len();
    if len <= MIN_WINDOW {
        return Err(Error::DegenerateInput(format!(
            "automatic integration windows need more than {MIN_WINDOW} samples, found {len}"
        )));
    }
    let peak = crate::math::argmax(flux).max(MIN_WINDOW);

    let start = flux
        .slice(s![..peak])
        .iter()
        .rposition(|&value| value < min_value)
        .unwrap_or(0);
    let mut end = flux
        .slice(s![peak + 1..])
        .iter()
        .position(|&value| value < min_value)
        .map_or(len, |offset| offset + peak);

    let mut start = start;
    if end.saturating_sub(start) < MIN_WINDOW {
        if start < MIN_WINDOW || end <= len - MIN_WINDOW {
            end = start + MIN_WINDOW;
        } else {
            start = end - MIN_WINDOW;
        }
    }
    Ok((start, end.min(len)))
}

/// The start and end time of the automatically detected integration window
///
/// # Errors
/// Fails if the series is too short to hold a window.
pub fn find_integration_time(
    flux: ArrayView1<f64>,
    times: ArrayView1<f64>,
    min_value: f64,
) -> Result<[f64; 2]> {
    let (start, end) = find_integration_index(flux, min_value)?;
    Ok([times[start], times[end - 1]])
}

fn window_indices(
    flux: ArrayView1<f64>,
    times: ArrayView1<f64>,
    window: IntegrationWindow,
) -> Result<(usize, usize)> {
    match window {
        IntegrationWindow::Full => Ok((0, times.len())),
        IntegrationWindow::Range(a, b) => {
            let (lower, upper) = if a <= b { (a, b) } else { (b, a) };
            Ok((nearest_index(times, lower), nearest_index(times, upper)))
        }
        IntegrationWindow::Auto => {
            let [first, last] = find_integration_time(flux, times, 0.)?;
            Ok((nearest_index(times, first), nearest_index(times, last)))
        }
    }
}

/// Compute the zeroth, first and second moment of a pulse by trapezoidal integration
///
/// The windowed flux is integrated against the leading samples of `times`, so the window start
/// becomes the time origin.
///
/// # Errors
/// Fails if `flux` and `times` differ in length, or if the window holds fewer than two samples.
pub fn moments(
    flux: ArrayView1<f64>,
    times: ArrayView1<f64>,
    window: IntegrationWindow,
) -> Result<Moments> {
    if flux.len() != times.len() {
        return Err(Error::DimensionMismatch {
            expected: times.len(),
            found: flux.len(),
        });
    }
    let (start, end) = window_indices(flux, times, window)?;
    if end < start + 2 {
        return Err(Error::DegenerateInput(format!(
            "integration window [{start}, {end}) holds fewer than two samples"
        )));
    }

    let sub_flux = flux.slice(s![start..end]);
    let sub_times = times.slice(s![..end - start]);

    let first = &sub_flux * &sub_times;
    let second = &first * &sub_times;

    Ok(Moments {
        m0: trapezoidal_integral(sub_flux, sub_times),
        m1: trapezoidal_integral(first.view(), sub_times),
        m2: trapezoidal_integral(second.view(), sub_times),
    })
}

/// Residence time distribution parameters from moments
///
/// Nothing is guarded: a non-positive variance yields non-finite shape and scale, which callers
/// must check for.
pub fn rtd_parameters(moments: &Moments) -> ResidenceTimeParameters {
    let mean = moments.m1 / moments.m0;
    let variance = moments.m2 / moments.m0 - mean.powi(2);
    ResidenceTimeParameters {
        mean,
        variance,
        gamma_shape: mean.powi(2) / variance,
        gamma_scale: mean / variance,
    }
}

/// Gas diffusion coefficient implied by the moments of an inert pulse
///
/// `masses` holds the `(current, new)` mass pair. When given, the diffusion is scaled by
/// `sqrt(new / current)`.
pub fn diffusion_moments(
    moments: &Moments,
    zone_lengths: &ZoneMap<f64>,
    zone_porosity: &ZoneMap<f64>,
    masses: Option<(f64, f64)>,
) -> f64 {
    let diffusion =
        zone_porosity.mean() * zone_lengths.sum().powi(2) * moments.m0 / (2. * moments.m1);
    masses.map_or(diffusion, |(current, new)| diffusion * (new / current).sqrt())
}

pub fn min_mean_max(flux: ArrayView1<f64>) -> MinMeanMax {
    MinMeanMax {
        min: flux.iter().copied().fold(f64::INFINITY, f64::min),
        mean: flux.mean().unwrap_or(f64::NAN),
        max: flux.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    }
}

/// Whether a species adsorbs reversibly
///
/// The inert is rescaled to the mass of the species with Graham's law. The species is
/// irreversible only if its normalised first moment is strictly below that of the rescaled inert.
///
/// # Errors
/// Propagates failures of the rescaling or the moment computation.
pub fn isreversible(
    flux: ArrayView1<f64>,
    times: ArrayView1<f64>,
    inert_flux: ArrayView1<f64>,
    flux_mass: f64,
    inert_mass: f64,
) -> Result<bool> {
    let rescaled_inert = grahams_law(inert_flux, times, inert_mass, flux_mass)?;
    let flux_moments = moments(flux, times, IntegrationWindow::Full)?;
    let inert_moments = moments(rescaled_inert.view(), times, IntegrationWindow::Full)?;
    Ok(flux_moments.normalised_mean() >= inert_moments.normalised_mean())
}

/// Estimate the number of active sites from the titration of a catalyst over a pulse train
///
/// The conversion of each pulse is `1 - flux_m0 / inert_m0`. The linearised Damkohler number of
/// each pulse is regressed against the pulse number, both centred, with an unconstrained
/// [`tap_mix`](crate::calibration::tap_mix) fit. The active sites are
/// `stoichiometric_coef * slope * sqrt(mean(pulse) - mean(regressor))`.
///
/// # Errors
/// Fails if the zeroth moments differ in length, hold fewer than two pulses or give a conversion
/// outside `(0, 1)`, and if the regression fails.
pub fn active_sites_by_pulse(
    flux_m0: ArrayView1<f64>,
    inert_m0: ArrayView1<f64>,
    stoichiometric_coef: f64,
    order: ReactionOrder,
    huber_loss: bool,
) -> Result<ActiveSites> {
    if flux_m0.len() != inert_m0.len() {
        return Err(Error::DimensionMismatch {
            expected: inert_m0.len(),
            found: flux_m0.len(),
        });
    }
    let num_pulses = flux_m0.len();
    if num_pulses < 2 {
        return Err(Error::DegenerateInput(format!(
            "an active-site regression needs at least two pulses, found {num_pulses}"
        )));
    }

    let damkohler = Zip::from(&flux_m0)
        .and(&inert_m0)
        .map_collect(|&flux, &inert| {
            let conversion = 1. - flux / inert;
            conversion / (1. - conversion)
        });
    if let Some(pulse) = damkohler.iter().position(|da| !(da.is_finite() && *da > 0.)) {
        return Err(Error::DegenerateInput(format!(
            "pulse {pulse} has Damkohler number {}, conversions must lie in (0, 1)",
            damkohler[pulse]
        )));
    }

    #[allow(clippy::cast_precision_loss)]
    let pulse_number = Array1::from_iter((1..=num_pulses).map(|pulse| pulse as f64));
    let regressor = damkohler.mapv(|da| order.linearise(da));
    let pulse_mean = pulse_number.mean().unwrap_or(f64::NAN);
    let regressor_mean = regressor.mean().unwrap_or(f64::NAN);
    let intercept = pulse_mean - regressor_mean;

    let centred_pulse = &pulse_number - pulse_mean;
    let centred_regressor = &regressor - regressor_mean;
    let fit = tap_mix_series(
        centred_regressor.view(),
        centred_pulse.view(),
        pulse_number.view(),
        &TapMixOptions {
            huber_loss,
            constraints: false,
            fit_intercept: true,
            noise_shortcut: false,
        },
    )?;

    Ok(ActiveSites {
        fitted: fit.flux + intercept,
        active_sites: stoichiometric_coef * fit.calibration_coef * intercept.sqrt(),
        damkohler,
    })
}
