use std::f64::consts::PI;

use argmin::core::observers::{ObserverMode, SlogLogger};
use argmin::core::{CostFunction, Executor, State};
use argmin::solver::brent::BrentOpt;
use log::debug;
use ndarray::{concatenate, s, Array1, ArrayView1, Axis};

use crate::math::{interp, outer_product, trapezoidal_integral};
use crate::{Error, Result};

/// Number of terms after the leading one kept in the eigenfunction series
const SERIES_TERMS: u32 = 100;

/// Rescale a pulse to appear as if measured for a gas of `new_mass`
///
/// Diffusive time scales go as the square root of the mass. A lighter gas is compressed onto a
/// uniform grid over the first `len / c` samples (with `c = sqrt(current / new)`) and keeps the
/// original tail, while a heavier gas is stretched by sampling at `c * t`. The result is
/// rescaled to the original area. Negative pulses are shifted to be non-negative for the
/// transformation and shifted back afterwards.
///
/// # Errors
/// Fails if either mass is not positive or the inputs differ in length.
pub fn grahams_law(
    flux: ArrayView1<f64>,
    times: ArrayView1<f64>,
    current_mass: f64,
    new_mass: f64,
) -> Result<Array1<f64>> {
    if !(current_mass > 0. && new_mass > 0.) {
        return Err(Error::DegenerateInput(format!(
            "masses must be positive, found {current_mass} and {new_mass}"
        )));
    }
    if flux.len() != times.len() {
        return Err(Error::DimensionMismatch {
            expected: times.len(),
            found: flux.len(),
        });
    }
    let len = times.len();
    if len == 0 {
        return Ok(Array1::zeros(0));
    }

    let constant = (current_mass / new_mass).sqrt();
    let min_time = times.iter().copied().fold(f64::INFINITY, f64::min);
    let max_time = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min_flux = flux.iter().copied().fold(f64::INFINITY, f64::min);
    let shift = if min_flux < 0. { min_flux } else { 0. };
    let shifted = flux.mapv(|f| f - shift);
    let original_m0 = trapezoidal_integral(shifted.view(), times);

    let rescaled = if constant >= 1. {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let stop = ((len as f64 / constant).round() as usize).min(len);
        let grid = Array1::linspace(min_time, max_time, stop);
        let head = interp(grid.view(), times, shifted.view());
        concatenate(Axis(0), &[head.view(), shifted.slice(s![stop..])])?
    } else {
        interp(times.mapv(|t| t * constant).view(), times, shifted.view())
    };

    let area = trapezoidal_integral(rescaled.view(), times);
    Ok(rescaled.mapv(|f| {
        let value = f / area * original_m0;
        if value.is_finite() {
            value + shift
        } else {
            shift
        }
    }))
}

/// Closed-form outlet flux of pure Knudsen diffusion through an inert bed
///
/// `flux(t) = pi / (2 tau) * sum_j (-1)^j (2j + 1) exp(-pi^2 (j + 1/2)^2 t / (2 tau))` for
/// `j = 0..=100`. Times are shifted to start at zero and the first sample is fixed at zero.
///
/// # Examples
///
/// ```
/// use ndarray::Array1;
/// use tap_pulse::diffusion::standard_diffusion_curve;
///
/// let times = Array1::linspace(0., 3., 3001);
/// let flux = standard_diffusion_curve(0.5, times.view()).unwrap();
/// assert_eq!(flux[0], 0.);
/// ```
///
/// # Errors
/// Fails if `residence_time` is not positive.
pub fn standard_diffusion_curve(residence_time: f64, times: ArrayView1<f64>) -> Result<Array1<f64>> {
    if !(residence_time > 0.) {
        return Err(Error::DegenerateInput(format!(
            "residence time must be positive, found {residence_time}"
        )));
    }
    if times.is_empty() {
        return Ok(Array1::zeros(0));
    }
    let start = times.iter().copied().fold(f64::INFINITY, f64::min);
    let shifted = times.slice(s![1..]).mapv(|t| t - start);

    let terms = Array1::from_iter((0..=SERIES_TERMS).map(f64::from));
    let weights = terms.mapv(|j| if j % 2. == 0. { 2. * j + 1. } else { -(2. * j + 1.) });
    let exponents = terms.mapv(|j| -0.5 * PI.powi(2) * (j + 0.5).powi(2) / residence_time);

    let series = weights.dot(&outer_product(&exponents, &shifted)?.mapv(f64::exp));
    let flux = series * (PI / (2. * residence_time));
    Ok(concatenate(Axis(0), &[Array1::zeros(1).view(), flux.view()])?)
}

/// Options of the standard diffusion curve fit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptSdcOptions {
    pub max_iters: u64,
    /// Attach a terminal observer to the optimiser
    pub verbose: bool,
}

impl Default for OptSdcOptions {
    fn default() -> Self {
        Self {
            max_iters: 100,
            verbose: false,
        }
    }
}

/// A fitted standard diffusion curve
#[derive(Clone, Debug, PartialEq)]
pub struct SdcFit {
    pub flux: Array1<f64>,
    pub residence_time: f64,
}

struct PeakMismatch<'a> {
    flux_max: f64,
    times: ArrayView1<'a, f64>,
}

impl CostFunction for PeakMismatch<'_> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> ::std::result::Result<Self::Output, argmin::core::Error> {
        let curve = standard_diffusion_curve(*p, self.times)?;
        let curve_max = curve.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Ok((self.flux_max - curve_max).abs())
    }
}

/// Fit the residence time of a standard diffusion curve to the peak height of `flux`
///
/// The residence time is searched between three sample intervals and ten times the time span,
/// starting the search from `residence_time`.
///
/// # Errors
/// Fails if the time axis holds fewer than two samples or the search fails.
pub fn opt_sdc(
    residence_time: f64,
    flux: ArrayView1<f64>,
    times: ArrayView1<f64>,
    options: &OptSdcOptions,
) -> Result<SdcFit> {
    if times.len() < 2 {
        return Err(Error::DegenerateInput(
            "fitting a diffusion curve needs at least two samples".into(),
        ));
    }
    let span = times[times.len() - 1] - times[0];
    let lower = 3. * (times[1] - times[0]);
    let upper = 10. * span;

    let problem = PeakMismatch {
        flux_max: flux.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        times,
    };
    let solver = BrentOpt::new(lower, upper);
    let initial = residence_time.clamp(lower, upper);

    let mut executor = Executor::new(problem, solver)
        .configure(|state| state.param(initial).max_iters(options.max_iters));
    if options.verbose {
        executor = executor.add_observer(SlogLogger::term(), ObserverMode::Always);
    }
    let res = executor.run().map_err(|e| Error::solver(&e))?;

    let mut state = res.state().clone();
    let residence_time = state
        .take_best_param()
        .ok_or_else(|| Error::SolverFailure("brent search returned no residence time".into()))?;
    debug!(
        "fitted residence time {residence_time} with peak mismatch {:e}",
        state.get_best_cost()
    );

    Ok(SdcFit {
        flux: standard_diffusion_curve(residence_time, times)?,
        residence_time,
    })
}

#[cfg(test)]
mod tests {
    use ndarray::Array1;
    use proptest::prelude::*;

    use super::{grahams_law, opt_sdc, standard_diffusion_curve, OptSdcOptions};
    use crate::math::trapezoidal_integral;

    fn times() -> Array1<f64> {
        Array1::from_iter((0..3000).map(|ii| f64::from(ii) * 0.001))
    }

    fn peak(flux: &Array1<f64>) -> f64 {
        flux.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    #[test]
    fn standard_curve_is_a_normalised_pulse() {
        let times = times();
        let flux = standard_diffusion_curve(0.5, times.view()).unwrap();

        assert_eq!(flux.len(), times.len());
        assert_eq!(flux[0], 0.);
        approx::assert_relative_eq!(
            trapezoidal_integral(flux.view(), times.view()),
            1.,
            max_relative = 1e-3
        );
        // the dimensionless peak sits at 1 / 6 of 2 tau
        let peak_index = crate::math::argmax(flux.view());
        approx::assert_abs_diff_eq!(times[peak_index], 1. / 6., epsilon = 2e-3);
    }

    #[test]
    fn standard_curve_ignores_the_time_origin() {
        let times = times();
        let later = &times + 2.;
        let at_zero = standard_diffusion_curve(0.5, times.view()).unwrap();
        let at_two = standard_diffusion_curve(0.5, later.view()).unwrap();
        for (a, b) in at_zero.iter().zip(at_two.iter()) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn non_positive_residence_times_are_rejected() {
        assert!(standard_diffusion_curve(0., times().view()).is_err());
    }

    #[test]
    fn lighter_gases_are_compressed_and_heavier_gases_stretched() {
        let times = times();
        let inert = standard_diffusion_curve(0.5, times.view()).unwrap();

        let lighter = grahams_law(inert.view(), times.view(), 40., 20.).unwrap();
        let heavier = grahams_law(inert.view(), times.view(), 40., 60.).unwrap();

        approx::assert_relative_eq!(peak(&lighter), peak(&inert) * 2f64.sqrt(), max_relative = 1e-2);
        approx::assert_relative_eq!(
            peak(&heavier),
            peak(&inert) * (40f64 / 60.).sqrt(),
            max_relative = 1e-2
        );
        assert_eq!(lighter.len(), inert.len());
        assert_eq!(heavier.len(), inert.len());
    }

    #[test]
    fn unchanged_mass_is_the_identity() {
        let times = times();
        let inert = standard_diffusion_curve(0.5, times.view()).unwrap();
        let same = grahams_law(inert.view(), times.view(), 40., 40.).unwrap();
        for (a, b) in same.iter().zip(inert.iter()) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn residence_time_is_recovered_from_the_peak() {
        let times = times();
        let inert = standard_diffusion_curve(0.5, times.view()).unwrap();

        let fit = opt_sdc(0.3, inert.view(), times.view(), &OptSdcOptions::default()).unwrap();

        approx::assert_abs_diff_eq!(fit.residence_time, 0.5, epsilon = 1e-3);
        approx::assert_relative_eq!(peak(&fit.flux), peak(&inert), max_relative = 1e-3);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn grahams_law_preserves_area(
            current_mass in 2.0f64..100.0,
            new_mass in 2.0f64..100.0,
            offset in -0.1f64..0.1,
        ) {
            let times = times();
            let flux = standard_diffusion_curve(0.5, times.view()).unwrap() + offset;
            let rescaled = grahams_law(flux.view(), times.view(), current_mass, new_mass).unwrap();

            let shift = offset.min(0.);
            let original = trapezoidal_integral(flux.mapv(|f| f - shift).view(), times.view());
            let transformed =
                trapezoidal_integral(rescaled.mapv(|f| f - shift).view(), times.view());
            prop_assert!((original - transformed).abs() <= 1e-9 * original.abs().max(1.));
        }
    }
}
