use log::{debug, warn};
use ndarray::{concatenate, s, Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::math::{mad, median, trapezoidal_integral};
use crate::minimisation::{LinearConstraints, Loss, PenalisedProblem, Problem, HUBER_THRESHOLD};
use crate::moments::isreversible;
use crate::{Error, Result};

/// Smallest integrated residual allowed by the mass balance constraint
const MASS_BALANCE_EPSILON: f64 = 1e-5;
/// Multiple of the median absolute deviation above the median which a real pulse must exceed
const NOISE_CEILING_MADS: f64 = 6.;

/// A calibrated pulse with the fitted transformation
#[derive(Clone, Debug, PartialEq)]
pub struct Calibration {
    pub flux: Array1<f64>,
    pub calibration_coef: f64,
    pub intercept: f64,
    /// Every fitted coefficient, intercept first when one was fitted
    pub all_coefs: Vec<f64>,
}

/// Knobs of the constrained mixture fit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TapMixOptions {
    /// Use the robust Huber loss instead of squared error
    pub huber_loss: bool,
    /// Enforce non-negative coefficients, mass balance and the residual floor
    pub constraints: bool,
    pub fit_intercept: bool,
    /// Return a single regressor unscaled when its maximum sits inside the noise ceiling
    pub noise_shortcut: bool,
}

impl Default for TapMixOptions {
    fn default() -> Self {
        Self {
            huber_loss: false,
            constraints: true,
            fit_intercept: true,
            noise_shortcut: true,
        }
    }
}

/// Knobs of the penalised fallback fit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TapMixOptOptions {
    pub max_iters: u64,
    /// Attach a terminal observer to the optimiser
    pub verbose: bool,
}

impl Default for TapMixOptOptions {
    fn default() -> Self {
        Self {
            max_iters: 500,
            verbose: false,
        }
    }
}

/// Result of the penalised fallback fit
#[derive(Clone, Debug, PartialEq)]
pub struct MixFit {
    pub flux: Array1<f64>,
    pub coefs: Vec<f64>,
}

/// Scale a pulse by a known coefficient
pub fn calibration_coef(flux: ArrayView1<f64>, amount: f64) -> Calibration {
    Calibration {
        flux: flux.mapv(|f| f * amount),
        calibration_coef: amount,
        intercept: 0.,
        all_coefs: vec![amount],
    }
}

fn check_lengths(rows: usize, y: ArrayView1<f64>, times: Option<ArrayView1<f64>>) -> Result<()> {
    if rows != y.len() {
        return Err(Error::DimensionMismatch {
            expected: y.len(),
            found: rows,
        });
    }
    if let Some(times) = times {
        if times.len() != y.len() {
            return Err(Error::DimensionMismatch {
                expected: y.len(),
                found: times.len(),
            });
        }
    }
    Ok(())
}

/// Fit `y ~ intercept + x . coefs` by constrained least squares
///
/// Each column of `x` is one regressor. When `x` holds a single column whose maximum sits below
/// `median + 6 MAD`, the column is taken to be noise and returned unscaled, unless
/// [`TapMixOptions::noise_shortcut`] is off.
///
/// The constraints, when enabled, are: every non-intercept coefficient is non-negative; the
/// residuals integrate to at least `1e-5`; every residual is at least twice the minimum of `y`.
///
/// # Errors
/// Fails with [`Error::SolverFailure`] if the constraints admit no solution, and with
/// [`Error::DimensionMismatch`] if the inputs disagree in length.
pub fn tap_mix(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    times: ArrayView1<f64>,
    options: &TapMixOptions,
) -> Result<Calibration> {
    check_lengths(x.nrows(), y, Some(times))?;
    if times.len() < 2 {
        return Err(Error::DegenerateInput(
            "a mixture fit needs at least two samples".into(),
        ));
    }

    if options.noise_shortcut && x.ncols() == 1 {
        let column = x.column(0);
        let ceiling = median(column) + NOISE_CEILING_MADS * mad(column);
        let max = column.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max < ceiling {
            warn!("flux maximum {max:e} is below the noise ceiling {ceiling:e}, leaving it unscaled");
            return Ok(Calibration {
                flux: column.to_owned(),
                calibration_coef: 1.,
                intercept: 0.,
                all_coefs: vec![],
            });
        }
    }

    let matrix = if options.fit_intercept {
        let ones = Array2::ones((x.nrows(), 1));
        concatenate(Axis(1), &[ones.view(), x.view()])?
    } else {
        x.to_owned()
    };
    let loss = if options.huber_loss {
        Loss::Huber(HUBER_THRESHOLD)
    } else {
        Loss::Squares
    };
    let offset = usize::from(options.fit_intercept);

    let problem = Problem::new(matrix.clone(), y.to_owned(), loss)?;
    let coefs = if options.constraints {
        let constraints = physical_constraints(&matrix, y, times[1] - times[0], offset)?;
        problem.fit_constrained(&constraints)?
    } else {
        problem.fit()?
    };
    debug!("mixture coefficients {coefs}");

    Ok(Calibration {
        flux: matrix.dot(&coefs),
        calibration_coef: coefs.get(offset).copied().unwrap_or(f64::NAN),
        intercept: if options.fit_intercept { coefs[0] } else { 0. },
        all_coefs: coefs.to_vec(),
    })
}

/// Convenience form of [`tap_mix`] for a single regressor
///
/// # Errors
/// See [`tap_mix`].
pub fn tap_mix_series(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    times: ArrayView1<f64>,
    options: &TapMixOptions,
) -> Result<Calibration> {
    tap_mix(x.insert_axis(Axis(1)), y, times, options)
}

/// Assemble `G . coefs <= h` for the physical constraints of a mixture fit
///
/// `offset` columns at the front of `matrix` (the intercept) are left unconstrained in sign.
fn physical_constraints(
    matrix: &Array2<f64>,
    y: ArrayView1<f64>,
    time_step: f64,
    offset: usize,
) -> Result<LinearConstraints> {
    let num_params = matrix.ncols();
    let num_signed = num_params - offset;
    let min_y = y.iter().copied().fold(f64::INFINITY, f64::min);

    let mut sign = Array2::zeros((num_signed, num_params));
    for jj in 0..num_signed {
        sign[[jj, jj + offset]] = -1.;
    }
    let mass_balance = (matrix.sum_axis(Axis(0)) * time_step).insert_axis(Axis(0));

    let rows = concatenate(Axis(0), &[sign.view(), mass_balance.view(), matrix.view()])?;
    let bounds = concatenate(
        Axis(0),
        &[
            Array1::zeros(num_signed).view(),
            Array1::from_elem(1, y.sum() * time_step - MASS_BALANCE_EPSILON).view(),
            y.mapv(|value| value - 2. * min_y).view(),
        ],
    )?;
    LinearConstraints::new(rows, bounds)
}

/// Bounded fit of `y ~ x . coefs` with the physical constraints enforced by a penalty
///
/// Each coefficient is bounded to `[0, max(max(y) / max(x_j), 1e-5)]` and the search starts from
/// the middle of the bounds. No intercept is fitted. This is an alternative to [`tap_mix`] when the
/// constrained fit fails, not an automatic retry.
///
/// # Errors
/// Fails with [`Error::DegenerateInput`] when `y` or a column of `x` has no positive finite
/// maximum, and propagates optimiser failures as [`Error::SolverFailure`].
pub fn tap_mix_opt(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    options: &TapMixOptOptions,
) -> Result<MixFit> {
    check_lengths(x.nrows(), y, None)?;
    let max_y = positive_max(y, "observed pulse")?;
    let upper = x
        .axis_iter(Axis(1))
        .enumerate()
        .map(|(jj, column)| {
            let max_x = positive_max(column, &format!("regressor {jj}"))?;
            Ok((max_y / max_x).max(1e-5))
        })
        .collect::<Result<Array1<f64>>>()?;

    let problem = PenalisedProblem::new(x.to_owned(), y.to_owned(), upper)?;
    let coefs = problem.solve(options.max_iters, options.verbose)?;

    Ok(MixFit {
        flux: x.dot(&coefs),
        coefs: coefs.to_vec(),
    })
}

fn positive_max(values: ArrayView1<f64>, label: &str) -> Result<f64> {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max > 0. && max.is_finite() {
        Ok(max)
    } else {
        Err(Error::DegenerateInput(format!(
            "{label} has maximum {max}, the coefficient bound needs a positive finite maximum"
        )))
    }
}

/// Calibrate a pulse against the inert pulse of the same shot
///
/// Irreversible species are scaled by the ratio of the inert area to their own. Reversible species
/// are fitted against the inert with [`tap_mix`].
///
/// # Errors
/// Fails if the pulse has no area, or if the reversibility test or mixture fit fail.
pub fn calibration_teak(
    flux: ArrayView1<f64>,
    inert_flux: ArrayView1<f64>,
    times: ArrayView1<f64>,
    flux_mass: f64,
    inert_mass: f64,
    options: &TapMixOptions,
) -> Result<Calibration> {
    if isreversible(flux, times, inert_flux, flux_mass, inert_mass)? {
        return tap_mix_series(flux, inert_flux, times, options);
    }

    let inert_area = trapezoidal_integral(inert_flux, times);
    let flux_area = trapezoidal_integral(flux, times);
    if flux_area == 0. || !flux_area.is_finite() {
        return Err(Error::DegenerateInput(format!(
            "cannot scale a pulse with area {flux_area}"
        )));
    }
    Ok(calibration_coef(flux, inert_area / flux_area))
}

#[cfg(test)]
mod tests {
    use ndarray::{Array, Array1, Array2, ArrayView1, Axis};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand_isaac::Isaac64Rng;

    use super::{
        calibration_coef, calibration_teak, tap_mix, tap_mix_opt, tap_mix_series,
        TapMixOptOptions, TapMixOptions,
    };
    use crate::diffusion::standard_diffusion_curve;
    use crate::math::trapezoidal_integral;
    use crate::Error;

    fn times() -> Array1<f64> {
        Array1::from_iter((0..3000).map(|ii| f64::from(ii) * 0.001))
    }

    // The mass balance constraint integrates residuals over the first time step
    fn integrated_residual(fitted: ArrayView1<f64>, y: ArrayView1<f64>, time_step: f64) -> f64 {
        (&y - &fitted).sum() * time_step
    }

    #[test]
    fn fixed_coefficients_scale_the_flux() {
        let flux = Array1::linspace(0., 1., 10);
        let calibrated = calibration_coef(flux.view(), 3.);
        approx::assert_relative_eq!(calibrated.flux[9], 3.);
        approx::assert_relative_eq!(calibrated.intercept, 0.);
    }

    #[test]
    fn mixture_fit_recovers_the_scale_between_pulses() {
        let times = times();
        let inert = standard_diffusion_curve(0.5, times.view()).unwrap();
        let doubled = &inert * 2.;

        let result = tap_mix_series(
            doubled.view(),
            inert.view(),
            times.view(),
            &TapMixOptions::default(),
        )
        .unwrap();

        approx::assert_abs_diff_eq!(result.calibration_coef, 0.5, epsilon = 1e-3);
        approx::assert_abs_diff_eq!(result.intercept, 0., epsilon = 1e-3);
        assert_eq!(result.all_coefs.len(), 2);
    }

    #[test]
    fn mixture_fit_honours_the_physical_constraints() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let times = times();
        let inert = standard_diffusion_curve(0.5, times.view()).unwrap();
        let noise = Array::random_using(times.len(), Uniform::new(-0.01, 0.01), &mut rng);
        let noisy = &inert * 1.5 + &noise;

        for huber_loss in [false, true] {
            let options = TapMixOptions {
                huber_loss,
                ..TapMixOptions::default()
            };
            let result =
                tap_mix_series(noisy.view(), inert.view(), times.view(), &options).unwrap();

            let min_y = inert.iter().copied().fold(f64::INFINITY, f64::min);
            assert!(result.calibration_coef >= 0.);
            assert!(
                integrated_residual(result.flux.view(), inert.view(), times[1] - times[0])
                    >= 1e-5 - 1e-9
            );
            for (fitted, observed) in result.flux.iter().zip(inert.iter()) {
                assert!(observed - fitted >= 2. * min_y - 1e-9);
            }
            approx::assert_abs_diff_eq!(result.calibration_coef, 1. / 1.5, epsilon = 2e-2);
        }
    }

    #[test]
    fn noise_is_left_unscaled() {
        let seed = 41;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let times = times();
        let inert = standard_diffusion_curve(0.5, times.view()).unwrap();
        let noise = Array::random_using(times.len(), Uniform::new(-0.01, 0.01), &mut rng);

        let result = tap_mix_series(
            noise.view(),
            inert.view(),
            times.view(),
            &TapMixOptions::default(),
        )
        .unwrap();

        assert_eq!(result.flux, noise);
        approx::assert_relative_eq!(result.calibration_coef, 1.);
        assert!(result.all_coefs.is_empty());
    }

    #[test]
    fn unconstrained_fit_without_intercept() {
        let times = times();
        let inert = standard_diffusion_curve(0.5, times.view()).unwrap();
        let doubled = &inert * 2.;
        let options = TapMixOptions {
            constraints: false,
            fit_intercept: false,
            ..TapMixOptions::default()
        };

        let result = tap_mix(
            doubled.view().insert_axis(ndarray::Axis(1)),
            inert.view(),
            times.view(),
            &options,
        )
        .unwrap();

        approx::assert_relative_eq!(result.calibration_coef, 0.5, max_relative = 1e-8);
        approx::assert_relative_eq!(result.intercept, 0.);
    }

    #[test]
    fn penalised_fallback_recovers_the_scale() {
        let times = times();
        let inert = standard_diffusion_curve(0.5, times.view()).unwrap();
        let doubled = &inert * 2.;

        let result = tap_mix_opt(
            doubled.view().insert_axis(ndarray::Axis(1)),
            inert.view(),
            &TapMixOptOptions::default(),
        )
        .unwrap();

        approx::assert_abs_diff_eq!(result.coefs[0], 0.5, epsilon = 1e-3);
    }

    #[test]
    fn penalised_fallback_rejects_flat_regressors() {
        let times = times();
        let inert = standard_diffusion_curve(0.5, times.view()).unwrap();
        let mut x = Array2::zeros((times.len(), 2));
        x.column_mut(0).assign(&(&inert * 2.));

        let result = tap_mix_opt(x.view(), inert.view(), &TapMixOptOptions::default());
        assert!(matches!(result, Err(Error::DegenerateInput(_))));

        let flat = Array1::zeros(times.len());
        let result = tap_mix_opt(
            inert.view().insert_axis(Axis(1)),
            flat.view(),
            &TapMixOptOptions::default(),
        );
        assert!(matches!(result, Err(Error::DegenerateInput(_))));
    }

    #[test]
    fn noise_shortcut_can_be_disabled() {
        let seed = 41;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let times = times();
        let inert = standard_diffusion_curve(0.5, times.view()).unwrap();
        let noise = Array::random_using(times.len(), Uniform::new(-0.01, 0.01), &mut rng);
        let options = TapMixOptions {
            constraints: false,
            noise_shortcut: false,
            ..TapMixOptions::default()
        };

        let result = tap_mix_series(noise.view(), inert.view(), times.view(), &options).unwrap();

        assert_eq!(result.all_coefs.len(), 2);
        assert_ne!(result.flux, noise);
    }

    #[test]
    fn irreversible_pulses_are_scaled_by_area() {
        let times = times();
        let inert = standard_diffusion_curve(0.5, times.view()).unwrap();
        let reactant = &inert * &times.mapv(|t| (-2. * t).exp());

        let result = calibration_teak(
            reactant.view(),
            inert.view(),
            times.view(),
            40.,
            40.,
            &TapMixOptions::default(),
        )
        .unwrap();

        assert!(result.calibration_coef > 1.);
        approx::assert_relative_eq!(
            trapezoidal_integral(result.flux.view(), times.view()),
            trapezoidal_integral(inert.view(), times.view()),
            max_relative = 1e-10
        );
    }

    #[test]
    fn reversible_pulses_are_fitted_against_the_inert() {
        let times = times();
        let inert = standard_diffusion_curve(0.5, times.view()).unwrap();
        let reactant = standard_diffusion_curve(0.7, times.view()).unwrap() * 0.9;

        let result = calibration_teak(
            reactant.view(),
            inert.view(),
            times.view(),
            40.,
            40.,
            &TapMixOptions::default(),
        )
        .unwrap();

        assert_eq!(result.all_coefs.len(), 2);
        assert!(result.calibration_coef >= 0.);
    }
}
