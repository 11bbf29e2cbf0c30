use std::cmp::Ordering;

use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, LinalgScalar};
use num_traits::Float;
use statrs::function::gamma::gamma;

use crate::Result;

/// Integrate `flux` over `times`
///
/// When the first two time steps are exactly equal the series is treated as uniformly sampled
/// and the integral collapses to `dt * sum(flux)`. Otherwise the unequal-step trapezoidal rule
/// is applied.
///
/// # Examples
///
/// ```
/// use tap_pulse::math::trapezoidal_integral;
/// use ndarray::arr1;
///
/// let times = arr1(&[0.0, 0.5, 1.0, 1.5]);
/// let flux = arr1(&[1.0, 2.0, 3.0, 4.0]);
/// assert_eq!(trapezoidal_integral(flux.view(), times.view()), 5.0);
/// ```
#[allow(clippy::float_cmp)]
pub fn trapezoidal_integral<E: Float>(flux: ArrayView1<E>, times: ArrayView1<E>) -> E {
    let len = flux.len().min(times.len());
    if len < 2 {
        return E::zero();
    }
    if len > 2 {
        let first_step = times[1] - times[0];
        let second_step = times[2] - times[1];
        if first_step == second_step {
            return flux.iter().take(len).fold(E::zero(), |acc, &f| acc + f) * first_step;
        }
    }
    let half = E::one() / (E::one() + E::one());
    times
        .iter()
        .take(len)
        .zip(flux.iter())
        .tuple_windows()
        .fold(E::zero(), |acc, ((&t0, &f0), (&t1, &f1))| {
            acc + (t1 - t0) * (f1 + f0)
        })
        * half
}

/// Gamma probability density with the given `shape` and `scale` at a single point
pub fn gamma_density(time: f64, shape: f64, scale: f64) -> f64 {
    1. / (gamma(shape) * scale.powf(shape)) * time.powf(shape - 1.) * (-time / scale).exp()
}

/// Gamma probability density evaluated over `times`
///
/// The rate of the distribution is `1 / scale`.
pub fn gamma_pdf(times: ArrayView1<f64>, shape: f64, scale: f64) -> Array1<f64> {
    times.mapv(|t| gamma_density(t, shape, scale))
}

fn sorted<E: Float>(x: ArrayView1<E>) -> Vec<E> {
    let mut values = x.to_vec();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    values
}

/// Median of `x`, averaging the two central values for even lengths. Empty input gives NaN.
pub fn median<E: Float>(x: ArrayView1<E>) -> E {
    let values = sorted(x);
    let len = values.len();
    match len {
        0 => E::nan(),
        len if len % 2 == 1 => values[len / 2],
        len => (values[len / 2 - 1] + values[len / 2]) / (E::one() + E::one()),
    }
}

/// The median absolute deviation of `x`
pub fn mad<E: Float>(x: ArrayView1<E>) -> E {
    let centre = median(x);
    let deviations = x.mapv(|xi| (xi - centre).abs());
    median(deviations.view())
}

/// Root mean square error between two equal-length series
pub fn rmse<E: Float>(x: ArrayView1<E>, y: ArrayView1<E>) -> E {
    let len = x.len().min(y.len());
    if len == 0 {
        return E::nan();
    }
    let sum_of_squares = x
        .iter()
        .zip(y.iter())
        .fold(E::zero(), |acc, (&a, &b)| acc + (a - b).powi(2));
    (sum_of_squares / E::from(len).unwrap_or_else(E::nan)).sqrt()
}

/// Population standard deviation
pub fn std_dev(x: ArrayView1<f64>) -> f64 {
    x.std(0.)
}

/// Index of the first maximum, ignoring NaN. Returns zero for empty input.
pub fn argmax(x: ArrayView1<f64>) -> usize {
    x.iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best_index, best), (ii, &value)| {
            if value > best {
                (ii, value)
            } else {
                (best_index, best)
            }
        })
        .0
}

/// Index of the sample of `times` closest to `target`
pub fn nearest_index(times: ArrayView1<f64>, target: f64) -> usize {
    times
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |(best_index, best), (ii, &t)| {
            let distance = (t - target).abs();
            if distance < best {
                (ii, distance)
            } else {
                (best_index, best)
            }
        })
        .0
}

/// Piecewise linear interpolation of `(xp, fp)` at `x`
///
/// `xp` must be increasing. Points outside `xp` take the nearest end value of `fp`.
pub fn interp(x: ArrayView1<f64>, xp: ArrayView1<f64>, fp: ArrayView1<f64>) -> Array1<f64> {
    let len = xp.len().min(fp.len());
    if len == 0 {
        return Array1::from_elem(x.len(), f64::NAN);
    }
    x.mapv(|xi| {
        if xi.is_nan() {
            return f64::NAN;
        }
        if xi <= xp[0] {
            return fp[0];
        }
        if xi >= xp[len - 1] {
            return fp[len - 1];
        }
        // first index with xp[upper] > xi
        let upper = xp
            .as_slice()
            .map_or_else(
                || xp.iter().position(|&v| v > xi).unwrap_or(len - 1),
                |slice| slice[..len].partition_point(|&v| v <= xi),
            )
            .clamp(1, len - 1);
        let lower = upper - 1;
        let span = xp[upper] - xp[lower];
        if span == 0. {
            return fp[upper];
        }
        fp[lower] + (fp[upper] - fp[lower]) * (xi - xp[lower]) / span
    })
}

/// The `(m x n)` grid `u[i] * v[j]`
///
/// Exponential series are evaluated by exponentiating the grid of decay rates against sample
/// times:
///
/// ```
/// use tap_pulse::math::outer_product;
/// use ndarray::{arr1, arr2};
///
/// let rates = arr1(&[-1., -2.]);
/// let times = arr1(&[0., 0.5, 1.]);
/// let grid = outer_product(&rates, &times).unwrap();
///
/// assert_eq!(grid, arr2(&[[0., -0.5, -1.], [0., -1., -2.]]));
/// ```
///
/// # Errors
/// Fails if either vector cannot be reshaped to a matrix.
pub fn outer_product<T: LinalgScalar>(u: &Array1<T>, v: &Array1<T>) -> Result<Array2<T>> {
    let u: Array2<T> = u.clone().into_shape((u.len(), 1))?;
    let v: Array2<T> = v.clone().into_shape((1, v.len()))?;

    Ok(u.dot(&v))
}

#[cfg(test)]
mod tests {
    use super::{
        argmax, gamma_pdf, interp, mad, median, nearest_index, outer_product, rmse,
        trapezoidal_integral,
    };

    use ndarray::{arr1, Array1};
    use proptest::prelude::*;

    #[test]
    fn decay_grids_sum_to_exponential_series() {
        let rates = arr1(&[-1., -3.]);
        let times = Array1::linspace(0., 2., 5);
        let weights = arr1(&[2., -1.]);

        let grid = outer_product(&rates, &times).unwrap();
        assert_eq!(grid.dim(), (2, 5));
        approx::assert_relative_eq!(grid[[1, 4]], -6.);

        let series = weights.dot(&grid.mapv(f64::exp));
        for (value, t) in series.iter().zip(times.iter()) {
            let expected = 2. * (-t).exp() - (-3. * t).exp();
            approx::assert_relative_eq!(*value, expected, max_relative = 1e-12);
        }
    }

    #[test]
    fn unequal_steps_use_the_trapezoidal_rule() {
        let times = arr1(&[0.0, 1.0, 3.0]);
        let flux = arr1(&[0.0, 2.0, 2.0]);
        // 0.5 * (1 * 2 + 2 * 4)
        approx::assert_relative_eq!(trapezoidal_integral(flux.view(), times.view()), 5.0);
    }

    #[test]
    fn median_and_mad_match_hand_computed_values() {
        let x = arr1(&[1.0, 1.0, 2.0, 2.0, 4.0, 6.0, 9.0]);
        approx::assert_relative_eq!(median(x.view()), 2.0);
        approx::assert_relative_eq!(mad(x.view()), 1.0);

        let even = arr1(&[4.0, 1.0, 3.0, 2.0]);
        approx::assert_relative_eq!(median(even.view()), 2.5);
    }

    #[test]
    fn interpolation_clamps_outside_the_sample_range() {
        let xp = arr1(&[0.0, 1.0, 2.0]);
        let fp = arr1(&[0.0, 10.0, 20.0]);
        let x = arr1(&[-1.0, 0.5, 1.5, 3.0]);

        let interpolated = interp(x.view(), xp.view(), fp.view());
        assert_eq!(interpolated, arr1(&[0.0, 5.0, 15.0, 20.0]));
    }

    #[test]
    fn gamma_pdf_integrates_to_unity() {
        let times = Array1::linspace(0.0, 40.0, 40_001);
        let pdf = gamma_pdf(times.view(), 1.5, 2.0);
        approx::assert_relative_eq!(
            trapezoidal_integral(pdf.view(), times.view()),
            1.0,
            max_relative = 1e-2
        );
    }

    #[test]
    fn index_helpers_locate_extrema_and_nearest_samples() {
        let x = arr1(&[0.0, 3.0, 1.0, 3.0]);
        assert_eq!(argmax(x.view()), 1);

        let times = arr1(&[0.0, 0.1, 0.2, 0.3]);
        assert_eq!(nearest_index(times.view(), 0.19), 2);
        assert_eq!(nearest_index(times.view(), 10.0), 3);
        approx::assert_relative_eq!(rmse(x.view(), x.view()), 0.0);
    }

    proptest! {
        #[test]
        fn constant_step_integral_is_step_times_sum(
            flux in proptest::collection::vec(-10.0f64..10.0, 3..200),
            step in 1e-3f64..1.0,
        ) {
            let times = Array1::from_iter((0..flux.len()).map(|ii| ii as f64 * step));
            let first = times[1] - times[0];
            prop_assume!(first == times[2] - times[1]);
            let flux = Array1::from(flux);
            let expected = flux.iter().fold(0.0, |acc, &f| acc + f) * first;
            prop_assert_eq!(trapezoidal_integral(flux.view(), times.view()), expected);
        }

        #[test]
        fn equal_step_shortcut_agrees_with_trapezoid_for_pulses(
            interior in proptest::collection::vec(0.0f64..10.0, 3..200),
        ) {
            // pulses start and end at zero, so the endpoint terms of the two rules coincide
            let mut flux = vec![0.0];
            flux.extend(interior);
            flux.push(0.0);
            let flux = Array1::from(flux);
            let uniform = Array1::from_iter((0..flux.len()).map(|ii| ii as f64 * 0.25));
            let mut perturbed = uniform.clone();
            perturbed[1] += 1e-12;

            let shortcut = trapezoidal_integral(flux.view(), uniform.view());
            let general = trapezoidal_integral(flux.view(), perturbed.view());
            prop_assert!((shortcut - general).abs() <= 1e-9 * (1.0 + shortcut.abs()));
        }
    }
}
