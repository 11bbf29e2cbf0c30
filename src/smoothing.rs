//! Cubic smoothing spline over the sample index
//!
//! The spline minimises `p * sum (y_i - f_i)^2 + (1 - p) * integral f''^2` on a unit-spaced grid,
//! so `p = 1` interpolates the data and `p -> 0` tends to the least-squares line. With unit knot
//! spacing the normal equations for the second derivatives form a symmetric pentadiagonal system,
//! solved here by a banded Cholesky factorisation.
use ndarray::{arr1, s, Array1, ArrayView1};

use crate::math::{argmax, median};
use crate::{Error, Result};

/// Default smoothing parameter of the smoothed-flux cache
pub const DEFAULT_SMOOTHING: f64 = 1e-4;

/// Lower factor of a symmetric positive definite matrix with two sub-diagonals
struct BandedCholesky {
    diagonal: Vec<f64>,
    first: Vec<f64>,
    second: Vec<f64>,
}

impl BandedCholesky {
    /// Factorise the Toeplitz matrix holding `band[k]` on its k-th off diagonal
    fn factorise(size: usize, band: [f64; 3]) -> Result<Self> {
        let mut diagonal = vec![0.; size];
        let mut first = vec![0.; size];
        let mut second = vec![0.; size];
        for ii in 0..size {
            if ii >= 2 {
                second[ii] = band[2] / diagonal[ii - 2];
            }
            if ii >= 1 {
                first[ii] = (band[1] - second[ii] * first[ii - 1]) / diagonal[ii - 1];
            }
            let pivot = band[0] - first[ii].powi(2) - second[ii].powi(2);
            if !(pivot > 0.) {
                return Err(Error::DegenerateInput(format!(
                    "smoothing system is not positive definite at row {ii}"
                )));
            }
            diagonal[ii] = pivot.sqrt();
        }
        Ok(Self {
            diagonal,
            first,
            second,
        })
    }

    fn solve(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let size = self.diagonal.len();
        let mut z = rhs.clone();
        for ii in 0..size {
            let mut value = z[ii];
            if ii >= 1 {
                value -= self.first[ii] * z[ii - 1];
            }
            if ii >= 2 {
                value -= self.second[ii] * z[ii - 2];
            }
            z[ii] = value / self.diagonal[ii];
        }
        for ii in (0..size).rev() {
            let mut value = z[ii];
            if ii + 1 < size {
                value -= self.first[ii + 1] * z[ii + 1];
            }
            if ii + 2 < size {
                value -= self.second[ii + 2] * z[ii + 2];
            }
            z[ii] = value / self.diagonal[ii];
        }
        z
    }
}

fn differences(x: &Array1<f64>) -> Array1<f64> {
    &x.slice(s![1..]) - &x.slice(s![..-1])
}

fn zero_padded(x: &Array1<f64>) -> Array1<f64> {
    let mut padded = Array1::zeros(x.len() + 2);
    padded.slice_mut(s![1..-1]).assign(x);
    padded
}

/// Evaluate the cubic smoothing spline of `y` at its own knots
///
/// # Errors
/// Fails if `smoothing` lies outside `(0, 1]` or fewer than three samples are given.
pub fn smoothing_spline(y: ArrayView1<f64>, smoothing: f64) -> Result<Array1<f64>> {
    if !(smoothing > 0. && smoothing <= 1.) {
        return Err(Error::ConfigurationMismatch(format!(
            "smoothing parameter must lie in (0, 1], found {smoothing}"
        )));
    }
    let len = y.len();
    if len < 3 {
        return Err(Error::DegenerateInput(format!(
            "a smoothing spline needs at least three samples, found {len}"
        )));
    }

    let roughness = 6. * (1. - smoothing);
    let band = [
        6. * roughness + 4. * smoothing,
        -4. * roughness + smoothing,
        roughness,
    ];
    let factor = BandedCholesky::factorise(len - 2, band)?;

    let curvature = differences(&differences(&y.to_owned()));
    let u = factor.solve(&curvature);
    let d1 = differences(&zero_padded(&u));
    let d2 = differences(&zero_padded(&d1));

    Ok(&y - &(d2 * roughness))
}

/// Smooth a pulse for use as a calibration or baseline reference
///
/// After the spline pass, pre-peak values which undershoot the minimum of the raw flux are
/// replaced in order by the median of their three-sample neighbourhood.
///
/// # Errors
/// Propagates the failures of [`smoothing_spline`].
pub fn smooth_flux(flux: ArrayView1<f64>, smoothing: f64) -> Result<Array1<f64>> {
    let mut smoothed = smoothing_spline(flux, smoothing)?;
    let floor = flux.iter().copied().fold(f64::INFINITY, f64::min);
    let peak = argmax(flux);

    for ii in 0..peak {
        if smoothed[ii] < floor {
            let neighbourhood = if ii == 0 {
                arr1(&[smoothed[0], smoothed[1], smoothed[2]])
            } else {
                arr1(&[smoothed[ii - 1], smoothed[ii], smoothed[ii + 1]])
            };
            smoothed[ii] = median(neighbourhood.view());
        }
    }
    Ok(smoothed)
}

#[cfg(test)]
mod tests {
    use ndarray::{Array, Array1};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Normal;
    use ndarray_rand::RandomExt;
    use rand_isaac::isaac64::Isaac64Rng;

    use super::{smooth_flux, smoothing_spline, DEFAULT_SMOOTHING};
    use crate::diffusion::standard_diffusion_curve;
    use crate::math::rmse;

    #[test]
    fn straight_lines_are_left_untouched() {
        let line = Array1::linspace(-1., 4., 200);
        let smoothed = smoothing_spline(line.view(), 1e-6).unwrap();
        for (a, b) in smoothed.iter().zip(line.iter()) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn unit_smoothing_interpolates() {
        let y = Array1::from_iter((0..50).map(|ii| f64::from(ii).sin()));
        let smoothed = smoothing_spline(y.view(), 1.).unwrap();
        for (a, b) in smoothed.iter().zip(y.iter()) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn noise_is_suppressed() {
        let mut rng = Isaac64Rng::seed_from_u64(7);
        let times = Array1::from_iter((0..3000).map(|ii| f64::from(ii) * 0.001));
        let inert = standard_diffusion_curve(0.5, times.view()).unwrap();
        let noise = Array::random_using(times.len(), Normal::new(0., 0.05).unwrap(), &mut rng);
        let noisy = &inert + &noise;

        let smoothed = smooth_flux(noisy.view(), DEFAULT_SMOOTHING).unwrap();

        let before = rmse(noisy.view(), inert.view());
        let after = rmse(smoothed.view(), inert.view());
        assert!(after < 0.5 * before, "rmse went from {before} to {after}");
    }

    #[test]
    fn pre_peak_undershoot_is_lifted() {
        let mut flux = Array1::zeros(40);
        flux[20] = 1.;
        let smoothed = smooth_flux(flux.view(), 0.5).unwrap();
        let spline = smoothing_spline(flux.view(), 0.5).unwrap();

        let undershoot =
            |x: &Array1<f64>| x.iter().take(20).map(|&v| (-v).max(0.)).sum::<f64>();
        assert!(undershoot(&spline) > 0.);
        assert!(undershoot(&smoothed) < undershoot(&spline));
        for ii in 20..40 {
            assert_eq!(smoothed[ii], spline[ii]);
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let y = Array1::linspace(0., 1., 10);
        assert!(smoothing_spline(y.view(), 0.).is_err());
        assert!(smoothing_spline(y.view(), 1.5).is_err());
        assert!(smoothing_spline(y.slice(ndarray::s![..2]), 0.5).is_err());
    }
}
