//! Concentration and rate of a gas from its outlet flux
//!
//! Two inversions are available. The G-Procedure weights the flux by a power of time chosen from
//! the Gamma approximation of the inert residence time distribution. The Y-Procedure deconvolves
//! the diffusive transport of the inert zones in the frequency domain, regularised by a Gaussian
//! window.
use std::f64::consts::PI;

use ndarray::{s, Array1, ArrayView1, Zip};
use rustfft::num_complex::Complex64;
use rustfft::FftPlanner;

use crate::math::{argmax, std_dev, trapezoidal_integral};
use crate::reactor::{Reactor, ZoneMap};
use crate::{Error, Result};

/// Number of trailing samples treated as pure noise
const NOISE_WINDOW: usize = 30;
/// Multiple of the noise level under which early samples count as spurious
const NOISE_MULTIPLE: f64 = 3.;
/// Stand-in for the zero frequency of the Y-Procedure
const ZERO_FREQUENCY: f64 = 1e-10;
/// Default width of the Y-Procedure smoothing window
pub const DEFAULT_Y_SMOOTHING: f64 = 3.;

/// Inversion from outlet flux to concentration or rate
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Procedure {
    /// Power-of-time weighting
    #[default]
    G,
    /// Frequency-domain deconvolution with a smoothing window width in samples
    Y { smoothing: f64 },
}

impl Procedure {
    /// Dimensionless gas concentration of one pulse
    ///
    /// # Errors
    /// Propagates the failures of [`concentration_g`] or [`concentration_y`].
    pub fn concentration(
        self,
        flux: ArrayView1<f64>,
        times: ArrayView1<f64>,
        diffusion: f64,
        reactor: &Reactor,
    ) -> Result<Array1<f64>> {
        match self {
            Self::G => concentration_g(flux, times, &reactor.zone_lengths),
            Self::Y { smoothing } => concentration_y(
                flux,
                times,
                diffusion,
                &reactor.zone_lengths,
                &reactor.zone_porosity,
                smoothing,
            ),
        }
    }

    /// Dimensionless rate of one pulse, optionally as the deficit against an inert pulse
    ///
    /// # Errors
    /// Propagates the failures of [`rate_g`] or [`rate_y`].
    pub fn rate(
        self,
        flux: ArrayView1<f64>,
        times: ArrayView1<f64>,
        inert_flux: Option<ArrayView1<f64>>,
        diffusion: f64,
        reactor: &Reactor,
    ) -> Result<Array1<f64>> {
        match self {
            Self::G => rate_g(flux, times, &reactor.zone_lengths, inert_flux),
            Self::Y { smoothing } => rate_y(
                flux,
                times,
                diffusion,
                &reactor.zone_lengths,
                &reactor.zone_porosity,
                inert_flux,
                smoothing,
            ),
        }
    }
}

fn check_len(expected: usize, found: usize) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(Error::DimensionMismatch { expected, found })
    }
}

/// Remove spurious low values ahead of the pulse onset
///
/// Samples before `flux_argmax` (the argmax of `flux` when `None`) which fall below three times
/// the standard deviation of the last 30 samples are treated as noise. Everything up to and
/// including the last of them is dropped and the series is padded with its final value, so the
/// length is unchanged.
pub fn postprocess_g(flux: ArrayView1<f64>, flux_argmax: Option<usize>) -> Array1<f64> {
    let len = flux.len();
    if len == 0 {
        return Array1::zeros(0);
    }
    let peak = flux_argmax.unwrap_or_else(|| argmax(flux)).min(len);
    let noise = std_dev(flux.slice(s![len.saturating_sub(NOISE_WINDOW)..]));

    match flux
        .slice(s![..peak])
        .iter()
        .rposition(|&value| value < NOISE_MULTIPLE * noise)
    {
        Some(last) => {
            let mut shifted = Array1::from_elem(len, flux[len - 1]);
            shifted
                .slice_mut(s![..len - last - 1])
                .assign(&flux.slice(s![last + 1..]));
            shifted
        }
        None => flux.to_owned(),
    }
}

/// Fraction of the reactor length taken by the outlet zone
fn catalyst_ratio(zone_lengths: &ZoneMap<f64>) -> f64 {
    zone_lengths.zone2 / zone_lengths.sum()
}

/// `t^exponent` with the first sample fixed at zero
fn time_weights(times: ArrayView1<f64>, exponent: f64) -> Array1<f64> {
    let mut weights = times.mapv(|t| t.powf(exponent));
    if let Some(first) = weights.first_mut() {
        *first = 0.;
    }
    weights
}

/// Gas concentration of one pulse by the G-Procedure, normalised to the flux area
///
/// # Errors
/// Fails if `flux` and `times` differ in length.
pub fn concentration_g(
    flux: ArrayView1<f64>,
    times: ArrayView1<f64>,
    zone_lengths: &ZoneMap<f64>,
) -> Result<Array1<f64>> {
    check_len(times.len(), flux.len())?;
    let exponent = -(1. - catalyst_ratio(zone_lengths).powi(2)) / 6.;
    let weighted = &flux * &time_weights(times, exponent);
    let concentration = postprocess_g(weighted.view(), Some(argmax(flux)));

    let scale = trapezoidal_integral(flux, times)
        / trapezoidal_integral(concentration.view(), times);
    Ok(concentration * scale)
}

/// Rate of one pulse by the G-Procedure
///
/// With `inert_flux` the rate is computed from the deficit `inert - flux` and scaled to the
/// fraction of the inert area it represents. A deficit which sums to exactly zero is returned
/// unchanged.
///
/// # Errors
/// Fails if the series differ in length.
pub fn rate_g(
    flux: ArrayView1<f64>,
    times: ArrayView1<f64>,
    zone_lengths: &ZoneMap<f64>,
    inert_flux: Option<ArrayView1<f64>>,
) -> Result<Array1<f64>> {
    check_len(times.len(), flux.len())?;
    let (mut deficit, original_m0) = match inert_flux {
        Some(inert) => {
            check_len(times.len(), inert.len())?;
            let deficit = &inert - &flux;
            let m0 =
                trapezoidal_integral(deficit.view(), times) / trapezoidal_integral(inert, times);
            (deficit, m0)
        }
        None => (flux.to_owned(), trapezoidal_integral(flux, times)),
    };
    #[allow(clippy::float_cmp)]
    let no_reaction = deficit.sum() == 0.;
    if no_reaction {
        return Ok(deficit);
    }
    if let Some(first) = deficit.first_mut() {
        *first = 0.;
    }

    let exponent = -(1. - catalyst_ratio(zone_lengths).powi(2)) * 1.5;
    let weighted = &deficit * &time_weights(times, exponent);
    let rate = postprocess_g(weighted.view(), Some(argmax(flux)));

    let scale = original_m0 / trapezoidal_integral(rate.view(), times) * -exponent;
    Ok(rate * scale)
}

/// Angular frequencies of the Y-Procedure in FFT bin order
///
/// The bins run `0, 1, .., ceil(n / 2)` followed by `-floor(n / 2), .., -2`, and the zero
/// frequency is replaced by a small positive value.
pub fn angular_frequencies(len: usize, dt: f64) -> Array1<f64> {
    let positive = (len + 1) / 2;
    let negative = len / 2;
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    let bins = (0..=positive as i64).chain(-(negative as i64)..-1);
    #[allow(clippy::cast_precision_loss)]
    let mut omega = Array1::from_iter(bins.map(|k| 2. * PI * k as f64 / (len as f64 * dt)));
    if let Some(first) = omega.first_mut() {
        *first = ZERO_FREQUENCY;
    }
    omega
}

fn smoothing_window(omega: &Array1<f64>, dt: f64, smoothing: f64) -> Array1<f64> {
    omega.mapv(|w| (-(w * dt * smoothing).powi(2) / 2.).exp())
}

/// Multiply the spectrum of `signal` by `transfer` and return the real part of the result
fn apply_transfer(signal: ArrayView1<f64>, transfer: &Array1<Complex64>) -> Array1<f64> {
    let len = signal.len();
    let mut planner = FftPlanner::new();
    let forward = planner.plan_fft_forward(len);
    let inverse = planner.plan_fft_inverse(len);

    let mut buffer: Vec<Complex64> = signal.iter().map(|&x| Complex64::new(x, 0.)).collect();
    forward.process(&mut buffer);
    for (value, &gain) in buffer.iter_mut().zip(transfer.iter()) {
        let filtered = *value * gain;
        *value = if filtered.is_finite() {
            filtered
        } else {
            Complex64::new(0., 0.)
        };
    }
    inverse.process(&mut buffer);

    #[allow(clippy::cast_precision_loss)]
    let scale = 1. / len as f64;
    buffer.iter().map(|value| value.re * scale).collect()
}

struct ZoneTransport {
    tau1: f64,
    tau3: f64,
    gamma1: f64,
    gamma3: f64,
}

impl ZoneTransport {
    fn new(diffusion: f64, zone_lengths: &ZoneMap<f64>, zone_porosity: &ZoneMap<f64>) -> Self {
        Self {
            tau1: zone_porosity.zone0 * zone_lengths.zone0.powi(2) / diffusion,
            tau3: zone_porosity.zone2 * zone_lengths.zone2.powi(2) / diffusion,
            gamma1: diffusion / zone_lengths.zone0,
            gamma3: diffusion / zone_lengths.zone2,
        }
    }
}

fn check_y_inputs(flux: ArrayView1<f64>, times: ArrayView1<f64>, diffusion: f64) -> Result<f64> {
    check_len(times.len(), flux.len())?;
    if times.len() < 2 {
        return Err(Error::DegenerateInput(
            "the Y-Procedure needs at least two samples".into(),
        ));
    }
    if !(diffusion > 0.) {
        return Err(Error::DegenerateInput(format!(
            "the Y-Procedure needs a positive diffusion, found {diffusion}"
        )));
    }
    Ok(times[1] - times[0])
}

/// Gas concentration of one pulse by the Y-Procedure, normalised to the flux area
///
/// # Errors
/// Fails on mismatched lengths, fewer than two samples or a non-positive diffusion.
pub fn concentration_y(
    flux: ArrayView1<f64>,
    times: ArrayView1<f64>,
    diffusion: f64,
    zone_lengths: &ZoneMap<f64>,
    zone_porosity: &ZoneMap<f64>,
    smoothing: f64,
) -> Result<Array1<f64>> {
    let dt = check_y_inputs(flux, times, diffusion)?;
    let transport = ZoneTransport::new(diffusion, zone_lengths, zone_porosity);
    let omega = angular_frequencies(flux.len(), dt);
    let window = smoothing_window(&omega, dt, smoothing);

    let mut transfer = Array1::zeros(omega.len());
    Zip::from(&mut transfer)
        .and(&omega)
        .and(&window)
        .for_each(|gain: &mut Complex64, &w, &smooth| {
            let iwt1 = (Complex64::i() * w * transport.tau1).sqrt();
            let iwt3 = (Complex64::i() * w * transport.tau3).sqrt();
            *gain = iwt3.sinh() / iwt1 * smooth / transport.gamma3;
        });
    transfer[0] = Complex64::new(window[0] / transport.gamma3, 0.);

    let concentration = apply_transfer(flux, &transfer);
    let scale =
        trapezoidal_integral(flux, times) / trapezoidal_integral(concentration.view(), times);
    Ok(concentration * scale)
}

/// Rate of one pulse by the Y-Procedure
///
/// With `inert_flux` the deficit `inert - flux` is inverted. The result is not renormalised.
///
/// # Errors
/// Fails on mismatched lengths, fewer than two samples or a non-positive diffusion.
pub fn rate_y(
    flux: ArrayView1<f64>,
    times: ArrayView1<f64>,
    diffusion: f64,
    zone_lengths: &ZoneMap<f64>,
    zone_porosity: &ZoneMap<f64>,
    inert_flux: Option<ArrayView1<f64>>,
    smoothing: f64,
) -> Result<Array1<f64>> {
    let dt = check_y_inputs(flux, times, diffusion)?;
    let signal = match inert_flux {
        Some(inert) => {
            check_len(times.len(), inert.len())?;
            &inert - &flux
        }
        None => flux.to_owned(),
    };
    let ZoneTransport {
        tau1,
        tau3,
        gamma1,
        gamma3,
    } = ZoneTransport::new(diffusion, zone_lengths, zone_porosity);
    let coupling = (tau1 * gamma1.powi(2) / (tau3 * gamma3.powi(2))).sqrt();
    let omega = angular_frequencies(flux.len(), dt);
    let window = smoothing_window(&omega, dt, smoothing);

    let mut transfer = Array1::zeros(omega.len());
    Zip::from(&mut transfer)
        .and(&omega)
        .and(&window)
        .for_each(|gain: &mut Complex64, &w, &smooth| {
            let iwt1 = (Complex64::i() * w * tau1).sqrt();
            let iwt3 = (Complex64::i() * w * tau3).sqrt();
            *gain = (iwt3.cosh() + iwt1.sinh() * iwt3.sinh() / iwt1.cosh() * coupling) * smooth;
        });

    Ok(apply_transfer(signal.view(), &transfer))
}

/// Scale from dimensionless concentration to mol per cubic metre
pub fn concentration_units(
    diffusion: f64,
    zone_lengths: &ZoneMap<f64>,
    reactor_radius: f64,
    mol_per_pulse: f64,
) -> f64 {
    let cross_section = PI * reactor_radius.powi(2);
    mol_per_pulse * zone_lengths.zone2 / (diffusion * cross_section)
}

/// Scale from dimensionless rate to mol per unit catalyst weight
pub fn rate_units(mol_per_pulse: f64, catalyst_weight: f64) -> f64 {
    mol_per_pulse / catalyst_weight
}

/// Cumulative integral of a rate on a uniform grid
pub fn uptake(rate: ArrayView1<f64>, times: ArrayView1<f64>) -> Array1<f64> {
    let max_time = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    #[allow(clippy::cast_precision_loss)]
    let step = max_time / times.len() as f64;
    let mut total = 0.;
    rate.mapv(|r| {
        total += r;
        total * step
    })
}
