//! Pulse responses of a single gas species
//!
//! A [`Transient`] owns the flux matrix of one species (rows are samples, columns are pulses), an
//! optional smoothed copy of it and the per-pulse [`SummaryTable`]. Every transform overwrites the
//! flux in place, so derived analyses work on copies.
//!
//! Transforms run pulse by pulse in parallel. A pulse which fails is left as it was, its summary
//! cells are set to NaN and the failure is reported in the returned [`BatchOutcome`].
use std::borrow::Cow;
use std::sync::Arc;

use log::{info, warn};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

use crate::baseline::{BaselineCorrection, BaselineMethod};
use crate::calibration::{
    calibration_coef, calibration_teak, tap_mix_series, Calibration, TapMixOptions,
};
use crate::diffusion::grahams_law;
use crate::inversion::{concentration_units, rate_units, uptake, Procedure};
use crate::math::nearest_index;
use crate::moments::{
    active_sites_by_pulse, diffusion_moments, min_mean_max, moments, rtd_parameters,
    ActiveSites, IntegrationWindow, Moments, ReactionOrder,
};
use crate::reactivities::{self, Diffusions, Reactivities};
use crate::reactor::Reactor;
use crate::smoothing::{self, DEFAULT_SMOOTHING};
use crate::summary::{Field, SummaryTable};
use crate::{Error, Result};

/// A pulse whose transform failed
#[derive(Debug)]
pub struct PulseFailure {
    pub pulse: usize,
    pub error: Error,
}

/// Per-pulse failures of a batch transform
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub failures: Vec<PulseFailure>,
}

impl BatchOutcome {
    /// True when every pulse was transformed
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_pulses(&self) -> impl Iterator<Item = usize> + '_ {
        self.failures.iter().map(|failure| failure.pulse)
    }

    pub fn merge(&mut self, other: Self) {
        self.failures.extend(other.failures);
    }

    fn record(&mut self, species: &str, stage: &str, pulse: usize, error: Error) {
        warn!("{species}: {stage} failed on pulse {pulse}: {error}");
        self.failures.push(PulseFailure { pulse, error });
    }
}

/// How moments are taken
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MomentOptions {
    /// Integrate the smoothed flux, smoothing first if needed
    pub smooth: bool,
    /// Detect the window of each pulse instead of using the species integration times
    pub auto_window: bool,
}

/// What a species is calibrated against
#[derive(Clone, Copy, Debug)]
pub enum CalibrationTarget<'a> {
    /// Multiply every pulse by a known coefficient
    Amount(f64),
    /// Fit every pulse to one pulse of the same species, which corrects drift
    Pulse(usize),
    /// Fit every pulse to the same pulse of another species
    Reference(&'a Transient),
    /// Scale irreversible pulses to the inert area and fit reversible ones to the inert pulse
    Teak(&'a Transient),
}

fn per_pulse<T, F>(source: &Array2<f64>, op: F) -> Vec<Result<T>>
where
    T: Send,
    F: Fn(usize, ArrayView1<f64>) -> Result<T> + Sync,
{
    (0..source.ncols())
        .into_par_iter()
        .map(|pulse| op(pulse, source.column(pulse)))
        .collect()
}

/// Smooth every column, keeping the raw column of any pulse which cannot be smoothed
fn smooth_columns(flux: &Array2<f64>, smoothing: f64) -> (Array2<f64>, Vec<(usize, Error)>) {
    let mut smoothed = flux.clone();
    let mut failures = Vec::new();
    for (pulse, result) in per_pulse(flux, |_, column| smoothing::smooth_flux(column, smoothing))
        .into_iter()
        .enumerate()
    {
        match result {
            Ok(values) => smoothed.column_mut(pulse).assign(&values),
            Err(error) => failures.push((pulse, error)),
        }
    }
    (smoothed, failures)
}

/// The pulse responses of one gas species
#[derive(Clone, Debug)]
pub struct Transient {
    pub name: String,
    /// Molecular mass in amu
    pub mass: f64,
    /// Gain of the mass spectrometer channel
    pub gain: f64,
    /// Time before the pulse which holds no signal
    pub delay_time: f64,
    /// Gas diffusion coefficient, zero for a surface species
    pub diffusion: f64,
    /// Smoothing parameter of the smoothed flux, in `(0, 1]`
    pub smoothing_parameter: f64,
    /// Time range over which moments are integrated
    pub integration_times: [f64; 2],
    /// Name of the species this one is measured against, usually the inert
    pub reference_gas: Option<String>,
    times: Array1<f64>,
    flux: Array2<f64>,
    smoothed_flux: Option<Array2<f64>>,
    summary: SummaryTable,
    reactor: Arc<Reactor>,
}

impl Transient {
    /// Create a species from a time axis and a flux matrix with one column per pulse
    ///
    /// # Errors
    /// Fails if the flux rows do not match the time axis or fewer than two samples are given.
    pub fn new(name: impl Into<String>, times: Array1<f64>, flux: Array2<f64>) -> Result<Self> {
        if flux.nrows() != times.len() {
            return Err(Error::DimensionMismatch {
                expected: times.len(),
                found: flux.nrows(),
            });
        }
        if times.len() < 2 {
            return Err(Error::DegenerateInput(format!(
                "a transient needs at least two samples, found {}",
                times.len()
            )));
        }
        let num_pulses = flux.ncols();
        Ok(Self {
            name: name.into(),
            mass: 40.,
            gain: 9.,
            delay_time: 0.,
            diffusion: 0.5,
            smoothing_parameter: DEFAULT_SMOOTHING,
            integration_times: [0., 3.],
            reference_gas: None,
            times,
            flux,
            smoothed_flux: None,
            summary: SummaryTable::new(num_pulses),
            reactor: Arc::new(Reactor::default()),
        })
    }

    #[must_use]
    pub fn with_mass(mut self, mass: f64) -> Self {
        self.mass = mass;
        self
    }

    #[must_use]
    pub fn with_reactor(mut self, reactor: Arc<Reactor>) -> Self {
        self.reactor = reactor;
        self
    }

    pub fn set_reactor(&mut self, reactor: Arc<Reactor>) {
        self.reactor = reactor;
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn times(&self) -> ArrayView1<f64> {
        self.times.view()
    }

    pub fn flux(&self) -> ArrayView2<f64> {
        self.flux.view()
    }

    pub fn smoothed_flux(&self) -> Option<ArrayView2<f64>> {
        self.smoothed_flux.as_ref().map(Array2::view)
    }

    pub const fn summary(&self) -> &SummaryTable {
        &self.summary
    }

    pub fn num_pulses(&self) -> usize {
        self.flux.ncols()
    }

    fn store(&mut self, field: Field, values: Array1<f64>) {
        *self.summary.column_mut(field, f64::NAN) = values;
    }

    fn check_compatible(&self, other: &Self) -> Result<()> {
        if other.num_pulses() != self.num_pulses() {
            return Err(Error::DimensionMismatch {
                expected: self.num_pulses(),
                found: other.num_pulses(),
            });
        }
        if other.times.len() != self.times.len() {
            return Err(Error::DimensionMismatch {
                expected: self.times.len(),
                found: other.times.len(),
            });
        }
        Ok(())
    }

    /// The flux a reference is compared against, smoothing on the fly if no cache exists
    fn reference_source(&self, smooth: bool) -> Cow<'_, Array2<f64>> {
        match (&self.smoothed_flux, smooth) {
            (Some(smoothed), true) => Cow::Borrowed(smoothed),
            (None, true) => Cow::Owned(smooth_columns(&self.flux, self.smoothing_parameter).0),
            (_, false) => Cow::Borrowed(&self.flux),
        }
    }

    fn source(&self, smooth: bool) -> &Array2<f64> {
        match &self.smoothed_flux {
            Some(smoothed) if smooth => smoothed,
            _ => &self.flux,
        }
    }

    /// Replace the smoothed flux with a smoothing spline of the current flux
    pub fn smooth_flux(&mut self) -> BatchOutcome {
        let (smoothed, failures) = smooth_columns(&self.flux, self.smoothing_parameter);
        let mut outcome = BatchOutcome::default();
        for (pulse, error) in failures {
            outcome.record(&self.name, "smoothing", pulse, error);
        }
        self.smoothed_flux = Some(smoothed);
        outcome
    }

    fn ensure_smoothed(&mut self) -> BatchOutcome {
        if self.smoothed_flux.is_none() {
            self.smooth_flux()
        } else {
            BatchOutcome::default()
        }
    }

    pub fn set_min_mean_max(&mut self) {
        let stats: Vec<_> = self.flux.axis_iter(Axis(1)).map(min_mean_max).collect();
        self.store(Field::Min, stats.iter().map(|s| s.min).collect());
        self.store(Field::Mean, stats.iter().map(|s| s.mean).collect());
        self.store(Field::Max, stats.iter().map(|s| s.max).collect());
    }

    /// Compute M0, M1 and M2 of every pulse
    pub fn set_moments(&mut self, options: &MomentOptions) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        if options.smooth {
            outcome.merge(self.ensure_smoothed());
        }
        let window = if options.auto_window {
            IntegrationWindow::Auto
        } else {
            IntegrationWindow::Range(self.integration_times[0], self.integration_times[1])
        };

        let times = self.times.view();
        let results = per_pulse(self.source(options.smooth), |_, flux| {
            moments(flux, times, window)
        });

        let num_pulses = self.num_pulses();
        let mut columns = Moments {
            m0: Array1::from_elem(num_pulses, f64::NAN),
            m1: Array1::from_elem(num_pulses, f64::NAN),
            m2: Array1::from_elem(num_pulses, f64::NAN),
        };
        for (pulse, result) in results.into_iter().enumerate() {
            match result {
                Ok(Moments { m0, m1, m2 }) => {
                    columns.m0[pulse] = m0;
                    columns.m1[pulse] = m1;
                    columns.m2[pulse] = m2;
                }
                Err(error) => outcome.record(&self.name, "moments", pulse, error),
            }
        }
        self.store(Field::M0, columns.m0);
        self.store(Field::M1, columns.m1);
        self.store(Field::M2, columns.m2);
        outcome
    }

    fn ensure_moments(&mut self) -> BatchOutcome {
        if self.summary.contains(Field::M1) {
            BatchOutcome::default()
        } else {
            self.set_moments(&MomentOptions::default())
        }
    }

    /// Gas diffusion of every pulse from its moments, and their mean as the species diffusion
    ///
    /// With `reference_mass` the diffusion is scaled by `sqrt(reference_mass / mass)`.
    ///
    /// # Errors
    /// Fails if no pulse yields a finite diffusion.
    pub fn set_gas_diffusion(&mut self, reference_mass: Option<f64>) -> Result<BatchOutcome> {
        let outcome = self.ensure_moments();
        let columns = Moments::from_summary(&self.summary, &self.name)?;
        let masses = reference_mass.map(|reference| (self.mass, reference));
        let diffusion: Array1<f64> = (0..columns.len())
            .map(|pulse| {
                diffusion_moments(
                    &columns.pulse(pulse),
                    &self.reactor.zone_lengths,
                    &self.reactor.zone_porosity,
                    masses,
                )
            })
            .collect();

        let finite: Array1<f64> = diffusion.iter().copied().filter(|d| d.is_finite()).collect();
        self.diffusion = finite.mean().ok_or_else(|| {
            Error::DegenerateInput(format!("{} has no pulse with a finite diffusion", self.name))
        })?;
        self.store(Field::Diffusion, diffusion);
        Ok(outcome)
    }

    /// Residence time distribution parameters of every pulse
    pub fn set_rtd_parameters(&mut self) -> Result<BatchOutcome> {
        let outcome = self.ensure_moments();
        let columns = Moments::from_summary(&self.summary, &self.name)?;
        let parameters: Vec<_> = (0..columns.len())
            .map(|pulse| rtd_parameters(&columns.pulse(pulse)))
            .collect();
        self.store(
            Field::MeanResidenceTime,
            parameters.iter().map(|p| p.mean).collect(),
        );
        self.store(
            Field::VarianceResidenceTime,
            parameters.iter().map(|p| p.variance).collect(),
        );
        self.store(
            Field::GammaShape,
            parameters.iter().map(|p| p.gamma_shape).collect(),
        );
        self.store(
            Field::GammaScale,
            parameters.iter().map(|p| p.gamma_scale).collect(),
        );
        Ok(outcome)
    }

    fn ensure_moments_and_diffusion(&mut self, reference_mass: f64) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        if !self.summary.contains(Field::M1) {
            outcome.merge(self.set_moments(&MomentOptions::default()));
            outcome.merge(self.set_gas_diffusion(Some(reference_mass))?);
        }
        Ok(outcome)
    }

    fn store_reactivities(&mut self, values: Reactivities<Array1<f64>>) {
        self.store(Field::R0, values.r0);
        self.store(Field::R1, values.r1);
        self.store(Field::R2, values.r2);
    }

    /// Reactivities of this species as a reactant measured against `inert`
    ///
    /// The moments of `inert` must already be computed.
    ///
    /// # Errors
    /// Fails with [`Error::MissingSummary`] if the inert moments are absent.
    pub fn set_reactivities(&mut self, inert: &Self) -> Result<BatchOutcome> {
        self.check_compatible(inert)?;
        let outcome = self.ensure_moments_and_diffusion(inert.mass)?;
        let own = Moments::from_summary(&self.summary, &self.name)?;
        let reference = Moments::from_summary(inert.summary(), &inert.name)?;
        let values =
            reactivities::reactant_columns(&own, &reference, &self.reactor.residence_times())?;
        self.store_reactivities(values);
        Ok(outcome)
    }

    /// Reactivities of this species as a product of `reactant`, measured against `inert`
    ///
    /// The moments of `inert` and the reactivities of `reactant` must already be computed.
    ///
    /// # Errors
    /// Fails with [`Error::MissingSummary`] if a required column is absent.
    pub fn set_product_reactivities(&mut self, reactant: &Self, inert: &Self) -> Result<BatchOutcome> {
        self.check_compatible(inert)?;
        self.check_compatible(reactant)?;
        let outcome = self.ensure_moments_and_diffusion(inert.mass)?;
        let own = Moments::from_summary(&self.summary, &self.name)?;
        let reactant_moments = Moments::from_summary(reactant.summary(), &reactant.name)?;
        let reference = Moments::from_summary(inert.summary(), &inert.name)?;
        let reactant_reactivities = Reactivities {
            r0: reactant.summary.require(Field::R0, &reactant.name)?.to_owned(),
            r1: reactant.summary.require(Field::R1, &reactant.name)?.to_owned(),
            r2: reactant.summary.require(Field::R2, &reactant.name)?.to_owned(),
        };
        let diffusions = Diffusions {
            inert: inert.diffusion,
            reactant: reactant.diffusion,
            product: self.diffusion,
        };
        let values = reactivities::product_columns(
            &own,
            &reactant_moments,
            &reference,
            &reactant_reactivities,
            &self.reactor.residence_times(),
            &diffusions,
        )?;
        self.store_reactivities(values);
        Ok(outcome)
    }

    /// Active sites titrated by this species over its pulse train, measured against `inert`
    ///
    /// The moments of both species must already be computed.
    ///
    /// # Errors
    /// Fails with [`Error::MissingSummary`] if either M0 column is absent, and propagates
    /// failures of [`active_sites_by_pulse`].
    pub fn active_sites(
        &self,
        inert: &Self,
        stoichiometric_coef: f64,
        order: ReactionOrder,
        huber_loss: bool,
    ) -> Result<ActiveSites> {
        self.check_compatible(inert)?;
        let estimate = active_sites_by_pulse(
            self.summary.require(Field::M0, &self.name)?,
            inert.summary.require(Field::M0, &inert.name)?,
            stoichiometric_coef,
            order,
            huber_loss,
        )?;
        info!("{}: {:e} active sites", self.name, estimate.active_sites);
        Ok(estimate)
    }

    /// Remove the baseline of every pulse
    ///
    /// The Gamma method works on the smoothed flux when `smooth` is set: the smoothed flux takes
    /// the corrected values and the raw flux is shifted by the same amount. The other methods
    /// correct the raw flux and shift the smoothed flux, if any. The removed amounts accumulate
    /// in the baseline column.
    pub fn baseline_correct(&mut self, method: BaselineMethod, smooth: bool) -> BatchOutcome {
        info!("{}: baseline correction by {method:?}", self.name);
        let on_smoothed = smooth && method == BaselineMethod::Gamma;
        let mut outcome = BatchOutcome::default();
        if on_smoothed {
            outcome.merge(self.ensure_smoothed());
        }

        let times = self.times.view();
        let results = per_pulse(self.source(on_smoothed), |_, flux| method.apply(flux, times));

        for (pulse, result) in results.into_iter().enumerate() {
            match result {
                Ok(BaselineCorrection { flux, amount }) => {
                    if on_smoothed {
                        if let Some(smoothed) = self.smoothed_flux.as_mut() {
                            smoothed.column_mut(pulse).assign(&flux);
                        }
                        self.flux.column_mut(pulse).mapv_inplace(|f| f - amount);
                    } else {
                        self.flux.column_mut(pulse).assign(&flux);
                        if let Some(smoothed) = self.smoothed_flux.as_mut() {
                            smoothed.column_mut(pulse).mapv_inplace(|f| f - amount);
                        }
                    }
                    self.summary.column_mut(Field::Baseline, 0.)[pulse] += amount;
                }
                Err(error) => {
                    self.summary.column_mut(Field::Baseline, 0.)[pulse] = f64::NAN;
                    outcome.record(&self.name, "baseline correction", pulse, error);
                }
            }
        }
        outcome
    }

    /// Calibrate every pulse
    ///
    /// Fits run on the smoothed flux when `smooth` is set, in which case the smoothed flux takes
    /// the fitted values and the raw flux is mapped through the same coefficient and intercept.
    /// A known amount always scales the raw flux. Coefficients multiply into the calibration
    /// column, the intercept is stored and removed from the baseline column.
    ///
    /// # Errors
    /// Fails if the reference pulse is out of range or a reference species does not match this
    /// one in shape.
    pub fn calibrate_flux(
        &mut self,
        target: CalibrationTarget<'_>,
        smooth: bool,
        options: &TapMixOptions,
    ) -> Result<BatchOutcome> {
        info!("{}: calibration", self.name);
        let smooth = smooth && !matches!(target, CalibrationTarget::Amount(_));
        let num_pulses = self.num_pulses();
        let reference = match target {
            CalibrationTarget::Amount(_) => None,
            CalibrationTarget::Pulse(index) => {
                if index >= num_pulses {
                    return Err(Error::DegenerateInput(format!(
                        "reference pulse {index} is out of range for {num_pulses} pulses"
                    )));
                }
                None
            }
            CalibrationTarget::Reference(gas) | CalibrationTarget::Teak(gas) => {
                self.check_compatible(gas)?;
                Some(gas.reference_source(smooth))
            }
        };

        let mut outcome = BatchOutcome::default();
        if smooth {
            outcome.merge(self.ensure_smoothed());
        }
        let times = self.times.view();
        let mass = self.mass;
        let source = self.source(smooth);
        let results = per_pulse(source, |pulse, flux| match (target, reference.as_deref()) {
            (CalibrationTarget::Amount(amount), _) => Ok(calibration_coef(flux, amount)),
            (CalibrationTarget::Pulse(index), _) => {
                tap_mix_series(flux, source.column(index), times, options)
            }
            (CalibrationTarget::Reference(_), Some(reference)) => {
                tap_mix_series(flux, reference.column(pulse), times, options)
            }
            (CalibrationTarget::Teak(inert), Some(reference)) => calibration_teak(
                flux,
                reference.column(pulse),
                times,
                mass,
                inert.mass,
                options,
            ),
            (_, None) => Err(Error::DegenerateInput("calibration reference is missing".into())),
        });

        for (pulse, result) in results.into_iter().enumerate() {
            match result {
                Ok(Calibration {
                    flux,
                    calibration_coef,
                    intercept,
                    ..
                }) => {
                    let rescale = |f: f64| f * calibration_coef + intercept;
                    if smooth {
                        self.flux.column_mut(pulse).mapv_inplace(rescale);
                        if let Some(smoothed) = self.smoothed_flux.as_mut() {
                            smoothed.column_mut(pulse).assign(&flux);
                        }
                    } else {
                        self.flux.column_mut(pulse).assign(&flux);
                        if let Some(smoothed) = self.smoothed_flux.as_mut() {
                            smoothed.column_mut(pulse).mapv_inplace(rescale);
                        }
                    }
                    self.summary.column_mut(Field::CalibrationCoef, 1.)[pulse] *= calibration_coef;
                    self.summary.column_mut(Field::Intercept, 0.)[pulse] = intercept;
                    self.summary.column_mut(Field::Baseline, 0.)[pulse] -= intercept;
                }
                Err(error) => {
                    self.summary.column_mut(Field::CalibrationCoef, 1.)[pulse] = f64::NAN;
                    self.summary.column_mut(Field::Intercept, 0.)[pulse] = f64::NAN;
                    outcome.record(&self.name, "calibration", pulse, error);
                }
            }
        }
        Ok(outcome)
    }

    /// Convert the flux of every pulse to a gas concentration in mol per cubic metre
    ///
    /// # Errors
    /// Fails if the species diffusion is not positive.
    pub fn set_concentration(
        &mut self,
        procedure: Procedure,
        post_smoothing: bool,
    ) -> Result<BatchOutcome> {
        info!("{}: concentration by {procedure:?}", self.name);
        if !(self.diffusion > 0.) {
            return Err(Error::DegenerateInput(format!(
                "{} needs a positive diffusion for a concentration, found {}",
                self.name, self.diffusion
            )));
        }
        let units = concentration_units(
            self.diffusion,
            &self.reactor.zone_lengths,
            self.reactor.reactor_radius,
            self.reactor.mol_per_pulse,
        );
        let times = self.times.view();
        let diffusion = self.diffusion;
        let reactor = &*self.reactor;
        let results = per_pulse(&self.flux, |_, flux| {
            procedure.concentration(flux, times, diffusion, reactor)
        });

        let mut outcome = self.apply_scaled(results, units, "concentration");
        if post_smoothing {
            outcome.merge(self.smooth_flux());
        }
        Ok(outcome)
    }

    /// Convert the flux of every pulse to a rate per unit catalyst weight
    ///
    /// With `inert` the rate is taken from the deficit against the inert pulse, rescaled to the
    /// mass of this species.
    ///
    /// # Errors
    /// Fails if `inert` does not match this species in shape.
    pub fn set_rate(
        &mut self,
        procedure: Procedure,
        inert: Option<&Self>,
        post_smoothing: bool,
    ) -> Result<BatchOutcome> {
        info!("{}: rate by {procedure:?}", self.name);
        if let Some(inert) = inert {
            self.check_compatible(inert)?;
        }
        let units = rate_units(self.reactor.mol_per_pulse, self.reactor.catalyst_weight);
        let times = self.times.view();
        let mass = self.mass;
        let diffusion = self.diffusion;
        let reactor = &*self.reactor;
        let results = per_pulse(&self.flux, |pulse, flux| {
            let rescaled = inert
                .map(|gas| grahams_law(gas.flux.column(pulse), times, gas.mass, mass))
                .transpose()?;
            procedure.rate(
                flux,
                times,
                rescaled.as_ref().map(Array1::view),
                diffusion,
                reactor,
            )
        });

        let mut outcome = self.apply_scaled(results, units, "rate");
        if post_smoothing {
            outcome.merge(self.smooth_flux());
        }
        Ok(outcome)
    }

    fn apply_scaled(
        &mut self,
        results: Vec<Result<Array1<f64>>>,
        units: f64,
        stage: &str,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (pulse, result) in results.into_iter().enumerate() {
            match result {
                Ok(values) => self.flux.column_mut(pulse).assign(&(values * units)),
                Err(error) => outcome.record(&self.name, stage, pulse, error),
            }
        }
        outcome
    }

    /// Replace every pulse, and its smoothed copy, by its cumulative integral
    pub fn set_accumulation(&mut self) {
        let times = self.times.view();
        for mut column in self.flux.axis_iter_mut(Axis(1)) {
            let accumulated = uptake(column.view(), times);
            column.assign(&accumulated);
        }
        if let Some(smoothed) = self.smoothed_flux.as_mut() {
            for mut column in smoothed.axis_iter_mut(Axis(1)) {
                let accumulated = uptake(column.view(), times);
                column.assign(&accumulated);
            }
        }
    }

    /// Rescale every pulse to `new_mass` and adopt it as the species mass
    ///
    /// # Errors
    /// Fails if `new_mass` is not positive.
    pub fn grahams_law(&mut self, new_mass: f64) -> Result<BatchOutcome> {
        if !(new_mass > 0.) {
            return Err(Error::DegenerateInput(format!(
                "cannot rescale {} to mass {new_mass}",
                self.name
            )));
        }
        let current_mass = self.mass;
        let times = self.times.view();
        let rescale =
            |_: usize, flux: ArrayView1<f64>| grahams_law(flux, times, current_mass, new_mass);

        let results = per_pulse(&self.flux, rescale);
        let smoothed_results = self.smoothed_flux.as_ref().map(|s| per_pulse(s, rescale));

        let mut outcome = BatchOutcome::default();
        for (pulse, result) in results.into_iter().enumerate() {
            match result {
                Ok(values) => self.flux.column_mut(pulse).assign(&values),
                Err(error) => outcome.record(&self.name, "mass rescaling", pulse, error),
            }
        }
        if let (Some(smoothed), Some(results)) = (self.smoothed_flux.as_mut(), smoothed_results) {
            for (pulse, result) in results.into_iter().enumerate() {
                match result {
                    Ok(values) => smoothed.column_mut(pulse).assign(&values),
                    Err(error) => {
                        outcome.record(&self.name, "smoothed mass rescaling", pulse, error);
                    }
                }
            }
        }
        self.mass = new_mass;
        Ok(outcome)
    }

    /// Drop the samples before the delay time and shorten the time axis to match
    ///
    /// # Errors
    /// Fails if fewer than two samples would remain.
    pub fn remove_delay_time(&mut self) -> Result<()> {
        let len = self.times.len();
        let cut = nearest_index(self.times.view(), self.delay_time);
        if len - cut < 2 {
            return Err(Error::DegenerateInput(format!(
                "removing a delay of {} from {} leaves fewer than two samples",
                self.delay_time, self.name
            )));
        }
        self.flux = self.flux.slice(s![cut.., ..]).to_owned();
        if let Some(smoothed) = self.smoothed_flux.take() {
            self.smoothed_flux = Some(smoothed.slice(s![cut.., ..]).to_owned());
        }
        self.times = self.times.slice(s![..len - cut]).to_owned();
        let max_time = self.times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        self.integration_times[1] = self.integration_times[1].min(max_time);
        Ok(())
    }
}
