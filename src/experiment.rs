//! A set of species measured together in one reactor
//!
//! The [`Experiment`] owns every [`Transient`] by name. Species refer to each other only through
//! names, resolved on demand against the map, so a species can be taken out, transformed against
//! its references and put back without aliasing.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};

use crate::baseline::BaselineMethod;
use crate::calibration::TapMixOptions;
use crate::inversion::Procedure;
use crate::reactor::Reactor;
use crate::summary::Field;
use crate::transient::{BatchOutcome, CalibrationTarget, MomentOptions, Transient};
use crate::{Error, Result};

/// Which species play which part in the reaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Roles {
    pub inert: String,
    #[serde(default)]
    pub reactants: BTreeSet<String>,
    /// Each product mapped to the reactant it is formed from
    #[serde(default)]
    pub products: BTreeMap<String, String>,
}

impl Roles {
    pub fn new(inert: impl Into<String>) -> Self {
        Self {
            inert: inert.into(),
            reactants: BTreeSet::new(),
            products: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_reactant(mut self, reactant: impl Into<String>) -> Self {
        self.reactants.insert(reactant.into());
        self
    }

    #[must_use]
    pub fn with_product(mut self, product: impl Into<String>, reactant: impl Into<String>) -> Self {
        self.products.insert(product.into(), reactant.into());
        self
    }

    /// Check every role against the species present
    ///
    /// # Errors
    /// Fails with [`Error::InvalidRole`] if a role names an absent species, a species holds two
    /// roles or a product is formed from a species which is not a reactant.
    pub fn validate(&self, species: &BTreeMap<String, Transient>) -> Result<()> {
        let present = |name: &str, role: &str| {
            if species.contains_key(name) {
                Ok(())
            } else {
                Err(Error::InvalidRole(format!("{role} {name} is not a species")))
            }
        };
        present(&self.inert, "inert")?;
        for reactant in &self.reactants {
            present(reactant, "reactant")?;
            if *reactant == self.inert {
                return Err(Error::InvalidRole(format!(
                    "{reactant} cannot be both inert and a reactant"
                )));
            }
        }
        for (product, reactant) in &self.products {
            present(product, "product")?;
            if *product == self.inert || self.reactants.contains(product) {
                return Err(Error::InvalidRole(format!(
                    "product {product} already holds another role"
                )));
            }
            if !self.reactants.contains(reactant) {
                return Err(Error::InvalidRole(format!(
                    "product {product} is formed from {reactant}, which is not a reactant"
                )));
            }
        }
        Ok(())
    }

    fn is_inert(&self, name: &str) -> bool {
        self.inert == name
    }
}

/// Summary quantities which can be computed on demand
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requirement {
    Moments,
    Diffusion,
    Reactivities,
}

/// Settings of [`Experiment::process`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProcessingOptions {
    pub baseline: BaselineMethod,
    /// Run baseline correction and calibration fits on the smoothed flux
    pub smooth: bool,
    /// Calibrate the inert against one of its own pulses before anything else
    pub inert_reference_pulse: Option<usize>,
    /// Calibrate every other species against the inert
    pub calibrate_species: bool,
    pub tap_mix: TapMixOptions,
    pub moments: MomentOptions,
    pub procedure: Procedure,
    /// Smooth the derived concentrations and rates
    pub post_smoothing: bool,
    pub reactivities: bool,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            baseline: BaselineMethod::default(),
            smooth: true,
            inert_reference_pulse: None,
            calibrate_species: true,
            tap_mix: TapMixOptions::default(),
            moments: MomentOptions::default(),
            procedure: Procedure::default(),
            post_smoothing: false,
            reactivities: true,
        }
    }
}

fn note(outcomes: &mut BTreeMap<String, BatchOutcome>, name: &str, outcome: BatchOutcome) {
    outcomes.entry(name.to_owned()).or_default().merge(outcome);
}

/// Name of a species derived from `name` by one analysis
pub fn derived_name(analysis: &str, name: &str) -> String {
    format!("{analysis}_{name}")
}

#[derive(Clone, Debug, Default)]
pub struct Experiment {
    reactor: Arc<Reactor>,
    species: BTreeMap<String, Transient>,
    roles: Option<Roles>,
}

impl Experiment {
    pub fn new(reactor: Reactor) -> Self {
        Self {
            reactor: Arc::new(reactor),
            species: BTreeMap::new(),
            roles: None,
        }
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Replace the reactor geometry of the experiment and every species in it
    ///
    /// Summary columns computed under the previous geometry are kept as they are.
    pub fn set_reactor(&mut self, reactor: Reactor) {
        self.reactor = Arc::new(reactor);
        for transient in self.species.values_mut() {
            transient.set_reactor(Arc::clone(&self.reactor));
        }
    }

    /// Add a species, replacing any species of the same name
    pub fn insert(&mut self, mut transient: Transient) {
        transient.set_reactor(Arc::clone(&self.reactor));
        self.species.insert(transient.name.clone(), transient);
    }

    /// # Errors
    /// Fails with [`Error::UnknownSpecies`] if no species has this name.
    pub fn get(&self, name: &str) -> Result<&Transient> {
        self.species
            .get(name)
            .ok_or_else(|| Error::UnknownSpecies(name.to_owned()))
    }

    /// # Errors
    /// Fails with [`Error::UnknownSpecies`] if no species has this name.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut Transient> {
        self.species
            .get_mut(name)
            .ok_or_else(|| Error::UnknownSpecies(name.to_owned()))
    }

    pub fn species(&self) -> impl Iterator<Item = &Transient> {
        self.species.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.species.keys().map(String::as_str)
    }

    pub const fn roles(&self) -> Option<&Roles> {
        self.roles.as_ref()
    }

    /// # Errors
    /// Fails if the roles do not match the species present.
    pub fn set_roles(&mut self, roles: Roles) -> Result<()> {
        roles.validate(&self.species)?;
        self.roles = Some(roles);
        Ok(())
    }

    fn validated_roles(&self) -> Result<Roles> {
        let roles = self
            .roles
            .clone()
            .ok_or_else(|| Error::InvalidRole("no roles are assigned".into()))?;
        roles.validate(&self.species)?;
        Ok(roles)
    }

    /// Insert an independent copy of a species under a new name
    ///
    /// # Errors
    /// Fails if `name` is not a species.
    pub fn make_copy(&mut self, name: &str, new_name: &str) -> Result<&mut Transient> {
        let mut copy = self.get(name)?.clone();
        copy.name = new_name.to_owned();
        self.species.insert(new_name.to_owned(), copy);
        self.get_mut(new_name)
    }

    /// Point every species but the inert at the inert
    ///
    /// # Errors
    /// Fails if no valid roles are assigned.
    pub fn set_reference_gas(&mut self) -> Result<()> {
        let roles = self.validated_roles()?;
        for transient in self.species.values_mut() {
            if !roles.is_inert(&transient.name) {
                transient.reference_gas = Some(roles.inert.clone());
            }
        }
        Ok(())
    }

    /// Remove the delay time of every species
    ///
    /// # Errors
    /// Fails on the first species whose delay leaves too few samples.
    pub fn remove_delay_time(&mut self) -> Result<()> {
        for transient in self.species.values_mut() {
            transient.remove_delay_time()?;
        }
        Ok(())
    }

    /// Run `op` on a species taken out of the map, with read access to the others
    fn with_species<T>(
        &mut self,
        name: &str,
        op: impl FnOnce(&mut Transient, &BTreeMap<String, Transient>) -> Result<T>,
    ) -> Result<T> {
        let (key, mut transient) = self
            .species
            .remove_entry(name)
            .ok_or_else(|| Error::UnknownSpecies(name.to_owned()))?;
        let result = op(&mut transient, &self.species);
        self.species.insert(key, transient);
        result
    }

    /// Compute a summary quantity of a species if it is not already present
    ///
    /// Reactivities pull in the moments and diffusion of the species and of the inert, and a
    /// product first resolves the reactivities of its reactant.
    ///
    /// # Errors
    /// Fails if the species is unknown, has no role suited to the requirement, or a dependency
    /// cannot be computed.
    pub fn resolve(
        &mut self,
        name: &str,
        requirement: Requirement,
        options: &MomentOptions,
    ) -> Result<BatchOutcome> {
        match requirement {
            Requirement::Moments => {
                let transient = self.get_mut(name)?;
                if transient.summary().contains(Field::M1) {
                    Ok(BatchOutcome::default())
                } else {
                    Ok(transient.set_moments(options))
                }
            }
            Requirement::Diffusion => {
                let mut outcome = self.resolve(name, Requirement::Moments, options)?;
                if self.get(name)?.summary().contains(Field::Diffusion) {
                    return Ok(outcome);
                }
                outcome.merge(self.with_species(name, |transient, others| {
                    let reference_mass = match &transient.reference_gas {
                        Some(reference) => Some(
                            others
                                .get(reference)
                                .ok_or_else(|| Error::UnknownSpecies(reference.clone()))?
                                .mass,
                        ),
                        None => None,
                    };
                    transient.set_gas_diffusion(reference_mass)
                })?);
                Ok(outcome)
            }
            Requirement::Reactivities => self.resolve_reactivities(name, options),
        }
    }

    fn resolve_reactivities(&mut self, name: &str, options: &MomentOptions) -> Result<BatchOutcome> {
        if self.get(name)?.summary().contains(Field::R0) {
            return Ok(BatchOutcome::default());
        }
        let roles = self.validated_roles()?;
        let mut outcome = self.resolve(&roles.inert, Requirement::Diffusion, options)?;
        outcome.merge(self.resolve(name, Requirement::Diffusion, options)?);

        if roles.reactants.contains(name) {
            info!("{name}: reactant reactivities");
            outcome.merge(self.with_species(name, |reactant, others| {
                let inert = others
                    .get(&roles.inert)
                    .ok_or_else(|| Error::UnknownSpecies(roles.inert.clone()))?;
                reactant.set_reactivities(inert)
            })?);
        } else if let Some(reactant_name) = roles.products.get(name) {
            outcome.merge(self.resolve_reactivities(reactant_name, options)?);
            info!("{name}: product reactivities from {reactant_name}");
            outcome.merge(self.with_species(name, |product, others| {
                let inert = others
                    .get(&roles.inert)
                    .ok_or_else(|| Error::UnknownSpecies(roles.inert.clone()))?;
                let reactant = others
                    .get(reactant_name)
                    .ok_or_else(|| Error::UnknownSpecies(reactant_name.clone()))?;
                product.set_product_reactivities(reactant, inert)
            })?);
        } else {
            return Err(Error::InvalidRole(format!(
                "{name} is neither a reactant nor a product"
            )));
        }
        Ok(outcome)
    }

    /// Derive the concentration, rate and accumulation of one species as new species
    fn derive_analyses(
        &mut self,
        name: &str,
        inert: Option<&str>,
        options: &ProcessingOptions,
        outcomes: &mut BTreeMap<String, BatchOutcome>,
    ) -> Result<()> {
        let concentration = derived_name("concentration", name);
        let outcome = self
            .make_copy(name, &concentration)?
            .set_concentration(options.procedure, options.post_smoothing)?;
        note(outcomes, &concentration, outcome);

        let rate = derived_name("rate", name);
        self.make_copy(name, &rate)?;
        let outcome = self.with_species(&rate, |transient, others| {
            let reference = inert
                .map(|inert| {
                    others
                        .get(inert)
                        .ok_or_else(|| Error::UnknownSpecies(inert.to_owned()))
                })
                .transpose()?;
            transient.set_rate(options.procedure, reference, options.post_smoothing)
        })?;
        note(outcomes, &rate, outcome);

        let accumulation = derived_name("accumulation", name);
        self.make_copy(&rate, &accumulation)?.set_accumulation();
        Ok(())
    }

    /// Process every species with an assigned role
    ///
    /// The stages run in order: baseline correction of every species, calibration of the inert
    /// to a reference pulse, calibration of every other species against a copy of the inert
    /// rescaled to its mass, the concentration, rate and accumulation of every reactant (rates
    /// taken against the inert) and product, and finally the reactivities. Derived analyses are
    /// inserted as new species named `concentration_<name>`, `rate_<name>` and
    /// `accumulation_<name>`.
    ///
    /// # Errors
    /// Fails if the roles are invalid or a stage fails for a whole species. Failures of single
    /// pulses are returned per species instead.
    pub fn process(
        &mut self,
        options: &ProcessingOptions,
    ) -> Result<BTreeMap<String, BatchOutcome>> {
        let roles = self.validated_roles()?;
        let mut outcomes = BTreeMap::new();
        let names: Vec<String> = self.species.keys().cloned().collect();

        for name in &names {
            let outcome = self
                .get_mut(name)?
                .baseline_correct(options.baseline, options.smooth);
            note(&mut outcomes, name, outcome);
        }

        if let Some(pulse) = options.inert_reference_pulse {
            let outcome = self.get_mut(&roles.inert)?.calibrate_flux(
                CalibrationTarget::Pulse(pulse),
                options.smooth,
                &options.tap_mix,
            )?;
            note(&mut outcomes, &roles.inert, outcome);
        }

        if options.calibrate_species {
            let inert = self.get(&roles.inert)?.clone();
            for name in names.iter().filter(|name| !roles.is_inert(name)) {
                let transient = self.get_mut(name)?;
                let mut reference = inert.clone();
                let rescaled = reference.grahams_law(transient.mass)?;
                note(&mut outcomes, &roles.inert, rescaled);
                let outcome = transient.calibrate_flux(
                    CalibrationTarget::Teak(&reference),
                    options.smooth,
                    &options.tap_mix,
                )?;
                note(&mut outcomes, name, outcome);
            }
        }

        self.set_reference_gas()?;

        for reactant in &roles.reactants {
            self.derive_analyses(reactant, Some(roles.inert.as_str()), options, &mut outcomes)?;
        }
        for product in roles.products.keys() {
            self.derive_analyses(product, None, options, &mut outcomes)?;
        }

        if options.reactivities {
            for name in roles.reactants.iter().chain(roles.products.keys()) {
                let outcome = self.resolve(name, Requirement::Reactivities, &options.moments)?;
                note(&mut outcomes, name, outcome);
            }
        }
        Ok(outcomes)
    }
}
