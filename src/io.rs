//! Experiment directories on disk
//!
//! A directory holds `experiment.toml` and one CSV file per species. Each CSV file starts with a
//! `time` column followed by one column per pulse:
//!
//! ```toml
//! [reactor]
//! zone_lengths = { zone0 = 0.02, zone1 = 0.00075, zone2 = 0.02 }
//! # ..
//!
//! [roles]
//! inert = "Ar"
//! reactants = ["CO"]
//!
//! [roles.products]
//! CO2 = "CO"
//!
//! [[species]]
//! name = "Ar"
//! mass = 40.0
//! ```
use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use ndarray::{Array1, Array2};
use serde::Deserialize;

use crate::experiment::{Experiment, Roles};
use crate::reactor::Reactor;
use crate::transient::Transient;
use crate::{Error, Result};

pub const EXPERIMENT_FILE: &str = "experiment.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExperimentFile {
    reactor: Option<toml::Table>,
    roles: Option<Roles>,
    #[serde(default)]
    species: Vec<SpeciesRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SpeciesRecord {
    name: String,
    mass: f64,
    gain: Option<f64>,
    delay_time: Option<f64>,
    /// Flux file relative to the experiment directory, `<name>.csv` when absent
    file: Option<PathBuf>,
    diffusion: Option<f64>,
    integration_times: Option<[f64; 2]>,
}

/// Read a time axis and a flux matrix with one column per pulse
///
/// # Errors
/// Fails if the file cannot be parsed, the first column is not `time`, no pulse column is present
/// or the time axis is not strictly increasing.
pub fn read_flux_csv(path: impl AsRef<Path>) -> Result<(Array1<f64>, Array2<f64>)> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    if headers.get(0) != Some("time") {
        return Err(Error::ConfigurationMismatch(format!(
            "{} must start with a time column",
            path.display()
        )));
    }
    let num_pulses = headers.len() - 1;
    if num_pulses == 0 {
        return Err(Error::DegenerateInput(format!(
            "{} holds no pulse columns",
            path.display()
        )));
    }

    let mut times = Vec::new();
    let mut values = Vec::new();
    for row in reader.deserialize::<Vec<f64>>() {
        let row = row?;
        times.push(row[0]);
        values.extend_from_slice(&row[1..]);
    }
    if times.windows(2).any(|pair| pair[1] <= pair[0]) {
        return Err(Error::DegenerateInput(format!(
            "times in {} are not strictly increasing",
            path.display()
        )));
    }

    let flux = Array2::from_shape_vec((times.len(), num_pulses), values)?;
    Ok((Array1::from_vec(times), flux))
}

/// Load an experiment directory
///
/// # Errors
/// Fails if `experiment.toml` or a species file is missing or malformed, the reactor is not
/// physical or the roles name absent species.
pub fn load_experiment(dir: impl AsRef<Path>) -> Result<Experiment> {
    let dir = dir.as_ref();
    let contents = fs::read_to_string(dir.join(EXPERIMENT_FILE))?;
    let file: ExperimentFile = toml::from_str(&contents)?;

    let reactor = match file.reactor {
        Some(table) => Reactor::from_toml_str(&table.to_string())?,
        None => Reactor::default(),
    };
    let mut experiment = Experiment::new(reactor);

    for record in file.species {
        let path = dir.join(
            record
                .file
                .unwrap_or_else(|| PathBuf::from(format!("{}.csv", record.name))),
        );
        let (times, flux) = read_flux_csv(&path)?;
        let mut transient = Transient::new(record.name, times, flux)?.with_mass(record.mass);
        if let Some(gain) = record.gain {
            transient.gain = gain;
        }
        if let Some(delay_time) = record.delay_time {
            transient.delay_time = delay_time;
        }
        if let Some(diffusion) = record.diffusion {
            transient.diffusion = diffusion;
        }
        if let Some(integration_times) = record.integration_times {
            transient.integration_times = integration_times;
        }
        info!(
            "loaded {} pulses of {} from {}",
            transient.num_pulses(),
            transient.name,
            path.display()
        );
        experiment.insert(transient);
    }

    if let Some(roles) = file.roles {
        experiment.set_roles(roles)?;
    }
    Ok(experiment)
}

/// Write the summary table of a species, one row per pulse
///
/// # Errors
/// Fails if the file cannot be written.
pub fn write_summary(path: impl AsRef<Path>, transient: &Transient) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    let columns: Vec<_> = transient.summary().iter().collect();

    writer.write_record(
        std::iter::once("pulse".to_owned()).chain(columns.iter().map(|(field, _)| field.to_string())),
    )?;
    for pulse in 0..transient.num_pulses() {
        writer.write_record(
            std::iter::once(pulse.to_string())
                .chain(columns.iter().map(|(_, values)| values[pulse].to_string())),
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the time axis and flux of a species in the layout read by [`read_flux_csv`]
///
/// # Errors
/// Fails if the file cannot be written.
pub fn write_flux(path: impl AsRef<Path>, transient: &Transient) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(
        std::iter::once("time".to_owned())
            .chain((0..transient.num_pulses()).map(|pulse| format!("pulse_{pulse}"))),
    )?;
    for (time, row) in transient.times().iter().zip(transient.flux().rows()) {
        writer.write_record(
            std::iter::once(time.to_string()).chain(row.iter().map(ToString::to_string)),
        )?;
    }
    writer.flush()?;
    Ok(())
}
