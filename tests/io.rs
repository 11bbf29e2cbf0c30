use std::path::Path;

use ndarray::Array1;
use tempdir::TempDir;

use tap_pulse::diffusion::standard_diffusion_curve;
use tap_pulse::io::{load_experiment, read_flux_csv, write_flux, write_summary, EXPERIMENT_FILE};
use tap_pulse::transient::MomentOptions;
use tap_pulse::Error;

const REACTOR: &str = r#"
[reactor]
zone_lengths = { zone0 = 0.02, zone1 = 0.00075, zone2 = 0.02 }
zone_porosity = { zone0 = 0.4, zone1 = 0.4, zone2 = 0.4 }
zone_diffusion = { zone0 = 0.002, zone1 = 0.002, zone2 = 0.002 }
reactor_radius = 0.002
catalyst_weight = 0.5
mol_per_pulse = 1.0
"#;

const SPECIES: &str = r#"
[roles]
inert = "Ar"
reactants = ["CO"]

[roles.products]
CO2 = "CO"

[[species]]
name = "Ar"
mass = 40.0

[[species]]
name = "CO"
mass = 28.0
delay_time = 0.1

[[species]]
name = "CO2"
mass = 44.0
file = "carbon_dioxide.csv"
diffusion = 0.3
"#;

fn write_species(path: &Path, residence_time: f64, num_pulses: usize) {
    let times = Array1::from_iter((0..500).map(|ii| f64::from(ii) * 0.002));
    let flux = standard_diffusion_curve(residence_time, times.view()).unwrap();

    let mut writer = csv::Writer::from_path(path).unwrap();
    let mut header = vec!["time".to_owned()];
    header.extend((0..num_pulses).map(|pulse| pulse.to_string()));
    writer.write_record(&header).unwrap();
    for (time, value) in times.iter().zip(flux.iter()) {
        let mut row = vec![time.to_string()];
        row.extend((0..num_pulses).map(|_| value.to_string()));
        writer.write_record(&row).unwrap();
    }
    writer.flush().unwrap();
}

fn create_experiment_dir(test_name: &str, config: &str) -> TempDir {
    let tmp_dir = TempDir::new(test_name).unwrap();
    std::fs::write(tmp_dir.path().join(EXPERIMENT_FILE), config).unwrap();
    write_species(&tmp_dir.path().join("Ar.csv"), 0.1, 3);
    write_species(&tmp_dir.path().join("CO.csv"), 0.08, 3);
    write_species(&tmp_dir.path().join("carbon_dioxide.csv"), 0.15, 3);
    tmp_dir
}

#[test]
fn experiment_directories_are_loaded() {
    let tmp_dir = create_experiment_dir("load", &format!("{REACTOR}{SPECIES}"));

    let experiment = load_experiment(tmp_dir.path()).unwrap();

    assert_eq!(experiment.names().collect::<Vec<_>>(), vec!["Ar", "CO", "CO2"]);
    approx::assert_relative_eq!(experiment.reactor().catalyst_weight, 0.5);

    let reactant = experiment.get("CO").unwrap();
    approx::assert_relative_eq!(reactant.mass, 28.);
    approx::assert_relative_eq!(reactant.delay_time, 0.1);
    assert_eq!(reactant.num_pulses(), 3);
    assert_eq!(reactant.times().len(), 500);
    approx::assert_relative_eq!(reactant.reactor().catalyst_weight, 0.5);

    let product = experiment.get("CO2").unwrap();
    approx::assert_relative_eq!(product.diffusion, 0.3);

    let roles = experiment.roles().unwrap();
    assert_eq!(roles.inert, "Ar");
    assert_eq!(roles.products["CO2"], "CO");
}

#[test]
fn unknown_keys_are_rejected() {
    let config = format!("{REACTOR}{SPECIES}colour = \"blue\"\n");
    let tmp_dir = create_experiment_dir("unknown_key", &config);
    assert!(matches!(load_experiment(tmp_dir.path()), Err(Error::Toml(_))));
}

#[test]
fn missing_zones_are_a_configuration_mismatch() {
    let config = format!(
        "{}{SPECIES}",
        REACTOR.replace(", zone2 = 0.02 }", " }")
    );
    let tmp_dir = create_experiment_dir("missing_zone", &config);
    assert!(matches!(
        load_experiment(tmp_dir.path()),
        Err(Error::ConfigurationMismatch(_))
    ));
}

#[test]
fn roles_must_name_loaded_species() {
    let config = format!("{REACTOR}{}", SPECIES.replace("inert = \"Ar\"", "inert = \"He\""));
    let tmp_dir = create_experiment_dir("bad_role", &config);
    assert!(matches!(
        load_experiment(tmp_dir.path()),
        Err(Error::InvalidRole(_))
    ));
}

#[test]
fn flux_files_round_trip() {
    let tmp_dir = create_experiment_dir("flux", &format!("{REACTOR}{SPECIES}"));
    let experiment = load_experiment(tmp_dir.path()).unwrap();
    let inert = experiment.get("Ar").unwrap();

    let path = tmp_dir.path().join("written.csv");
    write_flux(&path, inert).unwrap();
    let (times, flux) = read_flux_csv(&path).unwrap();

    assert_eq!(times, inert.times());
    assert_eq!(flux, inert.flux());
}

#[test]
fn summaries_are_written_per_pulse() {
    let tmp_dir = create_experiment_dir("summary", &format!("{REACTOR}{SPECIES}"));
    let experiment = load_experiment(tmp_dir.path()).unwrap();
    let mut inert = experiment.get("Ar").unwrap().clone();
    inert.set_moments(&MomentOptions::default());

    let path = tmp_dir.path().join("summary.csv");
    write_summary(&path, &inert).unwrap();

    let mut reader = csv::Reader::from_path(&path).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(headers.iter().collect::<Vec<_>>(), vec!["pulse", "M0", "M1", "M2"]);
    let rows = reader.records().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(rows.len(), 3);
    let m0: f64 = rows[0][1].parse().unwrap();
    approx::assert_relative_eq!(m0, 1., max_relative = 1e-2);
}
