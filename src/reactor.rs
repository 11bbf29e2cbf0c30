use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A quantity defined for each of the three reactor zones
///
/// `zone0` is the inert inlet, `zone1` the catalyst bed and `zone2` the inert outlet.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneMap<T> {
    pub zone0: T,
    pub zone1: T,
    pub zone2: T,
}

impl<T: Copy> ZoneMap<T> {
    pub const fn new(zone0: T, zone1: T, zone2: T) -> Self {
        Self {
            zone0,
            zone1,
            zone2,
        }
    }

    pub const fn uniform(value: T) -> Self {
        Self::new(value, value, value)
    }

    pub const fn values(&self) -> [T; 3] {
        [self.zone0, self.zone1, self.zone2]
    }

    pub fn map<U: Copy>(self, f: impl Fn(T) -> U) -> ZoneMap<U> {
        ZoneMap::new(f(self.zone0), f(self.zone1), f(self.zone2))
    }
}

impl ZoneMap<f64> {
    /// Build from dictionary-shaped input
    ///
    /// # Errors
    /// Fails with [`Error::ConfigurationMismatch`] if any of `zone0`, `zone1` or `zone2` is
    /// missing, or if an unexpected key is present.
    pub fn from_map(map: &HashMap<String, f64>) -> Result<Self> {
        let fetch = |key: &str| {
            map.get(key).copied().ok_or_else(|| {
                Error::ConfigurationMismatch(format!("zone dictionary is missing `{key}`"))
            })
        };
        if let Some(extra) = map
            .keys()
            .find(|key| !matches!(key.as_str(), "zone0" | "zone1" | "zone2"))
        {
            return Err(Error::ConfigurationMismatch(format!(
                "unexpected zone key `{extra}`"
            )));
        }
        Ok(Self::new(fetch("zone0")?, fetch("zone1")?, fetch("zone2")?))
    }

    pub fn sum(&self) -> f64 {
        self.values().iter().sum()
    }

    pub fn mean(&self) -> f64 {
        self.sum() / 3.
    }
}

/// Fixed geometry of the micro-reactor, shared read-only by every species of an experiment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reactor {
    pub zone_lengths: ZoneMap<f64>,
    pub zone_porosity: ZoneMap<f64>,
    pub zone_diffusion: ZoneMap<f64>,
    /// When absent the residence times are derived from the other zone quantities
    #[serde(default)]
    pub zone_residence_time: Option<ZoneMap<f64>>,
    pub reactor_radius: f64,
    pub catalyst_weight: f64,
    pub mol_per_pulse: f64,
}

impl Default for Reactor {
    fn default() -> Self {
        Self {
            zone_lengths: ZoneMap::new(0.02, 0.00075, 0.02),
            zone_porosity: ZoneMap::uniform(0.4),
            zone_diffusion: ZoneMap::uniform(0.002),
            zone_residence_time: Some(ZoneMap::uniform(0.5)),
            reactor_radius: 0.002,
            catalyst_weight: 1.,
            mol_per_pulse: 1.,
        }
    }
}

impl Reactor {
    /// Parse and validate a reactor from TOML
    ///
    /// # Errors
    /// Any schema violation, including a missing or unknown zone key, is reported as
    /// [`Error::ConfigurationMismatch`].
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let reactor: Self =
            toml::from_str(contents).map_err(|e| Error::ConfigurationMismatch(e.to_string()))?;
        reactor.validate()?;
        Ok(reactor)
    }

    /// Check that every quantity is physical
    ///
    /// # Errors
    /// Returns [`Error::ConfigurationMismatch`] naming the first offending quantity.
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, value: f64| {
            if value > 0. && value.is_finite() {
                Ok(())
            } else {
                Err(Error::ConfigurationMismatch(format!(
                    "{name} must be positive, found {value}"
                )))
            }
        };
        for (zone, length) in self.zone_lengths.values().into_iter().enumerate() {
            positive(&format!("zone{zone} length"), length)?;
        }
        for (zone, diffusion) in self.zone_diffusion.values().into_iter().enumerate() {
            positive(&format!("zone{zone} diffusion"), diffusion)?;
        }
        for (zone, porosity) in self.zone_porosity.values().into_iter().enumerate() {
            if !(porosity > 0. && porosity <= 1.) {
                return Err(Error::ConfigurationMismatch(format!(
                    "zone{zone} porosity must lie in (0, 1], found {porosity}"
                )));
            }
        }
        if let Some(residence) = self.zone_residence_time {
            for (zone, time) in residence.values().into_iter().enumerate() {
                positive(&format!("zone{zone} residence time"), time)?;
            }
        }
        positive("reactor radius", self.reactor_radius)?;
        positive("catalyst weight", self.catalyst_weight)?;
        positive("moles per pulse", self.mol_per_pulse)
    }

    /// Residence time of each zone, computed from the geometry if not set explicitly
    pub fn residence_times(&self) -> ZoneMap<f64> {
        self.zone_residence_time.unwrap_or_else(|| {
            calculate_residence_time(
                &self.zone_lengths,
                &self.zone_porosity,
                &self.zone_diffusion,
            )
        })
    }
}

/// Closed-form residence time of each zone (Constales et al.)
///
/// The inert zones use `porosity * (L0 + L2)^2 / (2 D)`, while the catalyst zone uses
/// `L1 * (L0 + L2) / (2 D1)`.
pub fn calculate_residence_time(
    zone_lengths: &ZoneMap<f64>,
    zone_porosity: &ZoneMap<f64>,
    zone_diffusion: &ZoneMap<f64>,
) -> ZoneMap<f64> {
    let inert_length = zone_lengths.zone0 + zone_lengths.zone2;
    ZoneMap {
        zone0: zone_porosity.zone0 * inert_length.powi(2) / (2. * zone_diffusion.zone0),
        zone1: zone_lengths.zone1 * inert_length / (2. * zone_diffusion.zone1),
        zone2: zone_porosity.zone2 * inert_length.powi(2) / (2. * zone_diffusion.zone2),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{calculate_residence_time, Reactor, ZoneMap};
    use crate::Error;

    #[test]
    fn symmetric_reactor_residence_times_are_self_consistent() {
        let lengths = ZoneMap::new(0.5, 1e-5, 0.5);
        let porosity = ZoneMap::uniform(0.5);
        let diffusion = ZoneMap::uniform(0.5);

        let residence = calculate_residence_time(&lengths, &porosity, &diffusion);

        approx::assert_relative_eq!(residence.zone0, 0.5);
        approx::assert_relative_eq!(residence.zone1, 1e-5);
        approx::assert_relative_eq!(residence.zone2, 0.5);
    }

    #[test]
    fn zone_dictionaries_fail_fast_on_missing_keys() {
        let mut map = HashMap::new();
        map.insert("zone0".to_owned(), 1.0);
        map.insert("zone2".to_owned(), 3.0);
        assert!(matches!(
            ZoneMap::from_map(&map),
            Err(Error::ConfigurationMismatch(_))
        ));

        map.insert("zone1".to_owned(), 2.0);
        assert_eq!(ZoneMap::from_map(&map).unwrap(), ZoneMap::new(1.0, 2.0, 3.0));

        map.insert("zone3".to_owned(), 4.0);
        assert!(ZoneMap::from_map(&map).is_err());
    }

    #[test]
    fn reactor_parses_from_toml_and_derives_residence_times() {
        let contents = r#"
            reactor_radius = 0.002
            catalyst_weight = 1.0
            mol_per_pulse = 1.0

            [zone_lengths]
            zone0 = 0.5
            zone1 = 1e-5
            zone2 = 0.5

            [zone_porosity]
            zone0 = 0.5
            zone1 = 0.5
            zone2 = 0.5

            [zone_diffusion]
            zone0 = 0.5
            zone1 = 0.5
            zone2 = 0.5
        "#;
        let reactor = Reactor::from_toml_str(contents).unwrap();
        assert!(reactor.zone_residence_time.is_none());
        approx::assert_relative_eq!(reactor.residence_times().zone0, 0.5);
    }

    #[test]
    fn reactor_rejects_missing_zones_and_unphysical_values() {
        let missing_zone = r#"
            reactor_radius = 0.002
            catalyst_weight = 1.0
            mol_per_pulse = 1.0
            zone_lengths = { zone0 = 0.5, zone2 = 0.5 }
            zone_porosity = { zone0 = 0.5, zone1 = 0.5, zone2 = 0.5 }
            zone_diffusion = { zone0 = 0.5, zone1 = 0.5, zone2 = 0.5 }
        "#;
        assert!(matches!(
            Reactor::from_toml_str(missing_zone),
            Err(Error::ConfigurationMismatch(_))
        ));

        let mut reactor = Reactor::default();
        assert!(reactor.validate().is_ok());
        reactor.zone_porosity.zone1 = 1.5;
        assert!(reactor.validate().is_err());
    }
}
