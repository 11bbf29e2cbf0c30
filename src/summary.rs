use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, ArrayView1};

use crate::{Error, Result};

/// A named per-pulse quantity tracked for a species
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    M0,
    M1,
    M2,
    MeanResidenceTime,
    VarianceResidenceTime,
    GammaShape,
    GammaScale,
    Baseline,
    CalibrationCoef,
    Intercept,
    Diffusion,
    R0,
    R1,
    R2,
    Min,
    Mean,
    Max,
}

impl Field {
    pub const ALL: [Self; 17] = [
        Self::M0,
        Self::M1,
        Self::M2,
        Self::MeanResidenceTime,
        Self::VarianceResidenceTime,
        Self::GammaShape,
        Self::GammaScale,
        Self::Baseline,
        Self::CalibrationCoef,
        Self::Intercept,
        Self::Diffusion,
        Self::R0,
        Self::R1,
        Self::R2,
        Self::Min,
        Self::Mean,
        Self::Max,
    ];

    /// The column header used when a summary table is written out
    pub const fn name(self) -> &'static str {
        match self {
            Self::M0 => "M0",
            Self::M1 => "M1",
            Self::M2 => "M2",
            Self::MeanResidenceTime => "mean_residence_time",
            Self::VarianceResidenceTime => "variance_residence_time",
            Self::GammaShape => "gamma_shape",
            Self::GammaScale => "gamma_scale",
            Self::Baseline => "baseline",
            Self::CalibrationCoef => "calibration_coef",
            Self::Intercept => "intercept",
            Self::Diffusion => "diffusion",
            Self::R0 => "r0",
            Self::R1 => "r1",
            Self::R2 => "r2",
            Self::Min => "min",
            Self::Mean => "mean",
            Self::Max => "max",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Field {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|field| field.name() == s)
            .ok_or_else(|| Error::ConfigurationMismatch(format!("unknown summary field `{s}`")))
    }
}

/// Per-pulse summary state for one species
///
/// Columns are added as they are computed and are never removed. Writing a column that already
/// exists overwrites it in place. Every column has one entry per pulse; a pulse whose computation
/// failed holds NaN.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SummaryTable {
    num_pulses: usize,
    columns: BTreeMap<Field, Array1<f64>>,
}

impl SummaryTable {
    pub fn new(num_pulses: usize) -> Self {
        Self {
            num_pulses,
            columns: BTreeMap::new(),
        }
    }

    pub const fn num_pulses(&self) -> usize {
        self.num_pulses
    }

    pub fn contains(&self, field: Field) -> bool {
        self.columns.contains_key(&field)
    }

    pub fn get(&self, field: Field) -> Option<ArrayView1<f64>> {
        self.columns.get(&field).map(Array1::view)
    }

    /// Fetch a column which a downstream computation depends on
    ///
    /// # Errors
    /// Returns [`Error::MissingSummary`] if the column has not been computed.
    pub fn require(&self, field: Field, species: &str) -> Result<ArrayView1<f64>> {
        self.get(field).ok_or_else(|| Error::MissingSummary {
            species: species.to_owned(),
            field,
        })
    }

    /// Insert or overwrite a full column
    ///
    /// # Errors
    /// Fails if `values` does not hold one entry per pulse.
    pub fn insert(&mut self, field: Field, values: Array1<f64>) -> Result<()> {
        if values.len() != self.num_pulses {
            return Err(Error::DimensionMismatch {
                expected: self.num_pulses,
                found: values.len(),
            });
        }
        self.columns.insert(field, values);
        Ok(())
    }

    /// Mutable access to a column, creating it filled with `fill` if absent
    pub fn column_mut(&mut self, field: Field, fill: f64) -> &mut Array1<f64> {
        let num_pulses = self.num_pulses;
        self.columns
            .entry(field)
            .or_insert_with(|| Array1::from_elem(num_pulses, fill))
    }

    /// Iterate over the computed columns in field order
    pub fn iter(&self) -> impl Iterator<Item = (Field, ArrayView1<f64>)> {
        self.columns.iter().map(|(field, values)| (*field, values.view()))
    }

    pub fn fields(&self) -> impl Iterator<Item = Field> + '_ {
        self.columns.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::{Field, SummaryTable};
    use crate::Error;

    #[test]
    fn field_names_round_trip_through_from_str() {
        for field in Field::ALL {
            assert_eq!(field.name().parse::<Field>().unwrap(), field);
        }
        assert!("not_a_field".parse::<Field>().is_err());
    }

    #[test]
    fn columns_must_span_every_pulse() {
        let mut table = SummaryTable::new(3);
        assert!(matches!(
            table.insert(Field::M0, arr1(&[1.0, 2.0])),
            Err(Error::DimensionMismatch {
                expected: 3,
                found: 2
            })
        ));
        table.insert(Field::M0, arr1(&[1.0, 2.0, 3.0])).unwrap();
        assert!(table.contains(Field::M0));
    }

    #[test]
    fn missing_columns_name_the_species() {
        let table = SummaryTable::new(1);
        let err = table.require(Field::R0, "CO").unwrap_err();
        assert_eq!(err.to_string(), "species `CO` has no `r0` summary column");
    }

    #[test]
    fn new_columns_are_filled_before_single_cells_are_written() {
        let mut table = SummaryTable::new(4);
        table.column_mut(Field::Baseline, f64::NAN)[2] = 1.5;
        let column = table.get(Field::Baseline).unwrap();
        assert!(column[0].is_nan());
        approx::assert_relative_eq!(column[2], 1.5);
        assert_eq!(table.fields().collect::<Vec<_>>(), vec![Field::Baseline]);
    }
}
