//! Reactivity coefficients from the perturbation expansion of the moments
//!
//! Each coefficient is a closed-form rational expression in the moments normalised by the inert
//! zeroth moment and in the zone residence times. The scalar functions evaluate a single pulse;
//! the `*_columns` functions evaluate every pulse of a species with the same expressions.
use ndarray::Array1;

use crate::moments::Moments;
use crate::reactor::ZoneMap;
use crate::{Error, Result};

/// Apparent rate constant, uptake/release coefficient and storage delay of a species
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reactivities<T = f64> {
    pub r0: T,
    pub r1: T,
    pub r2: T,
}

impl Reactivities<Array1<f64>> {
    pub fn pulse(&self, pulse: usize) -> Reactivities {
        Reactivities {
            r0: self.r0[pulse],
            r1: self.r1[pulse],
            r2: self.r2[pulse],
        }
    }

    fn collect(values: impl Iterator<Item = Reactivities>) -> Self {
        let (r0, (r1, r2)): (Vec<f64>, (Vec<f64>, Vec<f64>)) =
            values.map(|r| (r.r0, (r.r1, r.r2))).unzip();
        Self {
            r0: Array1::from(r0),
            r1: Array1::from(r1),
            r2: Array1::from(r2),
        }
    }
}

/// Diffusion coefficients of the inert, the reactant and the product, in that order
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Diffusions {
    pub inert: f64,
    pub reactant: f64,
    pub product: f64,
}

/// Reactivities of a reactant
pub fn reactant(
    reactant_moments: &Moments,
    inert_moments: &Moments,
    zone_residence_time: &ZoneMap<f64>,
) -> Reactivities {
    let Moments { m0, m1, m2 } = reactant_moments.normalise_by(inert_moments.m0);
    let tau1 = zone_residence_time.zone1;
    let tau2 = zone_residence_time.zone2;

    let r0 = -1. / tau1 + 1. / (tau1 * m0);
    let r1 = -2. * tau2 / (3. * tau1) - tau2 / (3. * tau1 * m0) + m1 / (tau1 * m0.powi(2));
    let r2 = 4. * tau2.powi(2) / (45. * tau1) + 7. * tau2.powi(2) / (90. * tau1 * m0)
        - tau2 * m1 / (3. * tau1 * m0.powi(2))
        - m2 / (2. * tau1 * m0.powi(2))
        + m1.powi(2) / (tau1 * m0.powi(3));

    Reactivities { r0, r1, r2 }
}

/// Reactivities of a product formed from `reactant_moments`
///
/// `reactant_reactivities` must already be resolved for the reactant.
pub fn product(
    product_moments: &Moments,
    reactant_moments: &Moments,
    inert_moments: &Moments,
    reactant_reactivities: &Reactivities,
    zone_residence_time: &ZoneMap<f64>,
    diffusions: &Diffusions,
) -> Reactivities {
    let reactant = reactant_moments.normalise_by(inert_moments.m0);
    let product = product_moments.normalise_by(inert_moments.m0);
    let tau1 = zone_residence_time.zone1;
    let tau2 = zone_residence_time.zone2;
    let rm0 = reactant.m0;
    let rr1 = reactant_reactivities.r1;
    let rr2 = reactant_reactivities.r2;
    let diffusion_ratio = diffusions.reactant / diffusions.product;

    let r0 = product.m0 / (tau1 * rm0);
    let r1 = r0
        * (tau2 / 12. * (8. * rm0 + 3. + 9. * diffusion_ratio) + tau1 * rm0 * rr1
            - product.m1 / product.m0);
    let r2 = r0 / 2.
        * (product.m2 / product.m0
            - 19. * diffusion_ratio.powi(2) * tau2.powi(2) / 16.
            - 19. * diffusion_ratio * tau2 / 16.
                * (r0 * ((3. + 8. * rm0) * tau2 + 12. * rm0 * rr1 * tau1) - 12. * r1)
            + r1 / (6. * r0) * ((3. + 8. * rm0) * tau2 + 12. * rm0 * rr1 * tau2)
            - tau2.powi(2) * (5. / 48. + rm0 / 45. * (23. + 40. * rm0))
            - rm0 / 6. * (3. + 16. * rm0) * rr1 * tau1 * tau2
            - 2. * rm0 * tau1 * (rm0 * rr1.powi(2) * tau1 - rr2));

    Reactivities { r0, r1, r2 }
}

fn check_len(expected: usize, found: usize) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(Error::DimensionMismatch { expected, found })
    }
}

/// Reactant reactivities for every pulse
///
/// # Errors
/// Fails if the reactant and inert hold a different number of pulses.
pub fn reactant_columns(
    reactant_moments: &Moments<Array1<f64>>,
    inert_moments: &Moments<Array1<f64>>,
    zone_residence_time: &ZoneMap<f64>,
) -> Result<Reactivities<Array1<f64>>> {
    check_len(reactant_moments.len(), inert_moments.len())?;
    Ok(Reactivities::collect((0..reactant_moments.len()).map(
        |pulse| {
            reactant(
                &reactant_moments.pulse(pulse),
                &inert_moments.pulse(pulse),
                zone_residence_time,
            )
        },
    )))
}

/// Product reactivities for every pulse
///
/// # Errors
/// Fails if the product, reactant, inert and reactant reactivities disagree on the number of
/// pulses.
pub fn product_columns(
    product_moments: &Moments<Array1<f64>>,
    reactant_moments: &Moments<Array1<f64>>,
    inert_moments: &Moments<Array1<f64>>,
    reactant_reactivities: &Reactivities<Array1<f64>>,
    zone_residence_time: &ZoneMap<f64>,
    diffusions: &Diffusions,
) -> Result<Reactivities<Array1<f64>>> {
    let num_pulses = product_moments.len();
    check_len(num_pulses, reactant_moments.len())?;
    check_len(num_pulses, inert_moments.len())?;
    check_len(num_pulses, reactant_reactivities.r0.len())?;
    Ok(Reactivities::collect((0..num_pulses).map(|pulse| {
        product(
            &product_moments.pulse(pulse),
            &reactant_moments.pulse(pulse),
            &inert_moments.pulse(pulse),
            &reactant_reactivities.pulse(pulse),
            zone_residence_time,
            diffusions,
        )
    })))
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::{product, product_columns, reactant, reactant_columns, Diffusions, Reactivities};
    use crate::moments::Moments;
    use crate::reactor::ZoneMap;

    const INERT: Moments = Moments {
        m0: 1.0,
        m1: 0.5,
        m2: 0.4,
    };

    fn residence() -> ZoneMap<f64> {
        ZoneMap::new(0.5, 1.0, 0.5)
    }

    #[test]
    fn irreversible_reactant_reactivities() {
        let moments = Moments {
            m0: 0.46,
            m1: 0.15,
            m2: 0.073,
        };
        let result = reactant(&moments, &INERT, &residence());
        approx::assert_abs_diff_eq!(result.r0, 1.17, epsilon = 0.01);
        approx::assert_abs_diff_eq!(result.r1, 0.01, epsilon = 0.01);
        approx::assert_abs_diff_eq!(result.r2, 0.01, epsilon = 0.01);
    }

    #[test]
    fn reversible_reactant_reactivities() {
        let moments = Moments {
            m0: 0.9,
            m1: 0.46,
            m2: 0.384,
        };
        let result = reactant(&moments, &INERT, &residence());
        approx::assert_abs_diff_eq!(result.r0, 0.11, epsilon = 0.01);
        approx::assert_abs_diff_eq!(result.r1, 0.05, epsilon = 0.01);
        approx::assert_abs_diff_eq!(result.r2, 0.00, epsilon = 0.01);
    }

    #[test]
    fn eley_rideal_product_reactivities() {
        let reactant_moments = Moments {
            m0: 0.4,
            m1: 0.09,
            m2: 0.03,
        };
        let product_moments = Moments {
            m0: 0.3,
            m1: 0.26,
            m2: 0.28,
        };
        let reactant_reactivities = reactant(&reactant_moments, &INERT, &residence());
        let diffusions = Diffusions {
            inert: 0.5,
            reactant: 0.5,
            product: 0.5,
        };

        let result = product(
            &product_moments,
            &reactant_moments,
            &INERT,
            &reactant_reactivities,
            &residence(),
            &diffusions,
        );

        approx::assert_abs_diff_eq!(result.r0, 0.75, epsilon = 0.01);
        approx::assert_abs_diff_eq!(result.r1, -0.23, epsilon = 0.01);
        approx::assert_abs_diff_eq!(result.r2, -0.82, epsilon = 0.01);
    }

    #[test]
    fn column_paths_agree_with_scalar_paths() {
        let reactant_moments = Moments {
            m0: arr1(&[0.46, 0.9, 0.4]),
            m1: arr1(&[0.15, 0.46, 0.09]),
            m2: arr1(&[0.073, 0.384, 0.03]),
        };
        let inert = Moments {
            m0: arr1(&[1.0, 1.1, 0.9]),
            m1: arr1(&[0.5, 0.55, 0.45]),
            m2: arr1(&[0.4, 0.44, 0.36]),
        };
        let product_moments = Moments {
            m0: arr1(&[0.3, 0.1, 0.2]),
            m1: arr1(&[0.26, 0.08, 0.1]),
            m2: arr1(&[0.28, 0.09, 0.07]),
        };
        let diffusions = Diffusions {
            inert: 0.5,
            reactant: 0.4,
            product: 0.6,
        };

        let reactant_columns =
            reactant_columns(&reactant_moments, &inert, &residence()).unwrap();
        let product_columns = product_columns(
            &product_moments,
            &reactant_moments,
            &inert,
            &reactant_columns,
            &residence(),
            &diffusions,
        )
        .unwrap();

        for pulse in 0..3 {
            let scalar_reactant = reactant(
                &reactant_moments.pulse(pulse),
                &inert.pulse(pulse),
                &residence(),
            );
            assert_eq!(reactant_columns.pulse(pulse), scalar_reactant);

            let scalar_product: Reactivities = product(
                &product_moments.pulse(pulse),
                &reactant_moments.pulse(pulse),
                &inert.pulse(pulse),
                &scalar_reactant,
                &residence(),
                &diffusions,
            );
            assert_eq!(product_columns.pulse(pulse), scalar_product);
        }
    }

    #[test]
    fn mismatched_pulse_counts_are_rejected() {
        let two = Moments {
            m0: arr1(&[1.0, 1.0]),
            m1: arr1(&[0.5, 0.5]),
            m2: arr1(&[0.4, 0.4]),
        };
        let three = Moments {
            m0: arr1(&[1.0, 1.0, 1.0]),
            m1: arr1(&[0.5, 0.5, 0.5]),
            m2: arr1(&[0.4, 0.4, 0.4]),
        };
        assert!(reactant_columns(&two, &three, &residence()).is_err());
    }
}
