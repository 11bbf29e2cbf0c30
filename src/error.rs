use thiserror::Error;

use crate::summary::Field;

/// Errors raised while processing pulse responses.
#[derive(Error, Debug)]
pub enum Error {
    /// The signal cannot support the requested computation (zero area, empty window, too few
    /// samples).
    #[error("degenerate input: {0}")]
    DegenerateInput(String),
    /// A constrained or iterative fit did not reach a feasible optimum.
    #[error("solver failure: {0}")]
    SolverFailure(String),
    /// A role assignment names a species that cannot fill it.
    #[error("invalid role assignment: {0}")]
    InvalidRole(String),
    #[error("species `{0}` is not present in the experiment")]
    UnknownSpecies(String),
    /// Reactor or experiment configuration is missing keys or holds unphysical values.
    #[error("configuration mismatch: {0}")]
    ConfigurationMismatch(String),
    /// A computation depends on a summary column that has not been filled.
    #[error("species `{species}` has no `{field}` summary column")]
    MissingSummary { species: String, field: Field },
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error(transparent)]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn solver(err: &argmin::core::Error) -> Self {
        Self::SolverFailure(err.to_string())
    }
}
