#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
// #![warn(clippy::cargo)]

extern crate blas_src;

pub mod baseline;
pub mod calibration;
pub mod diffusion;
pub mod error;
pub mod experiment;
pub mod inversion;
pub mod io;
pub mod math;
pub(crate) mod minimisation;
pub mod moments;
pub mod reactivities;
pub mod reactor;
pub mod smoothing;
pub mod summary;
pub mod transient;

pub use error::Error;
pub use experiment::{Experiment, ProcessingOptions, Roles};
pub use reactor::{Reactor, ZoneMap};
pub use transient::Transient;

pub type Result<T> = ::std::result::Result<T, Error>;
