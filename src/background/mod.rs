//! Sky background removal for FLT exposures: a 2-D least-squares fit of
//! polynomial and reference-image terms, and a 1-D column residual pass for
//! grism exposures.

pub mod fit;
pub mod model;
pub mod oned;
pub mod plot;
pub mod stats;

pub use fit::{fit_exposure, BackgroundFit, BackgroundFitter, FitOptions};
pub use model::{BackgroundModel, BasisTerm};
pub use oned::{asn_oned_background_subtract, oned_background_subtract, OnedOptions};
