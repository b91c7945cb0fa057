/*!
Bayesian posterior post-processing.

poppy fits a normalizing flow to an initial set of posterior samples and then uses it as a
proposal or preconditioner: importance sampling yields weighted samples and an evidence
estimate, and flow-initialised MCMC (stretch-move ensembles, pCN / t-pCN walkers) or
tempered SMC refine the samples further.

The main entry point is [`Poppy`], which owns a [`model::Model`] and a [`flows::Flow`].
*/

pub mod core;
pub mod error;
pub mod flows;
pub mod history;
pub mod io;
pub mod model;
#[cfg(feature = "plot")]
pub mod plot;
pub mod poppy;
pub mod samplers;
pub mod samples;
pub mod stats;
pub mod transforms;
pub mod utils;

pub use crate::error::{PoppyError, Result};
pub use crate::poppy::Poppy;
pub use crate::samples::{Samples, SmcSamples};
