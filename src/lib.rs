pub mod artifact;
pub mod autoencoder;
pub mod blocks;
pub mod config;
pub mod data;
pub mod error;
pub mod hparams;
pub mod loss;
pub mod optim;
pub mod report;
pub mod search;
pub mod session;
pub mod training;

pub use autoencoder::{ConvAutoencoder, ConvAutoencoderConfig};
pub use config::{OptimizerKind, RunConfig};
pub use error::{AeError, Result};
pub use hparams::{FixedParams, HyperParams, ParamProvider};
pub use session::AutoencoderSession;
pub use training::{train_autoencoder, History};
