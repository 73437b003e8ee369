pub mod checkpoint;
pub mod cifar;
pub mod cli;
pub mod config;
pub mod error;
pub mod loader;
pub mod loss;
pub mod metrics;
pub mod network;
pub mod nn;
pub mod optim;
pub mod pr_curve;
pub mod scheduler;
pub mod summary;
pub mod trainer;
pub mod transform;
pub mod viz;

pub use error::{Error, Result};
