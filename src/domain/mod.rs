pub mod credentials;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod port;
pub mod readout;
pub mod reconciler;
pub mod revisions;
pub mod runner;
pub mod secrets;
pub mod validation;

pub use orchestrator::{DeploymentService, Settings};
