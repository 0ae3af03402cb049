//! Shared domain and wire types for the launchpad platform.
//!
//! Types here cross process boundaries: the registry rows served by the
//! API, the log messages carried by the Log Channel, and the execution
//! context injected into every build.

pub mod model;
pub mod wire;

pub use model::{Deployment, DeploymentStatus, LogEvent, ParseStatusError, Project};
pub use wire::{BuildContext, LogMessage};
