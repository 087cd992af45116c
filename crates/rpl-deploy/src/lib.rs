//! Deploys a signed image to a namespace: render the manifest, apply it, record the attempt.

pub mod applier;
pub mod error;
pub mod executor;
pub mod file;
pub mod kubectl;
pub mod memory;
pub mod template;

pub use applier::*;
pub use error::*;
pub use executor::*;
pub use file::*;
pub use kubectl::*;
pub use memory::*;
pub use template::*;
