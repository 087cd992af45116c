//! Human approval gate for staging and prod deploys.

pub mod gate;
pub mod request;

pub use gate::*;
pub use request::*;
