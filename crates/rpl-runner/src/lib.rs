pub mod cancel;
pub mod config;
pub mod doctor;
pub mod pipeline;
pub mod wiring;

pub use cancel::*;
pub use config::*;
pub use doctor::*;
pub use pipeline::*;
pub use wiring::*;
