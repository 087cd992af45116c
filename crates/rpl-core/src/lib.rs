pub mod backoff;
pub mod engine;
pub mod error;
pub mod ids;
pub mod model;
pub mod outcomes;
pub mod routing;
pub mod time;
pub mod types;

pub use backoff::*;
pub use engine::*;
pub use error::*;
pub use ids::*;
pub use model::*;
pub use outcomes::*;
pub use routing::*;
pub use time::*;
pub use types::*;
