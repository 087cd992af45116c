pub mod builder;
pub mod digest;
pub mod error;
pub mod image;
pub mod source;

pub use builder::*;
pub use digest::*;
pub use error::*;
pub use image::*;
pub use source::*;
