pub mod command;
pub mod gate;
pub mod report;
pub mod scanner;

pub use command::*;
pub use gate::*;
pub use report::*;
pub use scanner::*;
