//! Step execution primitives shared by the pipeline's capability crates:
//! external commands, bounded timeouts, retries with backoff and named locks.

pub mod command;
pub mod locks;
pub mod retry;
pub mod timeout;

pub use command::*;
pub use locks::*;
pub use retry::*;
pub use timeout::*;
