mod storage;

pub use storage::SqliteStore;
