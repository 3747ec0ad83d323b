pub mod file;
pub mod memory;
pub mod sql;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use sql::SqlBackend;
