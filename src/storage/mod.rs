pub mod atomic;
pub mod engine;
pub mod lock;
pub mod memory;

pub use atomic::{AtomicFileStore, StagedWrite};
pub use engine::{DatasetStore, decode_json, encode_json, read_json, write_json};
pub use lock::{DatasetLock, FileLock, LockGuard, ProcessLock};
pub use memory::InMemoryStore;
