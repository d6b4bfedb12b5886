mod ledger;
mod storage;

pub use storage::MemoryBackend;
