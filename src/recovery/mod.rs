mod atomic;
mod wal;

pub use atomic::{AtomicOperation, AtomicOperationsManager, ComponentReadGuard};
pub use wal::{Lsn, WalManager, WalRecord};
