pub mod disk_manager;

pub use disk_manager::{DiskManager, FileId};
