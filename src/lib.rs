//! Watches removable drives and runs a restic backup whenever one is plugged
//! in. The HTTP layer talks to [`BackupOrchestrator`] and reads
//! [`ProgressStore`]; everything else here is plumbing behind those two.

pub mod backup;
pub mod storage;
pub mod utils;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testutil;

pub use backup::{BackupOrchestrator, Drive, ProgressRecord, ProgressStore};
pub use storage::{DriveSource, Storage};
pub use utils::config::Config;
pub use watcher::{DirectoryWatcher, WatchEvent, WatchState};
