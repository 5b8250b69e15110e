pub mod error;
pub mod manager;
pub mod process;
pub mod progress;
pub mod restic;

pub use error::{OrchestratorError, ToolError};
pub use manager::{BackupOrchestrator, EventOutcome, RunOutcome, RunStatus, Trigger, WatchHandle};
pub use progress::{MessageType, ProgressRecord, ProgressStore};
pub use restic::{BackupStream, DumpStream, Restic, Snapshot};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A watched source path and the repository it is backed up into.
///
/// The credential is skipped when serializing and redacted in `Debug`, so a
/// `Drive` can be handed to a rendering layer or logged as-is.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub path: PathBuf,
    pub backup_path: PathBuf,
    #[serde(skip_serializing, default)]
    pub credential: String,
    pub auto_backup_enabled: bool,
}

impl fmt::Debug for Drive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drive")
            .field("path", &self.path)
            .field("backup_path", &self.backup_path)
            .field("credential", &"<redacted>")
            .field("auto_backup_enabled", &self.auto_backup_enabled)
            .finish()
    }
}
