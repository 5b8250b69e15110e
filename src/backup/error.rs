use std::path::PathBuf;
use thiserror::Error;

/// Exit code restic uses when the repository does not exist (0.17+).
pub const EXIT_REPOSITORY_MISSING: i32 = 10;

/// Failures from invoking the external backup binary.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}", status = describe_exit(.code))]
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} produced no stdout pipe")]
    MissingStdout { program: String },

    #[error("i/o error talking to backup tool: {0}")]
    Io(#[from] std::io::Error),

    #[error("unparseable backup tool output: {0}")]
    Parse(#[from] serde_json::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "signal".to_string(),
    }
}

impl ToolError {
    /// True when the failure means the repository has never been initialized.
    pub fn is_missing_repository(&self) -> bool {
        match self {
            ToolError::Exit { code, stderr, .. } => {
                *code == Some(EXIT_REPOSITORY_MISSING)
                    || stderr.contains("Is there a repository at the following location?")
                    || stderr.contains("repository does not exist")
            }
            _ => false,
        }
    }
}

/// Failures surfaced by the orchestrator's imperative API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("drive not registered: {}", .0.display())]
    DriveNotFound(PathBuf),

    #[error("backup already running for {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("watcher already started")]
    AlreadyStarted,

    #[error(transparent)]
    Tool(#[from] ToolError),
}
