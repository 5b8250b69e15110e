use super::error::ToolError;
use pin_project_lite::pin_project;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

/// Program plus any wrapper arguments placed before the tool's own arguments
/// (e.g. `flatpak-spawn --host restic`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Whitespace-split command line. Returns `None` for a blank string.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).with_leading_args(parts))
    }

    fn display_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }
}

impl Default for ToolCommand {
    fn default() -> Self {
        Self::new("restic")
    }
}

/// Spawns the external tool with a controlled environment.
///
/// Secrets only ever travel through `env`, never argv, so they do not show up
/// in process listings. `Debug` prints variable names only.
#[derive(Clone)]
pub struct ProcessRunner {
    command: ToolCommand,
    env: Vec<(String, String)>,
}

impl fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("ProcessRunner")
            .field("command", &self.command)
            .field("env", &names)
            .finish()
    }
}

impl ProcessRunner {
    pub fn new(command: ToolCommand) -> Self {
        Self {
            command,
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program_name(&self) -> String {
        self.command.display_name()
    }

    fn build<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.leading_args);
        cmd.args(args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        // The tool must never sit waiting on a password prompt.
        cmd.stdin(Stdio::null());
        cmd
    }

    fn spawn_error(&self, source: io::Error) -> ToolError {
        ToolError::Spawn {
            program: self.program_name(),
            source,
        }
    }

    fn exit_error(&self, status: ExitStatus, stderr: &[u8]) -> ToolError {
        ToolError::Exit {
            program: self.program_name(),
            code: status.code(),
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }

    /// Run to completion and return stdout. Non-zero exit is an error
    /// carrying the captured stderr.
    pub async fn run<I, S>(&self, args: I) -> Result<Vec<u8>, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.build(args);
        debug!("Running {:?} {:?}", self.command.program, cmd.as_std().get_args().collect::<Vec<_>>());

        let output = cmd.output().await.map_err(|e| self.spawn_error(e))?;
        if !output.status.success() {
            return Err(self.exit_error(output.status, &output.stderr));
        }
        Ok(output.stdout)
    }

    fn spawn_piped<I, S>(&self, args: I) -> Result<(Child, ChildStdout, JoinHandle<Vec<u8>>), ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.build(args);
        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child.stdout.take().ok_or_else(|| ToolError::MissingStdout {
            program: self.program_name(),
        })?;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_stderr(self.program_name(), stderr)))
            .unwrap_or_else(|| tokio::spawn(async { Vec::new() }));

        Ok((child, stdout, stderr_task))
    }

    /// Spawn and expose stdout line by line.
    pub fn spawn_lines<I, S>(&self, args: I) -> Result<ChildLines, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (child, stdout, stderr_task) = self.spawn_piped(args)?;
        Ok(ChildLines {
            runner: self.clone(),
            child,
            lines: SplitStream::new(BufReader::new(stdout).split(b'\n')),
            stderr_task,
            read_error: None,
        })
    }

    /// Spawn and expose stdout as raw bytes.
    pub fn spawn_bytes<I, S>(&self, args: I) -> Result<ChildBytes, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (child, stdout, stderr_task) = self.spawn_piped(args)?;
        Ok(ChildBytes {
            runner: self.clone(),
            child,
            stdout,
            stderr_task,
        })
    }

    async fn finish(
        &self,
        mut child: Child,
        stderr_task: JoinHandle<Vec<u8>>,
    ) -> Result<(), ToolError> {
        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(self.exit_error(status, &stderr))
        }
    }
}

async fn collect_stderr(program: String, stderr: ChildStderr) -> Vec<u8> {
    let mut lines = BufReader::new(stderr).lines();
    let mut collected = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("{} stderr: {}", program, line);
        collected.extend_from_slice(line.as_bytes());
        collected.push(b'\n');
    }
    collected
}

/// Line-oriented stdout of a running child. Single pass.
///
/// Lines are split on raw bytes and decoded lossily, so output that is not
/// UTF-8 comes through as an ordinary (unparseable) line.
pub struct ChildLines {
    runner: ProcessRunner,
    child: Child,
    lines: SplitStream<BufReader<ChildStdout>>,
    stderr_task: JoinHandle<Vec<u8>>,
    read_error: Option<io::Error>,
}

impl ChildLines {
    /// Next stdout line, `None` at EOF. A read error also ends the stream and
    /// is reported by [`ChildLines::finish`].
    pub async fn next_line(&mut self) -> Option<String> {
        if self.read_error.is_some() {
            return None;
        }
        match self.lines.next().await? {
            Ok(mut line) => {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Some(String::from_utf8_lossy(&line).into_owned())
            }
            Err(e) => {
                warn!("Error reading {} stdout: {}", self.runner.program_name(), e);
                self.read_error = Some(e);
                None
            }
        }
    }

    /// Drain whatever stdout is left, then wait for exit.
    ///
    /// The pipe is closed before waiting, so a child that is still writing
    /// after a read error gets EPIPE instead of blocking forever.
    pub async fn finish(mut self) -> Result<(), ToolError> {
        while self.next_line().await.is_some() {}
        let ChildLines {
            runner,
            child,
            lines,
            stderr_task,
            read_error,
        } = self;
        drop(lines);
        let result = runner.finish(child, stderr_task).await;
        match (result, read_error) {
            (Err(e), _) => Err(e),
            (Ok(()), Some(e)) => Err(ToolError::Io(e)),
            (Ok(()), None) => Ok(()),
        }
    }
}

pin_project! {
    /// Raw stdout of a running child. Dropping it kills the child.
    pub struct ChildBytes {
        runner: ProcessRunner,
        child: Child,
        #[pin]
        stdout: ChildStdout,
        stderr_task: JoinHandle<Vec<u8>>,
    }
}

impl ChildBytes {
    /// Read everything that is left, then wait for exit.
    pub async fn finish(mut self) -> Result<(), ToolError> {
        let mut sink = Vec::new();
        self.stdout.read_to_end(&mut sink).await?;
        self.runner.finish(self.child, self.stderr_task).await
    }
}

impl AsyncRead for ChildBytes {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().stdout.poll_read(cx, buf)
    }
}
