use super::error::ToolError;
use super::process::{ChildBytes, ChildLines, ProcessRunner, ToolCommand};
use super::progress::ProgressRecord;
use async_compression::tokio::bufread::GzipEncoder;
use chrono::{DateTime, Utc};
use pin_project_lite::pin_project;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, BufReader, ReadBuf};
use tracing::{debug, info, warn};

const PASSWORD_ENV: &str = "RESTIC_PASSWORD";

/// A snapshot as listed by `restic snapshots --json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

/// restic client scoped to one (repository, password, source path) triple.
#[derive(Debug, Clone)]
pub struct Restic {
    runner: ProcessRunner,
    repository: PathBuf,
    source: PathBuf,
}

impl Restic {
    pub fn new(command: ToolCommand, repository: PathBuf, password: &str, source: PathBuf) -> Self {
        Self {
            runner: ProcessRunner::new(command).env(PASSWORD_ENV, password),
            repository,
            source,
        }
    }

    pub fn repository(&self) -> &Path {
        &self.repository
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    fn args<'a>(&'a self, args: &[&'a str]) -> Vec<&'a OsStr> {
        let mut full: Vec<&OsStr> = args.iter().map(|a| OsStr::new(*a)).collect();
        full.push(OsStr::new("--repo"));
        full.push(self.repository.as_os_str());
        full
    }

    /// `restic version`, first line only.
    pub async fn version(command: &ToolCommand) -> Result<String, ToolError> {
        let out = ProcessRunner::new(command.clone()).run(["version"]).await?;
        let text = String::from_utf8_lossy(&out);
        Ok(text.lines().next().unwrap_or("unknown").trim().to_string())
    }

    /// Probe with `snapshots`; initialize the repository if the probe fails.
    pub async fn ensure_initialized(&self) -> Result<(), ToolError> {
        match self.runner.run(self.args(&["snapshots", "--json"])).await {
            Ok(_) => Ok(()),
            Err(probe_err) => {
                debug!(
                    "Probe of {} failed ({}), initializing",
                    self.repository.display(),
                    probe_err
                );
                self.runner.run(self.args(&["init"])).await?;
                info!("Initialized repository {}", self.repository.display());
                Ok(())
            }
        }
    }

    /// Clear stale locks. Best-effort: failure is logged and swallowed.
    pub async fn unlock(&self) {
        match self.runner.run(self.args(&["unlock"])).await {
            Ok(_) => info!("Unlocked repository {}", self.repository.display()),
            Err(e) => warn!("Failed to unlock repository {}: {}", self.repository.display(), e),
        }
    }

    /// Start a backup of the source path and stream its progress.
    ///
    /// Initialization and unlock run first. Errors from those and from
    /// spawning are returned here; a failing backup process is reported by
    /// [`BackupStream::finish`].
    pub async fn backup(&self) -> Result<BackupStream, ToolError> {
        self.ensure_initialized().await?;
        self.unlock().await;

        let source = self.source.to_string_lossy();
        let lines = self
            .runner
            .spawn_lines(self.args(&["backup", source.as_ref(), "--json"]))?;
        info!("Backup started for {} -> {}", self.source.display(), self.repository.display());
        Ok(BackupStream { lines, skipped: 0 })
    }

    /// All snapshots in the repository; empty if it was never initialized.
    pub async fn snapshots(&self) -> Result<Vec<Snapshot>, ToolError> {
        let out = match self.runner.run(self.args(&["snapshots", "--json"])).await {
            Ok(out) => out,
            Err(e) if e.is_missing_repository() => {
                debug!("No repository at {}", self.repository.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        if out.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let snapshots: Option<Vec<Snapshot>> = serde_json::from_slice(&out)?;
        Ok(snapshots.unwrap_or_default())
    }

    /// Remove one snapshot and prune unreferenced data.
    pub async fn forget(&self, snapshot_id: &str) -> Result<(), ToolError> {
        self.runner
            .run(self.args(&["forget", snapshot_id, "--prune"]))
            .await?;
        info!("Forgot snapshot {} in {}", snapshot_id, self.repository.display());
        Ok(())
    }

    /// Restore a snapshot under `target`. Blocks until the tool exits.
    pub async fn restore(&self, snapshot_id: &str, target: &Path) -> Result<(), ToolError> {
        let target = target.to_string_lossy();
        self.runner
            .run(self.args(&["restore", snapshot_id, "--target", target.as_ref()]))
            .await?;
        info!("Restored snapshot {} to {}", snapshot_id, target);
        Ok(())
    }

    /// TAR export of the source path from the latest snapshot.
    pub fn dump(&self) -> Result<DumpStream, ToolError> {
        let source = self.source.to_string_lossy();
        let inner = self.runner.spawn_bytes(self.args(&[
            "dump",
            "latest",
            source.as_ref(),
            "--archive",
            "tar",
        ]))?;
        Ok(DumpStream { inner })
    }
}

/// Live progress of one backup process. Single pass: iterate with
/// [`BackupStream::next_record`], then call [`BackupStream::finish`].
pub struct BackupStream {
    lines: ChildLines,
    skipped: usize,
}

impl BackupStream {
    /// Next parsed record. Lines that are not progress JSON are skipped.
    pub async fn next_record(&mut self) -> Option<ProgressRecord> {
        loop {
            let line = self.lines.next_line().await?;
            match ProgressRecord::parse_line(&line) {
                Some(record) => return Some(record),
                None => {
                    self.skipped += 1;
                    debug!("Ignoring non-JSON backup output: {}", line);
                }
            }
        }
    }

    /// Lines dropped so far because they did not parse.
    pub fn skipped_lines(&self) -> usize {
        self.skipped
    }

    /// Wait for the process and report how it exited.
    pub async fn finish(self) -> Result<(), ToolError> {
        self.lines.finish().await
    }
}

pin_project! {
    /// TAR bytes from `restic dump`. The caller owns the stream; dropping it
    /// kills the process.
    pub struct DumpStream {
        #[pin]
        inner: ChildBytes,
    }
}

impl DumpStream {
    /// Gzip on the fly for `.tar.gz` downloads.
    pub fn gzip(self) -> GzipEncoder<BufReader<DumpStream>> {
        GzipEncoder::new(BufReader::new(self))
    }

    /// Read anything left and check the exit status.
    pub async fn finish(self) -> Result<(), ToolError> {
        self.inner.finish().await
    }
}

impl AsyncRead for DumpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeRestic;
    use async_compression::tokio::bufread::GzipDecoder;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_snapshots_on_missing_repository_is_empty() {
        let fake = FakeRestic::new();
        let restic = fake.client("/mnt/usb");
        assert!(restic.snapshots().await.unwrap().is_empty());
        assert_eq!(fake.calls(), vec!["snapshots"]);
    }

    #[tokio::test]
    async fn test_ensure_initialized_only_inits_once() {
        let fake = FakeRestic::new();
        let restic = fake.client("/mnt/usb");
        restic.ensure_initialized().await.unwrap();
        restic.ensure_initialized().await.unwrap();
        assert_eq!(fake.calls(), vec!["snapshots", "init", "snapshots"]);
    }

    #[tokio::test]
    async fn test_init_failure_is_fatal() {
        let fake = FakeRestic::new();
        fake.set_flag("init_fails");
        let restic = fake.client("/mnt/usb");
        assert!(matches!(restic.backup().await, Err(ToolError::Exit { .. })));
        assert!(!fake.calls().contains(&"backup".to_string()));
    }

    #[tokio::test]
    async fn test_backup_streams_records_and_skips_noise() {
        let fake = FakeRestic::new();
        let restic = fake.client("/mnt/usb");
        let mut stream = restic.backup().await.unwrap();

        let mut kinds = Vec::new();
        while let Some(record) = stream.next_record().await {
            kinds.push(record.message_type);
        }
        assert_eq!(stream.skipped_lines(), 1);
        stream.finish().await.unwrap();

        use crate::backup::progress::MessageType;
        assert_eq!(
            kinds,
            vec![MessageType::Status, MessageType::Status, MessageType::Summary]
        );
        assert_eq!(fake.calls(), vec!["snapshots", "init", "unlock", "backup"]);
        assert_eq!(fake.last_backup_password().as_deref(), Some(FakeRestic::PASSWORD));
    }

    #[tokio::test]
    async fn test_backup_skips_truncated_and_binary_lines() {
        use crate::backup::progress::MessageType;

        let fake = FakeRestic::new();
        fake.set_flag("noisy");
        let restic = fake.client("/mnt/usb");
        let mut stream = restic.backup().await.unwrap();

        let mut records = Vec::new();
        while let Some(record) = stream.next_record().await {
            records.push(record);
        }
        assert_eq!(stream.skipped_lines(), 3);
        stream.finish().await.unwrap();

        let kinds: Vec<_> = records.iter().map(|r| r.message_type).collect();
        assert_eq!(
            kinds,
            vec![MessageType::Status, MessageType::Status, MessageType::Summary]
        );
        let done: Vec<_> = records.iter().map(|r| r.files_done).collect();
        assert_eq!(done, vec![Some(0), Some(2), None]);
    }

    #[tokio::test]
    async fn test_failed_unlock_does_not_block_backup() {
        let fake = FakeRestic::new();
        fake.set_flag("unlock_fails");
        let restic = fake.client("/mnt/usb");
        let mut stream = restic.backup().await.unwrap();
        while stream.next_record().await.is_some() {}
        stream.finish().await.unwrap();
        assert_eq!(restic.snapshots().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_backup_reported_on_finish() {
        let fake = FakeRestic::new();
        fake.set_flag("backup_fails");
        let restic = fake.client("/mnt/usb");
        let mut stream = restic.backup().await.unwrap();
        let mut count = 0;
        while stream.next_record().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
        assert!(matches!(stream.finish().await, Err(ToolError::Exit { code: Some(1), .. })));
    }

    #[tokio::test]
    async fn test_forget_removes_snapshot() {
        let fake = FakeRestic::new();
        let restic = fake.client("/mnt/usb");
        restic.ensure_initialized().await.unwrap();
        fake.add_snapshot("snap123");
        fake.add_snapshot("snap456");

        restic.forget("snap123").await.unwrap();
        let ids: Vec<String> = restic.snapshots().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["snap456"]);
    }

    #[tokio::test]
    async fn test_restore_writes_target() {
        let fake = FakeRestic::new();
        let restic = fake.client("/mnt/usb");
        restic.ensure_initialized().await.unwrap();
        fake.add_snapshot("abc");
        let target = fake.dir().join("restore-here");

        restic.restore("abc", &target).await.unwrap();
        assert!(target.join("restored-abc").exists());
        assert!(restic.restore("missing", &target).await.is_err());
    }

    #[tokio::test]
    async fn test_dump_and_gzip() {
        let fake = FakeRestic::new();
        let restic = fake.client("/mnt/usb");

        let mut raw = Vec::new();
        let mut dump = restic.dump().unwrap();
        dump.read_to_end(&mut raw).await.unwrap();
        dump.finish().await.unwrap();
        assert_eq!(raw, b"tar:/mnt/usb");

        let mut gz = Vec::new();
        restic.dump().unwrap().gzip().read_to_end(&mut gz).await.unwrap();
        let mut plain = Vec::new();
        GzipDecoder::new(&gz[..]).read_to_end(&mut plain).await.unwrap();
        assert_eq!(plain, b"tar:/mnt/usb");
    }

    #[tokio::test]
    async fn test_version() {
        let fake = FakeRestic::new();
        let version = Restic::version(&fake.command()).await.unwrap();
        assert!(version.starts_with("restic 0.17"));
    }

    #[test]
    fn test_snapshot_json_shape() {
        let json = r#"[{"time":"2024-05-01T10:00:00.123456789+02:00","tree":"ab","paths":["/mnt/usb"],"hostname":"pixelbook","username":"me","id":"4f1c2d3e5a","short_id":"4f1c2d3e"}]"#;
        let snapshots: Vec<Snapshot> = serde_json::from_str(json).unwrap();
        assert_eq!(snapshots[0].short_id, "4f1c2d3e");
        assert_eq!(snapshots[0].time.to_rfc3339(), "2024-05-01T08:00:00.123456789+00:00");
        assert!(snapshots[0].tags.is_empty());
    }
}
