use super::error::OrchestratorError;
use super::progress::{ProgressRecord, ProgressStore};
use super::restic::{DumpStream, Restic, Snapshot};
use super::Drive;
use crate::storage::DriveSource;
use crate::utils::config::Config;
use crate::watcher::{DirectoryWatcher, WatchEvent};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Ties the watcher to the backup tool: starts a run when a drive appears,
/// keeps at most one run per drive, and publishes progress.
#[derive(Clone)]
pub struct BackupOrchestrator {
    config: Arc<Config>,
    drives: Arc<RwLock<HashMap<PathBuf, Registration>>>,
    next_generation: Arc<AtomicU64>,
    active_runs: Arc<Mutex<HashSet<PathBuf>>>,
    progress: ProgressStore,
    watcher: DirectoryWatcher,
    started: Arc<AtomicBool>,
}

/// A cached drive record. `generation` changes every time the path is
/// (re)added, so a run can tell whether its registration is still current.
#[derive(Clone)]
struct Registration {
    drive: Drive,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Automatic,
    Manual,
    Registration,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trigger::Automatic => "automatic",
            Trigger::Manual => "manual",
            Trigger::Registration => "on-registration",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub drive: PathBuf,
    pub trigger: Trigger,
    pub status: RunStatus,
    pub records: usize,
}

/// What the orchestrator did with one watcher event.
#[derive(Debug)]
pub enum EventOutcome {
    Started(JoinHandle<RunOutcome>),
    AlreadyRunning,
    AutoBackupDisabled,
    UnknownPath,
    Ignored,
}

/// Handles for the poller and the event loop.
pub struct WatchHandle {
    poller: JoinHandle<()>,
    events: JoinHandle<()>,
}

impl WatchHandle {
    pub fn abort(&self) {
        self.poller.abort();
        self.events.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.poller.is_finished() && self.events.is_finished()
    }
}

/// Marks a drive path busy for as long as it lives.
struct RunGuard {
    active: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl RunGuard {
    fn acquire(active: &Arc<Mutex<HashSet<PathBuf>>>, path: &Path) -> Option<Self> {
        if !active.lock().insert(path.to_path_buf()) {
            return None;
        }
        Some(Self {
            active: active.clone(),
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.path);
    }
}

impl BackupOrchestrator {
    pub fn new(config: Arc<Config>, progress: ProgressStore) -> Self {
        let watcher = DirectoryWatcher::new(config.poll_interval);
        Self {
            config,
            drives: Arc::new(RwLock::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(0)),
            active_runs: Arc::new(Mutex::new(HashSet::new())),
            progress,
            watcher,
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn watcher(&self) -> &DirectoryWatcher {
        &self.watcher
    }

    pub fn progress_store(&self) -> &ProgressStore {
        &self.progress
    }

    /// Register the initial drive set and start watching.
    pub async fn register_initial_drives(
        &self,
        drives: Vec<Drive>,
    ) -> Result<WatchHandle, OrchestratorError> {
        info!("Registering {} drive(s)", drives.len());
        for drive in drives {
            self.add_drive(drive).await;
        }
        self.start()
    }

    pub async fn register_from_source(&self, source: &dyn DriveSource) -> anyhow::Result<WatchHandle> {
        let drives = source.list_drives().await?;
        Ok(self.register_initial_drives(drives).await?)
    }

    /// Spawn the poller and the event loop. Only once per orchestrator.
    pub fn start(&self) -> Result<WatchHandle, OrchestratorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyStarted);
        }

        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let poller = self.watcher.start(tx);

        let orchestrator = self.clone();
        let events = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                orchestrator.handle_event(event);
            }
            debug!("Watch event channel closed");
        });

        Ok(WatchHandle { poller, events })
    }

    /// Add or replace a drive without disturbing the others.
    ///
    /// With `backup_on_register` set, a drive that is already present gets an
    /// automatic run straight away; the returned handle belongs to that run.
    pub async fn add_drive(&self, drive: Drive) -> Option<JoinHandle<RunOutcome>> {
        let host_path = self.config.host_path(&drive.path);
        let registration = Registration {
            drive,
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
        };
        self.drives
            .write()
            .insert(registration.drive.path.clone(), registration.clone());
        self.watcher.add(host_path.clone()).await;
        info!("Drive registered: {}", registration.drive.path.display());

        let present = self.watcher.is_present(&host_path) == Some(true);
        if self.config.backup_on_register && registration.drive.auto_backup_enabled && present {
            return self.start_run(registration, Trigger::Registration);
        }
        None
    }

    /// Refresh the cached record, e.g. after the auto-backup flag changed.
    pub fn update_drive(&self, drive: Drive) -> Result<(), OrchestratorError> {
        let mut drives = self.drives.write();
        match drives.get_mut(&drive.path) {
            Some(cached) => {
                cached.drive = drive;
                Ok(())
            }
            None => Err(OrchestratorError::DriveNotFound(drive.path)),
        }
    }

    /// Stop watching a drive and forget its progress. A run already in
    /// flight finishes but no longer publishes.
    pub fn remove_drive(&self, path: &Path) -> bool {
        self.watcher.remove(&self.config.host_path(path));
        let mut drives = self.drives.write();
        let removed = drives.remove(path).is_some();
        self.progress.clear(path);
        if removed {
            info!("Drive removed: {}", path.display());
        }
        removed
    }

    /// Start a backup regardless of the auto-backup flag.
    ///
    /// Only `drive.path` is looked at: the run uses the registered record,
    /// so credential-free copies from [`BackupOrchestrator::drives`] work.
    /// Use [`BackupOrchestrator::update_drive`] to change the record itself.
    pub fn trigger_manual_backup(&self, drive: Drive) -> Result<JoinHandle<RunOutcome>, OrchestratorError> {
        let registration = self.registration(&drive.path)?;
        self.start_run(registration, Trigger::Manual)
            .ok_or(OrchestratorError::AlreadyRunning(drive.path))
    }

    pub fn handle_event(&self, event: WatchEvent) -> EventOutcome {
        let host_path = match event {
            WatchEvent::Disappeared(path) => {
                debug!("{} disappeared", path.display());
                return EventOutcome::Ignored;
            }
            WatchEvent::Appeared(path) => path,
        };

        let Some(registration) = self.registration_at_host_path(&host_path) else {
            debug!("No drive registered at {}", host_path.display());
            return EventOutcome::UnknownPath;
        };

        let path = registration.drive.path.clone();
        if !registration.drive.auto_backup_enabled {
            info!("Auto backup disabled for {}, skipping", path.display());
            return EventOutcome::AutoBackupDisabled;
        }

        match self.start_run(registration, Trigger::Automatic) {
            Some(handle) => EventOutcome::Started(handle),
            None => {
                warn!("Backup already running for {}, dropping trigger", path.display());
                EventOutcome::AlreadyRunning
            }
        }
    }

    pub fn is_running(&self, path: &Path) -> bool {
        self.active_runs.lock().contains(path)
    }

    /// Credential-free view of the registered drives.
    pub fn drives(&self) -> Vec<Drive> {
        let mut drives: Vec<Drive> = self
            .drives
            .read()
            .values()
            .map(|r| Drive {
                credential: String::new(),
                ..r.drive.clone()
            })
            .collect();
        drives.sort_by(|a, b| a.path.cmp(&b.path));
        drives
    }

    /// Latest progress for a registered drive, `None` if nothing reported yet.
    pub fn progress(&self, path: &Path) -> Result<Option<ProgressRecord>, OrchestratorError> {
        self.registered(path)?;
        Ok(self.progress.get(path))
    }

    pub async fn snapshots(&self, path: &Path) -> Result<Vec<Snapshot>, OrchestratorError> {
        let client = self.client_for(&self.registered(path)?);
        Ok(client.snapshots().await?)
    }

    pub async fn forget(&self, path: &Path, snapshot_id: &str) -> Result<(), OrchestratorError> {
        let client = self.client_for(&self.registered(path)?);
        Ok(client.forget(snapshot_id).await?)
    }

    pub async fn restore(&self, path: &Path, snapshot_id: &str, target: &Path) -> Result<(), OrchestratorError> {
        let client = self.client_for(&self.registered(path)?);
        Ok(client.restore(snapshot_id, target).await?)
    }

    pub fn dump(&self, path: &Path) -> Result<DumpStream, OrchestratorError> {
        let client = self.client_for(&self.registered(path)?);
        Ok(client.dump()?)
    }

    fn registration(&self, path: &Path) -> Result<Registration, OrchestratorError> {
        self.drives
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| OrchestratorError::DriveNotFound(path.to_path_buf()))
    }

    fn registered(&self, path: &Path) -> Result<Drive, OrchestratorError> {
        self.registration(path).map(|r| r.drive)
    }

    fn registration_at_host_path(&self, host_path: &Path) -> Option<Registration> {
        self.drives
            .read()
            .values()
            .find(|r| self.config.host_path(&r.drive.path) == host_path)
            .cloned()
    }

    fn client_for(&self, drive: &Drive) -> Restic {
        Restic::new(
            self.config.restic.clone(),
            self.config.host_path(&drive.backup_path),
            &drive.credential,
            self.config.host_path(&drive.path),
        )
    }

    /// Publish only while the run's own registration is current. A drive
    /// that was removed, or removed and added again, never gets progress back
    /// from a run that outlived it.
    fn publish(&self, path: &Path, generation: u64, record: ProgressRecord) {
        let drives = self.drives.read();
        if drives.get(path).is_some_and(|r| r.generation == generation) {
            self.progress.set(path, record);
        } else {
            debug!("Dropping progress for stale registration of {}", path.display());
        }
    }

    fn start_run(&self, registration: Registration, trigger: Trigger) -> Option<JoinHandle<RunOutcome>> {
        let Registration { drive, generation } = registration;
        let guard = RunGuard::acquire(&self.active_runs, &drive.path)?;
        let run_id = Uuid::new_v4();
        let span = info_span!("backup_run", %run_id, drive = %drive.path.display(), %trigger);

        let orchestrator = self.clone();
        Some(tokio::spawn(
            async move {
                let _guard = guard;
                orchestrator.execute_run(run_id, drive, generation, trigger).await
            }
            .instrument(span),
        ))
    }

    async fn execute_run(&self, run_id: Uuid, drive: Drive, generation: u64, trigger: Trigger) -> RunOutcome {
        info!("Starting {} backup of {}", trigger, drive.path.display());
        let client = self.client_for(&drive);
        let mut records = 0;

        let result = match client.backup().await {
            Ok(mut stream) => {
                while let Some(record) = stream.next_record().await {
                    records += 1;
                    self.publish(&drive.path, generation, record);
                }
                stream.finish().await
            }
            Err(e) => Err(e),
        };

        let status = match result {
            Ok(()) => {
                info!("Backup of {} finished ({} progress records)", drive.path.display(), records);
                RunStatus::Succeeded
            }
            Err(e) => {
                error!("Backup of {} failed: {}", drive.path.display(), e);
                self.publish(&drive.path, generation, ProgressRecord::exit_error(e.to_string()));
                RunStatus::Failed(e.to_string())
            }
        };

        RunOutcome {
            run_id,
            drive: drive.path,
            trigger,
            status,
            records,
        }
    }
}
