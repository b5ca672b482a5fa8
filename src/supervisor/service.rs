//! The on-disk record of a detached llamafile service.
//!
//! The record is a pair of files in the state directory: the server's PID
//! and the API token it was started with. Both are written together by the
//! daemon and removed together when the service stops.
//!
//! A third file, the startup status, tells the launching process how the
//! daemon is doing: `OK <pid>` once the server is spawned and recorded, or
//! `ERROR <code> <message>` once the daemon gives up or the server exits.

use super::process::is_alive;
use crate::credentials::{CredentialStore, Token};
use crate::error::{ClientError, Result};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const PID_FILE_NAME: &str = "llamafile.pid";
pub const LOG_FILE_NAME: &str = "llamafile.log";
pub const STATUS_FILE_NAME: &str = "llamafile.status";

/// Most log bytes included in a startup failure.
const LOG_TAIL_LIMIT: u64 = 4096;

/// Progress reported by the daemon through the status file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupStatus {
    /// The server is spawned and the record written.
    Spawned(u32),
    /// The daemon failed, or the server exited. `exit_code` is the server's
    /// when it ran at all.
    Failed {
        exit_code: Option<i32>,
        message: String,
    },
}

impl StartupStatus {
    fn render(&self) -> String {
        match self {
            StartupStatus::Spawned(pid) => format!("OK {}", pid),
            StartupStatus::Failed { exit_code, message } => {
                let code = exit_code.map_or_else(|| "-".to_string(), |c| c.to_string());
                format!("ERROR {} {}", code, message)
            }
        }
    }

    fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Some(pid) = text.strip_prefix("OK ") {
            return pid.trim().parse().ok().map(StartupStatus::Spawned);
        }
        let rest = text.strip_prefix("ERROR ")?;
        let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
        let exit_code = match code {
            "-" => None,
            code => Some(code.parse().ok()?),
        };
        Some(StartupStatus::Failed {
            exit_code,
            message: message.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pid_path: PathBuf,
    log_path: PathBuf,
    status_path: PathBuf,
    credentials: CredentialStore,
}

impl ServiceRecord {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            pid_path: state_dir.join(PID_FILE_NAME),
            log_path: state_dir.join(LOG_FILE_NAME),
            status_path: state_dir.join(STATUS_FILE_NAME),
            credentials: CredentialStore::new(state_dir),
        }
    }

    #[cfg(test)]
    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Persist the token and then the PID. The PID file appears atomically.
    pub fn write(&self, pid: u32, token: &Token) -> Result<()> {
        if let Some(parent) = self.pid_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.credentials.persist(token)?;

        let tmp = self.pid_path.with_extension("pid.tmp");
        std::fs::write(&tmp, pid.to_string())?;
        std::fs::rename(&tmp, &self.pid_path)?;
        debug!("Service record written (PID {})", pid);
        Ok(())
    }

    #[cfg(test)]
    pub fn exists(&self) -> bool {
        self.pid_path.exists()
    }

    /// The recorded PID, `None` when there is no record.
    pub fn read_pid(&self) -> Result<Option<u32>> {
        let contents = match std::fs::read_to_string(&self.pid_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let trimmed = contents.trim();
        match trimmed.parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => Err(ClientError::InvalidPidFile {
                path: self.pid_path.clone(),
                reason: format!("'{}' is not a process id", trimmed),
            }),
        }
    }

    /// The recorded PID if that process is alive. Stale or unreadable
    /// records are removed.
    ///
    /// Only liveness is checked: a recycled PID belonging to an unrelated
    /// process is reported as the service.
    pub fn live_pid(&self) -> Option<u32> {
        match self.read_pid() {
            Ok(Some(pid)) if is_alive(pid) => Some(pid),
            Ok(Some(pid)) => {
                debug!("Discarding stale service record (PID {})", pid);
                self.discard();
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Discarding service record: {}", e);
                self.discard();
                None
            }
        }
    }

    /// Remove both files, tolerating their absence.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.pid_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.credentials.remove()
    }

    fn discard(&self) {
        if let Err(e) = self.remove() {
            warn!("Failed to remove service record: {}", e);
        }
    }

    /// Replace the startup status. The file appears atomically.
    pub fn write_status(&self, status: &StartupStatus) -> Result<()> {
        if let Some(parent) = self.status_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.status_path.with_extension("status.tmp");
        std::fs::write(&tmp, status.render())?;
        std::fs::rename(&tmp, &self.status_path)?;
        Ok(())
    }

    /// The last reported startup status. Missing or garbled files read as `None`.
    pub fn read_status(&self) -> Option<StartupStatus> {
        let contents = std::fs::read_to_string(&self.status_path).ok()?;
        StartupStatus::parse(&contents)
    }

    /// Forget the previous startup status before a new launch.
    pub fn clear_status(&self) -> Result<()> {
        match std::fs::remove_file(&self.status_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Current size of the log, used as the starting point for [`log_since`].
    ///
    /// [`log_since`]: ServiceRecord::log_since
    pub fn log_len(&self) -> u64 {
        std::fs::metadata(&self.log_path)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Log text appended after `offset`, limited to the last few KiB.
    pub fn log_since(&self, offset: u64) -> String {
        let Ok(mut file) = std::fs::File::open(&self.log_path) else {
            return String::new();
        };
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        let start = offset.max(len.saturating_sub(LOG_TAIL_LIMIT)).min(len);
        let mut bytes = Vec::new();
        if file.seek(SeekFrom::Start(start)).is_err() || file.read_to_end(&mut bytes).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_remove_pair() {
        let dir = tempfile::tempdir().unwrap();
        let record = ServiceRecord::new(&dir.path().join("state"));
        let pid = std::process::id();

        record.write(pid, &Token::new("secret")).unwrap();
        assert_eq!(record.read_pid().unwrap(), Some(pid));
        assert_eq!(record.credentials().load().unwrap().as_str(), "secret");
        assert_eq!(record.live_pid(), Some(pid));

        record.remove().unwrap();
        assert!(!record.exists());
        assert!(record.credentials().load().is_none());
        record.remove().unwrap();
    }

    #[test]
    fn test_stale_record_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let record = ServiceRecord::new(dir.path());

        // Spawn and reap a short-lived process so its PID is known dead.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        record.write(pid, &Token::new("secret")).unwrap();
        assert_eq!(record.live_pid(), None);
        assert!(!record.exists());
        assert!(!record.credentials().path().exists());
    }

    #[test]
    fn test_invalid_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let record = ServiceRecord::new(dir.path());
        std::fs::write(record.pid_path(), "not-a-pid").unwrap();

        assert!(matches!(
            record.read_pid(),
            Err(ClientError::InvalidPidFile { .. })
        ));
        assert_eq!(record.live_pid(), None);
        assert!(!record.exists());
    }

    #[test]
    fn test_startup_status_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let record = ServiceRecord::new(dir.path());
        assert_eq!(record.read_status(), None);

        record.write_status(&StartupStatus::Spawned(42)).unwrap();
        assert_eq!(record.read_status(), Some(StartupStatus::Spawned(42)));

        let failed = StartupStatus::Failed {
            exit_code: Some(2),
            message: "llamafile exited with exit status: 2".to_string(),
        };
        record.write_status(&failed).unwrap();
        assert_eq!(record.read_status(), Some(failed));

        let aborted = StartupStatus::Failed {
            exit_code: None,
            message: "failed to start /nope".to_string(),
        };
        record.write_status(&aborted).unwrap();
        assert_eq!(record.read_status(), Some(aborted));

        record.clear_status().unwrap();
        assert_eq!(record.read_status(), None);
        record.clear_status().unwrap();
    }

    #[test]
    fn test_garbled_status_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let record = ServiceRecord::new(dir.path());
        for garbage in ["", "OK", "OK abc", "ERROR x boom", "READY 1"] {
            std::fs::write(dir.path().join(STATUS_FILE_NAME), garbage).unwrap();
            assert_eq!(record.read_status(), None, "{:?}", garbage);
        }
    }

    #[test]
    fn test_log_since_offset() {
        let dir = tempfile::tempdir().unwrap();
        let record = ServiceRecord::new(dir.path());
        std::fs::write(record.log_path(), "old run\n").unwrap();
        let offset = record.log_len();

        let mut log = std::fs::OpenOptions::new()
            .append(true)
            .open(record.log_path())
            .unwrap();
        std::io::Write::write_all(&mut log, b"error: model not found\n").unwrap();

        assert_eq!(record.log_since(offset), "error: model not found");
        assert_eq!(record.log_since(0), "old run\nerror: model not found");
    }
}
