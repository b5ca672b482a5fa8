//! The foreground llamafile child and raw signal helpers.

use crate::error::{ClientError, Result};
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Most output kept per stream; older bytes are discarded.
const CAPTURE_LIMIT: usize = 64 * 1024;

/// How long to wait for the drain tasks once the child has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Tail of a child's output stream.
#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
}

impl Capture {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > CAPTURE_LIMIT {
            let excess = self.bytes.len() - CAPTURE_LIMIT;
            self.bytes.drain(..excess);
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).trim().to_string()
    }
}

type SharedCapture = Arc<Mutex<Capture>>;

fn drain<R>(mut reader: R, capture: SharedCapture) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut capture) = capture.lock() {
                        capture.push(&buf[..n]);
                    }
                }
            }
        }
    })
}

/// A llamafile server running as a child of this process.
///
/// The child is killed if the handle is dropped without [`terminate`].
///
/// [`terminate`]: ServerProcess::terminate
pub struct ServerProcess {
    child: Child,
    pid: u32,
    stdout: SharedCapture,
    stderr: SharedCapture,
    drains: Vec<JoinHandle<()>>,
}

impl ServerProcess {
    /// Spawn `executable` with `args`, capturing its output.
    pub fn spawn(executable: &Path, args: &[String]) -> Result<Self> {
        let mut child = Command::new(executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id().ok_or_else(|| ClientError::StartupFailure {
            exit_code: None,
            output: "process exited before it could be tracked".to_string(),
        })?;

        let stdout = SharedCapture::default();
        let stderr = SharedCapture::default();
        let mut drains = Vec::new();
        if let Some(out) = child.stdout.take() {
            drains.push(drain(out, Arc::clone(&stdout)));
        }
        if let Some(err) = child.stderr.take() {
            drains.push(drain(err, Arc::clone(&stderr)));
        }

        debug!("Spawned {} (PID {})", executable.display(), pid);
        Ok(Self {
            child,
            pid,
            stdout,
            stderr,
            drains,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The exit status, if the child has already exited.
    pub fn try_exit(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Captured stdout and stderr, after letting the drain tasks catch up.
    pub async fn diagnostics(&mut self) -> String {
        for handle in self.drains.drain(..) {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, handle).await;
        }
        let text = |capture: &SharedCapture| {
            capture
                .lock()
                .map(|c| c.text())
                .unwrap_or_default()
        };
        format!("stdout: {}\nstderr: {}", text(&self.stdout), text(&self.stderr))
    }

    /// SIGTERM, then SIGKILL if the child outlives `grace`.
    pub async fn terminate(mut self, grace: Duration) -> Result<()> {
        if self.try_exit()?.is_some() {
            return Ok(());
        }

        send_signal(self.pid, libc::SIGTERM)?;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                debug!("Llamafile exited with {}", status?);
            }
            Err(_) => {
                warn!(
                    "Llamafile (PID {}) ignored SIGTERM for {:?}, killing it",
                    self.pid, grace
                );
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

fn as_pid(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|pid| *pid > 0)
}

/// Whether a process with `pid` exists. A process owned by another user
/// still counts as alive.
pub fn is_alive(pid: u32) -> bool {
    let Some(pid) = as_pid(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission checks.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send `signal` to `pid`. Returns `false` if no such process exists.
pub fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<bool> {
    let Some(target) = as_pid(pid) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal PID {}", pid),
        ));
    };
    // SAFETY: plain kill(2) on a positive PID.
    if unsafe { libc::kill(target, signal) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_keeps_tail() {
        let mut capture = Capture::default();
        capture.push(&vec![b'a'; CAPTURE_LIMIT]);
        capture.push(b"tail");
        assert_eq!(capture.bytes.len(), CAPTURE_LIMIT);
        assert!(capture.text().ends_with("tail"));
    }

    #[test]
    fn test_liveness() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
        assert!(send_signal(0, 0).is_err());
    }

    #[tokio::test]
    async fn test_diagnostics_capture_output() {
        let args = vec!["-c".to_string(), "echo out; echo boom >&2; exit 3".to_string()];
        let mut process = ServerProcess::spawn(Path::new("/bin/sh"), &args).unwrap();

        let status = loop {
            if let Some(status) = process.try_exit().unwrap() {
                break status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(status.code(), Some(3));

        let output = process.diagnostics().await;
        assert!(output.contains("stdout: out"));
        assert!(output.contains("stderr: boom"));
    }

    #[tokio::test]
    async fn test_terminate_running_child() {
        let args = vec!["30".to_string()];
        let process = ServerProcess::spawn(Path::new("sleep"), &args).unwrap();
        let pid = process.pid();
        assert!(is_alive(pid));

        process.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(!is_alive(pid));
    }
}
