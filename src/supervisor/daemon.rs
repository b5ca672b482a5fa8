//! The detached side of service mode.
//!
//! Runs in the daemonized process, which has no terminal and no async
//! runtime. It owns the server for the lifetime of the service.

use super::service::{ServiceRecord, StartupStatus};
use super::Launch;
use std::fs::File;
use std::io::Write;
use std::process::{Command, Stdio};

/// Spawn the server, record it, wait for it to exit, then clean up.
/// Never returns.
pub(super) fn serve(launch: &Launch, record: &ServiceRecord) -> ! {
    let code = match run(launch, record) {
        Ok(code) => code,
        Err(message) => {
            fail(record, None, &message);
            1
        }
    };
    std::process::exit(code)
}

/// Report `message` and exit. Used when detaching itself failed.
pub(super) fn abort(record: &ServiceRecord, message: &str) -> ! {
    fail(record, None, message);
    std::process::exit(1)
}

fn run(launch: &Launch, record: &ServiceRecord) -> Result<i32, String> {
    let log = open_log(record).map_err(|e| format!("cannot open log: {}", e))?;
    let log_err = log
        .try_clone()
        .map_err(|e| format!("cannot open log: {}", e))?;

    let mut child = Command::new(&launch.executable)
        .args(&launch.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()
        .map_err(|e| format!("failed to start {}: {}", launch.executable.display(), e))?;

    let pid = child.id();
    if let Err(e) = record.write(pid, &launch.token) {
        let _ = child.kill();
        let _ = child.wait();
        return Err(format!("failed to write service record: {}", e));
    }
    let _ = record.write_status(&StartupStatus::Spawned(pid));
    append_log(record, &format!("sumarai: llamafile running (PID {})", pid));

    let status = child
        .wait()
        .map_err(|e| format!("failed to wait for llamafile: {}", e))?;
    fail(
        record,
        status.code(),
        &format!("llamafile exited with {}", status),
    );

    // `stop` may already have removed the record, and a newer service may
    // have replaced it.
    if record.read_pid().ok().flatten() == Some(pid) {
        let _ = record.remove();
    }
    Ok(status.code().unwrap_or(0))
}

/// Log the failure and publish it as the startup status.
fn fail(record: &ServiceRecord, exit_code: Option<i32>, message: &str) {
    append_log(record, &format!("sumarai: {}", message));
    let _ = record.write_status(&StartupStatus::Failed {
        exit_code,
        message: message.to_string(),
    });
}

fn open_log(record: &ServiceRecord) -> std::io::Result<File> {
    if let Some(parent) = record.log_path().parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(record.log_path())
}

fn append_log(record: &ServiceRecord, line: &str) {
    if let Ok(mut log) = open_log(record) {
        let _ = writeln!(log, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Token;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant};

    fn launch(dir: &Path, body: &str) -> Launch {
        let path = dir.join("llamafile");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Launch {
            executable: path,
            token: Token::new("daemon-token"),
            args: Vec::new(),
        }
    }

    fn log_text(record: &ServiceRecord) -> String {
        std::fs::read_to_string(record.log_path()).unwrap()
    }

    #[test]
    fn test_record_removed_when_server_exits() {
        let dir = tempfile::tempdir().unwrap();
        let record = ServiceRecord::new(&dir.path().join("state"));
        let launch = launch(dir.path(), "echo serving\nexit 0");

        assert_eq!(run(&launch, &record).unwrap(), 0);
        assert!(!record.exists());
        assert!(!record.credentials().path().exists());

        let log = log_text(&record);
        assert!(log.contains("serving"));
        assert!(log.contains("sumarai: llamafile running (PID"));
        match record.read_status() {
            Some(StartupStatus::Failed { exit_code, message }) => {
                assert_eq!(exit_code, Some(0));
                assert!(message.contains("exited with"));
            }
            other => panic!("unexpected status: {:?}", other),
        }
    }

    #[test]
    fn test_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let record = ServiceRecord::new(dir.path());
        let launch = launch(dir.path(), "echo 'bad model' >&2\nexit 7");

        assert_eq!(run(&launch, &record).unwrap(), 7);
        assert!(log_text(&record).contains("bad model"));
        assert!(matches!(
            record.read_status(),
            Some(StartupStatus::Failed { exit_code: Some(7), .. })
        ));
    }

    #[test]
    fn test_replaced_record_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let record = ServiceRecord::new(dir.path());
        let launch = launch(dir.path(), "sleep 1");

        let daemon_record = record.clone();
        let handle = std::thread::spawn(move || run(&launch, &daemon_record));

        let deadline = Instant::now() + Duration::from_secs(5);
        let spawned = loop {
            if let Some(StartupStatus::Spawned(pid)) = record.read_status() {
                break pid;
            }
            assert!(Instant::now() < deadline, "server was never recorded");
            std::thread::sleep(Duration::from_millis(20));
        };
        assert_eq!(record.read_pid().unwrap(), Some(spawned));
        assert_eq!(record.credentials().load().unwrap().as_str(), "daemon-token");

        // A newer service took over the record while this one was running.
        let newer = std::process::id();
        record.write(newer, &Token::new("newer")).unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), 0);
        assert_eq!(record.read_pid().unwrap(), Some(newer));
        assert_eq!(record.credentials().load().unwrap().as_str(), "newer");
    }

    #[test]
    fn test_spawn_failure_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let record = ServiceRecord::new(dir.path());
        let launch = Launch {
            executable: PathBuf::from("/nonexistent/llamafile"),
            token: Token::new("t"),
            args: Vec::new(),
        };

        let message = run(&launch, &record).unwrap_err();
        assert!(message.contains("failed to start"));
        assert!(!record.exists());
        assert!(!record.credentials().path().exists());
    }
}
