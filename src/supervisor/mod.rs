//! Supervision of the local llamafile server.
//!
//! The server runs either as a child of this process (foreground) or as a
//! detached service owned by a daemon. In service mode the daemon leaves a
//! [`ServiceRecord`] in the state directory so later invocations can find,
//! query and stop it.

mod daemon;
pub mod process;
pub mod service;

use crate::backend::{http_client, local::probe_models};
use crate::config::ServerConfig;
use crate::credentials::Token;
use crate::error::{ClientError, Result};
use crate::locator;
use daemonize::{Daemonize, Outcome};
use process::{is_alive, send_signal, ServerProcess};
use reqwest::Client;
use service::{ServiceRecord, StartupStatus};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Interval between liveness checks while waiting out the stop grace period.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Lifecycle of the supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unstarted,
    Starting,
    Ready,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new server was launched.
    Started { pid: u32 },
    /// A server was already answering. `pid` is known when it is a recorded
    /// service.
    AlreadyRunning { pid: Option<u32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    NotRunning,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Running => f.write_str("running"),
            ServiceStatus::NotRunning => f.write_str("not running"),
        }
    }
}

/// Supervisor settings, usually derived from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub base_url: String,
    pub extra_args: Vec<String>,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
    pub state_dir: PathBuf,
}

impl SupervisorOptions {
    pub fn from_config(server: &ServerConfig, state_dir: PathBuf) -> Self {
        Self {
            base_url: server.base_url(),
            extra_args: server.args.clone(),
            startup_timeout: server.startup_timeout(),
            poll_interval: server.poll_interval(),
            stop_grace: server.stop_grace(),
            state_dir,
        }
    }
}

/// What the user asked for: an executable and a token, both optional.
#[derive(Debug, Clone, Default)]
pub struct LaunchPlan {
    pub executable: Option<PathBuf>,
    pub token: Option<String>,
}

/// A fully resolved launch command.
#[derive(Debug, Clone)]
pub struct Launch {
    pub executable: PathBuf,
    pub token: Token,
    pub args: Vec<String>,
}

pub struct Supervisor {
    options: SupervisorOptions,
    record: ServiceRecord,
    client: Client,
    process: Option<ServerProcess>,
    token: Option<Token>,
    state: State,
    log_offset: u64,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Result<Self> {
        Ok(Self {
            record: ServiceRecord::new(&options.state_dir),
            client: http_client()?,
            options,
            process: None,
            token: None,
            state: State::Unstarted,
            log_offset: 0,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn base_url(&self) -> &str {
        &self.options.base_url
    }

    /// Token the running server accepts, once known.
    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    /// PID of a live recorded service. Stale records are discarded.
    pub fn running_service(&self) -> Option<u32> {
        self.record.live_pid()
    }

    /// Resolve the executable and token into a launch command.
    pub fn prepare_launch(&self, plan: &LaunchPlan) -> Result<Launch> {
        let executable = locator::locate(plan.executable.as_deref())?;
        let token = self.record.credentials().resolve_token(plan.token.as_deref());
        let mut args = vec!["--api-key".to_string(), token.as_str().to_string()];
        args.extend(self.options.extra_args.iter().cloned());
        Ok(Launch {
            executable,
            token,
            args,
        })
    }

    /// Start the server as a child of this process and wait until it answers.
    pub async fn start(&mut self, plan: &LaunchPlan) -> Result<StartOutcome> {
        if let Some(pid) = self.running_service() {
            info!("Llamafile service already running (PID {})", pid);
            self.token = self.record.credentials().load();
            self.state = State::Ready;
            return Ok(StartOutcome::AlreadyRunning { pid: Some(pid) });
        }

        let probe_token = plan
            .token
            .as_deref()
            .map(Token::new)
            .or_else(|| self.record.credentials().load());
        if self.is_healthy(probe_token.as_ref()).await {
            info!("Llamafile already answering at {}", self.options.base_url);
            self.token = probe_token;
            self.state = State::Ready;
            return Ok(StartOutcome::AlreadyRunning { pid: None });
        }

        let launch = self.prepare_launch(plan)?;
        info!("Starting {}", launch.executable.display());
        self.state = State::Starting;
        let process = match ServerProcess::spawn(&launch.executable, &launch.args) {
            Ok(process) => process,
            Err(e) => {
                self.state = State::Failed;
                return Err(e);
            }
        };
        let pid = process.pid();
        self.process = Some(process);
        self.token = Some(launch.token);

        let token = self.token.clone();
        match self.wait_until_ready(token.as_ref()).await {
            Ok(()) => {
                info!("Llamafile ready (PID {})", pid);
                self.state = State::Ready;
                Ok(StartOutcome::Started { pid })
            }
            Err(e) => {
                self.state = State::Failed;
                if let Some(process) = self.process.take() {
                    if let Err(kill_err) = process.terminate(self.options.stop_grace).await {
                        warn!("Failed to stop llamafile after startup failure: {}", kill_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// Poll the health endpoint until it answers, the child exits, or the
    /// startup timeout passes.
    async fn wait_until_ready(&mut self, token: Option<&Token>) -> Result<()> {
        let deadline = Instant::now() + self.options.startup_timeout;
        loop {
            if let Some(process) = self.process.as_mut() {
                if let Some(status) = process.try_exit()? {
                    let output = process.diagnostics().await;
                    self.process = None;
                    return Err(ClientError::StartupFailure {
                        exit_code: status.code(),
                        output,
                    });
                }
            }

            if self.is_healthy(token).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout(self.options.startup_timeout));
            }
            debug!("Waiting for llamafile at {}", self.options.base_url);
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// Detach into a service daemon that runs `launch`.
    ///
    /// Must be called before any async runtime or other thread exists. Only
    /// returns in the invoking process; follow up with
    /// [`wait_for_service`](Supervisor::wait_for_service).
    pub fn daemonize(&mut self, launch: &Launch) -> Result<()> {
        std::fs::create_dir_all(&self.options.state_dir)?;
        self.record.clear_status()?;
        self.log_offset = self.record.log_len();
        self.state = State::Starting;

        let mask: libc::mode_t = 0o077;
        let daemon = Daemonize::new().working_directory("/").umask(mask);
        match daemon.execute() {
            Outcome::Parent(Ok(parent)) if parent.first_child_exit_code != 0 => {
                self.state = State::Failed;
                Err(self.service_failure(
                    Some(parent.first_child_exit_code),
                    "service daemon failed to detach",
                ))
            }
            Outcome::Parent(Ok(_)) => {
                debug!("Service daemon detached");
                self.token = Some(launch.token.clone());
                Ok(())
            }
            Outcome::Parent(Err(e)) => {
                self.state = State::Failed;
                Err(ClientError::Daemonize(e.to_string()))
            }
            Outcome::Child(Ok(_)) => daemon::serve(launch, &self.record),
            Outcome::Child(Err(e)) => daemon::abort(&self.record, &e.to_string()),
        }
    }

    /// Wait for a freshly daemonized service to answer.
    ///
    /// Fails as soon as the daemon reports a failure, or the server it
    /// spawned is gone.
    pub async fn wait_for_service(&mut self) -> Result<StartOutcome> {
        let deadline = Instant::now() + self.options.startup_timeout;
        let token = self.token.clone();
        let mut spawned: Option<u32> = None;

        let result = loop {
            match self.record.read_status() {
                Some(StartupStatus::Failed { exit_code, message }) => {
                    debug!("Service daemon reported failure: {}", message);
                    break Err(self.service_failure(exit_code, &message));
                }
                Some(StartupStatus::Spawned(pid)) if !is_alive(pid) => {
                    debug!("Recorded llamafile (PID {}) is gone", pid);
                    break Err(self.service_failure(None, "llamafile exited during startup"));
                }
                Some(StartupStatus::Spawned(pid)) => spawned = Some(pid),
                None => {}
            }

            if self.is_healthy(token.as_ref()).await {
                break Ok(match spawned {
                    Some(pid) => StartOutcome::Started { pid },
                    None => StartOutcome::AlreadyRunning { pid: None },
                });
            }
            if Instant::now() >= deadline {
                break Err(match spawned {
                    Some(_) => ClientError::Timeout(self.options.startup_timeout),
                    None => self.service_failure(None, "service daemon never started llamafile"),
                });
            }
            tokio::time::sleep(self.options.poll_interval).await;
        };

        self.state = if result.is_ok() {
            State::Ready
        } else {
            State::Failed
        };
        result
    }

    /// A startup failure carrying the log written since the launch, or
    /// `message` when the log has nothing new.
    fn service_failure(&self, exit_code: Option<i32>, message: &str) -> ClientError {
        let output = self.record.log_since(self.log_offset);
        ClientError::StartupFailure {
            exit_code,
            output: if output.is_empty() {
                format!("{} (see {})", message, self.record.log_path().display())
            } else {
                output
            },
        }
    }

    /// Stop the in-process child, or else the recorded service.
    pub async fn stop(&mut self) -> Result<StopOutcome> {
        if let Some(process) = self.process.take() {
            info!("Stopping llamafile (PID {})", process.pid());
            process.terminate(self.options.stop_grace).await?;
            self.state = State::Stopped;
            return Ok(StopOutcome::Stopped);
        }

        let pid = match self.record.read_pid() {
            Ok(Some(pid)) => pid,
            Ok(None) => return Ok(StopOutcome::NotRunning),
            Err(e) => {
                warn!("Ignoring service record: {}", e);
                self.remove_record();
                return Ok(StopOutcome::NotRunning);
            }
        };

        let outcome = match send_signal(pid, libc::SIGTERM) {
            Ok(true) => {
                info!("Sent SIGTERM to llamafile (PID {})", pid);
                self.await_exit(pid).await;
                StopOutcome::Stopped
            }
            Ok(false) => {
                debug!("Recorded llamafile (PID {}) already exited", pid);
                StopOutcome::NotRunning
            }
            Err(e) => {
                warn!("Failed to signal llamafile (PID {}): {}", pid, e);
                StopOutcome::NotRunning
            }
        };
        self.remove_record();
        self.state = State::Stopped;
        Ok(outcome)
    }

    /// Wait out the grace period, then SIGKILL.
    async fn await_exit(&self, pid: u32) {
        let deadline = Instant::now() + self.options.stop_grace;
        while Instant::now() < deadline {
            if !is_alive(pid) {
                return;
            }
            tokio::time::sleep(STOP_POLL).await;
        }
        warn!("Llamafile (PID {}) ignored SIGTERM, killing it", pid);
        if let Err(e) = send_signal(pid, libc::SIGKILL) {
            warn!("Failed to kill llamafile (PID {}): {}", pid, e);
        }
    }

    fn remove_record(&self) {
        if let Err(e) = self.record.remove() {
            warn!("Failed to remove service record: {}", e);
        }
    }

    /// Whether the local endpoint answers `GET /v1/models`.
    pub async fn status(&self) -> ServiceStatus {
        let token = self
            .token
            .clone()
            .or_else(|| self.record.credentials().load());
        if self.is_healthy(token.as_ref()).await {
            ServiceStatus::Running
        } else {
            ServiceStatus::NotRunning
        }
    }

    /// Stop the server if this process started it. Services are left alone.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(process) = self.process.take() {
            debug!("Shutting down llamafile (PID {})", process.pid());
            process.terminate(self.options.stop_grace).await?;
            self.state = State::Stopped;
        }
        Ok(())
    }

    async fn is_healthy(&self, token: Option<&Token>) -> bool {
        match probe_models(&self.client, &self.options.base_url, token).await {
            Ok(_) => true,
            Err(e) => {
                debug!("Health probe failed: {}", e);
                false
            }
        }
    }
}
