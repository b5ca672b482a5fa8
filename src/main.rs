//! sumarai - summarize files and chat with a local llamafile server.
//!
//! Launches and supervises a llamafile server (in the foreground or as a
//! detached service) and talks to it over its OpenAI-compatible API. Ollama
//! and OpenAI can be used instead of the local server.

mod backend;
mod batch;
mod config;
mod credentials;
mod error;
mod locator;
mod protocol;
mod session;
mod stream;
mod supervisor;
mod transcript;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use backend::{create_backend, Backend};
use clap::{ArgGroup, Parser};
use config::{BackendConfig, Config};
use session::Session;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use supervisor::{LaunchPlan, StartOutcome, StopOutcome, Supervisor, SupervisorOptions};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sumarai")]
#[command(author, version, about = "Summarize files and chat with a local llamafile server")]
#[command(long_about = "Summarize files and chat with a local llamafile server.\n\nWith FILES, prints one summary per file. Without, starts an interactive chat.")]
#[command(group(ArgGroup::new("service_action").args(["service", "stop", "status", "init_config"])))]
#[command(group(ArgGroup::new("provider").args(["ollama", "openai"])))]
struct Cli {
    /// Files to summarize ("-" reads standard input)
    #[arg(value_name = "FILES")]
    files: Vec<PathBuf>,

    /// System prompt for summaries and chat
    #[arg(short = 'p', long, value_name = "TEXT")]
    prompt: Option<String>,

    /// Path to the llamafile executable
    #[arg(short = 'l', long, value_name = "PATH")]
    llamafile: Option<PathBuf>,

    /// API token for the local server (default: persisted or generated)
    #[arg(long, value_name = "TOKEN")]
    api_key: Option<String>,

    /// Use an Ollama server instead of llamafile
    #[arg(long)]
    ollama: bool,

    /// Use the OpenAI API instead of llamafile
    #[arg(long)]
    openai: bool,

    /// Ollama model name
    #[arg(long, env = "OLLAMA_MODEL", value_name = "MODEL")]
    ollama_model: Option<String>,

    /// Ollama host URL
    #[arg(long, env = "OLLAMA_HOST", value_name = "URL")]
    ollama_host: Option<String>,

    /// OpenAI model name
    #[arg(long, env = "OPENAI_MODEL", value_name = "MODEL")]
    openai_model: Option<String>,

    /// Configuration file (default: ~/.config/sumarai/config.toml)
    #[arg(short = 'c', long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Run llamafile as a background service
    #[arg(long)]
    service: bool,

    /// Stop the llamafile service
    #[arg(long)]
    stop: bool,

    /// Check whether the llamafile server is answering
    #[arg(long)]
    status: bool,

    /// Write a default configuration file if none exists
    #[arg(long)]
    init_config: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log = init_logging(cli.debug);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            debug!("{:?}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Install a stderr subscriber for the lifetime of the returned guard.
fn init_logging(debug: bool) -> tracing::subscriber::DefaultGuard {
    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sumarai=warn,reqwest=warn,hyper=warn"));
    if debug {
        if let Ok(directive) = "sumarai=debug".parse() {
            filter = filter.add_directive(directive);
        }
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_default(subscriber)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

fn run(cli: Cli) -> Result<()> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };
    if cli.init_config {
        return handle_init_config(&config_path);
    }

    let config = Config::load_from(&config_path)?;
    debug!(
        "Config: backend {} (model {})",
        config.backend_type(),
        config.model_name()
    );

    let options = SupervisorOptions::from_config(&config.server, Config::state_dir()?);
    let mut supervisor = Supervisor::new(options)?;
    let plan = LaunchPlan {
        executable: cli
            .llamafile
            .clone()
            .or_else(|| config.server.executable.clone()),
        token: cli.api_key.clone(),
    };

    if cli.service {
        // Detaching forks, so it has to happen before the runtime exists.
        return start_service(&mut supervisor, &plan);
    }

    let runtime = runtime()?;
    let result = runtime.block_on(run_client(cli, config, &mut supervisor, &plan));
    // A pending stdin read would otherwise keep the runtime alive.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

fn handle_init_config(path: &std::path::Path) -> Result<()> {
    if path.exists() {
        println!("Config file already exists: {}", path.display());
        return Ok(());
    }
    Config::default().save_to(path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn start_service(supervisor: &mut Supervisor, plan: &LaunchPlan) -> Result<()> {
    if let Some(pid) = supervisor.running_service() {
        println!("Llamafile service already running (PID {})", pid);
        return Ok(());
    }

    let launch = supervisor.prepare_launch(plan)?;
    supervisor.daemonize(&launch)?;

    let runtime = runtime()?;
    let outcome = runtime
        .block_on(supervisor.wait_for_service())
        .context("Llamafile service failed to start")?;
    match outcome {
        StartOutcome::Started { pid } => debug!("Service ready (PID {})", pid),
        StartOutcome::AlreadyRunning { .. } => warn!("Service answered before its record was written"),
    }
    println!("Llamafile running as a service");
    Ok(())
}

async fn run_client(
    cli: Cli,
    config: Config,
    supervisor: &mut Supervisor,
    plan: &LaunchPlan,
) -> Result<()> {
    if cli.stop {
        match supervisor.stop().await? {
            StopOutcome::Stopped => println!("Llamafile service stopped"),
            StopOutcome::NotRunning => println!("Llamafile service is not running"),
        }
        return Ok(());
    }

    if cli.status {
        println!("{}", supervisor.status().await);
        return Ok(());
    }

    let inputs = batch::parse_inputs(&cli.files)?;
    let backend_config = resolve_backend(&cli, &config);
    let prompt = cli
        .prompt
        .clone()
        .unwrap_or_else(|| config.prompt().to_string());

    if matches!(backend_config, BackendConfig::Local { .. }) {
        let outcome = supervisor
            .start(plan)
            .await
            .context("Failed to start llamafile")?;
        if let StartOutcome::AlreadyRunning { .. } = outcome {
            eprintln!("Using running llamafile service");
        }
        debug!("Supervisor state: {:?}", supervisor.state());
    }

    let result = converse(&backend_config, supervisor, &prompt, &inputs).await;

    if let Err(e) = supervisor.shutdown().await {
        warn!("Failed to stop llamafile: {}", e);
    }
    result
}

/// Summarize `inputs`, or chat when there are none.
async fn converse(
    backend_config: &BackendConfig,
    supervisor: &Supervisor,
    prompt: &str,
    inputs: &[batch::BatchInput],
) -> Result<()> {
    let backend = create_backend(
        backend_config,
        supervisor.base_url(),
        supervisor.token().cloned(),
    )?;
    if inputs.is_empty() {
        interactive(&backend, prompt).await
    } else {
        let mut stdout = std::io::stdout();
        batch::summarize(&backend, prompt, inputs, &mut stdout).await
    }
}

async fn interactive(backend: &Backend, prompt: &str) -> Result<()> {
    let input = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = std::io::stdout();
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    Session::new(backend, prompt)
        .run(input, &mut stdout, interrupt)
        .await?;
    Ok(())
}

/// Merge provider flags and their env fallbacks over the config file.
fn resolve_backend(cli: &Cli, config: &Config) -> BackendConfig {
    let base = if cli.ollama {
        match &config.backend {
            ollama @ BackendConfig::Ollama { .. } => ollama.clone(),
            _ => BackendConfig::Ollama {
                model: config::default_ollama_model(),
                host: config::default_ollama_host(),
            },
        }
    } else if cli.openai {
        match &config.backend {
            openai @ BackendConfig::OpenAI { .. } => openai.clone(),
            _ => BackendConfig::OpenAI {
                model: config::default_openai_model(),
                api_key: None,
            },
        }
    } else {
        config.backend.clone()
    };

    match base {
        BackendConfig::Ollama { model, host } => BackendConfig::Ollama {
            model: cli.ollama_model.clone().unwrap_or(model),
            host: cli.ollama_host.clone().unwrap_or(host),
        },
        BackendConfig::OpenAI { model, api_key } => BackendConfig::OpenAI {
            model: cli.openai_model.clone().unwrap_or(model),
            api_key,
        },
        local => local,
    }
}
