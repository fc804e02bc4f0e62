//! Agent entry point
//!
//! Loads configuration and the device model, builds the agent, and runs
//! every configured surface until interrupted. Exit codes: 0 on clean
//! shutdown, 1 for argument errors, 2 for configuration errors, 3 for
//! fatal runtime failures.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agent_service::rest::{router, AppState};
use agent_service::source::{AgentSource, HttpSession, ShdrAdapter, Source};
use agent_service::{Agent, JsonFormatter};
use config::AgentConfig;
use types::DataItemRegistry;

const EXIT_ARGUMENT: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_FATAL: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "mtc-agent", version, about = "MTConnect agent")]
struct Cli {
    /// Configuration file; falls back to MTC_CONFIG_PATH, then agent.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Change into this directory before reading anything
    #[arg(long, global = true)]
    working_directory: Option<PathBuf>,

    /// Write the process id here once started
    #[arg(long, global = true)]
    pid_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Run the agent (default)
    Run,
    /// Run with verbose logging
    Debug,
    /// Print the version and exit
    Version,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version requests are not errors
            if err.use_stderr() {
                let _ = err.print();
                return ExitCode::from(EXIT_ARGUMENT);
            }
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
    };

    let command = cli.command.unwrap_or(Command::Run);
    if matches!(command, Command::Version) {
        println!("mtc-agent {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let default_level = match command {
        Command::Debug => "debug",
        _ => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Some(dir) = &cli.working_directory {
        if let Err(err) = std::env::set_current_dir(dir) {
            error!(path = %dir.display(), error = %err, "cannot enter working directory");
            return ExitCode::from(EXIT_CONFIG);
        }
    }

    let config_path = AgentConfig::resolve_path(cli.config.as_deref());
    let mut config = match AgentConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(path = %config_path.display(), error = %err, "configuration failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if cli.pid_file.is_some() {
        config.pid_file = cli.pid_file.clone();
    }

    let registry = match load_registry(&config) {
        Ok(registry) => registry,
        Err(err) => {
            error!(error = %err, "device model failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Some(pid_file) = &config.pid_file {
        if let Err(err) = std::fs::write(pid_file, std::process::id().to_string()) {
            error!(path = %pid_file.display(), error = %err, "cannot write pid file");
            return ExitCode::from(EXIT_CONFIG);
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "runtime construction failed");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    match runtime.block_on(run_agent(config, registry)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal runtime failure");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn load_registry(config: &AgentConfig) -> anyhow::Result<Arc<DataItemRegistry>> {
    let raw = std::fs::read_to_string(&config.devices)?;
    Ok(Arc::new(DataItemRegistry::load_json(&raw)?))
}

async fn run_agent(config: AgentConfig, registry: Arc<DataItemRegistry>) -> anyhow::Result<()> {
    let sender = config
        .sender
        .clone()
        .unwrap_or_else(|| "mtc-agent".to_string());
    let agent = Agent::new(
        registry,
        config.buffer_size,
        config.checkpoint_frequency,
        config.max_assets,
        sender,
        config.allow_put,
    );
    agent.seed_unavailable();

    let mut sources: Vec<Arc<dyn Source>> = Vec::new();
    let mut tasks = Vec::new();

    for adapter_config in &config.adapters {
        let adapter = ShdrAdapter::new(Arc::clone(&agent), adapter_config.clone());
        sources.push(Arc::clone(&adapter) as Arc<dyn Source>);
        tasks.push(tokio::spawn(adapter.run()));
    }

    for upstream_config in &config.agents {
        let session = Arc::new(HttpSession::new(&upstream_config.url)?);
        let source = AgentSource::new(
            Arc::clone(&agent),
            upstream_config.clone(),
            session,
        );
        sources.push(Arc::clone(&source) as Arc<dyn Source>);
        tasks.push(tokio::spawn(source.run()));
    }

    let mqtt = config.mqtt.clone().map(|mqtt_config| {
        agent_service::mqtt::MqttService::new(
            Arc::clone(&agent),
            Arc::new(JsonFormatter),
            mqtt_config,
        )
    });
    if let Some(mqtt) = &mqtt {
        tasks.push(tokio::spawn(Arc::clone(mqtt).run()));
    }

    let state = AppState::new(Arc::clone(&agent));
    let app = router(state);
    let bind = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(
        address = %bind,
        instance_id = agent.instance_id(),
        buffer_size = config.buffer_size,
        "agent serving"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    for source in &sources {
        source.stop();
    }
    if let Some(mqtt) = &mqtt {
        mqtt.stop();
    }
    for task in tasks {
        let _ = task.await;
    }

    if let Some(pid_file) = &config.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }
    info!("agent stopped");
    Ok(())
}
