use std::path::PathBuf;

use clap::{Parser, Subcommand};

use pipevisor::config::Config;
use pipevisor::supervisor::{parse_model_ids, EnvironmentResolver};
use pipevisor::{plog, Error, Orchestrator, Result, StreamEndpoints};

/// Pipevisor - supervises one inference worker process per model
#[derive(Parser, Debug)]
#[command(name = "pipevisor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    PIPEVISOR_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.pipevisor/pipevisor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Do not mirror log records to stderr
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Config file (defaults to ~/.pipevisor/pipevisor.toml)
    #[arg(short = 'c', long = "config", global = true)]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start workers for the given models and supervise them until Ctrl-C
    Run {
        /// Comma-separated model ids
        #[arg(short, long)]
        models: String,

        /// Stream address the workers subscribe to
        #[arg(long)]
        subscribe_url: String,

        /// Stream address the workers publish to
        #[arg(long)]
        publish_url: String,

        /// Initial pipeline parameters as JSON
        #[arg(long, default_value = "{}")]
        params: String,

        /// First worker port; later models count up from here
        #[arg(long)]
        base_port: Option<u16>,
    },

    /// List configured model environments
    Envs,

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    pipevisor::log::init_with_debug(cli.debug);
    pipevisor::log::set_mirror_stderr(!cli.quiet);

    let config = match &cli.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run {
            models,
            subscribe_url,
            publish_url,
            params,
            base_port,
        } => {
            let mut config = config;
            if let Some(port) = base_port {
                config.base_port = port;
            }
            let params: serde_json::Value = serde_json::from_str(&params)?;
            let endpoints = StreamEndpoints::new(subscribe_url, publish_url);
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run(&config, &models, &endpoints, &params))
        }
        Command::Envs => list_envs(&config),
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run(
    config: &Config,
    models: &str,
    endpoints: &StreamEndpoints,
    params: &serde_json::Value,
) -> Result<()> {
    let models = parse_model_ids(models);
    if models.is_empty() {
        return Err(Error::Validation("no models requested".to_string()));
    }

    let orchestrator = Orchestrator::from_config(config)?;
    if let Err(e) = orchestrator.start(&models, endpoints, params) {
        for failure in e.failures() {
            eprintln!("failed to start {}: {}", failure.model, failure.error);
        }
        if orchestrator.registry().is_empty() {
            return Err(e);
        }
    }

    for worker in orchestrator.workers() {
        println!(
            "{:<24} port={} pid={} state={}",
            worker.model,
            worker.port,
            worker
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            worker.state
        );
    }

    tokio::signal::ctrl_c().await?;
    plog!("Interrupt received, stopping workers");
    orchestrator.shutdown().await
}

fn list_envs(config: &Config) -> Result<()> {
    let resolver = EnvironmentResolver::from_config(config)?;
    let models = resolver.models();
    if models.is_empty() {
        println!("No environments configured.");
        return Ok(());
    }
    for model in models {
        let env = resolver.resolve(model)?;
        println!(
            "{:<24} {} (root {})",
            model,
            env.executable.display(),
            env.root.display()
        );
    }
    Ok(())
}
