use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio_util::sync::CancellationToken;

mod progress;

#[derive(Parser, Debug)]
#[command(name = "datatorch-agent", version)]
#[command(about = "Runs pipeline jobs dispatched by a datatorch coordinator")]
struct Cli {
    /// Coordinator websocket URL. Overrides `AGENT_HOST` and `agent.yml`.
    #[arg(long, global = true)]
    host: Option<String>,

    /// Agent authentication token. Overrides `AGENT_TOKEN` and `agent.yml`.
    #[arg(long, global = true)]
    token: Option<String>,

    /// Directory for actions, job workdirs, and the event log.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the coordinator and dispatch jobs until interrupted.
    Run,
    /// Print resolved configuration and host facts without connecting.
    Doctor,
    /// Print recorded job/step events from the local event log.
    Events {
        /// Only print the last N events.
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Generate shell completion scripts.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("datatorch-agent")
}

fn resolve_config(cli: &Cli) -> Result<agent_config::AgentConfig> {
    let file = agent_config::load_config_file(&config_dir()).context("loading agent.yml")?;
    let overrides = agent_config::ConfigOverrides {
        host: cli.host.clone(),
        token: cli.token.clone(),
        data_dir: cli.data_dir.clone(),
    };
    agent_config::resolve(file, overrides).context("resolving agent configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match &cli.cmd {
        Commands::Run => run(&cli).await,
        Commands::Doctor => doctor(&cli),
        Commands::Events { tail } => events(&cli, *tail),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(*shell, &mut cmd, name, &mut std::io::stdout());
            Ok(())
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?;
    let agent = agent_core::Agent::bootstrap(config).context("bootstrapping agent")?;

    let identity = agent.identity();
    tracing::info!(
        hostname = %identity.hostname,
        os = %identity.facts.os,
        agent_version = %identity.facts.agent_version,
        "starting agent"
    );

    let cancellation = CancellationToken::new();
    let shutdown = cancellation.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received interrupt, shutting down");
        shutdown.cancel();
    });

    agent.run(cancellation).await.context("agent run loop")?;
    Ok(())
}

fn doctor(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?;
    let directory = config.directory();

    println!("host: {}", config.host);
    println!("token: {}", redact(&config.token));
    println!("data_dir: {}", config.data_dir.display());
    println!("actions_dir: {}", directory.actions_dir().display());
    println!("events_dir: {}", directory.events_dir().display());

    let agent = agent_core::Agent::bootstrap(config).context("bootstrapping agent")?;
    let identity = agent.identity();
    println!();
    println!("hostname: {}", identity.hostname);
    println!("os: {} ({:?})", identity.facts.os, identity.facts.os_version);
    println!(
        "cpu: {} ({} physical / {} logical cores)",
        identity.facts.cpu_name, identity.facts.cpu_cores_physical, identity.facts.cpu_cores_logical
    );
    println!("total_memory: {} bytes", identity.facts.total_memory);

    Ok(())
}

fn redact(token: &str) -> String {
    if token.len() <= 4 {
        "*".repeat(token.len())
    } else {
        format!("{}...{}", &token[..2], &token[token.len() - 2..])
    }
}

fn events(cli: &Cli, tail: Option<usize>) -> Result<()> {
    let config = resolve_config(cli)?;
    let directory = config.directory();
    let path = agent_events::events_path(&directory.events_dir());
    let all = agent_events::read_events(&path).context("reading event log")?;

    let start = match tail {
        Some(n) => all.len().saturating_sub(n),
        None => 0,
    };
    for event in &all[start..] {
        println!("{} job={} {:?}", event.timestamp, event.job_id, event.kind);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_masks_middle_of_token() {
        assert_eq!(redact("abcdefgh"), "ab...gh");
        assert_eq!(redact("ab"), "**");
    }

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["datatorch-agent", "run"]);
        assert!(matches!(cli.cmd, Commands::Run));
    }

    #[test]
    fn cli_parses_global_overrides_after_subcommand() {
        let cli = Cli::parse_from(["datatorch-agent", "--host", "wss://x", "doctor"]);
        assert_eq!(cli.host.as_deref(), Some("wss://x"));
    }
}
