use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use llm_relay::{Config, RelayError, Result};
use tracing_subscriber::fmt::writer::MakeWriterExt;

const DEFAULT_CONFIG_TEMPLATE: &str = include_str!("../config.example.toml");

#[derive(Parser)]
#[command(name = "llm-relay", version, about = "Local LLM API proxy with automatic retry and model fallback")]
struct Cli {
    /// Config file path (default: ~/.config/llm-relay/config.toml)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (debug, info, warn, error)
    #[arg(short = 'l', long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the proxy servers
    Serve,
    /// Open the config file in $EDITOR, creating a template if needed
    Edit,
    /// Print the version
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("llm-relay: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let path = config_path(cli.config)?;
            let config = Config::load(&path)?;
            let level = cli
                .log_level
                .as_deref()
                .map(normalize_level)
                .unwrap_or_else(|| config.log.level_filter());
            init_logging(level);
            llm_relay::server::serve(config).await
        }
        Command::Edit => edit_config(&config_path(cli.config)?),
        Command::Version => {
            println!("llm-relay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn config_path(cli_config: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = cli_config {
        return Ok(path);
    }
    let home = dirs::home_dir().ok_or_else(|| RelayError::ConfigInvalid {
        entity: "config".to_string(),
        reason: "could not determine home directory".to_string(),
    })?;
    Ok(home.join(".config").join("llm-relay").join("config.toml"))
}

fn normalize_level(level: &str) -> &'static str {
    match level.to_lowercase().as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Error records go to stderr, everything else to stdout. `RUST_LOG`
/// overrides the configured level when set.
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let writer = std::io::stderr
        .with_max_level(tracing::Level::ERROR)
        .or_else(std::io::stdout);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .init();
}

/// Opens the config in an editor, seeding a commented template when the
/// file does not exist yet.
fn edit_config(path: &std::path::Path) -> Result<()> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
    }

    let mut candidates = Vec::new();
    if let Ok(editor) = std::env::var("EDITOR") {
        if !editor.is_empty() {
            candidates.push(editor);
        }
    }
    candidates.extend(["code", "zed", "nvim", "vim", "vi"].map(String::from));

    for editor in &candidates {
        match std::process::Command::new(editor).arg(path).status() {
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        }
    }

    Err(RelayError::ConfigInvalid {
        entity: "editor".to_string(),
        reason: "no editor found; set EDITOR and retry".to_string(),
    })
}
