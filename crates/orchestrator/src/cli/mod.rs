pub mod abort;
pub mod config;
pub mod replay;

use clap::{Parser, Subcommand};

/// skillrun: streaming skill invocation runner.
#[derive(Debug, Parser)]
#[command(name = "skillrun", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Drive one invocation from a scripted engine event file.
    Replay {
        /// JSONL file with one engine event (or delay/fail/panic step) per line.
        script: String,
        /// Invocation id (a fresh UUID when omitted).
        #[arg(long)]
        result_id: Option<String>,
        /// Invocation version.
        #[arg(long = "invocation-version", default_value_t = 1)]
        invocation_version: u32,
        /// Owning user id.
        #[arg(long, default_value = "cli")]
        uid: String,
        /// Query text the invocation answers.
        #[arg(long, default_value = "")]
        query: String,
        /// Model or routing alias (e.g. "auto", "openai/gpt-4o").
        #[arg(long, default_value = "scripted")]
        model: String,
        /// Generate a title for the invocation once it finishes.
        #[arg(long)]
        auto_name: bool,
        /// Output all events as JSON instead of streaming text.
        #[arg(long)]
        json: bool,
    },
    /// Request an abort of a running invocation (possibly in another process).
    Abort {
        result_id: String,
        version: u32,
        /// Reason recorded with the abort.
        #[arg(long, default_value = "Aborted by user")]
        message: String,
    },
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

/// Load config from `SR_CONFIG` (default `config.toml`). A missing file
/// yields the defaults.
pub fn load_config() -> anyhow::Result<(sr_domain::config::Config, String)> {
    let config_path = std::env::var("SR_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        sr_domain::config::Config::default()
    };

    Ok((config, config_path))
}
