//! CLI for exercising the steadfast resilience core.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use steadfast_core::config::{self, CoreConfig};
use steadfast_core::TrafficClass;

use commands::{run_backoff, run_call, run_config, run_poll, run_sse, CallArgs};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "steadfast")]
#[command(about = "steadfast: retry, circuit breaking and future polling for HTTP calls", long_about = None)]
pub struct Cli {
    /// Use this config file instead of ~/.config/steadfast/config.toml.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Print the effective configuration as TOML.
    Config {
        /// Print only the config file location.
        #[arg(long)]
        path: bool,
    },

    /// Print the retry delay schedule derived from the config.
    Backoff {
        /// Number of attempts to show.
        #[arg(long, default_value = "8", value_name = "N")]
        attempts: u32,
    },

    /// Decode a captured text/event-stream body and print one JSON line per event.
    Sse {
        /// Path to the capture.
        path: PathBuf,
    },

    /// Send one request under the configured retry, circuit and rate-limit policy.
    Call {
        /// Target URL.
        url: String,

        /// Traffic class; selects the connection pool.
        #[arg(long, default_value = "session")]
        class: TrafficClass,

        /// HTTP method. Defaults to POST when --data is given, else GET.
        #[arg(long, short = 'X')]
        method: Option<String>,

        /// JSON request body.
        #[arg(long, short = 'd')]
        data: Option<String>,

        /// Extra header, `Name: value`. Repeatable.
        #[arg(long = "header", short = 'H', value_name = "HEADER")]
        headers: Vec<String>,

        /// Decode the response as a server-sent event stream.
        #[arg(long)]
        stream: bool,
    },

    /// Poll a server-side job until it resolves.
    Poll {
        /// URL that retrieves the job result.
        url: String,

        /// Job identifier returned when the job was submitted.
        request_id: String,
    },
}

fn load_config(path: Option<&Path>) -> Result<CoreConfig> {
    match path {
        Some(p) => config::load_from_path(p),
        None => config::load_or_init(),
    }
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = load_config(cli.config.as_deref())?;
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Config { path } => run_config(&cfg, path, cli.config.as_deref())?,
            CliCommand::Backoff { attempts } => run_backoff(&cfg, attempts),
            CliCommand::Sse { path } => run_sse(&path)?,
            CliCommand::Call {
                url,
                class,
                method,
                data,
                headers,
                stream,
            } => {
                let args = CallArgs {
                    url,
                    class,
                    method,
                    data,
                    headers,
                    stream,
                };
                run_call(&cfg, args).await?;
            }
            CliCommand::Poll { url, request_id } => run_poll(&cfg, &url, &request_id).await?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
