//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use nimbus_core::ProviderKind;

#[derive(Parser, Debug)]
#[command(name = "nimbus")]
#[command(version)]
#[command(about = "Run cloud CLI commands under a verified context", long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.nimbus/config.json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Print hub messages as JSON lines on stderr while working
    #[arg(long, global = true, default_value_t = false)]
    pub stream: bool,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run a tool command, e.g. `nimbus exec -p aws -e dev -- s3 ls`
    Exec {
        #[arg(short, long)]
        provider: ProviderKind,
        #[arg(short, long)]
        env: String,
        /// Overrides the configured command timeout
        #[arg(short, long)]
        timeout_secs: Option<u64>,
        /// Arguments after the tool name
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },
    /// Verify (and switch to) the context mapped to an environment
    Ensure {
        #[arg(short, long)]
        provider: ProviderKind,
        #[arg(short, long)]
        env: String,
    },
    /// Health of every configured provider and controller
    Status,
    /// Call a controller action, e.g. `nimbus invoke k8s list_pods -e dev`
    Invoke {
        controller: String,
        action: String,
        /// Action parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
        /// Sets `logical_env` in the parameters
        #[arg(short, long)]
        env: Option<String>,
    },
}

impl Command {
    /// Arguments for `exec`, starting with the tool's name.
    ///
    /// Each argument is passed through as given.
    pub fn exec_args(provider: ProviderKind, args: &[String]) -> Vec<String> {
        let program = provider.default_program();
        match args.first() {
            Some(first) if first == program => args.to_vec(),
            _ => std::iter::once(program.to_string())
                .chain(args.iter().cloned())
                .collect(),
        }
    }
}
