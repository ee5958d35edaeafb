use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use plinyport_core::{Endpoint, ExecutionTarget};

#[derive(Parser, Debug)]
#[command(name = "plinyctl", version, about = "Run graphs on a PlinyCompute engine")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Log level (RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    /// Connect timeout in milliseconds; 0 waits forever
    #[arg(long, global = true, default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Per-request timeout in milliseconds; 0 waits forever
    #[arg(long, global = true, default_value_t = 120_000)]
    pub request_timeout_ms: u64,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that an engine is reachable and print what it reports
    Ping {
        /// Engine address (host:port)
        #[arg(long, default_value = "localhost:8108")]
        addr: Endpoint,
    },

    /// Upload a JSON graph and run it once on generated inputs
    Run {
        /// Path to the graph, serialized as JSON
        #[arg(long)]
        graph: PathBuf,

        /// Engine address (host:port)
        #[arg(long, default_value = "localhost:8108")]
        addr: Endpoint,

        /// Requested execution target (cpu or cuda:N); advisory
        #[arg(long, default_value = "cpu")]
        target: ExecutionTarget,

        /// Size bound to every dynamic input dimension
        #[arg(long, default_value_t = 1)]
        batch: usize,

        /// Value every input element is set to
        #[arg(long, value_enum, default_value_t = Fill::Zeros)]
        fill: Fill,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Fill {
    Zeros,
    Ones,
}
