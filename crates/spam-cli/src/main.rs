mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{pipeline::PipelineSubcommand, store::StoreSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "spamstack",
    about = "Randomized load generator for multi-tenant cloud control planes",
    version,
    propagate_version = true
)]
struct Cli {
    /// Resource store database file
    #[arg(long, global = true, env = "SPAMSTACK_DB", default_value = "spamstack.redb")]
    db: PathBuf,

    /// YAML config file (defaults apply when omitted)
    #[arg(long, global = true, env = "SPAMSTACK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the backend named in the config (memory, rest)
    #[arg(long, global = true, env = "SPAMSTACK_BACKEND")]
    backend: Option<String>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Log at debug level
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run pipelines against the cloud until they complete or Ctrl-C
    Run {
        /// Pipeline file (YAML or JSON)
        #[arg(long = "conf")]
        conf: PathBuf,

        /// Only run the named pipelines (repeatable)
        #[arg(long)]
        only: Vec<String>,
    },

    /// Delete every tracked, unprotected resource in the given collections
    Clean {
        /// Collections to clean, or `all`
        #[arg(required = true)]
        collections: Vec<String>,
    },

    /// Inspect the resource store
    Store {
        #[command(subcommand)]
        subcommand: StoreSubcommand,
    },

    /// Validate pipeline files
    Pipeline {
        #[command(subcommand)]
        subcommand: PipelineSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match (&cli.command, cli.verbose) {
        (_, true) => tracing::Level::DEBUG,
        (Commands::Run { .. } | Commands::Clean { .. }, false) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let env = cmd::Env {
        db: cli.db,
        config: cli.config,
        backend: cli.backend,
    };

    let result = match cli.command {
        Commands::Run { conf, only } => cmd::run::run(&env, &conf, &only, cli.json),
        Commands::Clean { collections } => cmd::clean::run(&env, &collections, cli.json),
        Commands::Store { subcommand } => cmd::store::run(&env, subcommand, cli.json),
        Commands::Pipeline { subcommand } => cmd::pipeline::run(subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
