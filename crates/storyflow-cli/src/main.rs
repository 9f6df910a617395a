mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use cmd::db::DbSubcommand;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "storyflow",
    about = "Unattended Scrum-Master / Dev / QA workflow over an epic",
    version
)]
struct Cli {
    /// Project root (default: auto-detected from cwd)
    #[arg(long, global = true, env = "STORYFLOW_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every story of an epic, then the quality gate and the test suite
    Run {
        /// Epic document, relative to the project root
        epic: PathBuf,

        /// Answer every agent call locally instead of starting claude
        #[arg(long)]
        dry_run: bool,

        /// Skip the lint / type-check phase
        #[arg(long)]
        skip_quality: bool,

        /// Skip the test suite phase
        #[arg(long)]
        skip_tests: bool,

        /// Dev–QA rounds per story (overrides workflow.max_rounds)
        #[arg(long)]
        max_rounds: Option<u32>,

        /// Fix cycles for the quality gate (overrides quality.max_cycles)
        #[arg(long)]
        max_quality_cycles: Option<u32>,

        /// Test cycles (overrides tests.max_cycles)
        #[arg(long)]
        max_test_cycles: Option<u32>,
    },

    /// Show processing status recorded in the state store
    Status {
        /// Only stories of this epic
        #[arg(long)]
        epic: Option<String>,

        /// Only stories in this processing status (e.g. in_progress)
        #[arg(long)]
        status: Option<String>,
    },

    /// Rewrite the Status section of every story of an epic from the store
    Sync {
        /// Epic document, relative to the project root
        epic: PathBuf,

        /// Rewrite sections directly instead of asking the agent
        #[arg(long)]
        dry_run: bool,
    },

    /// State store maintenance
    Db {
        #[command(subcommand)]
        subcommand: DbSubcommand,
    },

    /// Inspect and validate .storyflow/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Run {
            epic,
            dry_run,
            skip_quality,
            skip_tests,
            max_rounds,
            max_quality_cycles,
            max_test_cycles,
        } => cmd::run::run(
            &root,
            cmd::run::RunArgs {
                epic,
                dry_run,
                skip_quality,
                skip_tests,
                max_rounds,
                max_quality_cycles,
                max_test_cycles,
            },
            cli.json,
        ),
        Commands::Status { epic, status } => {
            cmd::status::run(&root, epic.as_deref(), status.as_deref(), cli.json)
        }
        Commands::Sync { epic, dry_run } => cmd::sync::run(&root, &epic, dry_run, cli.json),
        Commands::Db { subcommand } => cmd::db::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
