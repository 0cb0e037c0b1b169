// CLI application
use clap::Parser;
use slothy_cli::commands::{dump_dfg, optimize, optimize_loop};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "slothy")]
#[command(about = "Micro-architecture-aware assembly superoptimizer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Optimize a straight-line region of an assembly file
    Optimize {
        /// Path to the assembly file
        #[arg(short, long)]
        input: PathBuf,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Label starting the region
        #[arg(long)]
        start: Option<String>,

        /// Label ending the region
        #[arg(long)]
        end: Option<String>,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// First stall budget to attempt
        #[arg(long)]
        stalls_first_attempt: Option<usize>,

        /// Solver timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Optimize a loop kernel, with software pipelining when enabled
    OptimizeLoop {
        /// Path to the assembly file
        #[arg(short, long)]
        input: PathBuf,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Loop start label
        #[arg(short, long)]
        label: String,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Enable software pipelining
        #[arg(long)]
        sw_pipelining: bool,

        /// Unroll factor applied before optimization
        #[arg(long)]
        unroll: Option<usize>,

        /// Solver timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Print the dataflow graph of a region, with depths
    DumpDfg {
        /// Path to the assembly file
        #[arg(short, long)]
        input: PathBuf,

        /// Treat the body as a loop kernel (cross-iteration edges)
        #[arg(long)]
        periodic: bool,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Optimize {
            input,
            output,
            start,
            end,
            config,
            stalls_first_attempt,
            timeout,
        } => optimize(
            &input,
            output.as_deref(),
            start.as_deref(),
            end.as_deref(),
            config.as_deref(),
            stalls_first_attempt,
            timeout,
        ),
        Commands::OptimizeLoop {
            input,
            output,
            label,
            config,
            sw_pipelining,
            unroll,
            timeout,
        } => optimize_loop(
            &input,
            output.as_deref(),
            &label,
            config.as_deref(),
            sw_pipelining,
            unroll,
            timeout,
        ),
        Commands::DumpDfg { input, periodic } => dump_dfg(&input, periodic),
    }
}
