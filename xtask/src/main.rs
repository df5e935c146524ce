//! Build automation tasks for Ferry
//!
//! Run with: cargo xtask <command>

use clap::{Parser, Subcommand};
use std::process::Command;

/// Fuzz targets under `fuzz/fuzz_targets`
const FUZZ_TARGETS: [&str; 4] = [
    "fuzz_mux_frame",
    "fuzz_multiaddr",
    "fuzz_negotiation",
    "fuzz_handshake",
];

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Ferry build automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests
    Test,

    /// Run clippy lints
    Lint,

    /// Check formatting
    Fmt,

    /// Run all CI checks
    Ci,

    /// Run each fuzz target for a bounded time (requires nightly and cargo-fuzz)
    Fuzz {
        /// Seconds per target
        #[arg(short, long, default_value_t = 60)]
        seconds: u64,

        /// Run only this target
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Run the benchmarks
    Bench,

    /// Generate documentation
    Doc,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Test => {
            run_command("cargo", &["test", "--all-features", "--workspace"])?;
        }
        Commands::Lint => {
            run_command("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
        }
        Commands::Fmt => {
            run_command("cargo", &["fmt", "--all", "--check"])?;
        }
        Commands::Ci => {
            println!("Running CI checks...");
            run_command("cargo", &["fmt", "--all", "--check"])?;
            run_command("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
            run_command("cargo", &["test", "--all-features", "--workspace"])?;
            println!("All CI checks passed!");
        }
        Commands::Fuzz { seconds, target } => {
            let max_time = format!("-max_total_time={seconds}");
            let targets: Vec<&str> = match target.as_deref() {
                Some(name) if FUZZ_TARGETS.contains(&name) => vec![name],
                Some(name) => anyhow::bail!(
                    "unknown fuzz target {}, expected one of {:?}",
                    name,
                    FUZZ_TARGETS
                ),
                None => FUZZ_TARGETS.to_vec(),
            };
            for target in targets {
                println!("Fuzzing {target} for {seconds}s...");
                run_command(
                    "cargo",
                    &["+nightly", "fuzz", "run", "--fuzz-dir", "fuzz", target, "--", &max_time],
                )?;
            }
        }
        Commands::Bench => {
            run_command("cargo", &["bench", "-p", "ferry-core"])?;
        }
        Commands::Doc => {
            run_command("cargo", &["doc", "--workspace", "--no-deps", "--open"])?;
        }
    }

    Ok(())
}

fn run_command(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new(program).args(args).status()?;

    if !status.success() {
        anyhow::bail!("{} {:?} failed", program, args);
    }

    Ok(())
}
