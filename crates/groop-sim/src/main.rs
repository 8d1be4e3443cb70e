mod demo;
mod report;
mod scenarios;

use std::time::Duration;

use clap::{Parser, Subcommand};
use groop_e2ee::E2eeConfig;

#[derive(Parser)]
#[command(name = "groop-sim", about = "Simulate groop E2EE across several devices")]
struct Cli {
    /// Per-call store timeout in ms (overrides GROOP_E2EE_LOOKUP_TIMEOUT_MS).
    #[arg(long)]
    lookup_timeout: Option<u64>,

    /// Attempts per store call.
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Emit results as JSON lines on stdout instead of a summary.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reference scenarios A to D.
    Scenarios,

    /// Simulate a trip group end to end.
    Demo {
        /// Group members, admitted one after another.
        #[arg(long, default_value = "4")]
        members: usize,
        /// Messages sent by each member.
        #[arg(long, default_value = "10")]
        messages: usize,
        /// Users who never get admitted.
        #[arg(long, default_value = "1")]
        outsiders: usize,
        /// History decryption batch size.
        #[arg(long)]
        batch: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = E2eeConfig::new();
    if let Some(ms) = cli.lookup_timeout {
        config = config.lookup_timeout(Duration::from_millis(ms));
    }
    if let Some(attempts) = cli.max_attempts {
        config = config.max_attempts(attempts);
    }

    eprintln!("groop-sim v{}", env!("CARGO_PKG_VERSION"));

    let results = match cli.command {
        Command::Scenarios => scenarios::run_all(&config).await?,
        Command::Demo {
            members,
            messages,
            outsiders,
            batch,
        } => {
            if let Some(batch) = batch {
                config = config.history_batch_size(batch);
            }
            vec![
                demo::run(
                    &config,
                    demo::DemoConfig {
                        members,
                        messages,
                        outsiders,
                    },
                )
                .await?,
            ]
        }
    };

    let mut failed = 0;
    for result in &results {
        tracing::info!(
            "{}: {} passed, {} failed in {:.1}ms",
            result.scenario,
            result.passed,
            result.failed,
            result.total_ms
        );
        if cli.json {
            result.emit_json();
        } else {
            result.print_summary();
        }
        if !result.success() {
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} scenarios failed", results.len());
    }
    Ok(())
}
