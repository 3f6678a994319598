//! loopback: score an external encoder frame by frame

use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use color_eyre::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use loopback::bus::EventBus;
use loopback::pipeline::{self, Evaluator};
use loopback::utils::CancelToken;
use loopback::{Cli, Config};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Usage errors exit with 1, --help and --version with 0
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
            let _ = e.print();
            return Ok(code);
        }
    };

    // Initialize error handling and logging
    color_eyre::install()?;
    let default_filter = if cli.verbose { "loopback=debug" } else { "loopback=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let config = Config::load(&cli)?.validate()?;
    info!("loopback {} launching", env!("CARGO_PKG_VERSION"));

    let cancel = CancelToken::new();
    cancel.listen_for_signals();

    let bus = EventBus::join(config.cid).await?;
    let started = Instant::now();
    let summary = Evaluator::new(config, cancel).run(&bus).await?;
    pipeline::log_summary(&summary, started.elapsed());

    info!("loopback shutting down");
    Ok(ExitCode::SUCCESS)
}
