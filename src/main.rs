//! Devfleet - development server fleet toolkit
//!
//! This is the main entry point for the devfleet CLI.

mod cli;

use anyhow::Result;
use cli::commands::CommandContext;
use cli::{Cli, Commands};
use devfleet::config::Config;
use devfleet::daemon::LogRouter;
use devfleet::inventory::InventoryError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Application version information
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize logging based on verbosity
    let logs = init_logging(cli.verbosity());

    if cli.verbosity() >= 2 {
        eprintln!("devfleet v{}", VERSION);
    }

    // An explicitly named config must load; a missing default file is fine
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    let mut ctx = CommandContext::new(&cli, config, logs);

    let exit_code = match run(&cli, &mut ctx).await {
        Ok(code) => code,
        Err(e) => {
            ctx.output.error(&format!("{:#}", e));
            exit_code_for(&e)
        }
    };

    std::process::exit(exit_code);
}

async fn run(cli: &Cli, ctx: &mut CommandContext) -> Result<i32> {
    match &cli.command {
        Commands::Deploy(args) => args.execute(ctx).await,
        Commands::Transfer(args) => args.execute(ctx).await,
        Commands::Ssh(args) => args.execute(ctx).await,
        Commands::Open(args) => args.execute(ctx).await,
        Commands::Serve(args) => args.execute(ctx).await,
    }
}

/// Config and name resolution problems exit with 2, everything else with 1.
fn exit_code_for(e: &anyhow::Error) -> i32 {
    if let Some(e) = e.downcast_ref::<devfleet::Error>() {
        return e.exit_code();
    }
    if e.downcast_ref::<InventoryError>().is_some() {
        return 2;
    }
    1
}

/// Initialize logging based on verbosity level.
///
/// The returned router feeds daemon clients the log lines of their requests.
fn init_logging(verbosity: u8) -> LogRouter {
    let filter = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let logs = LogRouter::new();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity >= 2),
        )
        .with(env_filter)
        .with(logs.layer())
        .init();

    logs
}
